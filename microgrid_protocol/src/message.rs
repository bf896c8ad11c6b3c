// Protocol messages for client-relay communication.
//
// Two enums define the full protocol vocabulary:
// - `ClientMessage`: sent by market, participant, and simulation-controller
//   processes to the relay.
// - `ServerMessage`: sent by the relay to those clients.
//
// Event bodies the relay never inspects (bids, meter readings, round
// metadata, curricula) travel as `serde_json::Value`, keeping this crate
// independent of any market implementation. The relay only reads the fields
// it routes on: market/participant ids, commit ids, and prices.
//
// Acknowledgements use correlation ids instead of in-band callbacks: a
// `ServerMessage` that requires confirmation carries a fresh `AckId`, and the
// receiver replies with `ClientMessage::Ack` echoing it. There is no error
// event in the protocol — a client that never receives the derived
// success/delivery message must treat the operation as unconfirmed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{AckId, ConnectionId};

/// Messages sent by a client process to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Register the sender as the market authority for `market_id`.
    /// Always accepted; re-registration replaces the previous link.
    RegisterMarket { market_id: String },
    /// Join `market_id` as a participant. Rejected if the market is
    /// unregistered or `participant_id` is empty.
    JoinMarket {
        market_id: String,
        participant_id: String,
        participant_type: String,
    },
    /// Register the sender as the simulation controller for `market_id`.
    /// Rejected if the market is unregistered.
    RegisterSimController {
        controller_id: String,
        market_id: String,
    },
    /// Submit a bid to the sender's market (participant only).
    Bid { body: Value },
    /// Submit an ask to the sender's market (participant only).
    Ask { body: Value },
    /// Submetering data for the round that just ended (participant only).
    MeterData { meter: Value },
    /// Notify both counterparties of a cleared settlement (market only).
    SendSettlement { settlement: Settlement },
    /// Financial/grid transactions incurred after delivery allocation,
    /// addressed to one participant (market only).
    ReturnExtraTransactions {
        participant_id: String,
        transactions: Value,
    },
    /// Start the next trading round (market, to its room).
    StartRound { round: Value },
    /// Ask the market to start the next round (controller only; the market
    /// itself emits `StartRound` in response).
    StartRoundSimulation { round: Value },
    /// All market functions for the current round are complete (market, to
    /// the controller).
    EndRound { summary: Value },
    /// The sender has performed all of its actions for the current round
    /// (participant, to the controller).
    EndTurn,
    /// A new generation begins; clients reset per-episode state
    /// (controller, to the room).
    StartGeneration { generation: Value },
    /// The current generation is over (controller, to the room).
    EndGeneration { generation: Value },
    /// The simulation is over; clients may quit when ready (controller, to
    /// the room). The relay shuts down once all sessions close.
    EndSimulation,
    /// Ask all participants to resend their registrations, in case some
    /// were missed during initialization (controller, to the room).
    ReRegisterParticipant,
    /// Model weights finished loading (participant, to the controller).
    ParticipantWeightsLoaded { body: Value },
    /// The sender is ready for the next generation (participant, to the
    /// controller).
    ParticipantReady { body: Value },
    /// Updated curriculum for all participants (controller only).
    UpdateCurriculum { curriculum: Value },
    /// Tell one named participant to load weights (controller only).
    LoadWeights {
        participant_id: String,
        body: Value,
    },
    /// Ask whether the sender's market has registered (controller only).
    /// Answered with `MarketOnline`; silence means it has not.
    IsMarketOnline,
    /// The market is ready to operate (market, to the controller).
    MarketReady,
    /// Acknowledge a `ServerMessage` that carried `ack`. `body` carries the
    /// receiver's reply payload where one is expected (bid/ask relay).
    Ack {
        ack: AckId,
        #[serde(default)]
        body: Value,
    },
    /// Graceful disconnect.
    Goodbye,
}

/// Messages sent by the relay to a client process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Reply to `RegisterMarket` / `JoinMarket` / `RegisterSimController`.
    RegisterReply { accepted: bool },
    /// A participant joined the market (to the market link). The market
    /// must ack before the participant is greeted.
    ParticipantConnected {
        participant_id: String,
        participant_type: String,
        session: ConnectionId,
        ack: AckId,
    },
    /// Market info for a freshly joined participant, sent once the market
    /// has acknowledged the join.
    UpdateMarketInfo { market_id: String },
    /// A participant finished joining (to the controller).
    ParticipantJoined { participant_id: String },
    /// A participant's connection dropped (to the controller).
    ParticipantDisconnected { participant_id: String },
    /// A relayed bid, tagged with the submitter's connection so the
    /// market's settlement can reference it. Must be acked; a non-null
    /// `uuid` in the ack body produces `BidSuccess` for the submitter.
    Bid {
        session: ConnectionId,
        body: Value,
        ack: AckId,
    },
    /// A relayed ask; same contract as `Bid`.
    Ask {
        session: ConnectionId,
        body: Value,
        ack: AckId,
    },
    /// The market accepted the bid (to the submitter).
    BidSuccess { body: Value },
    /// The market accepted the ask (to the submitter).
    AskSuccess { body: Value },
    /// One side of a cleared settlement (to buyer and seller). `price` is
    /// set when the market quoted differentiated buy/sell prices. Must be
    /// acked; the second ack reports delivery to the market.
    Settled {
        commit_id: String,
        price: Option<f64>,
        details: Value,
        ack: AckId,
    },
    /// Both counterparties received the settlement, or at least one was
    /// offline and delivery was skipped (to the market). Sent exactly once
    /// per tracked commit id.
    SettlementDelivered { commit_id: String },
    /// Relayed submetering data (to the market).
    MeterData {
        participant_id: String,
        meter: Value,
    },
    /// Relayed post-delivery transactions (to one participant).
    ReturnExtraTransactions { transactions: Value },
    /// Round begins (to the market room, or to the market when redirected
    /// from `StartRoundSimulation`).
    StartRound { round: Value },
    /// Round is complete (to the controller).
    EndRound { summary: Value },
    /// A participant ended its turn (to the controller).
    EndTurn { participant_id: String },
    /// Generation lifecycle fan-out (to the market room).
    StartGeneration { generation: Value },
    /// Generation lifecycle fan-out (to the market room).
    EndGeneration { generation: Value },
    /// Simulation is over (to the market room).
    EndSimulation,
    /// Resend your registration (to participants in the room).
    ReRegisterParticipant,
    /// Forwarded participant notification (to the controller).
    ParticipantWeightsLoaded { body: Value },
    /// Forwarded participant notification (to the controller).
    ParticipantReady { body: Value },
    /// Forwarded curriculum update (to participants in the room).
    UpdateCurriculum { curriculum: Value },
    /// Forwarded weight-loading instruction (to one participant).
    LoadWeights { body: Value },
    /// The controller's market is registered (reply to `IsMarketOnline`).
    MarketOnline,
    /// Forwarded market readiness notification (to the controller).
    MarketReady,
}

/// A cleared settlement between two counterparties, as reported by the
/// market. `buy_price`/`sell_price` are both set when the market quotes
/// differentiated prices per side; `details` is the rest of the settlement
/// record, relayed untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub buyer_id: String,
    pub seller_id: String,
    pub commit_id: String,
    #[serde(default)]
    pub buy_price: Option<f64>,
    #[serde(default)]
    pub sell_price: Option<f64>,
    #[serde(default)]
    pub details: Value,
}
