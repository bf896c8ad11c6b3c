// Broker state for the market relay.
//
// `Broker` is the central data structure that `server.rs` drives. It owns
// every piece of process-wide coordination state: the session registry
// (connection → role/client/market), the market registry (market → link,
// participant roster, controller binding, open settlements), room
// membership for fan-out, and the pending-acknowledgement table. All
// mutation happens through methods called from the server's single-threaded
// main loop — no internal locking.
//
// Key responsibilities:
// - Registration: bind market links, participant slots, and controller
//   slots; re-registration of a market is last-writer-wins and resets the
//   roster.
// - Relay: forward bids/asks/meter data to the market, settlements to both
//   counterparties, lifecycle signals to the right room or single target,
//   validating the sender's role and dropping anything unroutable. The
//   absence of a derived success/delivery event is the only failure signal
//   the protocol has.
// - Acknowledgements: outbound messages that need confirmation carry an
//   `AckId`; the matching inbound `Ack` runs a deferred action (greet a
//   joined participant, derive bid/ask success, flip a settlement receipt).
// - Settlements: one boolean per commit id, XOR-flipped by each
//   counterparty's receipt; the flip that lands back on `true` pops the
//   entry and reports `SettlementDelivered` to the market exactly once.
//
// Writing to client streams: `Broker` holds cloned `TcpStream` write halves
// wrapped in `BufWriter`. The `send_to` / `broadcast_room` helpers serialize
// a `ServerMessage` to JSON, frame it, and write it out. Write errors on a
// single client are logged but do not crash the relay — the reader thread
// for that client will detect the broken pipe and send a disconnect event.

use std::collections::{BTreeSet, HashMap};
use std::io::{self, BufWriter};
use std::net::TcpStream;

use log::{debug, info, warn};
use serde_json::Value;

use microgrid_protocol::framing::write_message;
use microgrid_protocol::message::{ServerMessage, Settlement};
use microgrid_protocol::types::{AckId, ConnectionId};

/// Room that every simulation controller joins in addition to its market's
/// room, for simulation-wide fan-out.
pub const SIMULATION_ROOM: &str = "simulation";

/// Reserved counterparty id for the external grid. The grid is not a
/// tracked participant, so settlements against it need no handshake.
const GRID_ID: &str = "grid";

/// Role a connection registered as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientRole {
    Market,
    Participant,
    SimController,
}

/// One registered connection: who it is and which market it belongs to.
#[derive(Clone, Debug)]
pub struct Session {
    pub client_id: String,
    pub role: ClientRole,
    pub market_id: String,
}

#[derive(Clone, Copy, Debug)]
struct ParticipantSlot {
    online: bool,
    conn: ConnectionId,
}

#[derive(Clone, Debug)]
struct ControllerSlot {
    id: String,
    conn: ConnectionId,
}

/// Registry entry for one market. Created on `RegisterMarket` and never
/// removed for the process lifetime; only participant `online` flags flip.
struct MarketEntry {
    market: ConnectionId,
    participants: HashMap<String, ParticipantSlot>,
    sim_controller: Option<ControllerSlot>,
    /// Open settlement handshakes, keyed by commit id. Inserted `true`,
    /// XOR-flipped by each counterparty receipt; popped when the second
    /// flip lands back on `true`.
    settlements: HashMap<String, bool>,
}

impl MarketEntry {
    fn new(market: ConnectionId) -> Self {
        Self {
            market,
            participants: HashMap::new(),
            sim_controller: None,
            settlements: HashMap::new(),
        }
    }
}

/// Deferred action to run when the matching `Ack` arrives.
enum AckAction {
    /// The market acknowledged a join: greet the participant with market
    /// info and tell the controller, if one is registered.
    GreetParticipant {
        market_id: String,
        participant: ConnectionId,
    },
    /// The market acknowledged a relayed bid; a non-null `uuid` in the ack
    /// body derives `BidSuccess` for the submitter.
    BidRelayed { submitter: ConnectionId },
    /// Same contract as `BidRelayed`, for asks.
    AskRelayed { submitter: ConnectionId },
    /// A counterparty acknowledged its `Settled` message: flip the commit's
    /// tracker entry.
    SettlementReceipt {
        market_id: String,
        commit_id: String,
    },
}

struct PendingAck {
    /// Connection the acknowledgement must come from.
    from: ConnectionId,
    action: AckAction,
}

/// Relay coordination state: session registry, market registry, rooms, and
/// pending acknowledgements. Driven exclusively by the server loop.
pub struct Broker {
    links: HashMap<ConnectionId, BufWriter<TcpStream>>,
    sessions: HashMap<ConnectionId, Session>,
    markets: HashMap<String, MarketEntry>,
    rooms: HashMap<String, BTreeSet<ConnectionId>>,
    pending: HashMap<AckId, PendingAck>,
    next_ack: u64,
    shutting_down: bool,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            links: HashMap::new(),
            sessions: HashMap::new(),
            markets: HashMap::new(),
            rooms: HashMap::new(),
            pending: HashMap::new(),
            next_ack: 0,
            shutting_down: false,
        }
    }

    /// Take ownership of a new connection's write half. The connection has
    /// no session until it registers.
    pub fn attach(&mut self, conn: ConnectionId, stream: TcpStream) {
        self.links.insert(conn, BufWriter::new(stream));
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register `conn` as the market authority for `market_id`. Always
    /// succeeds; re-registration replaces the previous link and resets the
    /// roster (participants re-join via `ReRegisterParticipant`).
    pub fn register_market(&mut self, conn: ConnectionId, market_id: &str) -> bool {
        if self
            .markets
            .insert(market_id.to_string(), MarketEntry::new(conn))
            .is_some()
        {
            warn!("market {market_id} re-registered; roster reset");
        }
        self.sessions.insert(
            conn,
            Session {
                client_id: market_id.to_string(),
                role: ClientRole::Market,
                market_id: market_id.to_string(),
            },
        );
        self.enter_room(market_id, conn);
        info!("market {market_id} registered on {conn:?}");
        self.send_to(conn, &ServerMessage::RegisterReply { accepted: true });
        true
    }

    /// Register `conn` as participant `participant_id` of `market_id`.
    /// Fails if the market is unknown or the id is empty. On success the
    /// market is told about the join and must ack before the participant
    /// is greeted with market info.
    pub fn join_market(
        &mut self,
        conn: ConnectionId,
        market_id: &str,
        participant_id: &str,
        participant_type: &str,
    ) -> bool {
        if participant_id.is_empty() || !self.markets.contains_key(market_id) {
            debug!("join of {participant_id:?} to {market_id:?} rejected");
            self.send_to(conn, &ServerMessage::RegisterReply { accepted: false });
            return false;
        }

        self.sessions.insert(
            conn,
            Session {
                client_id: participant_id.to_string(),
                role: ClientRole::Participant,
                market_id: market_id.to_string(),
            },
        );
        let market_conn = match self.markets.get_mut(market_id) {
            Some(entry) => {
                entry
                    .participants
                    .insert(participant_id.to_string(), ParticipantSlot { online: true, conn });
                entry.market
            }
            None => return false,
        };
        self.enter_room(market_id, conn);
        info!("participant {participant_id} joined market {market_id}");

        let ack = self.issue_ack(
            market_conn,
            AckAction::GreetParticipant {
                market_id: market_id.to_string(),
                participant: conn,
            },
        );
        self.send_to(conn, &ServerMessage::RegisterReply { accepted: true });
        self.send_to(
            market_conn,
            &ServerMessage::ParticipantConnected {
                participant_id: participant_id.to_string(),
                participant_type: participant_type.to_string(),
                session: conn,
                ack,
            },
        );
        true
    }

    /// Register `conn` as the simulation controller for `market_id`. Fails
    /// if the market is unknown. The controller joins both the market room
    /// and the global simulation room.
    pub fn register_sim_controller(
        &mut self,
        conn: ConnectionId,
        controller_id: &str,
        market_id: &str,
    ) -> bool {
        if !self.markets.contains_key(market_id) {
            debug!("controller {controller_id:?} addressed unknown market {market_id:?}");
            self.send_to(conn, &ServerMessage::RegisterReply { accepted: false });
            return false;
        }
        if let Some(entry) = self.markets.get_mut(market_id) {
            entry.sim_controller = Some(ControllerSlot {
                id: controller_id.to_string(),
                conn,
            });
        }
        self.sessions.insert(
            conn,
            Session {
                client_id: controller_id.to_string(),
                role: ClientRole::SimController,
                market_id: market_id.to_string(),
            },
        );
        self.enter_room(market_id, conn);
        self.enter_room(SIMULATION_ROOM, conn);
        info!("sim controller {controller_id} registered for market {market_id}");
        self.send_to(conn, &ServerMessage::RegisterReply { accepted: true });
        true
    }

    /// Tear down a connection: drop its writer and room membership, remove
    /// its session (no-op if it never registered), flip its participant
    /// slot offline, and resolve any acknowledgements it still owed.
    pub fn disconnect(&mut self, conn: ConnectionId) {
        self.links.remove(&conn);
        for members in self.rooms.values_mut() {
            members.remove(&conn);
        }

        let Some(session) = self.sessions.remove(&conn) else {
            return;
        };
        info!(
            "{} ({:?}) disconnected from market {}",
            session.client_id, session.role, session.market_id
        );

        match session.role {
            ClientRole::Participant => {
                let mut notify = None;
                if let Some(entry) = self.markets.get_mut(&session.market_id) {
                    if let Some(slot) = entry.participants.get_mut(&session.client_id) {
                        // Guard against a stale connection flipping a slot
                        // the participant has since re-joined.
                        if slot.conn == conn {
                            slot.online = false;
                        }
                        notify = entry.sim_controller.as_ref().map(|c| c.conn);
                    }
                }
                if let Some(controller) = notify {
                    self.send_to(
                        controller,
                        &ServerMessage::ParticipantDisconnected {
                            participant_id: session.client_id.clone(),
                        },
                    );
                }
            }
            ClientRole::SimController => {
                if let Some(entry) = self.markets.get_mut(&session.market_id) {
                    if entry.sim_controller.as_ref().is_some_and(|c| c.conn == conn) {
                        entry.sim_controller = None;
                    }
                }
            }
            ClientRole::Market => {
                warn!(
                    "market link for {} dropped; relaying stalls until it re-registers",
                    session.market_id
                );
            }
        }

        self.resolve_pending_for(conn);
    }

    // ------------------------------------------------------------------
    // Trading relay
    // ------------------------------------------------------------------

    /// Forward a participant's bid to its market, tagged with the sender's
    /// connection and an acknowledgement id.
    pub fn bid(&mut self, conn: ConnectionId, body: Value) {
        self.relay_order(conn, body, true);
    }

    /// Forward a participant's ask to its market; same contract as `bid`.
    pub fn ask(&mut self, conn: ConnectionId, body: Value) {
        self.relay_order(conn, body, false);
    }

    fn relay_order(&mut self, conn: ConnectionId, body: Value, is_bid: bool) {
        let Some(session) = self.session_as(conn, ClientRole::Participant) else {
            return;
        };
        let market_id = session.market_id.clone();
        let Some(entry) = self.markets.get(&market_id) else {
            return;
        };
        let market_conn = entry.market;
        let action = if is_bid {
            AckAction::BidRelayed { submitter: conn }
        } else {
            AckAction::AskRelayed { submitter: conn }
        };
        let ack = self.issue_ack(market_conn, action);
        let msg = if is_bid {
            ServerMessage::Bid {
                session: conn,
                body,
                ack,
            }
        } else {
            ServerMessage::Ask {
                session: conn,
                body,
                ack,
            }
        };
        self.send_to(market_conn, &msg);
    }

    /// Forward submetering data to the sender's market.
    pub fn meter_data(&mut self, conn: ConnectionId, meter: Value) {
        let Some(session) = self.session_as(conn, ClientRole::Participant) else {
            return;
        };
        let participant_id = session.client_id.clone();
        let market_id = session.market_id.clone();
        let Some(entry) = self.markets.get(&market_id) else {
            return;
        };
        let market_conn = entry.market;
        self.send_to(
            market_conn,
            &ServerMessage::MeterData {
                participant_id,
                meter,
            },
        );
    }

    /// Notify both counterparties of a cleared settlement and track their
    /// receipts. Grid counterparties are untracked (no-op); an offline
    /// counterparty skips the handshake and reports delivery immediately.
    pub fn send_settlement(&mut self, conn: ConnectionId, settlement: Settlement) {
        let Some(session) = self.session_as(conn, ClientRole::Market) else {
            return;
        };
        let market_id = session.market_id.clone();

        if settlement.buyer_id == GRID_ID || settlement.seller_id == GRID_ID {
            return;
        }

        let Some(entry) = self.markets.get_mut(&market_id) else {
            return;
        };
        let market_conn = entry.market;
        let buyer = entry.participants.get(&settlement.buyer_id).copied();
        let seller = entry.participants.get(&settlement.seller_id).copied();
        let (Some(buyer), Some(seller)) = (buyer, seller) else {
            debug!(
                "settlement {} references unknown counterparties",
                settlement.commit_id
            );
            return;
        };

        if buyer.online && seller.online {
            entry.settlements.insert(settlement.commit_id.clone(), true);

            let buyer_ack = self.issue_ack(
                buyer.conn,
                AckAction::SettlementReceipt {
                    market_id: market_id.clone(),
                    commit_id: settlement.commit_id.clone(),
                },
            );
            let seller_ack = self.issue_ack(
                seller.conn,
                AckAction::SettlementReceipt {
                    market_id,
                    commit_id: settlement.commit_id.clone(),
                },
            );

            // Differentiated pricing: only when both sides are quoted does
            // each party see its own price; a single-sided quote is not
            // forwarded.
            let (buyer_price, seller_price) =
                match (settlement.buy_price, settlement.sell_price) {
                    (Some(buy), Some(sell)) => (Some(buy), Some(sell)),
                    _ => (None, None),
                };

            self.send_to(
                buyer.conn,
                &ServerMessage::Settled {
                    commit_id: settlement.commit_id.clone(),
                    price: buyer_price,
                    details: settlement.details.clone(),
                    ack: buyer_ack,
                },
            );
            self.send_to(
                seller.conn,
                &ServerMessage::Settled {
                    commit_id: settlement.commit_id,
                    price: seller_price,
                    details: settlement.details,
                    ack: seller_ack,
                },
            );
        } else {
            self.send_to(
                market_conn,
                &ServerMessage::SettlementDelivered {
                    commit_id: settlement.commit_id,
                },
            );
        }
    }

    /// Forward post-delivery transactions to one named participant.
    pub fn return_extra_transactions(
        &mut self,
        conn: ConnectionId,
        participant_id: &str,
        transactions: Value,
    ) {
        let Some(session) = self.session_as(conn, ClientRole::Market) else {
            return;
        };
        let market_id = session.market_id.clone();
        let target = self
            .markets
            .get(&market_id)
            .and_then(|e| e.participants.get(participant_id))
            .map(|p| p.conn);
        let Some(target) = target else {
            debug!("extra transactions for unknown participant {participant_id:?}");
            return;
        };
        if !self.sessions.contains_key(&target) {
            return;
        }
        self.send_to(target, &ServerMessage::ReturnExtraTransactions { transactions });
    }

    // ------------------------------------------------------------------
    // Acknowledgements
    // ------------------------------------------------------------------

    /// Run the deferred action for an acknowledged message. Unknown or
    /// already-consumed ids are ignored; an ack from the wrong connection
    /// leaves the entry pending.
    pub fn ack(&mut self, conn: ConnectionId, ack: AckId, body: Value) {
        let Some(pending) = self.pending.remove(&ack) else {
            debug!("ignoring {ack:?}: unknown or already consumed");
            return;
        };
        if pending.from != conn {
            warn!(
                "{ack:?} arrived from {conn:?}, expected {:?}",
                pending.from
            );
            self.pending.insert(ack, pending);
            return;
        }
        match pending.action {
            AckAction::GreetParticipant {
                market_id,
                participant,
            } => self.greet_participant(&market_id, participant),
            AckAction::BidRelayed { submitter } => {
                if order_accepted(&body) {
                    self.send_to(submitter, &ServerMessage::BidSuccess { body });
                }
            }
            AckAction::AskRelayed { submitter } => {
                if order_accepted(&body) {
                    self.send_to(submitter, &ServerMessage::AskSuccess { body });
                }
            }
            AckAction::SettlementReceipt {
                market_id,
                commit_id,
            } => self.settle_flip(&market_id, &commit_id),
        }
    }

    /// Greet a participant whose join the market has acknowledged, and
    /// tell the controller about it.
    fn greet_participant(&mut self, market_id: &str, participant: ConnectionId) {
        // The participant may have dropped between join and the ack.
        let Some(session) = self.sessions.get(&participant) else {
            return;
        };
        let participant_id = session.client_id.clone();
        self.send_to(
            participant,
            &ServerMessage::UpdateMarketInfo {
                market_id: market_id.to_string(),
            },
        );
        let controller = self
            .markets
            .get(market_id)
            .and_then(|e| e.sim_controller.as_ref())
            .map(|c| c.conn);
        if let Some(controller) = controller {
            self.send_to(controller, &ServerMessage::ParticipantJoined { participant_id });
        }
    }

    /// XOR-flip one settlement receipt. The second receipt lands the flag
    /// back on `true`, which pops the entry and reports delivery to the
    /// market exactly once.
    fn settle_flip(&mut self, market_id: &str, commit_id: &str) {
        let Some(entry) = self.markets.get_mut(market_id) else {
            return;
        };
        let delivered = match entry.settlements.get_mut(commit_id) {
            Some(flag) => {
                *flag ^= true;
                *flag
            }
            None => {
                debug!("ignoring receipt for unknown settlement {commit_id}");
                false
            }
        };
        if delivered {
            entry.settlements.remove(commit_id);
            let market_conn = entry.market;
            self.send_to(
                market_conn,
                &ServerMessage::SettlementDelivered {
                    commit_id: commit_id.to_string(),
                },
            );
        }
    }

    /// Consume pending acknowledgements owed by a connection that is gone.
    /// Settlement receipts are resolved as undeliverable so the market
    /// still gets its `SettlementDelivered`; everything else is dropped.
    fn resolve_pending_for(&mut self, conn: ConnectionId) {
        let due: Vec<AckId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.from == conn)
            .map(|(&id, _)| id)
            .collect();
        for id in due {
            if let Some(pending) = self.pending.remove(&id) {
                if let AckAction::SettlementReceipt {
                    market_id,
                    commit_id,
                } = pending.action
                {
                    self.settle_flip(&market_id, &commit_id);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Round / generation lifecycle
    // ------------------------------------------------------------------

    /// Market starts the next round: fan out to its room, skipping itself.
    pub fn start_round(&mut self, conn: ConnectionId, round: Value) {
        let Some(market_id) = self.registered_market(conn) else {
            return;
        };
        self.broadcast_room(&market_id, &[conn], &ServerMessage::StartRound { round });
    }

    /// Controller asks the market to start the next round; the market will
    /// emit `StartRound` itself.
    pub fn start_round_simulation(&mut self, conn: ConnectionId, round: Value) {
        let Some(market_id) = self.registered_controller(conn) else {
            return;
        };
        let Some(entry) = self.markets.get(&market_id) else {
            return;
        };
        let market_conn = entry.market;
        self.send_to(market_conn, &ServerMessage::StartRound { round });
    }

    /// Market reports the round complete to the controller.
    pub fn end_round(&mut self, conn: ConnectionId, summary: Value) {
        let Some(market_id) = self.registered_market(conn) else {
            return;
        };
        let Some(controller) = self.controller_conn(&market_id) else {
            return;
        };
        self.send_to(controller, &ServerMessage::EndRound { summary });
    }

    /// Participant reports its turn complete; the controller learns which
    /// participant by client id.
    pub fn end_turn(&mut self, conn: ConnectionId) {
        let Some(session) = self.session_as(conn, ClientRole::Participant) else {
            return;
        };
        let participant_id = session.client_id.clone();
        let market_id = session.market_id.clone();
        let Some(controller) = self.controller_conn(&market_id) else {
            return;
        };
        self.send_to(controller, &ServerMessage::EndTurn { participant_id });
    }

    /// Controller fan-out: a new generation begins.
    pub fn start_generation(&mut self, conn: ConnectionId, generation: Value) {
        let Some(market_id) = self.registered_controller(conn) else {
            return;
        };
        self.broadcast_room(
            &market_id,
            &[conn],
            &ServerMessage::StartGeneration { generation },
        );
    }

    /// Controller fan-out: the current generation is over.
    pub fn end_generation(&mut self, conn: ConnectionId, generation: Value) {
        let Some(market_id) = self.registered_controller(conn) else {
            return;
        };
        self.broadcast_room(
            &market_id,
            &[conn],
            &ServerMessage::EndGeneration { generation },
        );
    }

    /// Controller fan-out: the simulation is over. Arms the shutdown
    /// watchdog — the server loop exits once the session registry drains.
    pub fn end_simulation(&mut self, conn: ConnectionId) {
        let Some(market_id) = self.registered_controller(conn) else {
            return;
        };
        self.broadcast_room(&market_id, &[conn], &ServerMessage::EndSimulation);
        self.shutting_down = true;
        info!("simulation over for market {market_id}; draining sessions before shutdown");
    }

    /// Controller asks every participant in the room to resend its
    /// registration (the market link and the sender are skipped).
    pub fn re_register_participant(&mut self, conn: ConnectionId) {
        let Some(market_id) = self.registered_controller(conn) else {
            return;
        };
        let Some(entry) = self.markets.get(&market_id) else {
            return;
        };
        let market_conn = entry.market;
        self.broadcast_room(
            &market_id,
            &[conn, market_conn],
            &ServerMessage::ReRegisterParticipant,
        );
    }

    /// Forwarded participant notification: weights finished loading.
    pub fn participant_weights_loaded(&mut self, conn: ConnectionId, body: Value) {
        let Some(session) = self.session_as(conn, ClientRole::Participant) else {
            return;
        };
        let market_id = session.market_id.clone();
        let Some(controller) = self.controller_conn(&market_id) else {
            return;
        };
        self.send_to(controller, &ServerMessage::ParticipantWeightsLoaded { body });
    }

    /// Forwarded participant notification: ready for the next generation.
    pub fn participant_ready(&mut self, conn: ConnectionId, body: Value) {
        let Some(session) = self.session_as(conn, ClientRole::Participant) else {
            return;
        };
        let market_id = session.market_id.clone();
        let Some(controller) = self.controller_conn(&market_id) else {
            return;
        };
        self.send_to(controller, &ServerMessage::ParticipantReady { body });
    }

    /// Controller pushes an updated curriculum to the participants (the
    /// market link and the sender are skipped).
    pub fn update_curriculum(&mut self, conn: ConnectionId, curriculum: Value) {
        let Some(market_id) = self.registered_controller(conn) else {
            return;
        };
        let Some(entry) = self.markets.get(&market_id) else {
            return;
        };
        let market_conn = entry.market;
        self.broadcast_room(
            &market_id,
            &[conn, market_conn],
            &ServerMessage::UpdateCurriculum { curriculum },
        );
    }

    /// Controller instructs one named participant to load weights.
    pub fn load_weights(&mut self, conn: ConnectionId, participant_id: &str, body: Value) {
        let Some(market_id) = self.registered_controller(conn) else {
            return;
        };
        let target = self
            .markets
            .get(&market_id)
            .and_then(|e| e.participants.get(participant_id))
            .map(|p| p.conn);
        let Some(target) = target else {
            debug!("load_weights for unknown participant {participant_id:?}");
            return;
        };
        self.send_to(target, &ServerMessage::LoadWeights { body });
    }

    /// Controller asks whether its market has registered. Replies with
    /// `MarketOnline` if it has; silence otherwise.
    pub fn is_market_online(&mut self, conn: ConnectionId) {
        let Some(session) = self.session_as(conn, ClientRole::SimController) else {
            return;
        };
        let market_id = session.market_id.clone();
        if self.markets.contains_key(&market_id) {
            self.send_to(conn, &ServerMessage::MarketOnline);
        }
    }

    /// Market tells the controller it is ready to operate.
    pub fn market_ready(&mut self, conn: ConnectionId) {
        let Some(market_id) = self.registered_market(conn) else {
            return;
        };
        let Some(controller) = self.controller_conn(&market_id) else {
            return;
        };
        self.send_to(controller, &ServerMessage::MarketReady);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// True once `EndSimulation` has been relayed; the server loop then
    /// polls `session_count` until the registry drains.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Number of registered sessions (markets, participants, controllers).
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether a market has registered under this id.
    pub fn market_is_registered(&self, market_id: &str) -> bool {
        self.markets.contains_key(market_id)
    }

    /// A participant's online flag, or None if market or participant is
    /// unknown.
    pub fn participant_online(&self, market_id: &str, participant_id: &str) -> Option<bool> {
        self.markets
            .get(market_id)?
            .participants
            .get(participant_id)
            .map(|p| p.online)
    }

    /// The registered controller's client id for a market, if any.
    pub fn controller_id(&self, market_id: &str) -> Option<&str> {
        self.markets
            .get(market_id)?
            .sim_controller
            .as_ref()
            .map(|c| c.id.as_str())
    }

    /// Number of settlement handshakes still awaiting receipts.
    pub fn open_settlements(&self, market_id: &str) -> usize {
        self.markets
            .get(market_id)
            .map_or(0, |e| e.settlements.len())
    }

    /// Number of outbound messages still awaiting acknowledgement.
    pub fn pending_ack_count(&self) -> usize {
        self.pending.len()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Resolve the sender's session, requiring `role`. Unregistered
    /// senders and role mismatches are dropped with a debug log.
    fn session_as(&self, conn: ConnectionId, role: ClientRole) -> Option<&Session> {
        match self.sessions.get(&conn) {
            Some(session) if session.role == role => Some(session),
            Some(session) => {
                debug!(
                    "dropping event from {conn:?}: sender is {:?}, expected {role:?}",
                    session.role
                );
                None
            }
            None => {
                debug!("dropping event from unregistered connection {conn:?}");
                None
            }
        }
    }

    /// Resolve `conn` as the market link its registry entry currently
    /// recognizes (a replaced link no longer routes).
    fn registered_market(&self, conn: ConnectionId) -> Option<String> {
        let session = self.session_as(conn, ClientRole::Market)?;
        let entry = self.markets.get(&session.market_id)?;
        if entry.market == conn {
            Some(session.market_id.clone())
        } else {
            debug!("dropping market event from superseded link {conn:?}");
            None
        }
    }

    /// Resolve `conn` as the controller its market currently recognizes.
    fn registered_controller(&self, conn: ConnectionId) -> Option<String> {
        let session = self.session_as(conn, ClientRole::SimController)?;
        let entry = self.markets.get(&session.market_id)?;
        if entry.sim_controller.as_ref().is_some_and(|c| c.conn == conn) {
            Some(session.market_id.clone())
        } else {
            debug!("dropping controller event from superseded link {conn:?}");
            None
        }
    }

    fn controller_conn(&self, market_id: &str) -> Option<ConnectionId> {
        self.markets
            .get(market_id)?
            .sim_controller
            .as_ref()
            .map(|c| c.conn)
    }

    fn issue_ack(&mut self, from: ConnectionId, action: AckAction) -> AckId {
        self.next_ack += 1;
        let id = AckId(self.next_ack);
        self.pending.insert(id, PendingAck { from, action });
        id
    }

    fn enter_room(&mut self, room: &str, conn: ConnectionId) {
        self.rooms.entry(room.to_string()).or_default().insert(conn);
    }

    /// Send a message to a specific connection. Write errors are logged
    /// and otherwise ignored (the reader thread will detect the broken
    /// pipe and deliver the authoritative disconnect).
    fn send_to(&mut self, conn: ConnectionId, msg: &ServerMessage) {
        if let Some(writer) = self.links.get_mut(&conn) {
            if let Err(e) = send_message(writer, msg) {
                warn!("write to {conn:?} failed: {e}");
            }
        }
    }

    /// Broadcast a message to every member of a room except `skip`.
    fn broadcast_room(&mut self, room: &str, skip: &[ConnectionId], msg: &ServerMessage) {
        let members: Vec<ConnectionId> = self
            .rooms
            .get(room)
            .map(|members| {
                members
                    .iter()
                    .copied()
                    .filter(|conn| !skip.contains(conn))
                    .collect()
            })
            .unwrap_or_default();
        for conn in members {
            self.send_to(conn, msg);
        }
    }
}

/// The market confirms a relayed order by acking with a body whose `uuid`
/// is non-null; anything else derives no success event.
fn order_accepted(body: &Value) -> bool {
    body.get("uuid").is_some_and(|uuid| !uuid.is_null())
}

/// Serialize a `ServerMessage` to JSON and write it with length-delimited
/// framing. Returns any I/O error (caller decides whether to log).
fn send_message(writer: &mut BufWriter<TcpStream>, msg: &ServerMessage) -> io::Result<()> {
    let json = serde_json::to_vec(msg)?;
    write_message(writer, &json)
}
