// TCP client for connecting to the market relay.
//
// Provides a non-blocking interface for market, participant, and
// simulation-controller processes (and the integration tests) to talk to
// the relay. Architecture:
// - `connect()` performs the TCP connect on the calling thread, then spawns
//   a background reader thread.
// - The reader thread calls `read_message()` in a loop, deserializes
//   `ServerMessage`, and pushes into an `mpsc` channel.
// - The caller's thread holds a `BufWriter<TcpStream>` for sending.
// - `poll()` drains the inbox non-blocking, returning all queued messages.
//
// Registration is the one blocking operation: `register_market` /
// `join_market` / `register_sim_controller` wait for the relay's
// `RegisterReply` and return its verdict. Any other message that arrives
// while waiting is buffered and handed out by the next `poll()`.
//
// This separation ensures the caller never blocks on network I/O outside
// registration. The reader thread handles the blocking reads, and the
// writer flushes synchronously (acceptable for the small messages we send).

use std::io::{self, BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;

use microgrid_protocol::framing::{read_message, write_message};
use microgrid_protocol::message::{ClientMessage, ServerMessage, Settlement};
use microgrid_protocol::types::AckId;

/// How long a registration call waits for the relay's `RegisterReply`.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced by `RelayClient`. Protocol-level failures (a rejected
/// join, a bid that never earns `BidSuccess`) are not errors — the protocol
/// reports them through reply booleans and silence respectively.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
    #[error("no registration reply within {0:?}")]
    ReplyTimeout(Duration),
    #[error("relay closed the connection")]
    Closed,
}

/// TCP client for relay communication.
pub struct RelayClient {
    writer: BufWriter<TcpStream>,
    inbox: Receiver<ServerMessage>,
    /// Messages that arrived while a registration call was waiting for its
    /// reply; drained by the next `poll()`.
    pending: Vec<ServerMessage>,
    _reader_thread: Option<JoinHandle<()>>,
}

impl RelayClient {
    /// Connect to a relay and spawn the reader thread. The connection has
    /// no session until one of the registration calls succeeds.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).map_err(ClientError::Connect)?;
        let reader_stream = stream.try_clone().map_err(ClientError::Connect)?;
        let writer = BufWriter::new(stream);

        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::spawn(move || {
            reader_loop(BufReader::new(reader_stream), tx);
        });

        Ok(Self {
            writer,
            inbox: rx,
            pending: Vec::new(),
            _reader_thread: Some(reader_thread),
        })
    }

    /// Register as the market authority for `market_id`. Returns the
    /// relay's verdict (always accepted under the current protocol).
    pub fn register_market(&mut self, market_id: &str) -> Result<bool, ClientError> {
        self.send(&ClientMessage::RegisterMarket {
            market_id: market_id.into(),
        })?;
        self.wait_register_reply()
    }

    /// Join a market as a participant. Returns false if the relay rejected
    /// the join (unknown market or empty id).
    pub fn join_market(
        &mut self,
        market_id: &str,
        participant_id: &str,
        participant_type: &str,
    ) -> Result<bool, ClientError> {
        self.send(&ClientMessage::JoinMarket {
            market_id: market_id.into(),
            participant_id: participant_id.into(),
            participant_type: participant_type.into(),
        })?;
        self.wait_register_reply()
    }

    /// Register as the simulation controller for `market_id`. Returns
    /// false if the market is not registered.
    pub fn register_sim_controller(
        &mut self,
        controller_id: &str,
        market_id: &str,
    ) -> Result<bool, ClientError> {
        self.send(&ClientMessage::RegisterSimController {
            controller_id: controller_id.into(),
            market_id: market_id.into(),
        })?;
        self.wait_register_reply()
    }

    /// Submit a bid. Confirmation arrives later as `BidSuccess`, or not at
    /// all — silence means the market did not accept it.
    pub fn send_bid(&mut self, body: Value) -> Result<(), ClientError> {
        self.send(&ClientMessage::Bid { body })
    }

    /// Submit an ask; same confirmation contract as `send_bid`.
    pub fn send_ask(&mut self, body: Value) -> Result<(), ClientError> {
        self.send(&ClientMessage::Ask { body })
    }

    /// Report a cleared settlement to both counterparties (market only).
    pub fn send_settlement(&mut self, settlement: Settlement) -> Result<(), ClientError> {
        self.send(&ClientMessage::SendSettlement { settlement })
    }

    /// Acknowledge a relay message that carried `ack`. `body` carries the
    /// reply payload where one is expected (bid/ask relay).
    pub fn acknowledge(&mut self, ack: AckId, body: Value) -> Result<(), ClientError> {
        self.send(&ClientMessage::Ack { ack, body })
    }

    /// Send any protocol message. The typed helpers above cover the common
    /// paths; lifecycle events go through here.
    pub fn send(&mut self, msg: &ClientMessage) -> Result<(), ClientError> {
        let json = serde_json::to_vec(msg)
            .map_err(io::Error::from)
            .map_err(ClientError::Send)?;
        write_message(&mut self.writer, &json).map_err(ClientError::Send)
    }

    /// Send Goodbye; the relay tears the session down on receipt.
    pub fn disconnect(&mut self) {
        let _ = self.send(&ClientMessage::Goodbye);
    }

    /// Drain all queued server messages (non-blocking).
    pub fn poll(&mut self) -> Vec<ServerMessage> {
        let mut messages = std::mem::take(&mut self.pending);
        while let Ok(msg) = self.inbox.try_recv() {
            messages.push(msg);
        }
        messages
    }

    /// Block until the relay answers a registration call. Unrelated
    /// messages that arrive first are buffered for `poll()`.
    fn wait_register_reply(&mut self) -> Result<bool, ClientError> {
        let deadline = Instant::now() + REPLY_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::ReplyTimeout(REPLY_TIMEOUT));
            }
            match self.inbox.recv_timeout(remaining) {
                Ok(ServerMessage::RegisterReply { accepted }) => return Ok(accepted),
                Ok(other) => self.pending.push(other),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(ClientError::ReplyTimeout(REPLY_TIMEOUT));
                }
                Err(RecvTimeoutError::Disconnected) => return Err(ClientError::Closed),
            }
        }
    }
}

/// Reader thread: read framed messages in a loop, push to channel.
fn reader_loop(mut reader: BufReader<TcpStream>, tx: mpsc::Sender<ServerMessage>) {
    while let Ok(bytes) = read_message(&mut reader) {
        match serde_json::from_slice::<ServerMessage>(&bytes) {
            Ok(msg) => {
                if tx.send(msg).is_err() {
                    break; // Owner dropped the receiver
                }
            }
            Err(_) => break, // Malformed message
        }
    }
}
