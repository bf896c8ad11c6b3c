// TCP server and main event loop for the market relay.
//
// Architecture: thread-per-reader with a central `mpsc` channel.
//
// - **Listener thread** (`TcpListener::accept()` loop): accepts new TCP
//   connections, assigns each a `ConnectionId`, sends
//   `InternalEvent::NewConnection` to the main thread, and spawns the
//   connection's reader thread.
// - **Reader threads** (one per client): call `framing::read_message()` in a
//   loop, deserialize `ClientMessage`, and send `InternalEvent::MessageFrom`
//   to the main thread. On error/EOF/Goodbye, send
//   `InternalEvent::Disconnected`.
// - **Main thread**: owns the `Broker`, receives events from the channel,
//   and dispatches them. Uses `recv_timeout` with the shutdown-poll interval
//   as the timeout — once `EndSimulation` has been relayed, each quiet
//   interval checks whether the session registry has drained, and the
//   interval is re-jittered per retry (fixed-plus-random backoff).
//
// The main thread is the only writer to client TCP streams (via
// `Broker::send_to`/`broadcast_room`). Reader threads only read from
// streams. This avoids concurrent read/write on the same `TcpStream`, which
// is safe on most platforms but fragile.
//
// Shutdown: the main thread checks a `keep_running` flag (set to false by
// `RelayHandle::stop`) and breaks out of the event loop; it also stops on
// its own once the registry drains after `EndSimulation`.

use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use log::{debug, info};
use rand::Rng;

use microgrid_protocol::framing::read_message;
use microgrid_protocol::message::ClientMessage;
use microgrid_protocol::types::ConnectionId;

use crate::broker::Broker;

/// Events sent from listener/reader threads to the main thread.
enum InternalEvent {
    NewConnection {
        conn: ConnectionId,
        stream: TcpStream,
    },
    MessageFrom {
        conn: ConnectionId,
        message: ClientMessage,
    },
    Disconnected {
        conn: ConnectionId,
    },
}

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RelayHandle {
    /// Signal the relay to stop and wait for it to shut down.
    pub fn stop(self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread {
            let _ = handle.join();
        }
    }

    /// Wait for the relay to stop on its own (after `EndSimulation` has
    /// been relayed and every session has closed).
    pub fn wait(self) {
        if let Some(handle) = self.thread {
            let _ = handle.join();
        }
    }
}

/// Configuration for starting a relay server.
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Base interval for the post-`EndSimulation` shutdown watchdog; each
    /// retry waits this plus a uniform random slice of it.
    pub shutdown_poll: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 42069,
            shutdown_poll: Duration::from_secs(5),
        }
    }
}

/// Start the relay server on a background thread. Returns a handle for
/// stopping it and the actual bound address (useful when port 0 is used
/// to let the OS pick a free port).
pub fn start_relay(config: RelayConfig) -> std::io::Result<(RelayHandle, std::net::SocketAddr)> {
    let listener = TcpListener::bind(format!("{}:{}", config.host, config.port))?;
    let addr = listener.local_addr()?;
    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_clone = keep_running.clone();

    let thread = thread::spawn(move || {
        run_relay(listener, config, keep_running_clone);
    });

    Ok((
        RelayHandle {
            keep_running,
            thread: Some(thread),
        },
        addr,
    ))
}

/// Main relay loop. Runs until `keep_running` is set to false or the
/// shutdown watchdog fires.
fn run_relay(listener: TcpListener, config: RelayConfig, keep_running: Arc<AtomicBool>) {
    let mut broker = Broker::new();
    let (tx, rx): (Sender<InternalEvent>, Receiver<InternalEvent>) = mpsc::channel();

    // Set the listener to non-blocking so the accept thread can check
    // keep_running periodically.
    listener.set_nonblocking(true).ok();

    // Listener thread: accepts new connections and spawns their readers.
    let keep_running_listener = keep_running.clone();
    let tx_listener = tx.clone();
    thread::spawn(move || {
        let mut next_conn: u64 = 0;
        while keep_running_listener.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false).ok();
                    next_conn += 1;
                    let conn = ConnectionId(next_conn);
                    let read_stream = match stream.try_clone() {
                        Ok(s) => s,
                        Err(_) => continue,
                    };
                    let _ = tx_listener.send(InternalEvent::NewConnection { conn, stream });
                    let tx_reader = tx_listener.clone();
                    let keep_running_reader = keep_running_listener.clone();
                    thread::spawn(move || {
                        reader_loop(
                            BufReader::new(read_stream),
                            conn,
                            tx_reader,
                            keep_running_reader,
                        );
                    });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(_) => break,
            }
        }
    });

    let mut rng = rand::thread_rng();
    let mut poll = jittered(config.shutdown_poll, &mut rng);

    // Main event loop.
    while keep_running.load(Ordering::SeqCst) {
        match rx.recv_timeout(poll) {
            Ok(event) => {
                handle_event(&mut broker, event);
                // Drain any additional events that arrived during handling.
                while let Ok(event) = rx.try_recv() {
                    handle_event(&mut broker, event);
                }
                if broker.is_shutting_down() && broker.session_count() == 0 {
                    info!("all sessions closed; stopping relay");
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if broker.is_shutting_down() {
                    if broker.session_count() == 0 {
                        info!("all sessions closed; stopping relay");
                        break;
                    }
                    debug!(
                        "{} session(s) still open; retrying shutdown",
                        broker.session_count()
                    );
                    poll = jittered(config.shutdown_poll, &mut rng);
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    // Whether we stopped via the handle or the watchdog, take the listener
    // and reader threads down with us.
    keep_running.store(false, Ordering::SeqCst);
}

/// Fixed-plus-random backoff: the base interval plus a uniform slice of it.
fn jittered(base: Duration, rng: &mut impl Rng) -> Duration {
    base + base.mul_f64(rng.gen_range(0.0..1.0))
}

/// Dispatch a single event to the broker.
fn handle_event(broker: &mut Broker, event: InternalEvent) {
    match event {
        InternalEvent::NewConnection { conn, stream } => {
            debug!("{conn:?} connected");
            broker.attach(conn, stream);
        }
        InternalEvent::MessageFrom { conn, message } => {
            handle_message(broker, conn, message);
        }
        InternalEvent::Disconnected { conn } => {
            broker.disconnect(conn);
        }
    }
}

/// Route one inbound protocol event to the matching broker handler.
fn handle_message(broker: &mut Broker, conn: ConnectionId, message: ClientMessage) {
    match message {
        ClientMessage::RegisterMarket { market_id } => {
            broker.register_market(conn, &market_id);
        }
        ClientMessage::JoinMarket {
            market_id,
            participant_id,
            participant_type,
        } => {
            broker.join_market(conn, &market_id, &participant_id, &participant_type);
        }
        ClientMessage::RegisterSimController {
            controller_id,
            market_id,
        } => {
            broker.register_sim_controller(conn, &controller_id, &market_id);
        }
        ClientMessage::Bid { body } => broker.bid(conn, body),
        ClientMessage::Ask { body } => broker.ask(conn, body),
        ClientMessage::MeterData { meter } => broker.meter_data(conn, meter),
        ClientMessage::SendSettlement { settlement } => broker.send_settlement(conn, settlement),
        ClientMessage::ReturnExtraTransactions {
            participant_id,
            transactions,
        } => broker.return_extra_transactions(conn, &participant_id, transactions),
        ClientMessage::StartRound { round } => broker.start_round(conn, round),
        ClientMessage::StartRoundSimulation { round } => {
            broker.start_round_simulation(conn, round);
        }
        ClientMessage::EndRound { summary } => broker.end_round(conn, summary),
        ClientMessage::EndTurn => broker.end_turn(conn),
        ClientMessage::StartGeneration { generation } => broker.start_generation(conn, generation),
        ClientMessage::EndGeneration { generation } => broker.end_generation(conn, generation),
        ClientMessage::EndSimulation => broker.end_simulation(conn),
        ClientMessage::ReRegisterParticipant => broker.re_register_participant(conn),
        ClientMessage::ParticipantWeightsLoaded { body } => {
            broker.participant_weights_loaded(conn, body);
        }
        ClientMessage::ParticipantReady { body } => broker.participant_ready(conn, body),
        ClientMessage::UpdateCurriculum { curriculum } => {
            broker.update_curriculum(conn, curriculum);
        }
        ClientMessage::LoadWeights {
            participant_id,
            body,
        } => broker.load_weights(conn, &participant_id, body),
        ClientMessage::IsMarketOnline => broker.is_market_online(conn),
        ClientMessage::MarketReady => broker.market_ready(conn),
        ClientMessage::Ack { ack, body } => broker.ack(conn, ack, body),
        ClientMessage::Goodbye => {
            // Goodbye is handled in the reader loop.
        }
    }
}

/// Reader loop for a single client. Runs in its own thread.
fn reader_loop(
    mut reader: BufReader<TcpStream>,
    conn: ConnectionId,
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
) {
    while keep_running.load(Ordering::SeqCst) {
        match read_message(&mut reader) {
            Ok(bytes) => match serde_json::from_slice::<ClientMessage>(&bytes) {
                Ok(ClientMessage::Goodbye) => {
                    let _ = tx.send(InternalEvent::Disconnected { conn });
                    break;
                }
                Ok(message) => {
                    let _ = tx.send(InternalEvent::MessageFrom { conn, message });
                }
                Err(_) => {
                    // Malformed message — disconnect.
                    let _ = tx.send(InternalEvent::Disconnected { conn });
                    break;
                }
            },
            Err(_) => {
                // Read error or EOF — disconnect.
                let _ = tx.send(InternalEvent::Disconnected { conn });
                break;
            }
        }
    }
}
