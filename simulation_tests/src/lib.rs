// Shared helpers for the end-to-end simulation tests.
//
// `TestClient` wraps `RelayClient` with synchronous deadline polling so
// tests can say "wait until the market hears X" without hand-rolling sleep
// loops. Messages that arrive while waiting for something else are kept in
// a backlog and matched by later waits, since the relay interleaves fan-out
// traffic arbitrarily across connections.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use microgrid_protocol::message::ServerMessage;
use microgrid_relay::RelayClient;
use microgrid_relay::server::{RelayConfig, RelayHandle, start_relay};

/// How long `wait_for` polls before giving up.
const WAIT_DEADLINE: Duration = Duration::from_secs(5);

/// Grace window for `assert_never`: long enough for in-flight relay
/// traffic to land, short enough to keep the suite fast.
const NEVER_WINDOW: Duration = Duration::from_millis(150);

/// Start a relay on an ephemeral port with a fast shutdown watchdog.
pub fn start_test_relay() -> (RelayHandle, SocketAddr) {
    let config = RelayConfig {
        host: "127.0.0.1".into(),
        port: 0,
        shutdown_poll: Duration::from_millis(50),
    };
    start_relay(config).expect("relay should bind an ephemeral port")
}

/// A relay client with deadline polling for test assertions.
pub struct TestClient {
    pub client: RelayClient,
    backlog: Vec<ServerMessage>,
}

impl TestClient {
    pub fn connect(addr: SocketAddr) -> Self {
        Self {
            client: RelayClient::connect(addr).expect("connect to test relay"),
            backlog: Vec::new(),
        }
    }

    /// Poll until a message matching `pred` arrives and return it. Other
    /// messages are retained for later waits. Panics after the deadline.
    pub fn wait_for<F>(&mut self, what: &str, mut pred: F) -> ServerMessage
    where
        F: FnMut(&ServerMessage) -> bool,
    {
        let deadline = Instant::now() + WAIT_DEADLINE;
        loop {
            if let Some(pos) = self.backlog.iter().position(|m| pred(m)) {
                return self.backlog.remove(pos);
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {what}; backlog: {:?}",
                self.backlog
            );
            let mut arrived = self.client.poll();
            if arrived.is_empty() {
                thread::sleep(Duration::from_millis(10));
            } else {
                self.backlog.append(&mut arrived);
            }
        }
    }

    /// Assert that nothing matching `pred` arrives within a grace window.
    pub fn assert_never<F>(&mut self, what: &str, mut pred: F)
    where
        F: FnMut(&ServerMessage) -> bool,
    {
        thread::sleep(NEVER_WINDOW);
        let mut arrived = self.client.poll();
        self.backlog.append(&mut arrived);
        assert!(
            !self.backlog.iter().any(|m| pred(m)),
            "unexpected {what}; backlog: {:?}",
            self.backlog
        );
    }
}
