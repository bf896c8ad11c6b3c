// microgrid_relay — market relay and session coordinator.
//
// This crate implements the central broker of the microgrid simulation: it
// accepts TCP connections from market, participant, and simulation-
// controller processes, tracks who belongs to which market, and routes
// protocol events between them — bids and asks to the market, settlements
// to both counterparties with delivery tracking, round/generation lifecycle
// signals to the right room. It never computes market-clearing logic; all
// trading decisions stay in the market process.
//
// Module overview:
// - `broker.rs`:  Coordination state — session registry, market registry
//                 (participant roster, controller binding, open
//                 settlements), room membership, pending acknowledgements.
//                 The core data structure that `server.rs` drives.
// - `server.rs`:  TCP listener, reader threads (one per client), and the
//                 main event loop. Uses `std::net` with a thread-per-reader
//                 architecture and an `mpsc` channel to funnel events into
//                 the single-threaded `Broker`. Owns the post-simulation
//                 shutdown watchdog.
// - `client.rs`:  `RelayClient`, the library the external processes (and
//                 the integration tests) use to speak the protocol.
//
// Dependencies: `microgrid_protocol` (shared message types and framing).
// No dependency on any market or agent implementation.
//
// The relay can run as a standalone binary (`main.rs`) or be embedded in a
// test harness via the library API (`start_relay`).

pub mod broker;
pub mod client;
pub mod server;

pub use client::RelayClient;
pub use server::start_relay;
