// microgrid_protocol — wire protocol for the market relay.
//
// This crate defines the message types, framing, and serialization used by
// the relay (`microgrid_relay`) and the market / participant / simulation-
// controller processes to communicate over TCP. It is shared between both
// sides and has no dependency on any market or agent implementation.
//
// Module overview:
// - `types.rs`:    Core ID types — `ConnectionId`, `AckId`.
// - `message.rs`:  Client-to-relay and relay-to-client message enums, plus
//                  the `Settlement` record shared by both directions.
// - `framing.rs`:  Length-delimited framing over any `Read`/`Write` stream:
//                  4-byte big-endian length prefix, then JSON payload.
//
// Design decisions:
// - **JSON serialization.** Every process in the simulation stack already
//   speaks JSON; binary framing can be swapped in later if bandwidth matters.
// - **Opaque bodies as `serde_json::Value`.** The relay never inspects bid,
//   meter, round, or curriculum payloads — it only routes on ids and prices.
// - **Closed message enums.** Routing is a `match` over a tagged union, so an
//   unhandled event kind is a compile error rather than a silently dropped
//   string topic.
// - **No async runtime.** Uses `std::io::Read`/`Write` for framing,
//   compatible with both blocking TCP streams and buffered wrappers.

pub mod framing;
pub mod message;
pub mod types;

pub use framing::{MAX_MESSAGE_SIZE, read_message, write_message};
pub use message::{ClientMessage, ServerMessage, Settlement};
pub use types::{AckId, ConnectionId};
