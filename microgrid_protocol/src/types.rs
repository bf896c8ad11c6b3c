// Core ID types for the relay protocol.
//
// These are lightweight newtypes used by both `message.rs` (protocol
// messages) and the relay's registries (`microgrid_relay::broker`). They are
// relay-scoped identifiers: the relay assigns compact integer IDs to
// connections and outstanding acknowledgements for efficient wire
// representation. Market ids, participant ids, and commit ids stay as
// caller-supplied strings and never get a newtype here — the relay treats
// them as opaque keys.

use serde::{Deserialize, Serialize};

/// Relay-assigned connection ID. Ephemeral: valid only for the lifetime of
/// one TCP connection, never reused within a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

/// Correlation ID for one outbound message that requires an acknowledgement.
/// The receiver echoes it back in `ClientMessage::Ack`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AckId(pub u64);
