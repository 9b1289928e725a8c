//! Wire formats shared by the console relay server and its tools.
//!
//! Two protocols live here:
//!
//! - The **relay protocol** (`relay`), spoken over TCP between the relay and
//!   its subscribers. Frames are little-endian: a 4-byte magic, a 1-byte
//!   packet type, a 2-byte payload length and the payload. Heartbeats are the
//!   one exception and carry only the magic and the type byte.
//! - The **control protocol** (`control`), spoken over UDP between the relay
//!   and `relayctl`. Frames are big-endian and carry a sender timestamp so the
//!   requester can reject stale replies.
//!
//! Frames are built fresh for every send and parsed fresh for every receive.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod control;
pub mod error;
pub mod relay;

pub use control::{ControlCommand, ControlFrame, ControlMessage, StatusReport};
pub use error::{FrameError, RequestError};
pub use relay::{read_frame, write_frame, ConnectionRequest, Frame, PacketType, RelayedMessage};

/// Magic prefix of every relay-protocol frame.
pub const RELAY_MAGIC: u32 = 0xFFFF_FFFF;

/// Magic prefix of every control-protocol frame.
pub const CONTROL_MAGIC: u32 = 0xFFFF_FFFE;

/// Version byte carried in message-data and control frames.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest payload a relay frame may declare.
pub const MAX_PAYLOAD_LEN: usize = 4096;

/// Magic + type + length.
pub const HEADER_LEN: usize = 7;

/// Magic + type, the complete heartbeat frame.
pub const HEARTBEAT_LEN: usize = 5;

/// Marker that starts the payload of a connection request.
pub const REQUEST_MARKER: &str = "P ";

/// Marker that starts a game-server log line inside a datagram.
pub const LOG_LINE_MARKER: &[u8] = b"L ";

/// Reason strings carried by connection-failure frames. Subscribers match on
/// these, so they never change.
pub mod reasons {
    pub const INVALID_PACKET: &str = "E Invalid packet";
    pub const INVALID_CONTENT_LENGTH: &str = "E Invalid content length";
    pub const EMPTY_PACKET: &str = "E Empty packet";
    pub const BAD_PASSWORD: &str = "E Bad password";
    pub const BAD_IP_ADDRESS: &str = "E Bad IP address";
    pub const BAD_PORT_NUMBER: &str = "E Bad port number";
    pub const TOO_MANY_CONNECTIONS: &str = "E Too many connections";
}

/// Payload of the connection-success frame.
pub const SUCCESS_TEXT: &str = "OK";

/// Identity announced to every new subscriber before anything else.
pub fn identity_string() -> String {
    format!("Console Relay {}", env!("CARGO_PKG_VERSION"))
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as i64
}

/// Current wall-clock time in whole seconds since the Unix epoch.
pub fn timestamp_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs() as u32
}
