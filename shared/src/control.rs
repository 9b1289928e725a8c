//! Control-protocol frames (big-endian) for the out-of-band status and
//! shutdown channel.
//!
//! Layout: `magic:u32 | version:u8 | timestamp:i64 (ms) | command:u8`
//! followed by a command-specific payload. All fields are fixed-width, so
//! they are encoded with bincode's fixed-int big-endian options.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::FrameError;
use crate::{CONTROL_MAGIC, PROTOCOL_VERSION};

/// Length of the fixed control header.
pub const CONTROL_HEADER_LEN: usize = 14;

/// A reply older than this (or from the future) is rejected by the requester.
pub const FRESHNESS_WINDOW_MS: i64 = 100;

#[derive(Debug, Serialize, Deserialize)]
struct ControlHeader {
    magic: u32,
    version: u8,
    timestamp: i64,
    command: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCommand {
    StatusRequest = 0x06,
    ShutdownRequest = 0x07,
    StatusResponse = 0x08,
    ShutdownResponse = 0x09,
}

impl TryFrom<u8> for ControlCommand {
    type Error = FrameError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0x06 => Ok(ControlCommand::StatusRequest),
            0x07 => Ok(ControlCommand::ShutdownRequest),
            0x08 => Ok(ControlCommand::StatusResponse),
            0x09 => Ok(ControlCommand::ShutdownResponse),
            _ => Err(FrameError::malformed()),
        }
    }
}

/// Status snapshot, in wire order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub uptime_minutes: i32,
    pub up_days: i32,
    pub up_hours: i32,
    pub up_minutes: i32,
    pub allocated_kb: i32,
    pub free_kb: i32,
    pub max_kb: i32,
    pub used_kb: i32,
    pub total_packets: i64,
    pub relayed_packets: i64,
    pub accepted_connections: i32,
    pub rejected_connections: i32,
    pub active_bans: i32,
}

impl StatusReport {
    /// "2 days 1 hour 5 minutes"
    pub fn uptime_text(&self) -> String {
        format!(
            "{} {} {}",
            plural(self.up_days, "day"),
            plural(self.up_hours, "hour"),
            plural(self.up_minutes, "minute")
        )
    }

    pub fn memory_text(&self) -> String {
        format!(
            "max={}k, allocated={}k, used={}k, free={}k",
            self.max_kb, self.allocated_kb, self.used_kb, self.free_kb
        )
    }
}

fn plural(count: i32, unit: &str) -> String {
    if count == 1 {
        format!("{count} {unit}")
    } else {
        format!("{count} {unit}s")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    StatusRequest,
    ShutdownRequest,
    StatusResponse(StatusReport),
    ShutdownResponse { accepted: bool },
}

impl ControlMessage {
    pub fn command(&self) -> ControlCommand {
        match self {
            ControlMessage::StatusRequest => ControlCommand::StatusRequest,
            ControlMessage::ShutdownRequest => ControlCommand::ShutdownRequest,
            ControlMessage::StatusResponse(_) => ControlCommand::StatusResponse,
            ControlMessage::ShutdownResponse { .. } => ControlCommand::ShutdownResponse,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    /// Sender's wall clock, milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub message: ControlMessage,
}

impl ControlFrame {
    pub fn new(timestamp: i64, message: ControlMessage) -> Self {
        Self { timestamp, message }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let header = ControlHeader {
            magic: CONTROL_MAGIC,
            version: PROTOCOL_VERSION,
            timestamp: self.timestamp,
            command: self.message.command() as u8,
        };
        let mut out = codec()
            .serialize(&header)
            .map_err(|_| FrameError::malformed())?;

        match &self.message {
            ControlMessage::StatusResponse(report) => {
                let payload = codec()
                    .serialize(report)
                    .map_err(|_| FrameError::malformed())?;
                out.extend_from_slice(&payload);
            }
            ControlMessage::ShutdownResponse { accepted } => {
                out.push(if *accepted { 0x00 } else { 0x01 });
            }
            ControlMessage::StatusRequest | ControlMessage::ShutdownRequest => {}
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < CONTROL_HEADER_LEN {
            return Err(FrameError::malformed());
        }
        let header: ControlHeader = codec()
            .deserialize(&bytes[..CONTROL_HEADER_LEN])
            .map_err(|_| FrameError::malformed())?;
        if header.magic != CONTROL_MAGIC {
            return Err(FrameError::malformed());
        }

        let body = &bytes[CONTROL_HEADER_LEN..];
        let message = match ControlCommand::try_from(header.command)? {
            ControlCommand::StatusRequest => ControlMessage::StatusRequest,
            ControlCommand::ShutdownRequest => ControlMessage::ShutdownRequest,
            ControlCommand::StatusResponse => ControlMessage::StatusResponse(
                codec()
                    .deserialize(body)
                    .map_err(|_| FrameError::malformed())?,
            ),
            ControlCommand::ShutdownResponse => match body.first() {
                Some(code) => ControlMessage::ShutdownResponse {
                    accepted: *code == 0x00,
                },
                None => return Err(FrameError::malformed()),
            },
        };

        Ok(Self {
            timestamp: header.timestamp,
            message,
        })
    }

    /// Whether a reply received at `received_at_ms` is recent enough to trust.
    pub fn is_fresh(&self, received_at_ms: i64) -> bool {
        self.timestamp <= received_at_ms && self.timestamp >= received_at_ms - FRESHNESS_WINDOW_MS
    }
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
        .allow_trailing_bytes()
}
