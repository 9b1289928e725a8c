//! Relay-protocol frames (little-endian) and their payloads.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{FrameError, RequestError};
use crate::{
    HEARTBEAT_LEN, HEADER_LEN, MAX_PAYLOAD_LEN, PROTOCOL_VERSION, RELAY_MAGIC, REQUEST_MARKER,
    SUCCESS_TEXT,
};

/// Packet type tags of the relay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Identity = 0x00,
    Heartbeat = 0x01,
    ConnectionRequest = 0x02,
    ConnectionFailure = 0x03,
    ConnectionSuccess = 0x04,
    MessageData = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = FrameError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0x00 => Ok(PacketType::Identity),
            0x01 => Ok(PacketType::Heartbeat),
            0x02 => Ok(PacketType::ConnectionRequest),
            0x03 => Ok(PacketType::ConnectionFailure),
            0x04 => Ok(PacketType::ConnectionSuccess),
            0x05 => Ok(PacketType::MessageData),
            _ => Err(FrameError::malformed()),
        }
    }
}

/// One relay-protocol frame.
///
/// Heartbeats have no payload and are encoded without a length field; every
/// other type carries between 1 and [`MAX_PAYLOAD_LEN`] payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    packet_type: PacketType,
    payload: Vec<u8>,
}

impl Frame {
    pub fn new(packet_type: PacketType, payload: Vec<u8>) -> Result<Self, FrameError> {
        match packet_type {
            PacketType::Heartbeat if !payload.is_empty() => Err(FrameError::bad_length()),
            PacketType::Heartbeat => Ok(Self::heartbeat()),
            _ => {
                check_length(payload.len())?;
                Ok(Self {
                    packet_type,
                    payload,
                })
            }
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            packet_type: PacketType::Heartbeat,
            payload: Vec::new(),
        }
    }

    /// Frame whose payload is `text` followed by a NUL terminator.
    pub fn text(packet_type: PacketType, text: &str) -> Result<Self, FrameError> {
        Self::new(packet_type, terminated(text))
    }

    pub fn identity() -> Self {
        Self {
            packet_type: PacketType::Identity,
            payload: terminated(&crate::identity_string()),
        }
    }

    pub fn connection_success() -> Self {
        Self {
            packet_type: PacketType::ConnectionSuccess,
            payload: terminated(SUCCESS_TEXT),
        }
    }

    pub fn connection_failure(reason: &str) -> Result<Self, FrameError> {
        Self::text(PacketType::ConnectionFailure, reason)
    }

    pub fn connection_request(request: &ConnectionRequest) -> Result<Self, FrameError> {
        Self::new(PacketType::ConnectionRequest, request.to_payload())
    }

    pub fn message_data(message: &RelayedMessage) -> Result<Self, FrameError> {
        Self::new(PacketType::MessageData, message.to_payload())
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as text with the NUL terminator removed.
    pub fn text_payload(&self) -> String {
        String::from_utf8_lossy(&self.payload)
            .trim_end_matches('\0')
            .to_string()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&RELAY_MAGIC.to_le_bytes());
        out.push(self.packet_type as u8);
        if self.packet_type != PacketType::Heartbeat {
            out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
            out.extend_from_slice(&self.payload);
        }
        out
    }

    /// Decodes one complete frame; trailing or missing bytes are malformed.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEARTBEAT_LEN {
            return Err(FrameError::malformed());
        }
        let packet_type = parse_prefix(&bytes[..HEARTBEAT_LEN])?;
        if packet_type == PacketType::Heartbeat {
            return if bytes.len() == HEARTBEAT_LEN {
                Ok(Self::heartbeat())
            } else {
                Err(FrameError::malformed())
            };
        }
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::malformed());
        }
        let length = check_length(u16::from_le_bytes([bytes[5], bytes[6]]) as usize)?;
        if bytes.len() != HEADER_LEN + length {
            return Err(FrameError::malformed());
        }
        Ok(Self {
            packet_type,
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

/// Reads one frame from `reader`. Every individual read is bounded by
/// `deadline`; the magic is checked before anything past it is read.
pub async fn read_frame<R>(reader: &mut R, deadline: Duration) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; HEARTBEAT_LEN];
    read_within(reader, &mut prefix, deadline).await?;
    let packet_type = parse_prefix(&prefix)?;
    if packet_type == PacketType::Heartbeat {
        return Ok(Frame::heartbeat());
    }

    let mut length = [0u8; 2];
    read_within(reader, &mut length, deadline).await?;
    let length = check_length(u16::from_le_bytes(length) as usize)?;

    let mut payload = vec![0u8; length];
    read_within(reader, &mut payload, deadline).await?;

    Ok(Frame {
        packet_type,
        payload,
    })
}

/// Writes one encoded frame and flushes it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await
}

async fn read_within<R>(reader: &mut R, buf: &mut [u8], deadline: Duration) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    match timeout(deadline, reader.read_exact(buf)).await {
        Err(_) => Err(FrameError::Timeout),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::malformed()),
        Ok(Err(e)) => Err(FrameError::Io(e)),
        Ok(Ok(_)) => Ok(()),
    }
}

fn parse_prefix(prefix: &[u8]) -> Result<PacketType, FrameError> {
    let magic = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    if magic != RELAY_MAGIC {
        return Err(FrameError::malformed());
    }
    PacketType::try_from(prefix[4])
}

fn check_length(length: usize) -> Result<usize, FrameError> {
    if (1..=MAX_PAYLOAD_LEN).contains(&length) {
        Ok(length)
    } else {
        Err(FrameError::bad_length())
    }
}

fn terminated(text: &str) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

/// Payload of a connection request: the marker, the password and the wanted
/// origin, NUL-separated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub password: String,
    pub server_ip: String,
    pub server_port: String,
}

impl ConnectionRequest {
    pub fn new(
        password: impl Into<String>,
        server_ip: impl Into<String>,
        server_port: impl Into<String>,
    ) -> Self {
        Self {
            password: password.into(),
            server_ip: server_ip.into(),
            server_port: server_port.into(),
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(
            REQUEST_MARKER.len() + self.password.len() + self.server_ip.len() + self.server_port.len() + 3,
        );
        let marked = format!("{REQUEST_MARKER}{}", self.password);
        for field in [&marked, &self.server_ip, &self.server_port] {
            payload.extend_from_slice(field.as_bytes());
            payload.push(0);
        }
        payload
    }

    /// Splits a request payload into its three fields. Only the structure is
    /// checked here; the values are validated by the relay.
    pub fn parse(payload: &[u8]) -> Result<Self, RequestError> {
        let text = String::from_utf8_lossy(payload);
        if text.chars().count() < REQUEST_MARKER.len() {
            return Err(RequestError::Empty);
        }
        if !text.starts_with(REQUEST_MARKER) {
            return Err(RequestError::MissingMarker);
        }

        let fields: Vec<&str> = text.trim_end_matches('\0').split('\0').collect();
        if fields.len() != 3 {
            return Err(RequestError::FieldCount(fields.len()));
        }

        Ok(Self {
            password: fields[0][REQUEST_MARKER.len()..].to_string(),
            server_ip: fields[1].to_string(),
            server_port: fields[2].to_string(),
        })
    }
}

/// A game-server log line as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedMessage {
    /// Unix seconds observed by the relay when the datagram arrived.
    pub timestamp: u32,
    pub server_ip: String,
    pub server_port: String,
    pub line: String,
}

impl RelayedMessage {
    /// Builds a message, cutting `line` short (on a char boundary) when the
    /// encoded payload would not fit in one frame.
    pub fn new(
        timestamp: u32,
        server_ip: impl Into<String>,
        server_port: impl Into<String>,
        line: &str,
    ) -> Self {
        let server_ip = server_ip.into();
        let server_port = server_port.into();
        let overhead = 1 + 4 + server_ip.len() + 1 + server_port.len() + 1 + 1;
        let room = MAX_PAYLOAD_LEN.saturating_sub(overhead);

        Self {
            timestamp,
            server_ip,
            server_port,
            line: truncate_on_boundary(line, room).to_string(),
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(
            5 + self.server_ip.len() + self.server_port.len() + self.line.len() + 3,
        );
        payload.push(PROTOCOL_VERSION);
        payload.extend_from_slice(&self.timestamp.to_le_bytes());
        for field in [&self.server_ip, &self.server_port, &self.line] {
            payload.extend_from_slice(field.as_bytes());
            payload.push(0);
        }
        payload
    }

    pub fn parse(payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() < 5 {
            return Err(FrameError::malformed());
        }
        let timestamp = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
        let body = String::from_utf8_lossy(&payload[5..]);
        let body = body.strip_suffix('\0').unwrap_or(&body);

        let mut fields = body.splitn(3, '\0');
        match (fields.next(), fields.next(), fields.next()) {
            (Some(ip), Some(port), Some(line)) => Ok(Self {
                timestamp,
                server_ip: ip.to_string(),
                server_port: port.to_string(),
                line: line.to_string(),
            }),
            _ => Err(FrameError::malformed()),
        }
    }
}

fn truncate_on_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
