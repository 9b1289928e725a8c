//! Subscriber side of the relay protocol, used by `console-logger`.

use std::time::Duration;

use chrono::{Local, TimeZone};
use log::{trace, warn};
use shared::{read_frame, write_frame, ConnectionRequest, Frame, PacketType, RelayedMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::ClientError;

/// Longest silence tolerated from the relay. Heartbeats normally arrive
/// every few seconds.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Something the subscriber should react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The relay announced itself and the connection request was sent.
    Identified(String),
    Connected,
    /// The relay refused the request; the reason has its "E " code removed.
    Rejected(String),
    Message(RelayedMessage),
}

pub struct RelaySession<S> {
    stream: S,
    request: ConnectionRequest,
    idle_timeout: Duration,
}

impl RelaySession<TcpStream> {
    pub async fn connect(relay: &str, request: ConnectionRequest) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(relay)
            .await
            .map_err(|source| ClientError::Connect {
                address: relay.to_string(),
                source,
            })?;
        Ok(Self::new(stream, request))
    }
}

impl<S> RelaySession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, request: ConnectionRequest) -> Self {
        Self {
            stream,
            request,
            idle_timeout: IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Reads frames until one is worth reporting. Heartbeats are swallowed
    /// and the identity frame is answered with the connection request.
    pub async fn next_event(&mut self) -> Result<SessionEvent, ClientError> {
        loop {
            let frame = read_frame(&mut self.stream, self.idle_timeout).await?;
            match frame.packet_type() {
                PacketType::Heartbeat => trace!("Heartbeat from relay"),
                PacketType::Identity => {
                    let request = Frame::connection_request(&self.request)?;
                    write_frame(&mut self.stream, &request).await?;
                    return Ok(SessionEvent::Identified(frame.text_payload()));
                }
                PacketType::ConnectionSuccess => return Ok(SessionEvent::Connected),
                PacketType::ConnectionFailure => {
                    let reason = frame.text_payload();
                    let reason = reason.strip_prefix("E ").unwrap_or(&reason).to_string();
                    return Ok(SessionEvent::Rejected(reason));
                }
                PacketType::MessageData => {
                    return Ok(SessionEvent::Message(RelayedMessage::parse(frame.payload())?));
                }
                PacketType::ConnectionRequest => warn!("Ignoring connection request from relay"),
            }
        }
    }
}

/// "[ip][port][MM/dd/yyyy HH:mm:ss][line]", with the relay's timestamp in
/// local time.
pub fn format_message(message: &RelayedMessage) -> String {
    let stamp = Local
        .timestamp_opt(i64::from(message.timestamp), 0)
        .single()
        .map(|time| time.format("%m/%d/%Y %H:%M:%S").to_string())
        .unwrap_or_else(|| message.timestamp.to_string());

    format!(
        "[{}][{}][{}][{}]",
        message.server_ip,
        message.server_port,
        stamp,
        message.line.trim_end_matches('\n')
    )
}
