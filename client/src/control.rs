//! Requester side of the control channel, used by `relayctl`.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use shared::{ControlFrame, ControlMessage, StatusReport};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::ClientError;

/// How long to wait for the relay to answer.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Sends one control request and returns the relay's reply. Replies whose
/// timestamp is outside the freshness window are refused.
pub async fn send_request(
    relay: SocketAddr,
    message: ControlMessage,
) -> Result<ControlMessage, ClientError> {
    let local = if relay.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(relay).await?;

    let request = ControlFrame::new(shared::timestamp_millis(), message).encode()?;
    socket.send(&request).await?;

    let mut buffer = [0u8; 512];
    let len = timeout(REPLY_TIMEOUT, socket.recv(&mut buffer))
        .await
        .map_err(|_| ClientError::NoReply)??;
    let received_at = shared::timestamp_millis();

    let reply = ControlFrame::decode(&buffer[..len])?;
    if !reply.is_fresh(received_at) {
        return Err(ClientError::StaleReply);
    }
    Ok(reply.message)
}

pub async fn query_status(relay: SocketAddr) -> Result<StatusReport, ClientError> {
    match send_request(relay, ControlMessage::StatusRequest).await? {
        ControlMessage::StatusResponse(report) => Ok(report),
        _ => Err(ClientError::UnexpectedReply("reply to a status request")),
    }
}

/// Asks the relay to stop. Returns whether it agreed.
pub async fn request_shutdown(relay: SocketAddr) -> Result<bool, ClientError> {
    match send_request(relay, ControlMessage::ShutdownRequest).await? {
        ControlMessage::ShutdownResponse { accepted } => Ok(accepted),
        _ => Err(ClientError::UnexpectedReply("reply to a shutdown request")),
    }
}

pub fn render_status(report: &StatusReport) -> String {
    [
        "Console Relay is running.".to_string(),
        String::new(),
        format!("  Uptime: {}", report.uptime_text()),
        format!("  Memory: {}", report.memory_text()),
        format!("  Packets received: {}", report.total_packets),
        format!("  Packets relayed: {}", report.relayed_packets),
        format!("  Accepted connections: {}", report.accepted_connections),
        format!("  Rejected connections: {}", report.rejected_connections),
        format!("  Clients currently banned: {}", report.active_bans),
    ]
    .join("\n")
}
