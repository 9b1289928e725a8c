//! Subscriber registration handshake.
//!
//! For every accepted TCP connection the relay:
//!
//! 1. closes it without a word if the peer's IP is banned,
//! 2. announces its identity,
//! 3. reads one connection request within [`REQUEST_READ_TIMEOUT`],
//! 4. checks structure, password, IP literal and port range, in that order,
//! 5. clears the peer's failure count and reserves the lowest free slot,
//! 6. answers "OK" and binds the connection into the slot.
//!
//! Any failure after step 1 is counted as a rejection. Failures other than
//! a full relay also count against the peer's IP in the ban ledger.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use shared::{read_frame, reasons, write_frame, ConnectionRequest, Frame, PacketType};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::ban_ledger::StrikeOutcome;
use crate::error::RegistrationError;
use crate::slot_table::{Origin, SharedStream};
use crate::state::RelayState;

/// Deadline for each read of the connection request.
pub const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum RegistrationOutcome {
    Accepted { slot: usize, id: u64 },
    Rejected(RegistrationError),
    /// The peer was banned and got no answer at all.
    IgnoredBanned,
    /// The peer was answered "OK" but shutdown emptied its slot first.
    ShuttingDown,
}

/// Checks the content of a structurally valid request and returns the origin
/// the subscriber asked for.
pub fn validate_request(
    request: &ConnectionRequest,
    password: &str,
) -> Result<Origin, RegistrationError> {
    if !password.is_empty() && request.password != password {
        return Err(RegistrationError::ProtocolViolation {
            reason: reasons::BAD_PASSWORD,
        });
    }

    let ip: IpAddr = request
        .server_ip
        .trim()
        .parse()
        .map_err(|_| RegistrationError::ProtocolViolation {
            reason: reasons::BAD_IP_ADDRESS,
        })?;

    let port = request
        .server_port
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|port| *port > 0)
        .ok_or(RegistrationError::ProtocolViolation {
            reason: reasons::BAD_PORT_NUMBER,
        })?;

    Ok(Origin::new(ip, port))
}

/// Runs the identity/request exchange on `stream` and returns the validated
/// origin. Nothing is written on failure; the caller owes the reply.
pub async fn negotiate<S>(
    stream: &mut S,
    password: &str,
    deadline: Duration,
) -> Result<Origin, RegistrationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(stream, &Frame::identity()).await?;

    let frame = read_frame(stream, deadline).await?;
    if frame.packet_type() != PacketType::ConnectionRequest {
        return Err(RegistrationError::MalformedFrame {
            reason: reasons::INVALID_PACKET,
        });
    }

    let request = ConnectionRequest::parse(frame.payload())?;
    validate_request(&request, password)
}

/// Registers subscribers on behalf of the client listener.
#[derive(Debug, Clone)]
pub struct Registrar {
    state: Arc<RelayState>,
    deadline: Duration,
}

impl Registrar {
    pub fn new(state: Arc<RelayState>) -> Self {
        Self {
            state,
            deadline: REQUEST_READ_TIMEOUT,
        }
    }

    /// Takes ownership of a freshly accepted connection and either binds it
    /// into a slot or closes it.
    pub async fn accept(&self, mut stream: TcpStream, peer: SocketAddr) -> RegistrationOutcome {
        let ip = peer.ip().to_canonical();
        let peer = peer.to_string();

        if self.state.bans.read().await.is_banned(ip) {
            debug!("Ignoring connection from banned address {}", peer);
            return RegistrationOutcome::IgnoredBanned;
        }

        let negotiated = negotiate(&mut stream, &self.state.config.password, self.deadline).await;
        let wanted = match negotiated {
            Ok(origin) => origin,
            Err(err) => return self.reject(stream, &peer, ip, err).await,
        };

        self.state.bans.write().await.clear_failures(ip);

        let reserved = self.state.slots.write().await.reserve();
        let Some(slot) = reserved else {
            return self
                .reject(stream, &peer, ip, RegistrationError::CapacityExceeded)
                .await;
        };

        if let Err(e) = write_frame(&mut stream, &Frame::connection_success()).await {
            self.state.slots.write().await.release(slot);
            return self.reject(stream, &peer, ip, e.into()).await;
        }

        self.bind_reserved(slot, peer, wanted, Arc::new(Mutex::new(stream)))
            .await
    }

    /// Moves an answered subscriber into its reserved slot.
    async fn bind_reserved(
        &self,
        slot: usize,
        peer: String,
        wanted: Origin,
        stream: SharedStream,
    ) -> RegistrationOutcome {
        let bound = self.state.slots.write().await.occupy(
            slot,
            peer.clone(),
            wanted,
            Arc::clone(&stream),
        );
        match bound {
            Some(id) => {
                self.state.counters.record_accepted();
                info!("New client connection from {}.", peer);
                info!("Client {} wants messages from {}", peer, wanted);
                RegistrationOutcome::Accepted { slot, id }
            }
            // The reservation vanished, which only happens when the table
            // was drained for shutdown.
            None => {
                info!("Dropping client {} : relay is shutting down.", peer);
                self.state.counters.record_rejected();
                let _ = stream.lock().await.shutdown().await;
                RegistrationOutcome::ShuttingDown
            }
        }
    }

    async fn reject(
        &self,
        mut stream: TcpStream,
        peer: &str,
        ip: IpAddr,
        err: RegistrationError,
    ) -> RegistrationOutcome {
        if let Some(reason) = err.reason() {
            if let Ok(frame) = Frame::connection_failure(reason) {
                if let Err(e) = write_frame(&mut stream, &frame).await {
                    debug!("Could not send rejection to {}: {}", peer, e);
                }
            }
        }

        if matches!(err, RegistrationError::CapacityExceeded) {
            info!("Refusing connection from {} : Too many connections.", peer);
        } else {
            info!("Rejecting client {} : {}", peer, err);
        }
        self.state.counters.record_rejected();

        if err.is_strike() {
            let outcome = self.state.bans.write().await.record_failure(ip, Instant::now());
            match outcome {
                StrikeOutcome::Banned => info!(
                    "Banning {} after {} failed connection attempts",
                    ip,
                    self.state.config.auto_ban.threshold
                ),
                StrikeOutcome::Counted(count) => {
                    debug!("{} has {} failed connection attempts", ip, count)
                }
                StrikeOutcome::Disabled => {}
            }
        }

        let _ = stream.shutdown().await;
        RegistrationOutcome::Rejected(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn request_frame(password: &str, ip: &str, port: &str) -> Vec<u8> {
        Frame::connection_request(&ConnectionRequest::new(password, ip, port))
            .unwrap()
            .encode()
    }

    fn reason_of(result: Result<Origin, RegistrationError>) -> Option<&'static str> {
        result.unwrap_err().reason()
    }

    #[test]
    fn test_validate_accepts_good_request() {
        let request = ConnectionRequest::new("secret", "10.0.0.5", "27015");
        let origin = validate_request(&request, "secret").unwrap();
        assert_eq!(origin, Origin::new("10.0.0.5".parse().unwrap(), 27015));
    }

    #[test]
    fn test_validate_ignores_password_when_none_configured() {
        let request = ConnectionRequest::new("anything", "::1", "1");
        assert!(validate_request(&request, "").is_ok());
    }

    #[test]
    fn test_validate_checks_in_order() {
        let bad_everything = ConnectionRequest::new("wrong", "not-an-ip", "0");
        assert_eq!(
            reason_of(validate_request(&bad_everything, "secret")),
            Some(reasons::BAD_PASSWORD)
        );
        assert_eq!(
            reason_of(validate_request(&bad_everything, "")),
            Some(reasons::BAD_IP_ADDRESS)
        );

        for port in ["0", "65536", "-1", "http"] {
            let request = ConnectionRequest::new("", "10.0.0.5", port);
            assert_eq!(
                reason_of(validate_request(&request, "")),
                Some(reasons::BAD_PORT_NUMBER),
                "port {port}"
            );
        }
    }

    #[test]
    fn test_validate_rejects_hostnames() {
        let request = ConnectionRequest::new("", "game.example.com", "27015");
        assert_eq!(
            reason_of(validate_request(&request, "")),
            Some(reasons::BAD_IP_ADDRESS)
        );
    }

    #[tokio::test]
    async fn test_negotiate_success() {
        let mut stream = Builder::new()
            .write(&Frame::identity().encode())
            .read(&request_frame("", "10.0.0.5", "27015"))
            .build();

        let origin = negotiate(&mut stream, "", REQUEST_READ_TIMEOUT).await.unwrap();
        assert_eq!(origin.port, 27015);
    }

    #[tokio::test]
    async fn test_negotiate_bad_password() {
        let mut stream = Builder::new()
            .write(&Frame::identity().encode())
            .read(&request_frame("xyz", "10.0.0.5", "27015"))
            .build();

        let result = negotiate(&mut stream, "abc", REQUEST_READ_TIMEOUT).await;
        assert_eq!(reason_of(result), Some(reasons::BAD_PASSWORD));
    }

    #[tokio::test]
    async fn test_negotiate_wrong_packet_type() {
        let mut stream = Builder::new()
            .write(&Frame::identity().encode())
            .read(&Frame::connection_success().encode())
            .build();

        let result = negotiate(&mut stream, "", REQUEST_READ_TIMEOUT).await;
        assert_eq!(reason_of(result), Some(reasons::INVALID_PACKET));
    }

    #[tokio::test]
    async fn test_negotiate_oversized_length() {
        let mut header = Vec::new();
        header.extend_from_slice(&shared::RELAY_MAGIC.to_le_bytes());
        header.push(PacketType::ConnectionRequest as u8);
        header.extend_from_slice(&5000u16.to_le_bytes());

        let mut stream = Builder::new()
            .write(&Frame::identity().encode())
            .read(&header)
            .build();

        let result = negotiate(&mut stream, "", REQUEST_READ_TIMEOUT).await;
        assert_eq!(reason_of(result), Some(reasons::INVALID_CONTENT_LENGTH));
    }

    #[tokio::test]
    async fn test_negotiate_empty_request() {
        let frame = Frame::new(PacketType::ConnectionRequest, b"P".to_vec()).unwrap();
        let mut stream = Builder::new()
            .write(&Frame::identity().encode())
            .read(&frame.encode())
            .build();

        let result = negotiate(&mut stream, "", REQUEST_READ_TIMEOUT).await;
        assert_eq!(reason_of(result), Some(reasons::EMPTY_PACKET));
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiate_silent_peer_times_out() {
        let mut stream = Builder::new()
            .write(&Frame::identity().encode())
            .wait(Duration::from_secs(10))
            .build();

        let err = negotiate(&mut stream, "", REQUEST_READ_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrationError::FrameTimeout));
        assert!(err.reason().is_none());
    }

    async fn loopback_stream() -> (TcpStream, SharedStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (server_side, _) = accepted.unwrap();
        (client.unwrap(), Arc::new(Mutex::new(server_side)))
    }

    #[tokio::test]
    async fn test_bind_reserved_counts_acceptance() {
        let state = RelayState::new(crate::config::RelayConfig::default());
        let registrar = Registrar::new(Arc::clone(&state));
        let (_client, stream) = loopback_stream().await;
        let wanted = Origin::new("10.0.0.5".parse().unwrap(), 27015);

        let slot = state.slots.write().await.reserve().unwrap();
        let outcome = registrar
            .bind_reserved(slot, "127.0.0.1:5000".into(), wanted, stream)
            .await;

        assert!(matches!(outcome, RegistrationOutcome::Accepted { slot: 0, .. }));
        let counters = state.counters.snapshot();
        assert_eq!(counters.accepted_connections, 1);
        assert_eq!(counters.rejected_connections, 0);
        assert_eq!(state.slots.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_bind_after_drain_is_counted_and_closed() {
        let state = RelayState::new(crate::config::RelayConfig::default());
        let registrar = Registrar::new(Arc::clone(&state));
        let (mut client, stream) = loopback_stream().await;
        let wanted = Origin::new("10.0.0.5".parse().unwrap(), 27015);

        let slot = state.slots.write().await.reserve().unwrap();
        state.slots.write().await.drain();
        let outcome = registrar
            .bind_reserved(slot, "127.0.0.1:5000".into(), wanted, stream)
            .await;

        assert!(matches!(outcome, RegistrationOutcome::ShuttingDown));
        let counters = state.counters.snapshot();
        assert_eq!(counters.accepted_connections, 0);
        assert_eq!(counters.rejected_connections, 1);
        assert!(state.slots.read().await.is_empty());

        let mut buffer = [0u8; 8];
        let read = tokio::io::AsyncReadExt::read(&mut client, &mut buffer).await;
        assert!(matches!(read, Ok(0) | Err(_)));
    }
}
