//! Relay network layer: binds the listeners and runs every worker task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::RelayConfig;
use crate::control::handle_control;
use crate::error::ServerError;
use crate::fanout::{deliver, ingest_datagram};
use crate::liveness::{
    check_subscribers, close_stream, sweep_bans, sweeper_enabled, BAN_SWEEP_INTERVAL,
};
use crate::registration::Registrar;
use crate::state::RelayState;
use crate::stats::log_statistics;

/// Largest datagram the message listener accepts.
const MAX_DATAGRAM_LEN: usize = 65_536;

/// How long `run` waits for workers to notice shutdown.
const WORKER_STOP_GRACE: Duration = Duration::from_secs(2);

/// A bound relay, ready to run.
pub struct Server {
    state: Arc<RelayState>,
    client_listener: Option<TcpListener>,
    message_socket: Option<UdpSocket>,
    control_socket: Option<UdpSocket>,
    client_addr: SocketAddr,
    message_addr: SocketAddr,
    control_addr: Option<SocketAddr>,
}

impl Server {
    /// Binds the subscriber listener, the message listener and, when
    /// possible, the control socket. The first two are required.
    pub async fn new(config: RelayConfig) -> Result<Self, ServerError> {
        let client_address = config.client_listen_addr();
        let client_listener = TcpListener::bind(&client_address)
            .await
            .map_err(|source| ServerError::Bind {
                listener: "client listener",
                address: client_address.clone(),
                source,
            })?;
        let client_addr = local_addr(client_listener.local_addr(), &client_address)?;
        info!("Listening for clients on {} (TCP)", client_addr);

        let message_address = config.message_listen_addr();
        let message_socket = UdpSocket::bind(&message_address)
            .await
            .map_err(|source| ServerError::Bind {
                listener: "message listener",
                address: message_address.clone(),
                source,
            })?;
        let message_addr = local_addr(message_socket.local_addr(), &message_address)?;
        info!("Listening for game server messages on {} (UDP)", message_addr);

        let control_address = config.control_listen_addr();
        let control_socket = match UdpSocket::bind(&control_address).await {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!(
                    "Control channel unavailable, could not bind {}: {}",
                    control_address, e
                );
                None
            }
        };
        let control_addr = control_socket
            .as_ref()
            .and_then(|socket| socket.local_addr().ok());
        if let Some(addr) = control_addr {
            info!("Listening for control requests on {} (UDP)", addr);
        }

        Ok(Server {
            state: RelayState::new(config),
            client_listener: Some(client_listener),
            message_socket: Some(message_socket),
            control_socket,
            client_addr,
            message_addr,
            control_addr,
        })
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn message_addr(&self) -> SocketAddr {
        self.message_addr
    }

    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control_addr
    }

    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    /// Spawns task that accepts subscriber connections
    fn spawn_client_listener(&mut self) -> Option<JoinHandle<()>> {
        let listener = self.client_listener.take()?;
        let state = Arc::clone(&self.state);
        let registrar = Registrar::new(Arc::clone(&state));

        Some(tokio::spawn(async move {
            let mut shutdown = state.shutdown.listener();
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let registrar = registrar.clone();
                            tokio::spawn(async move {
                                registrar.accept(stream, peer).await;
                            });
                        }
                        Err(e) => {
                            error!("Error accepting client connection: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    },
                    _ = shutdown.wait() => break,
                }
            }
            debug!("Client listener stopped");
        }))
    }

    /// Spawns task that receives game-server datagrams
    fn spawn_message_listener(&mut self) -> Option<JoinHandle<()>> {
        let socket = self.message_socket.take()?;
        let state = Arc::clone(&self.state);

        Some(tokio::spawn(async move {
            let mut shutdown = state.shutdown.listener();
            let mut buffer = vec![0u8; MAX_DATAGRAM_LEN];
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buffer) => match received {
                        Ok((len, source)) => {
                            tokio::select! {
                                _ = ingest_datagram(&state, source, &buffer[..len]) => {}
                                _ = shutdown.wait() => break,
                            }
                        }
                        Err(e) => {
                            error!("Error receiving datagram: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    },
                    _ = shutdown.wait() => break,
                }
            }
            debug!("Message listener stopped");
        }))
    }

    /// Spawns task that relays staged messages to subscribers
    fn spawn_sender(&self) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let mut shutdown = state.shutdown.listener();
            loop {
                let message = tokio::select! {
                    message = state.mailbox.next() => message,
                    _ = shutdown.wait() => break,
                };
                deliver(&state, &message).await;
            }
            debug!("Sender stopped");
        })
    }

    /// Spawns task that probes subscribers with heartbeats
    fn spawn_liveness_supervisor(&self) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let mut shutdown = state.shutdown.listener();
            let mut ticker = interval(state.config.client_check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the first tick since it fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.wait() => break,
                }
                check_subscribers(&state).await;
            }
            debug!("Liveness supervisor stopped");
        })
    }

    /// Spawns task that lifts expired bans
    fn spawn_ban_sweeper(&self) -> Option<JoinHandle<()>> {
        if !sweeper_enabled(&self.state) {
            return None;
        }
        let state = Arc::clone(&self.state);

        Some(tokio::spawn(async move {
            let mut shutdown = state.shutdown.listener();
            let mut ticker = interval(BAN_SWEEP_INTERVAL);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.wait() => break,
                }
                sweep_bans(&state).await;
            }
            debug!("Ban sweeper stopped");
        }))
    }

    /// Spawns task that answers control requests
    fn spawn_control_listener(&mut self) -> Option<JoinHandle<()>> {
        let socket = self.control_socket.take()?;
        let state = Arc::clone(&self.state);

        Some(tokio::spawn(async move {
            let mut shutdown = state.shutdown.listener();
            let mut buffer = [0u8; 512];
            loop {
                let (len, requester) = tokio::select! {
                    received = socket.recv_from(&mut buffer) => match received {
                        Ok(received) => received,
                        Err(e) => {
                            warn!("Error receiving control datagram: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            continue;
                        }
                    },
                    _ = shutdown.wait() => break,
                };

                let Some(reply) = handle_control(&state, &buffer[..len]).await else {
                    continue;
                };
                match reply.frame.encode() {
                    Ok(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, requester).await {
                            warn!("Failed to answer control request from {}: {}", requester, e);
                        }
                    }
                    Err(e) => error!("Failed to encode control reply: {}", e),
                }
                if reply.shutdown_after {
                    state.shutdown.trigger();
                }
            }
            debug!("Control listener stopped");
        }))
    }

    /// Spawns task that periodically logs relay statistics
    fn spawn_stats_logger(&self) -> Option<JoinHandle<()>> {
        if !self.state.config.log_stats_enabled {
            return None;
        }
        let state = Arc::clone(&self.state);

        Some(tokio::spawn(async move {
            let mut shutdown = state.shutdown.listener();
            let mut ticker = interval(state.config.log_stats_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.wait() => break,
                }
                log_statistics(&state).await;
            }
        }))
    }

    /// Runs the relay until shutdown is raised, then closes every
    /// subscriber connection.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let mut workers = vec![self.spawn_sender(), self.spawn_liveness_supervisor()];
        workers.extend(self.spawn_client_listener());
        workers.extend(self.spawn_message_listener());
        workers.extend(self.spawn_control_listener());
        workers.extend(self.spawn_ban_sweeper());
        workers.extend(self.spawn_stats_logger());

        info!("Console relay started");

        let mut shutdown = self.state.shutdown.listener();
        shutdown.wait().await;
        info!("Console relay shutting down");

        for worker in workers {
            match tokio::time::timeout(WORKER_STOP_GRACE, worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("A worker failed: {}", e),
                Err(_) => warn!("A worker did not stop in time"),
            }
        }

        let subscribers = self.state.slots.write().await.drain();
        if !subscribers.is_empty() {
            info!("Closing {} client connections", subscribers.len());
        }
        for subscriber in subscribers {
            close_stream(&subscriber.stream).await;
        }

        log_statistics(&self.state).await;
        Ok(())
    }
}

fn local_addr(
    result: std::io::Result<SocketAddr>,
    address: &str,
) -> Result<SocketAddr, ServerError> {
    result.map_err(|source| ServerError::Bind {
        listener: "listener",
        address: address.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> RelayConfig {
        RelayConfig {
            client_listen_address: "127.0.0.1".to_string(),
            client_listen_port: 0,
            message_listen_address: "127.0.0.1".to_string(),
            message_listen_port: 0,
            control_listen_port: 0,
            log_stats_enabled: false,
            ..RelayConfig::default()
        }
    }

    #[tokio::test]
    async fn test_server_binds_ephemeral_ports() {
        let server = Server::new(loopback_config()).await.unwrap();
        assert_ne!(server.client_addr().port(), 0);
        assert_ne!(server.message_addr().port(), 0);
        assert!(server.control_addr().is_some());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = RelayConfig {
            client_listen_port: taken.local_addr().unwrap().port(),
            ..loopback_config()
        };

        let err = Server::new(config).await.err().unwrap();
        assert!(matches!(err, ServerError::Bind { listener: "client listener", .. }));
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        let server = Server::new(loopback_config()).await.unwrap();
        let state = server.state();
        let running = tokio::spawn(server.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        state.shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
