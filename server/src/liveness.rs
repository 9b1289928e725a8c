//! Background upkeep: heartbeat probes for subscribers and expiry of bans.

use std::io;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use log::{debug, info};
use shared::Frame;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::slot_table::SharedStream;
use crate::state::RelayState;

/// How often expired bans are lifted.
pub const BAN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on writing one heartbeat.
pub const PROBE_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long the drain waits for more inbound bytes before calling the
/// subscriber idle.
const DRAIN_WINDOW: Duration = Duration::from_millis(10);

/// Reads per probe before the drain gives up and moves on.
const MAX_DRAIN_READS: usize = 64;

/// Sends one heartbeat and discards whatever the subscriber sent us.
///
/// Subscribers are not expected to talk after registration, so inbound
/// bytes are thrown away. End-of-stream or any I/O error means the
/// subscriber is gone.
pub async fn probe<S>(stream: &mut S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let heartbeat = Frame::heartbeat().encode();
    timeout(PROBE_WRITE_TIMEOUT, async {
        stream.write_all(&heartbeat).await?;
        stream.flush().await
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "heartbeat write timed out"))??;

    let mut scratch = [0u8; 1024];
    for _ in 0..MAX_DRAIN_READS {
        match timeout(DRAIN_WINDOW, stream.read(&mut scratch)).await {
            Err(_) => return Ok(()),
            Ok(Ok(0)) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "subscriber closed the connection",
                ))
            }
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => return Err(e),
        }
    }
    Ok(())
}

/// Probes every occupied slot once and evicts the subscribers that failed,
/// along with any the sender already marked failed. Returns how many were
/// evicted.
pub async fn check_subscribers(state: &RelayState) -> usize {
    let subscribers = state.slots.read().await.occupied();
    let mut evicted = 0;

    for subscriber in subscribers {
        let result = if subscriber.has_failed() {
            Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "an earlier message write failed",
            ))
        } else {
            let mut stream = subscriber.stream.lock().await;
            probe(&mut *stream).await
        };

        if let Err(e) = result {
            debug!("Socket check for {} failed: {}", subscriber.peer, e);
            let removed = state
                .slots
                .write()
                .await
                .evict(subscriber.slot, subscriber.id);
            if let Some(removed) = removed {
                info!(
                    "Removing client {} : No response to socket check.",
                    removed.peer
                );
                close_stream(&removed.stream).await;
                evicted += 1;
            }
        }
    }
    evicted
}

/// Lifts expired bans and logs each one.
pub async fn sweep_bans(state: &RelayState) -> Vec<IpAddr> {
    let freed = state.bans.write().await.sweep_expired(Instant::now());
    for ip in &freed {
        info!("Ban on {} has expired", ip);
    }
    freed
}

/// Whether the ban sweeper has anything to do under this configuration.
pub fn sweeper_enabled(state: &RelayState) -> bool {
    let policy = state.config.auto_ban;
    policy.enabled && !policy.duration.is_zero()
}

pub async fn close_stream(stream: &SharedStream) {
    if let Err(e) = stream.lock().await.shutdown().await {
        debug!("Error while closing subscriber socket: {}", e);
    }
}
