//! Ingestion of game-server datagrams and fan-out to subscribers.
//!
//! The message listener and the sender meet at a [`Mailbox`] holding at most
//! one staged message. The listener waits for the mailbox to drain before it
//! builds the next frame, and the sender clears it only after every matching
//! subscriber got a write attempt, so messages leave in arrival order and a
//! slow subscriber backs the whole pipeline up instead of growing a queue.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use shared::{Frame, RelayedMessage, LOG_LINE_MARKER};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;

use crate::slot_table::{Origin, SharedStream};
use crate::state::RelayState;

/// Upper bound on one frame write to one subscriber.
pub const SUBSCRIBER_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// An encoded message-data frame waiting for the sender.
#[derive(Debug)]
pub struct StagedMessage {
    pub origin: Origin,
    pub frame: Vec<u8>,
}

/// Single-capacity hand-off between the message listener and the sender.
#[derive(Debug, Default)]
pub struct Mailbox {
    staged: Mutex<Option<Arc<StagedMessage>>>,
    filled: Notify,
    emptied: Notify,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_empty(&self) -> bool {
        self.staged.lock().await.is_none()
    }

    /// Waits until nothing is staged.
    pub async fn wait_empty(&self) {
        loop {
            let emptied = self.emptied.notified();
            if self.is_empty().await {
                return;
            }
            emptied.await;
        }
    }

    /// Stages `message`, waiting first for any previous one to be cleared.
    pub async fn stage(&self, message: StagedMessage) {
        loop {
            let emptied = self.emptied.notified();
            {
                let mut staged = self.staged.lock().await;
                if staged.is_none() {
                    *staged = Some(Arc::new(message));
                    self.filled.notify_one();
                    return;
                }
            }
            emptied.await;
        }
    }

    /// Waits for a staged message and returns it without clearing it.
    pub async fn next(&self) -> Arc<StagedMessage> {
        loop {
            let filled = self.filled.notified();
            if let Some(message) = self.staged.lock().await.as_ref() {
                return Arc::clone(message);
            }
            filled.await;
        }
    }

    /// Clears the staged message and wakes a waiting producer.
    pub async fn clear(&self) {
        *self.staged.lock().await = None;
        self.emptied.notify_waiters();
        self.emptied.notify_one();
    }
}

/// What happened to one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramOutcome {
    /// No subscriber wants this origin.
    Unwanted,
    /// The datagram carries no "L " log line.
    NoLogLine,
    Staged,
}

/// Returns the log line inside a raw datagram: everything from the first
/// "L " up to, but not including, the final byte.
pub fn extract_log_line(datagram: &[u8]) -> Option<String> {
    let start = datagram
        .windows(LOG_LINE_MARKER.len())
        .position(|window| window == LOG_LINE_MARKER)?;
    let end = datagram.len().saturating_sub(1).max(start);
    Some(String::from_utf8_lossy(&datagram[start..end]).into_owned())
}

/// Handles one datagram from the message listener.
pub async fn ingest_datagram(
    state: &RelayState,
    source: SocketAddr,
    datagram: &[u8],
) -> DatagramOutcome {
    state.counters.record_datagram();
    let origin = Origin::from(source);

    if !state.slots.read().await.is_wanted(&origin) {
        trace!("Dropping datagram from {}: no subscriber", origin);
        return DatagramOutcome::Unwanted;
    }

    let Some(line) = extract_log_line(datagram) else {
        debug!("Dropping datagram from {}: no log line", origin);
        return DatagramOutcome::NoLogLine;
    };

    state.mailbox.wait_empty().await;

    let message = RelayedMessage::new(
        shared::timestamp_secs(),
        origin.ip.to_string(),
        origin.port.to_string(),
        &line,
    );
    let frame = match Frame::message_data(&message) {
        Ok(frame) => frame.encode(),
        Err(e) => {
            warn!("Dropping datagram from {}: {}", origin, e);
            return DatagramOutcome::NoLogLine;
        }
    };

    trace!("Staging message from {}", origin);
    state.mailbox.stage(StagedMessage { origin, frame }).await;
    DatagramOutcome::Staged
}

/// Delivers the staged message to every matching subscriber, counts it as
/// relayed and clears the mailbox. Returns how many writes succeeded.
///
/// A recipient whose write fails is marked failed and skipped from then on;
/// eviction is left to the liveness check.
pub async fn deliver(state: &RelayState, message: &StagedMessage) -> usize {
    let recipients = state.slots.read().await.subscribers_for(&message.origin);
    let mut delivered = 0;

    for recipient in recipients {
        if recipient.has_failed() {
            trace!("Skipping {}: awaiting eviction", recipient.peer);
            continue;
        }
        match write_bytes(&recipient.stream, &message.frame).await {
            Ok(()) => {
                trace!("Relayed message from {} to {}", message.origin, recipient.peer);
                delivered += 1;
            }
            Err(e) => {
                debug!("Failed to relay message to {}: {}", recipient.peer, e);
                recipient.mark_failed();
            }
        }
    }

    state.counters.record_relayed();
    state.mailbox.clear().await;
    delivered
}

async fn write_bytes(stream: &SharedStream, bytes: &[u8]) -> io::Result<()> {
    let mut stream = stream.lock().await;
    timeout(SUBSCRIBER_WRITE_TIMEOUT, async {
        stream.write_all(bytes).await?;
        stream.flush().await
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "subscriber write timed out"))?
}
