//! State shared by every worker of a running relay.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, RwLock};

use crate::ban_ledger::BanLedger;
use crate::config::RelayConfig;
use crate::fanout::Mailbox;
use crate::stats::Counters;
use crate::slot_table::SlotTable;

#[derive(Debug)]
pub struct RelayState {
    pub config: RelayConfig,
    pub slots: RwLock<SlotTable>,
    pub bans: RwLock<BanLedger>,
    pub mailbox: Mailbox,
    pub counters: Counters,
    pub shutdown: Shutdown,
    pub started_at: Instant,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            slots: RwLock::new(SlotTable::new(config.max_clients)),
            bans: RwLock::new(BanLedger::new(config.auto_ban)),
            mailbox: Mailbox::new(),
            counters: Counters::default(),
            shutdown: Shutdown::new(),
            started_at: Instant::now(),
            config,
        })
    }
}

/// Process-wide stop flag. Raising it is permanent.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolves once shutdown has been triggered. Cancel-safe, so it can sit
    /// in a `select!` loop.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_listener_wakes_on_trigger() {
        let shutdown = Shutdown::new();
        let mut listener = shutdown.listener();

        let waiter = tokio::spawn(async move { listener.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_late_listener_sees_earlier_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let mut listener = shutdown.listener();
        tokio::time::timeout(Duration::from_millis(100), listener.wait())
            .await
            .unwrap();
    }

    #[test]
    fn test_state_sizes_slot_table_from_config() {
        let config = RelayConfig {
            max_clients: 4,
            ..RelayConfig::default()
        };
        let state = RelayState::new(config);
        assert_eq!(state.slots.try_read().unwrap().capacity(), 4);
        assert!(!state.shutdown.is_triggered());
    }
}
