//! Relay counters, the status snapshot served over the control channel, and
//! the periodic statistics log.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use log::info;
use shared::StatusReport;

use crate::state::RelayState;

/// Monotonic counters, updated lock-free from every worker.
#[derive(Debug, Default)]
pub struct Counters {
    total_packets: AtomicU64,
    relayed_packets: AtomicU64,
    accepted_connections: AtomicU32,
    rejected_connections: AtomicU32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub total_packets: u64,
    pub relayed_packets: u64,
    pub accepted_connections: u32,
    pub rejected_connections: u32,
}

impl Counters {
    pub fn record_datagram(&self) {
        self.total_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relayed(&self) {
        self.relayed_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accepted(&self) {
        self.accepted_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total_packets: self.total_packets.load(Ordering::Relaxed),
            relayed_packets: self.relayed_packets.load(Ordering::Relaxed),
            accepted_connections: self.accepted_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
        }
    }
}

/// Process memory in kilobytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub allocated_kb: u64,
    pub used_kb: u64,
    pub max_kb: u64,
}

impl MemoryUsage {
    pub fn free_kb(&self) -> u64 {
        self.allocated_kb.saturating_sub(self.used_kb)
    }

    /// Reads the current process's figures from `/proc/self/status`.
    /// Platforms without procfs report zeros.
    pub fn current() -> Self {
        std::fs::read_to_string("/proc/self/status")
            .map(|status| Self::from_proc_status(&status))
            .unwrap_or_default()
    }

    /// VmSize is what the process has mapped, VmRSS what is resident and
    /// VmPeak the high-water mark of VmSize.
    pub fn from_proc_status(status: &str) -> Self {
        let mut usage = Self::default();
        for line in status.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let kb = value
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse::<u64>()
                .unwrap_or(0);
            match key {
                "VmSize" => usage.allocated_kb = kb,
                "VmRSS" => usage.used_kb = kb,
                "VmPeak" => usage.max_kb = kb,
                _ => {}
            }
        }
        usage
    }
}

/// Whole uptime split as (total minutes, days, hours, minutes).
pub fn split_uptime(uptime: Duration) -> (u64, u64, u64, u64) {
    let total = uptime.as_secs() / 60;
    (total, total / 1440, (total % 1440) / 60, total % 60)
}

fn clamp_i32(value: u64) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Point-in-time status of the relay.
pub async fn status_report(state: &RelayState) -> StatusReport {
    let (total, days, hours, minutes) = split_uptime(state.started_at.elapsed());
    let memory = MemoryUsage::current();
    let counters = state.counters.snapshot();
    let active_bans = state.bans.read().await.active_bans();

    StatusReport {
        uptime_minutes: clamp_i32(total),
        up_days: clamp_i32(days),
        up_hours: clamp_i32(hours),
        up_minutes: clamp_i32(minutes),
        allocated_kb: clamp_i32(memory.allocated_kb),
        free_kb: clamp_i32(memory.free_kb()),
        max_kb: clamp_i32(memory.max_kb),
        used_kb: clamp_i32(memory.used_kb),
        total_packets: clamp_i64(counters.total_packets),
        relayed_packets: clamp_i64(counters.relayed_packets),
        accepted_connections: clamp_i32(u64::from(counters.accepted_connections)),
        rejected_connections: clamp_i32(u64::from(counters.rejected_connections)),
        active_bans: clamp_i32(active_bans as u64),
    }
}

/// Writes one block of statistics to the log.
pub async fn log_statistics(state: &RelayState) {
    let report = status_report(state).await;
    let connected = state.slots.read().await.len();

    info!("Relay statistics:");
    info!("  Uptime: {}", report.uptime_text());
    info!("  Memory: {}", report.memory_text());
    info!("  Packets received: {}", report.total_packets);
    info!("  Packets relayed: {}", report.relayed_packets);
    info!("  Connections accepted: {}", report.accepted_connections);
    info!("  Connections rejected: {}", report.rejected_connections);
    info!("  Clients connected: {}", connected);
    if state.config.auto_ban.enabled {
        info!("  Active bans: {}", report.active_bans);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;

    const PROC_STATUS: &str = "Name:\tconsole-relay\n\
        VmPeak:\t  204800 kB\n\
        VmSize:\t  102400 kB\n\
        VmRSS:\t   51200 kB\n\
        Threads:\t4\n";

    #[test]
    fn test_counters_snapshot() {
        let counters = Counters::default();
        counters.record_datagram();
        counters.record_datagram();
        counters.record_relayed();
        counters.record_accepted();
        counters.record_rejected();
        counters.record_rejected();

        assert_eq!(
            counters.snapshot(),
            CounterSnapshot {
                total_packets: 2,
                relayed_packets: 1,
                accepted_connections: 1,
                rejected_connections: 2,
            }
        );
    }

    #[test]
    fn test_memory_from_proc_status() {
        let usage = MemoryUsage::from_proc_status(PROC_STATUS);
        assert_eq!(usage.allocated_kb, 102_400);
        assert_eq!(usage.used_kb, 51_200);
        assert_eq!(usage.max_kb, 204_800);
        assert_eq!(usage.free_kb(), 51_200);
    }

    #[test]
    fn test_memory_missing_fields_are_zero() {
        let usage = MemoryUsage::from_proc_status("Name:\tx\nVmRSS:\tgarbage\n");
        assert_eq!(usage, MemoryUsage::default());
    }

    #[test]
    fn test_split_uptime() {
        let uptime = Duration::from_secs((1440 + 65) * 60 + 59);
        assert_eq!(split_uptime(uptime), (1505, 1, 1, 5));
        assert_eq!(split_uptime(Duration::from_secs(59)), (0, 0, 0, 0));
    }

    #[tokio::test]
    async fn test_status_report_reflects_counters() {
        let state = RelayState::new(RelayConfig::default());
        state.counters.record_datagram();
        state.counters.record_accepted();

        let report = status_report(&state).await;
        assert_eq!(report.total_packets, 1);
        assert_eq!(report.accepted_connections, 1);
        assert_eq!(report.active_bans, 0);
        assert_eq!(report.uptime_minutes, 0);
    }
}
