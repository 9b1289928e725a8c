//! Per-IP failure counting and temporary bans.
//!
//! A peer that keeps failing registration is banned once its failure count
//! reaches the configured threshold. Bans expire after the configured
//! duration, or never when the duration is zero. The ledger itself is plain
//! data; callers share it behind the relay state's lock and pass in the
//! current instant so tests can move time freely.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// How the ledger turns failed attempts into bans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoBanPolicy {
    pub enabled: bool,
    /// Failed attempts that trigger a ban. Always at least 1.
    pub threshold: u32,
    /// Window in which failures accumulate. Zero means unlimited.
    pub time_limit: Duration,
    /// How long a ban lasts. Zero means permanent.
    pub duration: Duration,
}

impl Default for AutoBanPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 5,
            time_limit: Duration::ZERO,
            duration: Duration::from_secs(86_400),
        }
    }
}

/// Result of recording one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrikeOutcome {
    /// Auto-ban is off; nothing was recorded.
    Disabled,
    /// The attempt was counted; the value is the running count.
    Counted(u32),
    /// The attempt reached the threshold and the IP is now banned.
    Banned,
}

#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    count: u32,
    last_failure: Instant,
}

#[derive(Debug)]
pub struct BanLedger {
    policy: AutoBanPolicy,
    failures: HashMap<IpAddr, FailureRecord>,
    bans: HashMap<IpAddr, Instant>,
}

impl BanLedger {
    pub fn new(policy: AutoBanPolicy) -> Self {
        Self {
            policy,
            failures: HashMap::new(),
            bans: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &AutoBanPolicy {
        &self.policy
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.bans.contains_key(&ip)
    }

    /// Counts one failed attempt from `ip` and bans it when the count
    /// reaches the threshold.
    ///
    /// A failure that arrives after the accumulation window has passed
    /// starts a fresh count of one. A banned IP has no failure record.
    pub fn record_failure(&mut self, ip: IpAddr, now: Instant) -> StrikeOutcome {
        if !self.policy.enabled {
            return StrikeOutcome::Disabled;
        }

        let window = self.policy.time_limit;
        let record = self.failures.entry(ip).or_insert(FailureRecord {
            count: 0,
            last_failure: now,
        });

        let within_window =
            window.is_zero() || now.saturating_duration_since(record.last_failure) <= window;
        record.count = if within_window { record.count + 1 } else { 1 };
        record.last_failure = now;
        let count = record.count;

        if count >= self.policy.threshold {
            self.failures.remove(&ip);
            self.bans.insert(ip, now);
            StrikeOutcome::Banned
        } else {
            StrikeOutcome::Counted(count)
        }
    }

    /// Forgets the failure count of `ip` after a successful validation.
    pub fn clear_failures(&mut self, ip: IpAddr) -> bool {
        self.failures.remove(&ip).is_some()
    }

    pub fn failure_count(&self, ip: IpAddr) -> u32 {
        self.failures.get(&ip).map_or(0, |record| record.count)
    }

    /// Lifts every ban older than the ban duration and returns the freed IPs.
    /// Permanent bans are never lifted.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<IpAddr> {
        let duration = self.policy.duration;
        if duration.is_zero() {
            return Vec::new();
        }

        let expired: Vec<IpAddr> = self
            .bans
            .iter()
            .filter(|(_, started)| now.saturating_duration_since(**started) >= duration)
            .map(|(ip, _)| *ip)
            .collect();

        for ip in &expired {
            self.bans.remove(ip);
        }
        expired
    }

    pub fn active_bans(&self) -> usize {
        self.bans.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(threshold: u32, time_limit: u64, duration: u64) -> AutoBanPolicy {
        AutoBanPolicy {
            enabled: true,
            threshold,
            time_limit: Duration::from_secs(time_limit),
            duration: Duration::from_secs(duration),
        }
    }

    fn test_ip() -> IpAddr {
        "10.1.2.3".parse().unwrap()
    }

    #[test]
    fn test_threshold_bans_on_last_strike() {
        let mut ledger = BanLedger::new(policy(3, 0, 60));
        let now = Instant::now();

        assert_eq!(ledger.record_failure(test_ip(), now), StrikeOutcome::Counted(1));
        assert_eq!(ledger.record_failure(test_ip(), now), StrikeOutcome::Counted(2));
        assert!(!ledger.is_banned(test_ip()));

        assert_eq!(ledger.record_failure(test_ip(), now), StrikeOutcome::Banned);
        assert!(ledger.is_banned(test_ip()));
        assert_eq!(ledger.failure_count(test_ip()), 0);
        assert_eq!(ledger.active_bans(), 1);
    }

    #[test]
    fn test_threshold_of_one_bans_immediately() {
        let mut ledger = BanLedger::new(policy(1, 0, 60));
        assert_eq!(
            ledger.record_failure(test_ip(), Instant::now()),
            StrikeOutcome::Banned
        );
    }

    #[test]
    fn test_disabled_policy_records_nothing() {
        let mut ledger = BanLedger::new(AutoBanPolicy {
            enabled: false,
            ..policy(1, 0, 60)
        });

        assert_eq!(
            ledger.record_failure(test_ip(), Instant::now()),
            StrikeOutcome::Disabled
        );
        assert_eq!(ledger.failure_count(test_ip()), 0);
        assert!(!ledger.is_banned(test_ip()));
    }

    #[test]
    fn test_expired_window_restarts_count() {
        let mut ledger = BanLedger::new(policy(3, 10, 60));
        let start = Instant::now();

        ledger.record_failure(test_ip(), start);
        ledger.record_failure(test_ip(), start + Duration::from_secs(5));
        let outcome = ledger.record_failure(test_ip(), start + Duration::from_secs(16));

        assert_eq!(outcome, StrikeOutcome::Counted(1));
        assert!(!ledger.is_banned(test_ip()));
    }

    #[test]
    fn test_window_follows_most_recent_failure() {
        let mut ledger = BanLedger::new(policy(3, 10, 60));
        let start = Instant::now();

        ledger.record_failure(test_ip(), start);
        ledger.record_failure(test_ip(), start + Duration::from_secs(9));
        let outcome = ledger.record_failure(test_ip(), start + Duration::from_secs(18));

        assert_eq!(outcome, StrikeOutcome::Banned);
    }

    #[test]
    fn test_clear_failures_resets_count() {
        let mut ledger = BanLedger::new(policy(2, 0, 60));
        let now = Instant::now();

        ledger.record_failure(test_ip(), now);
        assert!(ledger.clear_failures(test_ip()));
        assert!(!ledger.clear_failures(test_ip()));
        assert_eq!(ledger.record_failure(test_ip(), now), StrikeOutcome::Counted(1));
    }

    #[test]
    fn test_counts_are_per_ip() {
        let mut ledger = BanLedger::new(policy(2, 0, 60));
        let other: IpAddr = "10.1.2.4".parse().unwrap();
        let now = Instant::now();

        ledger.record_failure(test_ip(), now);
        ledger.record_failure(other, now);

        assert_eq!(ledger.failure_count(test_ip()), 1);
        assert_eq!(ledger.failure_count(other), 1);
    }

    #[test]
    fn test_sweep_lifts_expired_bans_only() {
        let mut ledger = BanLedger::new(policy(1, 0, 60));
        let start = Instant::now();
        let late: IpAddr = "10.9.9.9".parse().unwrap();

        ledger.record_failure(test_ip(), start);
        ledger.record_failure(late, start + Duration::from_secs(30));

        assert!(ledger.sweep_expired(start + Duration::from_secs(59)).is_empty());

        let freed = ledger.sweep_expired(start + Duration::from_secs(60));
        assert_eq!(freed, vec![test_ip()]);
        assert!(!ledger.is_banned(test_ip()));
        assert!(ledger.is_banned(late));
    }

    #[test]
    fn test_permanent_bans_survive_sweep() {
        let mut ledger = BanLedger::new(policy(1, 0, 0));
        let start = Instant::now();

        ledger.record_failure(test_ip(), start);
        assert!(ledger
            .sweep_expired(start + Duration::from_secs(1_000_000))
            .is_empty());
        assert!(ledger.is_banned(test_ip()));
    }
}
