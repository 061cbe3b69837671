//! Per-(channel, model) rolling health counters and cool-off bans.
//!
//! Each entry is guarded by its own mutex so concurrent requests against
//! different channels never contend. The registry map itself is only locked
//! long enough to clone the entry handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Ban policy knobs, taken from `RelayConfig`.
#[derive(Debug, Clone, Copy)]
pub struct BanPolicy {
    /// Error rate within the window at which the pair is banned.
    pub error_rate: f64,
    /// Rolling window length.
    pub window: Duration,
}

impl Default for BanPolicy {
    fn default() -> Self {
        Self {
            error_rate: 0.5,
            window: Duration::from_secs(60),
        }
    }
}

/// Minimum samples in the window before the error rate is meaningful.
const MIN_SAMPLES: u32 = 4;
/// Base cool-off; doubles with each consecutive ban, capped.
const BAN_BASE: Duration = Duration::from_secs(10);
const BAN_MAX_EXPONENT: u32 = 6;
/// Consecutive bans at which the channel itself is auto-disabled.
pub const AUTO_DISABLE_BAN_STREAK: u32 = 3;

#[derive(Debug, Default)]
struct HealthEntry {
    window_start: Option<Instant>,
    success: u32,
    errors: u32,
    /// Consecutive bans; drives the exponential cool-off.
    ban_streak: u32,
    ban_until: Option<Instant>,
}

impl HealthEntry {
    fn roll_window(&mut self, now: Instant, window: Duration) {
        match self.window_start {
            Some(start) if now.duration_since(start) <= window => {}
            _ => {
                self.window_start = Some(now);
                self.success = 0;
                self.errors = 0;
            }
        }
    }
}

/// Snapshot of one entry for the monitor endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub channel_id: i64,
    pub model: String,
    pub success: u32,
    pub errors: u32,
    pub banned: bool,
    pub ban_remaining_secs: u64,
}

/// Registry of rolling health counters, keyed by (channel id, model).
pub struct HealthRegistry {
    policy: BanPolicy,
    entries: Mutex<HashMap<(i64, String), Arc<Mutex<HealthEntry>>>>,
}

impl HealthRegistry {
    pub fn new(policy: BanPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, channel_id: i64, model: &str) -> Arc<Mutex<HealthEntry>> {
        let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        map.entry((channel_id, model.to_string()))
            .or_default()
            .clone()
    }

    /// Whether the pair is currently cooling off.
    pub fn is_banned(&self, channel_id: i64, model: &str) -> bool {
        let entry = self.entry(channel_id, model);
        let entry = entry.lock().unwrap_or_else(|e| e.into_inner());
        matches!(entry.ban_until, Some(until) if until > Instant::now())
    }

    pub fn record_success(&self, channel_id: i64, model: &str) {
        let now = Instant::now();
        let entry = self.entry(channel_id, model);
        let mut entry = entry.lock().unwrap_or_else(|e| e.into_inner());
        entry.roll_window(now, self.policy.window);
        entry.success += 1;
        entry.ban_streak = 0;
    }

    /// Record a classified-retryable failure. When the windowed error rate
    /// crosses the threshold the pair is banned with an exponential
    /// cool-off.
    pub fn record_error(&self, channel_id: i64, model: &str) {
        let now = Instant::now();
        let entry = self.entry(channel_id, model);
        let mut entry = entry.lock().unwrap_or_else(|e| e.into_inner());
        entry.roll_window(now, self.policy.window);
        entry.errors += 1;

        let total = entry.success + entry.errors;
        if total < MIN_SAMPLES {
            return;
        }
        let rate = f64::from(entry.errors) / f64::from(total);
        if rate < self.policy.error_rate {
            return;
        }

        let exponent = entry.ban_streak.min(BAN_MAX_EXPONENT);
        let cooloff = BAN_BASE * 2u32.pow(exponent);
        entry.ban_until = Some(now + cooloff);
        entry.ban_streak += 1;
        // Reset the window so recovery starts clean after the ban.
        entry.window_start = Some(now);
        entry.success = 0;
        entry.errors = 0;

        tracing::warn!(
            channel_id,
            model,
            error_rate = rate,
            cooloff_secs = cooloff.as_secs(),
            "channel banned for model after repeated errors"
        );
    }

    /// Error count currently in the window, for tests and the monitor.
    pub fn error_count(&self, channel_id: i64, model: &str) -> u32 {
        let entry = self.entry(channel_id, model);
        let entry = entry.lock().unwrap_or_else(|e| e.into_inner());
        entry.errors
    }

    /// Consecutive bans for the pair; drives channel auto-disable.
    pub fn ban_streak(&self, channel_id: i64, model: &str) -> u32 {
        let entry = self.entry(channel_id, model);
        let entry = entry.lock().unwrap_or_else(|e| e.into_inner());
        entry.ban_streak
    }

    /// Snapshot every known entry for `/api/monitor`.
    pub fn report(&self) -> Vec<HealthReport> {
        let now = Instant::now();
        let map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut reports: Vec<HealthReport> = map
            .iter()
            .map(|((channel_id, model), entry)| {
                let entry = entry.lock().unwrap_or_else(|e| e.into_inner());
                let remaining = entry
                    .ban_until
                    .and_then(|until| until.checked_duration_since(now))
                    .unwrap_or(Duration::ZERO);
                HealthReport {
                    channel_id: *channel_id,
                    model: model.clone(),
                    success: entry.success,
                    errors: entry.errors,
                    banned: remaining > Duration::ZERO,
                    ban_remaining_secs: remaining.as_secs(),
                }
            })
            .collect();
        reports.sort_by(|a, b| (a.channel_id, &a.model).cmp(&(b.channel_id, &b.model)));
        reports
    }

    #[cfg(test)]
    pub(crate) fn force_ban(&self, channel_id: i64, model: &str, duration: Duration) {
        let entry = self.entry(channel_id, model);
        let mut entry = entry.lock().unwrap_or_else(|e| e.into_inner());
        entry.ban_until = Some(Instant::now() + duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_below_threshold_do_not_ban() {
        let registry = HealthRegistry::new(BanPolicy::default());
        registry.record_success(1, "gpt-4o");
        registry.record_success(1, "gpt-4o");
        registry.record_success(1, "gpt-4o");
        registry.record_error(1, "gpt-4o");

        assert!(!registry.is_banned(1, "gpt-4o"));
        assert_eq!(registry.error_count(1, "gpt-4o"), 1);
    }

    #[test]
    fn repeated_errors_trigger_ban() {
        let registry = HealthRegistry::new(BanPolicy::default());
        for _ in 0..MIN_SAMPLES {
            registry.record_error(1, "gpt-4o");
        }
        assert!(registry.is_banned(1, "gpt-4o"));
        // Other models on the same channel are unaffected.
        assert!(!registry.is_banned(1, "gpt-4o-mini"));
        assert!(!registry.is_banned(2, "gpt-4o"));
    }

    #[test]
    fn too_few_samples_never_ban() {
        let registry = HealthRegistry::new(BanPolicy::default());
        registry.record_error(1, "m");
        registry.record_error(1, "m");
        registry.record_error(1, "m");
        assert!(!registry.is_banned(1, "m"));
    }

    #[test]
    fn success_resets_ban_streak() {
        let registry = HealthRegistry::new(BanPolicy::default());
        for _ in 0..MIN_SAMPLES {
            registry.record_error(1, "m");
        }
        registry.record_success(1, "m");

        let entry = registry.entry(1, "m");
        assert_eq!(entry.lock().unwrap().ban_streak, 0);
    }

    #[test]
    fn report_lists_entries_in_order() {
        let registry = HealthRegistry::new(BanPolicy::default());
        registry.record_success(2, "b");
        registry.record_success(1, "a");
        registry.force_ban(1, "a", Duration::from_secs(30));

        let report = registry.report();
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].channel_id, 1);
        assert!(report[0].banned);
        assert!(report[0].ban_remaining_secs <= 30);
        assert!(!report[1].banned);
    }
}
