//! Per-connection fair-use governor.
//!
//! Inbound messages are charged in "units": `max(1, bytes / unit_bytes)`.
//! Each connection may spend `max_units_num / max_units_den` units per
//! second; the rational form allows fractional rates such as one message
//! every two seconds. Accounting runs in one-second windows. When a
//! window's spend crosses the limit the governor computes a restart time
//! that amortizes the overspend and, in enforcing mode, the worker stops
//! servicing the read side until that time passes.

use crate::config::FairUseConfig;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::info;

/// What happens when a connection exceeds its fair-use rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleMode {
    /// Suppress reads until the restart time.
    Enforce,
    /// Count and log violations but keep reading.
    LogOnly,
    /// Governor disabled.
    Off,
}

/// Verdict for one accepted inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Under the limit; keep reading.
    Proceed,
    /// Over the limit; stop servicing reads until `restart_at`.
    Throttled { restart_at: Instant },
}

/// Rate accounting for a single connection.
pub struct FairUseGovernor {
    unit_bytes: u64,
    max_units_num: u64,
    max_units_den: u64,
    mode: ThrottleMode,
    window_start: Instant,
    units_in_window: u64,
    violated_this_window: bool,
    violations: u64,
    suppressed_until: Option<Instant>,
}

impl FairUseGovernor {
    /// Build a governor from endpoint configuration; `None` when the
    /// configuration imposes no limit.
    pub fn from_config(config: &FairUseConfig, now: Instant) -> Option<Self> {
        if !config.is_enabled() {
            return None;
        }
        Some(Self {
            unit_bytes: u64::from(config.unit_bytes.max(1)),
            max_units_num: u64::from(config.max_units_num),
            max_units_den: u64::from(config.max_units_den.max(1)),
            mode: config.mode,
            window_start: now,
            units_in_window: 0,
            violated_this_window: false,
            violations: 0,
            suppressed_until: None,
        })
    }

    pub fn mode(&self) -> ThrottleMode {
        self.mode
    }

    /// Total windows in which the limit was exceeded, surfaced at
    /// connection-close logging.
    pub fn violations(&self) -> u64 {
        self.violations
    }

    /// Whether reads are currently suppressed.
    pub fn is_suppressed(&self, now: Instant) -> bool {
        match self.suppressed_until {
            Some(t) => now < t && self.mode == ThrottleMode::Enforce,
            None => false,
        }
    }

    pub fn restart_at(&self) -> Option<Instant> {
        self.suppressed_until
    }

    /// Charge one accepted inbound message and decide whether reading
    /// may continue.
    pub fn on_message(&mut self, bytes: usize, now: Instant) -> Verdict {
        self.roll_window(now);

        let units = (bytes as u64 / self.unit_bytes).max(1);
        self.units_in_window += units;

        // Limit comparison without division: units/sec > num/den.
        if self.units_in_window * self.max_units_den <= self.max_units_num {
            return Verdict::Proceed;
        }

        if !self.violated_this_window {
            self.violated_this_window = true;
            self.violations += 1;
        }

        // Spread the overspend over future whole seconds so the average
        // rate converges on the configured limit.
        let owed_secs = if self.max_units_num == 0 {
            1
        } else {
            (self.units_in_window * self.max_units_den).div_ceil(self.max_units_num)
        };
        let restart_at = self.window_start + Duration::from_secs(owed_secs);
        self.suppressed_until = Some(restart_at);

        if self.mode == ThrottleMode::LogOnly {
            info!(
                units = self.units_in_window,
                violations = self.violations,
                "fair-use limit exceeded (log-only)"
            );
            return Verdict::Proceed;
        }
        Verdict::Throttled { restart_at }
    }

    fn roll_window(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.window_start);
        if elapsed < Duration::from_secs(1) {
            return;
        }
        // Snap the window start forward to the current whole second so
        // quiet periods do not bank credit.
        let whole = Duration::from_secs(elapsed.as_secs());
        self.window_start += whole;
        self.units_in_window = 0;
        self.violated_this_window = false;
        if let Some(t) = self.suppressed_until {
            if now >= t {
                self.suppressed_until = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(units_per_second: u32) -> FairUseConfig {
        FairUseConfig::per_second(1024, units_per_second)
    }

    #[test]
    fn disabled_config_builds_no_governor() {
        let now = Instant::now();
        assert!(FairUseGovernor::from_config(&FairUseConfig::unlimited(), now).is_none());
    }

    #[test]
    fn suppresses_after_limit_and_counts_one_violation_per_window() {
        let start = Instant::now();
        let mut gov = FairUseGovernor::from_config(&config(10), start).unwrap();

        // 20 messages of 1 KiB = 1 unit each, all inside one window.
        let mut throttled_at = None;
        for i in 0..20 {
            let verdict = gov.on_message(1024, start + Duration::from_millis(i * 10));
            if verdict != Verdict::Proceed && throttled_at.is_none() {
                throttled_at = Some(i);
            }
        }
        // The 11th message is the first over the limit.
        assert_eq!(throttled_at, Some(10));
        assert_eq!(gov.violations(), 1);
        assert!(gov.is_suppressed(start + Duration::from_millis(500)));
    }

    #[test]
    fn window_roll_clears_suppression() {
        let start = Instant::now();
        let mut gov = FairUseGovernor::from_config(&config(2), start).unwrap();

        for _ in 0..3 {
            gov.on_message(1024, start);
        }
        assert!(gov.is_suppressed(start));

        // Two seconds later the owed time has elapsed.
        let later = start + Duration::from_secs(2);
        assert_eq!(gov.on_message(1024, later), Verdict::Proceed);
        assert!(!gov.is_suppressed(later));
    }

    #[test]
    fn large_messages_charge_multiple_units() {
        let start = Instant::now();
        let mut gov = FairUseGovernor::from_config(&config(10), start).unwrap();

        // One 12 KiB message = 12 units, instantly over a 10/s limit.
        assert!(matches!(
            gov.on_message(12 * 1024, start),
            Verdict::Throttled { .. }
        ));
        assert_eq!(gov.violations(), 1);
    }

    #[test]
    fn log_only_counts_but_never_suppresses() {
        let start = Instant::now();
        let cfg = config(2).log_only();
        let mut gov = FairUseGovernor::from_config(&cfg, start).unwrap();

        for _ in 0..5 {
            assert_eq!(gov.on_message(1024, start), Verdict::Proceed);
        }
        assert_eq!(gov.violations(), 1);
        assert!(!gov.is_suppressed(start));
    }
}
