//! Wall-clock source with a frozen-time override.
//!
//! The engine's iterations run against the real clock, but every test and
//! every deterministic replay needs `runtime_utc` fields to be
//! reproducible. `MM_FREEZE_UTC_ISO`, when set, pins every timestamp this
//! clock hands out to that exact value, byte for byte (spec §6, §8).

use chrono::{DateTime, Utc};
use std::env;

/// Name of the environment variable that freezes wall-clock reads.
pub const FREEZE_ENV_VAR: &str = "MM_FREEZE_UTC_ISO";

/// A clock that is either the real `Utc::now()` or a value pinned at
/// construction time from `MM_FREEZE_UTC_ISO`.
#[derive(Debug, Clone)]
pub struct WallClock {
    frozen: Option<DateTime<Utc>>,
}

impl Default for WallClock {
    fn default() -> Self {
        Self::from_env()
    }
}

impl WallClock {
    /// Reads `MM_FREEZE_UTC_ISO` once and freezes the clock for the
    /// lifetime of this instance if it parses as valid ISO 8601.
    pub fn from_env() -> Self {
        let frozen = env::var(FREEZE_ENV_VAR)
            .ok()
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Self { frozen }
    }

    /// Builds a clock frozen at an explicit instant, bypassing the
    /// environment. Used by tests that want determinism without mutating
    /// process-global env state.
    pub fn frozen_at(instant: DateTime<Utc>) -> Self {
        Self {
            frozen: Some(instant),
        }
    }

    /// Builds a clock that always reads the real wall clock.
    pub fn live() -> Self {
        Self { frozen: None }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }

    /// Current instant: the frozen value if one was configured, else
    /// `Utc::now()`.
    pub fn now(&self) -> DateTime<Utc> {
        self.frozen.unwrap_or_else(Utc::now)
    }

    /// `now()` formatted as the ISO 8601 `Z`-suffixed string artifacts use
    /// for `runtime_utc`.
    pub fn now_iso(&self) -> String {
        self.now()
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_clock_advances() {
        let c = WallClock::live();
        let a = c.now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = c.now();
        assert!(b >= a);
    }

    #[test]
    fn frozen_clock_is_stable() {
        let instant = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let c = WallClock::frozen_at(instant);
        assert_eq!(c.now(), instant);
        assert_eq!(c.now(), instant);
        assert!(c.is_frozen());
    }

    #[test]
    fn frozen_iso_matches_env_value_byte_for_byte() {
        let instant = DateTime::parse_from_rfc3339("2026-03-04T12:30:00.000Z")
            .unwrap()
            .with_timezone(&Utc);
        let c = WallClock::frozen_at(instant);
        assert_eq!(c.now_iso(), "2026-03-04T12:30:00.000Z");
    }
}
