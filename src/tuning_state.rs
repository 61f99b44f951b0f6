//! `TuningState` (spec §3): process-global state carried between
//! iterations. Modeled as an immutable value passed forward — each
//! iteration's Delta Pipeline produces a `(new_state, artifact)` pair
//! rather than mutating shared state in place (spec §9 "Cyclic / shared
//! state").
//!
//! Persisted alongside the runtime overrides file as a small sidecar JSON
//! (`tuning_state.json`) so a restarted process resumes cooldown/velocity/
//! freeze accounting instead of silently re-arming every guard.

use crate::json_io::{read_json_opt, write_atomic};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One applied delta, recorded for oscillation detection (last K per
/// parameter) and velocity accounting (trailing sum of `|delta|`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedDelta {
    pub iteration: u64,
    pub delta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningState {
    /// Current `param -> value` overrides, mirrors the on-disk
    /// `runtime_overrides.json`.
    pub overrides: BTreeMap<String, f64>,
    /// Signature (sha256 of canonical overrides) last written to disk.
    pub last_signature: String,
    /// Rolling history of applied deltas per parameter, most recent last.
    /// Bounded per-parameter to `history_cap` entries.
    pub history: BTreeMap<String, Vec<AppliedDelta>>,
    /// Iteration index at which each parameter was last modified (for
    /// cooldown accounting); absent if never modified.
    pub last_modified_iteration: BTreeMap<String, u64>,
    /// Consecutive PASS iterations with no active drivers, for freeze
    /// arming; crossing `freeze_consecutive_passes` re-arms the global
    /// freeze guard each iteration until a non-PASS or driver-bearing
    /// iteration resets this to zero (spec §4.5 "Freeze is released if
    /// any subsequent iteration fails").
    pub consecutive_clean_passes: u64,
    /// Per-parameter oscillation freeze: the last iteration at which the
    /// parameter is still suppressed, keyed by parameter name (spec §4.5
    /// "the parameter is frozen for `cooldown_iterations` additional
    /// iterations").
    pub oscillation_freeze_until: BTreeMap<String, u64>,
}

const HISTORY_CAP: usize = 8;

impl Default for TuningState {
    fn default() -> Self {
        Self {
            overrides: crate::params::defaults(),
            last_signature: String::new(),
            history: BTreeMap::new(),
            last_modified_iteration: BTreeMap::new(),
            consecutive_clean_passes: 0,
            oscillation_freeze_until: BTreeMap::new(),
        }
    }
}

impl TuningState {
    /// Loads the sidecar state file, falling back to defaults if absent —
    /// the same "absent means defaults" contract the overrides file uses.
    pub fn load(path: &Path) -> Result<Self, crate::errors::EngineError> {
        Ok(read_json_opt::<Self>(path)?.unwrap_or_default())
    }

    pub fn persist(&self, path: &Path) -> Result<(), crate::errors::EngineError> {
        write_atomic(path, self)
    }

    /// Records an applied delta for `param` at `iteration`, trimming the
    /// history ring to `HISTORY_CAP`.
    pub fn record_applied(&mut self, param: &str, iteration: u64, delta: f64) {
        self.last_modified_iteration
            .insert(param.to_string(), iteration);
        let entry = self.history.entry(param.to_string()).or_default();
        entry.push(AppliedDelta { iteration, delta });
        if entry.len() > HISTORY_CAP {
            let excess = entry.len() - HISTORY_CAP;
            entry.drain(0..excess);
        }
    }

    /// Sum of `|delta|` applied to `param` within the trailing
    /// `window` iterations counting back from `current_iteration`
    /// inclusive (spec §4.5 Velocity guard).
    pub fn velocity_sum(&self, param: &str, current_iteration: u64, window: u64) -> f64 {
        let floor = current_iteration.saturating_sub(window.saturating_sub(1));
        self.history
            .get(param)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.iteration >= floor && e.iteration <= current_iteration)
                    .map(|e| e.delta.abs())
                    .sum()
            })
            .unwrap_or(0.0)
    }

    /// Iterations since `param` was last modified; `u64::MAX` if never.
    pub fn iterations_since_modified(&self, param: &str, current_iteration: u64) -> u64 {
        match self.last_modified_iteration.get(param) {
            Some(&last) => current_iteration.saturating_sub(last),
            None => u64::MAX,
        }
    }

    /// Detects an A -> B -> A alternating-sign pattern in the last three
    /// applied deltas for `param` (spec §4.5 Oscillation guard).
    pub fn is_oscillating(&self, param: &str) -> bool {
        let Some(entries) = self.history.get(param) else {
            return false;
        };
        if entries.len() < 3 {
            return false;
        }
        let last_three = &entries[entries.len() - 3..];
        let signs: Vec<i8> = last_three
            .iter()
            .map(|e| if e.delta >= 0.0 { 1 } else { -1 })
            .collect();
        signs[0] == signs[2] && signs[0] != signs[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn velocity_sum_windows_correctly() {
        let mut state = TuningState::default();
        state.record_applied("min_interval_ms", 1, 5.0);
        state.record_applied("min_interval_ms", 2, 5.0);
        state.record_applied("min_interval_ms", 3, 5.0);
        // window=2 counting back from iteration 3 -> iterations {2,3} only.
        assert!((state.velocity_sum("min_interval_ms", 3, 2) - 10.0).abs() < 1e-9);
        assert!((state.velocity_sum("min_interval_ms", 3, 5) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn oscillation_detects_a_b_a_pattern() {
        let mut state = TuningState::default();
        state.record_applied("base_spread_bps_delta", 1, 0.02);
        state.record_applied("base_spread_bps_delta", 2, -0.02);
        state.record_applied("base_spread_bps_delta", 3, 0.02);
        assert!(state.is_oscillating("base_spread_bps_delta"));
    }

    #[test]
    fn monotone_same_sign_is_not_oscillating() {
        let mut state = TuningState::default();
        state.record_applied("min_interval_ms", 1, 5.0);
        state.record_applied("min_interval_ms", 2, 5.0);
        state.record_applied("min_interval_ms", 3, 5.0);
        assert!(!state.is_oscillating("min_interval_ms"));
    }

    #[test]
    fn history_is_bounded_to_cap() {
        let mut state = TuningState::default();
        for i in 0..20u64 {
            state.record_applied("min_interval_ms", i, 1.0);
        }
        assert_eq!(state.history["min_interval_ms"].len(), HISTORY_CAP);
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tuning_state.json");
        let mut state = TuningState::default();
        state.record_applied("min_interval_ms", 1, 5.0);
        state.persist(&path).unwrap();

        let reloaded = TuningState::load(&path).unwrap();
        assert_eq!(reloaded.history["min_interval_ms"].len(), 1);
    }

    #[test]
    fn load_missing_file_is_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let state = TuningState::load(&path).unwrap();
        assert_eq!(state.overrides, crate::params::defaults());
    }
}
