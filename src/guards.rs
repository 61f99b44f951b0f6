//! Guards Coordinator (spec §4.5): evaluates warm-up/ramp-down, cooldown,
//! velocity, oscillation, freeze, and the multi-fail guard in that fixed
//! order, narrowing a `Proposal` down to what the Delta Pipeline is allowed
//! to apply.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::GuardConfig;
use crate::params::bounds_for;
use crate::tuning_state::TuningState;
use crate::watcher::{Driver, Proposal};

/// Closed skip-reason taxonomy (spec §4.6), as it appears in both the
/// per-iteration summary and the cumulative report.
pub const TAG_NO_EFFECTIVE_CHANGE: &str = "no_effective_change";
pub const TAG_VELOCITY_CAP_EXCEEDED: &str = "velocity_cap_exceeded";
pub const TAG_COOLDOWN_ACTIVE: &str = "cooldown_active";
pub const TAG_OSCILLATION_DETECTED: &str = "oscillation_detected";
pub const TAG_FREEZE_TRIGGERED: &str = "freeze_triggered";
pub const TAG_WARMUP_SOFTENED: &str = "warmup_softened";
pub const TAG_MULTI_FAIL_SUPPRESS: &str = "multi_fail_suppress";
pub const TAG_WRITE_FAILED: &str = "write_failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardOutcome {
    Apply,
    Partial,
    Skip,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardDecision {
    pub outcome_tags: BTreeSet<String>,
    pub freeze_ready: bool,
    pub warmup_softened: bool,
    /// Parameters newly placed under an oscillation freeze this iteration
    /// (as opposed to ones already serving out a prior freeze window). The
    /// caller records `iteration + cooldown_iterations` against each of
    /// these in `TuningState::oscillation_freeze_until`.
    pub newly_oscillation_frozen: BTreeSet<String>,
}

impl GuardDecision {
    fn trip(&mut self, tag: &str) {
        self.outcome_tags.insert(tag.to_string());
    }

    pub fn outcome(&self, proposal_is_empty: bool) -> GuardOutcome {
        if self.outcome_tags.contains(TAG_FREEZE_TRIGGERED)
            || self.outcome_tags.contains(TAG_MULTI_FAIL_SUPPRESS)
        {
            GuardOutcome::Skip
        } else if proposal_is_empty {
            GuardOutcome::Skip
        } else if self.outcome_tags.is_empty() {
            GuardOutcome::Apply
        } else {
            GuardOutcome::Partial
        }
    }
}

/// Evaluates all six guards in the spec's fixed order against `proposal`,
/// mutating it in place (keys drop out, values clip) and returning the
/// accumulated decision. `kpi_verdict_before_guards` is the raw verdict the
/// KPI thresholds produced, prior to warm-up softening; the (possibly
/// softened) verdict is returned alongside the decision.
pub fn evaluate(
    proposal: &mut Proposal,
    drivers: &[Driver],
    kpi_verdict_before_guards: Verdict,
    iteration: u64,
    state: &TuningState,
    cfg: &GuardConfig,
) -> (GuardDecision, Verdict) {
    let mut decision = GuardDecision::default();
    let mut verdict = kpi_verdict_before_guards;

    // 1. Warm-up / Ramp-down.
    if iteration >= 1 && iteration <= cfg.warmup_iterations {
        decision.warmup_softened = true;
        decision.trip(TAG_WARMUP_SOFTENED);
        if verdict == Verdict::Fail {
            verdict = Verdict::Warn;
        }
        // Non-blocking: proposal is retained, no keys are dropped here.
    }
    // Iterations warmup+1 .. warmup+rampdown interpolate thresholds
    // upstream (in the KPI Gate comparison, not here); strict mode is
    // simply "no softening" beyond that window.

    // 2. Cooldown: a parameter modified within the last
    // `cooldown_iterations` iterations is suppressed entirely.
    let keys: Vec<String> = proposal.deltas.keys().cloned().collect();
    for key in &keys {
        let since = state.iterations_since_modified(key, iteration);
        if since < cfg.cooldown_iterations {
            proposal.deltas.remove(key);
            decision.trip(TAG_COOLDOWN_ACTIVE);
        }
    }

    // 3. Velocity: trailing |delta| sum per parameter must not exceed the
    // parameter's declared bound width used as its velocity cap proxy —
    // each parameter's cap is its own `[lo, hi]` span (a parameter cannot
    // plausibly need more cumulative movement than its own range in one
    // velocity window).
    let keys: Vec<String> = proposal.deltas.keys().cloned().collect();
    for key in &keys {
        let Some(bounds) = bounds_for(key) else {
            continue;
        };
        let cap = bounds.hi - bounds.lo;
        let already_spent = state.velocity_sum(key, iteration.saturating_sub(1), cfg.velocity_window);
        let remaining = (cap - already_spent).max(0.0);
        let proposed = proposal.deltas[key];
        if remaining <= 0.0 {
            proposal.deltas.remove(key);
            decision.trip(TAG_VELOCITY_CAP_EXCEEDED);
        } else if proposed.abs() > remaining {
            let clipped = remaining * proposed.signum();
            proposal.deltas.insert(key.clone(), clipped);
            decision.trip(TAG_VELOCITY_CAP_EXCEEDED);
        }
    }

    // 4. Oscillation: A -> B -> A pattern in the last applied deltas
    // freezes the parameter for `cooldown_iterations` more iterations.
    // A parameter already serving out a prior freeze window stays
    // suppressed even if its last-three-deltas window no longer shows the
    // pattern (history doesn't advance while the parameter is frozen).
    let keys: Vec<String> = proposal.deltas.keys().cloned().collect();
    for key in &keys {
        if let Some(&until) = state.oscillation_freeze_until.get(key) {
            if iteration <= until {
                proposal.deltas.remove(key);
                decision.trip(TAG_OSCILLATION_DETECTED);
                continue;
            }
        }
        if state.is_oscillating(key) {
            proposal.deltas.remove(key);
            decision.trip(TAG_OSCILLATION_DETECTED);
            decision.newly_oscillation_frozen.insert(key.clone());
        }
    }

    // 5. Freeze: arm once `freeze_consecutive_passes` consecutive clean
    // passes have accumulated; clear the whole proposal.
    let no_active_drivers = drivers.is_empty();
    if verdict == Verdict::Pass && no_active_drivers {
        if state.consecutive_clean_passes + 1 >= cfg.freeze_consecutive_passes {
            decision.freeze_ready = true;
            decision.trip(TAG_FREEZE_TRIGGERED);
            proposal.deltas.clear();
        }
    }

    // 6. Multi-fail guard: three or more distinct driver categories
    // suppresses the proposal outright regardless of the above.
    if drivers.len() >= cfg.multi_fail_threshold {
        decision.trip(TAG_MULTI_FAIL_SUPPRESS);
        proposal.deltas.clear();
    }

    (decision, verdict)
}

/// KPI verdict (spec §3 `IterationSummary.kpi_verdict`). Lives here rather
/// than in `watcher` since the Guards Coordinator is what degrades
/// FAIL -> WARN during warm-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Warn,
    Fail,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::Severity;
    use std::collections::BTreeMap;

    fn cfg() -> GuardConfig {
        GuardConfig::default()
    }

    #[test]
    fn cooldown_suppresses_recently_modified_param() {
        let mut proposal = Proposal {
            deltas: BTreeMap::from([("min_interval_ms".to_string(), 5.0)]),
            rationale: vec![],
            severity: Some(Severity::Medium),
        };
        let mut state = TuningState::default();
        state.record_applied("min_interval_ms", 5, 5.0);

        let (decision, _) = evaluate(&mut proposal, &[], Verdict::Warn, 6, &state, &cfg());
        assert!(proposal.deltas.is_empty());
        assert!(decision.outcome_tags.contains(TAG_COOLDOWN_ACTIVE));
    }

    #[test]
    fn freeze_triggers_after_enough_clean_passes() {
        let mut proposal = Proposal::default();
        let mut state = TuningState::default();
        state.consecutive_clean_passes = 6;
        let (decision, _) = evaluate(&mut proposal, &[], Verdict::Pass, 8, &state, &cfg());
        assert!(decision.freeze_ready);
        assert!(decision.outcome_tags.contains(TAG_FREEZE_TRIGGERED));
    }

    #[test]
    fn multi_fail_suppresses_regardless_of_other_guards() {
        let mut proposal = Proposal {
            deltas: BTreeMap::from([
                ("min_interval_ms".to_string(), 5.0),
                ("quoting.base_spread_bps_delta".to_string(), 0.02),
            ]),
            rationale: vec!["risk_blocks".into()],
            severity: Some(Severity::High),
        };
        let state = TuningState::default();
        let drivers = vec![
            Driver::RiskBlocks,
            Driver::AdverseBps,
            Driver::SlippageBps,
        ];
        let (decision, _) = evaluate(&mut proposal, &drivers, Verdict::Fail, 10, &state, &cfg());
        assert!(proposal.deltas.is_empty());
        assert!(decision.outcome_tags.contains(TAG_MULTI_FAIL_SUPPRESS));
    }

    #[test]
    fn warmup_degrades_fail_to_warn_without_blocking_proposal() {
        let mut proposal = Proposal {
            deltas: BTreeMap::from([("min_interval_ms".to_string(), 5.0)]),
            rationale: vec![],
            severity: Some(Severity::Medium),
        };
        let state = TuningState::default();
        let (decision, verdict) = evaluate(&mut proposal, &[], Verdict::Fail, 2, &state, &cfg());
        assert_eq!(verdict, Verdict::Warn);
        assert!(decision.warmup_softened);
        assert!(!proposal.deltas.is_empty());
    }

    #[test]
    fn oscillation_freezes_the_specific_parameter() {
        let mut proposal = Proposal {
            deltas: BTreeMap::from([("quoting.base_spread_bps_delta".to_string(), 0.02)]),
            rationale: vec![],
            severity: Some(Severity::Medium),
        };
        let mut state = TuningState::default();
        state.record_applied("quoting.base_spread_bps_delta", 1, 0.02);
        state.record_applied("quoting.base_spread_bps_delta", 2, -0.02);
        state.record_applied("quoting.base_spread_bps_delta", 3, 0.02);

        let (decision, _) = evaluate(&mut proposal, &[], Verdict::Warn, 4, &state, &cfg());
        assert!(proposal.deltas.is_empty());
        assert!(decision.outcome_tags.contains(TAG_OSCILLATION_DETECTED));
        assert!(decision
            .newly_oscillation_frozen
            .contains("quoting.base_spread_bps_delta"));
    }

    #[test]
    fn oscillation_freeze_window_suppresses_even_without_a_fresh_pattern() {
        // Parameter was frozen through iteration 6 by a previous detection;
        // its applied-delta history hasn't moved since, so a fresh
        // `is_oscillating` check on the stale window would no longer fire,
        // but the explicit freeze window must still suppress it.
        let mut proposal = Proposal {
            deltas: BTreeMap::from([("quoting.base_spread_bps_delta".to_string(), 0.02)]),
            rationale: vec![],
            severity: Some(Severity::Medium),
        };
        let mut state = TuningState::default();
        state
            .oscillation_freeze_until
            .insert("quoting.base_spread_bps_delta".to_string(), 6);

        let (decision, _) = evaluate(&mut proposal, &[], Verdict::Warn, 5, &state, &cfg());
        assert!(proposal.deltas.is_empty());
        assert!(decision.outcome_tags.contains(TAG_OSCILLATION_DETECTED));
        // Already-frozen, not newly detected this iteration.
        assert!(decision.newly_oscillation_frozen.is_empty());
    }

    #[test]
    fn oscillation_freeze_window_expires() {
        let mut proposal = Proposal {
            deltas: BTreeMap::from([("quoting.base_spread_bps_delta".to_string(), 0.02)]),
            rationale: vec![],
            severity: Some(Severity::Medium),
        };
        let mut state = TuningState::default();
        state
            .oscillation_freeze_until
            .insert("quoting.base_spread_bps_delta".to_string(), 6);

        let (decision, _) = evaluate(&mut proposal, &[], Verdict::Warn, 7, &state, &cfg());
        assert!(!proposal.deltas.is_empty());
        assert!(!decision.outcome_tags.contains(TAG_OSCILLATION_DETECTED));
    }

    #[test]
    fn velocity_clips_excess_delta_to_remaining_budget() {
        let mut proposal = Proposal {
            deltas: BTreeMap::from([("min_interval_ms".to_string(), 100.0)]),
            rationale: vec![],
            severity: Some(Severity::Medium),
        };
        let state = TuningState::default();
        let (decision, _) = evaluate(&mut proposal, &[], Verdict::Warn, 1, &state, &cfg());
        assert!(decision.outcome_tags.contains(TAG_VELOCITY_CAP_EXCEEDED));
        // min_interval_ms bounds are [50, 90], so cap width is 40.
        assert!((proposal.deltas["min_interval_ms"] - 40.0).abs() < 1e-9);
    }
}
