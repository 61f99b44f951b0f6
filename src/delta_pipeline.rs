//! Delta Application Pipeline (spec §4.6): merges the surviving proposal
//! into the current overrides, clamps to declared bounds, detects no-op
//! changes, computes the state signature, and atomically writes
//! `runtime_overrides.json`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::EngineError;
use crate::guards::{GuardDecision, TAG_NO_EFFECTIVE_CHANGE, TAG_WRITE_FAILED};
use crate::json_io::{sha256, write_atomic};
use crate::metrics::MetricsRegistry;
use crate::params::{clamp_param, whitelist};
use crate::tuning_state::TuningState;
use crate::watcher::Proposal;

const NO_OP_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignaturePair {
    pub before: String,
    pub after: String,
}

/// The `tuning` sub-object recorded into an `IterationSummary` (spec §6
/// wire format).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningOutcome {
    pub applied: bool,
    pub skip_reason: Vec<String>,
    pub changed_keys: Vec<String>,
    pub signature: SignaturePair,
    pub deltas: BTreeMap<String, f64>,
    pub rationale: Vec<String>,
}

/// One entry in the cumulative `TUNING_REPORT.json` array — identical
/// schema to `tuning` plus the iteration index it belongs to (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningReportEntry {
    pub iteration: u64,
    #[serde(flatten)]
    pub outcome: TuningOutcome,
}

/// Runs the full pipeline: merge, clamp, no-op check, signature, write.
/// Returns the updated `TuningState` (immutable-value-passed-forward per
/// spec §9) and the outcome to record into the iteration summary. Never
/// mutates `state` in place — callers replace their held state with the
/// returned one.
pub fn apply(
    state: &TuningState,
    proposal: &Proposal,
    guard_decision: &GuardDecision,
    iteration: u64,
    overrides_path: &Path,
    metrics: &MetricsRegistry,
) -> Result<(TuningState, TuningOutcome), EngineError> {
    let bounds = whitelist();
    let mut next_state = state.clone();
    let mut next_overrides = state.overrides.clone();

    // Merge + clamp. Proposal keys that are not whitelisted are dropped —
    // this is an `InvariantViolation`-class condition (spec §7) but fails
    // only that key, not the iteration; the Watcher never emits such keys
    // in practice since it only names whitelisted params.
    let mut changed_keys = Vec::new();
    let mut effective_deltas = BTreeMap::new();
    for (key, delta) in &proposal.deltas {
        let Some(current) = next_overrides.get(key).copied() else {
            continue;
        };
        let Some(clamped) = clamp_param(key, current + delta) else {
            continue;
        };
        let effective_delta = clamped - current;
        if effective_delta.abs() > NO_OP_EPSILON {
            changed_keys.push(key.clone());
            effective_deltas.insert(key.clone(), effective_delta);
        }
        next_overrides.insert(key.clone(), clamped);
    }
    changed_keys.sort();

    let before_signature = state.last_signature.clone();

    let mut skip_reason: Vec<String> = guard_decision.outcome_tags.iter().cloned().collect();

    if changed_keys.is_empty() {
        skip_reason.push(TAG_NO_EFFECTIVE_CHANGE.to_string());
        skip_reason.sort();
        skip_reason.dedup();
        return Ok((
            next_state,
            TuningOutcome {
                applied: false,
                skip_reason,
                changed_keys,
                signature: SignaturePair {
                    before: before_signature.clone(),
                    after: before_signature,
                },
                deltas: effective_deltas,
                rationale: proposal.rationale.clone(),
            },
        ));
    }

    let after_signature = sha256(&next_overrides)?;

    match write_atomic(overrides_path, &next_overrides) {
        Ok(()) => {
            next_state.overrides = next_overrides;
            next_state.last_signature = after_signature.clone();
            for key in &changed_keys {
                if let Some(&delta) = effective_deltas.get(key) {
                    next_state.record_applied(key, iteration, delta);
                }
            }
            skip_reason.sort();
            skip_reason.dedup();
            Ok((
                next_state,
                TuningOutcome {
                    applied: true,
                    skip_reason,
                    changed_keys,
                    signature: SignaturePair {
                        before: before_signature,
                        after: after_signature,
                    },
                    deltas: effective_deltas,
                    rationale: proposal.rationale.clone(),
                },
            ))
        }
        Err(e) => {
            metrics.record_write_failed();
            skip_reason.push(TAG_WRITE_FAILED.to_string());
            skip_reason.sort();
            skip_reason.dedup();
            tracing::error!(error = %e, "runtime overrides write failed");
            Ok((
                next_state,
                TuningOutcome {
                    applied: false,
                    skip_reason,
                    changed_keys: Vec::new(),
                    signature: SignaturePair {
                        before: before_signature.clone(),
                        after: before_signature,
                    },
                    deltas: BTreeMap::new(),
                    rationale: proposal.rationale.clone(),
                },
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guards::GuardDecision;
    use crate::params::MIN_INTERVAL_MS;
    use tempfile::tempdir;

    fn proposal_with(key: &str, delta: f64) -> Proposal {
        Proposal {
            deltas: BTreeMap::from([(key.to_string(), delta)]),
            rationale: vec!["risk_blocks".to_string()],
            severity: None,
        }
    }

    #[test]
    fn empty_proposal_is_a_no_op() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runtime_overrides.json");
        let state = TuningState::default();
        let metrics = MetricsRegistry::new();
        let (next, outcome) = apply(
            &state,
            &Proposal::default(),
            &GuardDecision::default(),
            1,
            &path,
            &metrics,
        )
        .unwrap();
        assert!(!outcome.applied);
        assert!(outcome.skip_reason.contains(&"no_effective_change".to_string()));
        assert_eq!(next.last_signature, state.last_signature);
        assert!(!path.exists());
    }

    #[test]
    fn applies_and_writes_when_change_is_effective() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runtime_overrides.json");
        let state = TuningState::default();
        let metrics = MetricsRegistry::new();
        let proposal = proposal_with(MIN_INTERVAL_MS, 5.0);

        let (next, outcome) = apply(
            &state,
            &proposal,
            &GuardDecision::default(),
            1,
            &path,
            &metrics,
        )
        .unwrap();

        assert!(outcome.applied);
        assert!(outcome.skip_reason.is_empty());
        assert_ne!(outcome.signature.before, outcome.signature.after);
        assert!(path.exists());
        assert_eq!(next.overrides[MIN_INTERVAL_MS], 65.0);
    }

    #[test]
    fn applying_identical_proposal_twice_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runtime_overrides.json");
        let state = TuningState::default();
        let metrics = MetricsRegistry::new();
        let proposal = proposal_with(MIN_INTERVAL_MS, 5.0);

        let (state1, _) = apply(&state, &proposal, &GuardDecision::default(), 1, &path, &metrics)
            .unwrap();
        let bytes_first = std::fs::read(&path).unwrap();

        let (state2, outcome2) =
            apply(&state1, &proposal, &GuardDecision::default(), 2, &path, &metrics).unwrap();
        let bytes_second = std::fs::read(&path).unwrap();

        assert!(!outcome2.applied);
        assert!(outcome2.skip_reason.contains(&"no_effective_change".to_string()));
        assert_eq!(bytes_first, bytes_second);
        assert_eq!(state1.last_signature, state2.last_signature);
    }

    #[test]
    fn clamp_prevents_exceeding_declared_bounds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runtime_overrides.json");
        let mut state = TuningState::default();
        state.overrides.insert(MIN_INTERVAL_MS.to_string(), 88.0);
        let metrics = MetricsRegistry::new();
        let proposal = proposal_with(MIN_INTERVAL_MS, 50.0); // would overflow past 90

        let (next, outcome) = apply(&state, &proposal, &GuardDecision::default(), 1, &path, &metrics)
            .unwrap();
        assert!(outcome.applied);
        assert_eq!(next.overrides[MIN_INTERVAL_MS], 90.0);
    }
}
