//! Delta Verifier (spec §4.8): reads the cumulative tuning report and
//! every iteration summary, and for each consecutive pair where a proposal
//! existed, classifies the outcome as full-apply, partial, fail, or
//! signature-stuck.

use serde::Serialize;

use crate::artifact_store::IterationSummary;

const MATCH_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairVerdict {
    FullApply,
    Partial,
    Fail,
    SignatureStuck,
    NoProposal,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairResult {
    pub iteration: u64,
    pub verdict: PairVerdict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierMode {
    Default,
    Strict,
    Soft,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub pairs: Vec<PairResult>,
    pub full_apply_ratio: f64,
    pub signature_stuck_count: u64,
    pub verdict_pass: bool,
}

/// Classifies one (iteration i-1, iteration i) pair. `proposed` is the
/// proposal from iteration i-1's summary; `observed` is iteration i's
/// applied deltas (`tuning.deltas`); `guard_tags` are iteration i's
/// skip-reason set.
fn classify_pair(
    proposed: &std::collections::BTreeMap<String, f64>,
    observed: &std::collections::BTreeMap<String, f64>,
    guard_tags: &[String],
    applied: bool,
    signature_before: &str,
    signature_after: &str,
) -> PairVerdict {
    if proposed.is_empty() {
        return PairVerdict::NoProposal;
    }
    if applied && signature_before == signature_after && !signature_before.is_empty() {
        return PairVerdict::SignatureStuck;
    }

    let full_apply = proposed
        .iter()
        .all(|(k, v)| (observed.get(k).copied().unwrap_or(0.0) - v).abs() <= MATCH_EPSILON);
    if full_apply {
        return PairVerdict::FullApply;
    }

    if !guard_tags.is_empty() {
        PairVerdict::Partial
    } else {
        PairVerdict::Fail
    }
}

/// Runs verification over the full summary sequence (ascending iteration
/// order expected; callers sort first).
pub fn verify(summaries: &[IterationSummary], mode: VerifierMode) -> VerificationReport {
    let mut sorted: Vec<&IterationSummary> = summaries.iter().collect();
    sorted.sort_by_key(|s| s.iteration);

    let mut pairs = Vec::new();
    for window in sorted.windows(2) {
        let prev = window[0];
        let curr = window[1];
        if prev.proposed_deltas.is_empty() {
            continue;
        }
        let verdict = classify_pair(
            &prev.proposed_deltas,
            &curr.tuning.deltas,
            &curr.tuning.skip_reason,
            curr.tuning.applied,
            &curr.tuning.signature.before,
            &curr.tuning.signature.after,
        );
        pairs.push(PairResult {
            iteration: curr.iteration,
            verdict,
        });
    }

    let considered: Vec<&PairResult> = pairs
        .iter()
        .filter(|p| p.verdict != PairVerdict::NoProposal)
        .collect();
    let signature_stuck_count = considered
        .iter()
        .filter(|p| p.verdict == PairVerdict::SignatureStuck)
        .count() as u64;
    let full_apply_count = considered
        .iter()
        .filter(|p| p.verdict == PairVerdict::FullApply)
        .count();
    let full_apply_ratio = if considered.is_empty() {
        1.0
    } else {
        full_apply_count as f64 / considered.len() as f64
    };

    let verdict_pass = if considered.is_empty() {
        true
    } else {
        match mode {
            VerifierMode::Default => {
                full_apply_ratio >= 0.90 || (full_apply_ratio >= 0.80 && signature_stuck_count == 0)
            }
            VerifierMode::Strict => full_apply_ratio >= 0.95 && signature_stuck_count == 0,
            VerifierMode::Soft => full_apply_ratio >= 0.60,
        }
    };

    VerificationReport {
        pairs,
        full_apply_ratio,
        signature_stuck_count,
        verdict_pass,
    }
}
