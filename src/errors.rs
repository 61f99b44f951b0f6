//! Error taxonomy for the soak engine.
//!
//! Kinds mirror the failure modes the engine actually recovers from or
//! surfaces, not a generic catch-all. Most of these are recorded into an
//! iteration's `skip_reason`/`tuning.applied` fields rather than bubbled up
//! as a process error; only `Fatal` ever reaches `main`.

use std::fmt;

/// Top-level error taxonomy (spec §7). Variant names are the error *kind*,
/// not a wrapper around a single underlying type.
#[derive(Debug)]
pub enum EngineError {
    /// Network blip, exchange 5xx, timeout. Retried with backoff inside the
    /// connector; this variant only appears once retries are exhausted.
    TransientIo(String),
    /// Invalid request, 4xx (non-throttle). Not retried.
    PermanentIo(String),
    /// 429 / backoff advice from the exchange.
    RateLimit(String),
    /// Per-tick or per-request deadline exceeded.
    DeadlineExceeded(String),
    /// NaN/Inf encountered in a KPI or proposed delta.
    NumericDomain(String),
    /// Artifact fsync/rename failed.
    WriteFailure(String),
    /// Unknown parameter key, out-of-bounds value after clamp, missing
    /// schema field.
    InvariantViolation(String),
    /// Unrecoverable configuration error; the engine refuses to start.
    Fatal(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::TransientIo(m) => write!(f, "transient io: {m}"),
            EngineError::PermanentIo(m) => write!(f, "permanent io: {m}"),
            EngineError::RateLimit(m) => write!(f, "rate limited: {m}"),
            EngineError::DeadlineExceeded(m) => write!(f, "deadline exceeded: {m}"),
            EngineError::NumericDomain(m) => write!(f, "numeric domain violation: {m}"),
            EngineError::WriteFailure(m) => write!(f, "write failure: {m}"),
            EngineError::InvariantViolation(m) => write!(f, "invariant violation: {m}"),
            EngineError::Fatal(m) => write!(f, "fatal: {m}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::WriteFailure(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::InvariantViolation(e.to_string())
    }
}

/// One entry in the deterministic `FAILURES.md`-style failure ledger: an
/// iteration index plus the reason it failed.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub iteration: u64,
    pub reason: String,
}

impl FailureRecord {
    pub fn new(iteration: u64, reason: impl Into<String>) -> Self {
        Self {
            iteration,
            reason: reason.into(),
        }
    }
}

/// Renders the accumulated failure ledger in the deterministic text format
/// the operator-facing `FAILURES.md` analogue uses: one line per record,
/// ordered by iteration index, no trailing metadata that would vary run to
/// run.
pub fn render_failures_md(records: &[FailureRecord]) -> String {
    let mut sorted = records.to_vec();
    sorted.sort_by_key(|r| r.iteration);
    let mut out = String::from("# Failures\n\n");
    if sorted.is_empty() {
        out.push_str("(none)\n");
        return out;
    }
    for r in &sorted {
        out.push_str(&format!("- iteration {}: {}\n", r.iteration, r.reason));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_empty_failures() {
        let s = render_failures_md(&[]);
        assert!(s.contains("(none)"));
    }

    #[test]
    fn render_sorts_by_iteration() {
        let records = vec![
            FailureRecord::new(3, "multi_fail_suppress"),
            FailureRecord::new(1, "write_failed"),
        ];
        let s = render_failures_md(&records);
        let pos1 = s.find("iteration 1").unwrap();
        let pos3 = s.find("iteration 3").unwrap();
        assert!(pos1 < pos3);
    }

    #[test]
    fn display_matches_kind() {
        let e = EngineError::NumericDomain("nan in net_bps".into());
        assert!(e.to_string().starts_with("numeric domain violation"));
    }
}
