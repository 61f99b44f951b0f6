//! Artifact Store (spec §2, §6): the on-disk tree under
//! `artifacts/soak/<stream>/` — per-iteration summaries, the cumulative
//! tuning report, the runtime overrides file, and the terminal
//! `POST_SOAK_SNAPSHOT.json` / `FAILURES.md` artifacts.
//!
//! Single writer (the engine's iteration loop), many readers (the KPI
//! Gate, the Delta Verifier, the next process's `TuningState::load`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::delta_pipeline::TuningOutcome;
use crate::errors::{render_failures_md, EngineError, FailureRecord};
use crate::guards::Verdict;
use crate::json_io::{read_json_opt, write_atomic};
use crate::watcher::{IterationKpis, MakerTakerSource};

/// One iteration's complete summary (spec §6 wire format). Written exactly
/// once per iteration; immutable after write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationSummary {
    pub iteration: u64,
    pub runtime_utc: String,
    pub net_bps: f64,
    pub kpi_verdict: Verdict,
    pub neg_edge_drivers: Vec<String>,
    pub proposed_deltas: BTreeMap<String, f64>,
    pub freeze_ready: bool,
    pub tuning: TuningOutcome,
    pub maker_taker_source: MakerTakerSource,
    pub summary: IterationKpis,
}

pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn iteration_summary_path(&self, iteration: u64) -> PathBuf {
        self.root.join(format!("ITER_SUMMARY_{iteration}.json"))
    }

    pub fn tuning_report_path(&self) -> PathBuf {
        self.root.join("TUNING_REPORT.json")
    }

    pub fn runtime_overrides_path(&self) -> PathBuf {
        self.root.join("runtime_overrides.json")
    }

    pub fn tuning_state_path(&self) -> PathBuf {
        self.root.join("tuning_state.json")
    }

    pub fn post_soak_snapshot_path(&self) -> PathBuf {
        self.root.join("POST_SOAK_SNAPSHOT.json")
    }

    pub fn failures_md_path(&self) -> PathBuf {
        self.root.join("FAILURES.md")
    }

    /// Writes an iteration summary exactly once. Written before the
    /// overrides file for iteration *i+1* is touched (the delta pipeline
    /// call that produces the overrides write happens before this, so the
    /// ordering spec §5 demands — "iteration summaries are written before
    /// the overrides file is updated for iteration i+1" — holds simply by
    /// sequencing the engine's loop body this way).
    pub fn write_iteration_summary(&self, summary: &IterationSummary) -> Result<(), EngineError> {
        write_atomic(&self.iteration_summary_path(summary.iteration), summary)
    }

    pub fn read_iteration_summary(&self, iteration: u64) -> Result<Option<IterationSummary>, EngineError> {
        read_json_opt(&self.iteration_summary_path(iteration))
    }

    /// Reads every `ITER_SUMMARY_N.json` present, ordered by iteration
    /// index ascending.
    pub fn read_all_iteration_summaries(&self) -> Result<Vec<IterationSummary>, EngineError> {
        let mut summaries = Vec::new();
        if !self.root.exists() {
            return Ok(summaries);
        }
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("ITER_SUMMARY_") && name.ends_with(".json") {
                if let Some(parsed) = read_json_opt::<IterationSummary>(&entry.path())? {
                    summaries.push(parsed);
                }
            }
        }
        summaries.sort_by_key(|s| s.iteration);
        Ok(summaries)
    }

    /// Appends one entry to the cumulative tuning report, rewriting the
    /// whole array atomically (spec §6: "re-written atomically as a whole
    /// on each iteration"). Strictly iteration-index ordered.
    pub fn append_tuning_report(
        &self,
        iteration: u64,
        outcome: &TuningOutcome,
    ) -> Result<(), EngineError> {
        let path = self.tuning_report_path();
        let mut entries: Vec<Value> = read_json_opt(&path)?.unwrap_or_default();
        let entry = serde_json::to_value(crate::delta_pipeline::TuningReportEntry {
            iteration,
            outcome: outcome.clone(),
        })?;
        entries.push(entry);
        entries.sort_by_key(|v| v.get("iteration").and_then(Value::as_u64).unwrap_or(0));
        write_atomic(&path, &entries)
    }

    pub fn read_tuning_report(&self) -> Result<Vec<Value>, EngineError> {
        Ok(read_json_opt(&self.tuning_report_path())?.unwrap_or_default())
    }

    pub fn write_post_soak_snapshot<T: Serialize>(&self, snapshot: &T) -> Result<(), EngineError> {
        write_atomic(&self.post_soak_snapshot_path(), snapshot)
    }

    /// Renders the deterministic `FAILURES.md` artifact. Plain-text, not
    /// run through the JSON canonicaliser, but still written atomically
    /// (tmp -> rename) for the same partial-write safety.
    pub fn write_failures_md(&self, records: &[FailureRecord]) -> Result<(), EngineError> {
        let rendered = render_failures_md(records);
        write_text_atomic(&self.failures_md_path(), &rendered)
    }
}

fn write_text_atomic(path: &Path, contents: &str) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);
    std::fs::write(&tmp_path, contents.as_bytes())?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta_pipeline::SignaturePair;
    use crate::watcher::{IterationKpis, MakerTakerSource};
    use tempfile::tempdir;

    fn sample_summary(iteration: u64) -> IterationSummary {
        IterationSummary {
            iteration,
            runtime_utc: "2026-01-01T00:00:00.000Z".to_string(),
            net_bps: 3.0,
            kpi_verdict: Verdict::Pass,
            neg_edge_drivers: vec![],
            proposed_deltas: BTreeMap::new(),
            freeze_ready: false,
            tuning: TuningOutcome {
                applied: false,
                skip_reason: vec!["no_effective_change".to_string()],
                changed_keys: vec![],
                signature: SignaturePair {
                    before: "abc".to_string(),
                    after: "abc".to_string(),
                },
                deltas: BTreeMap::new(),
                rationale: vec![],
            },
            maker_taker_source: MakerTakerSource::Mock,
            summary: IterationKpis {
                net_bps: 3.0,
                gross_bps: 5.0,
                fees_eff_bps: -1.0,
                slippage_bps: 0.0,
                inventory_bps: 1.0,
                maker_taker_ratio: 0.8,
                maker_taker_source: MakerTakerSource::Mock,
                p95_latency_ms: 100.0,
                order_age_p95_ms: 200.0,
                ws_lag_p95_ms: 10.0,
                adverse_bps_p95: 1.0,
                slippage_bps_p95: 1.0,
                risk_ratio: 0.1,
                cancel_ratio: 0.2,
            },
        }
    }

    #[test]
    fn write_then_read_iteration_summary_round_trips() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let summary = sample_summary(1);
        store.write_iteration_summary(&summary).unwrap();

        let read_back = store.read_iteration_summary(1).unwrap().unwrap();
        assert_eq!(read_back.iteration, 1);
        assert!((read_back.net_bps - 3.0).abs() < 1e-9);
    }

    #[test]
    fn read_all_orders_by_iteration_index() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.write_iteration_summary(&sample_summary(3)).unwrap();
        store.write_iteration_summary(&sample_summary(1)).unwrap();
        store.write_iteration_summary(&sample_summary(2)).unwrap();

        let all = store.read_all_iteration_summaries().unwrap();
        assert_eq!(
            all.iter().map(|s| s.iteration).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn tuning_report_is_strictly_iteration_ordered_and_atomic() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let outcome = sample_summary(1).tuning;
        store.append_tuning_report(2, &outcome).unwrap();
        store.append_tuning_report(1, &outcome).unwrap();

        let report = store.read_tuning_report().unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(report[0]["iteration"], 1);
        assert_eq!(report[1]["iteration"], 2);
    }

    #[test]
    fn failures_md_is_written_and_readable() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store
            .write_failures_md(&[FailureRecord::new(2, "multi_fail_suppress")])
            .unwrap();
        let contents = std::fs::read_to_string(store.failures_md_path()).unwrap();
        assert!(contents.contains("iteration 2"));
    }
}
