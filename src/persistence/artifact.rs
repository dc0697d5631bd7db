//! JSON artifact writers: `run_summary.json` and `benchmark_summary.json`.
//!
//! These are plain filesystem writes, independent of the SQLite store --
//! the database is the queryable record, the artifacts are the
//! human/tool-consumable snapshot handed off at the end of a run or a
//! benchmark.

use tokio::{fs, io::AsyncWriteExt};

use crate::{
    models::{BenchmarkStatus, EndReason, Outcome, RunRecord, StepRecord},
    prelude::*,
};

/// Slugify a quest name into a filesystem-safe path component.
pub fn quest_slug(quest_name: &str) -> String {
    quest_name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Aggregate token/cost usage across a run's steps.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
}

fn aggregate_usage(steps: &[StepRecord]) -> AggregateUsage {
    let mut total = AggregateUsage::default();
    for step in steps {
        if let Some(decision) = &step.llm_decision {
            total.prompt_tokens += decision.usage.prompt_tokens;
            total.completion_tokens += decision.usage.completion_tokens;
            total.total_tokens += decision.usage.total_tokens();
            total.cost_usd += decision.cost_usd.unwrap_or(0.0);
        }
    }
    total
}

fn classify_end_reason(outcome: Outcome, cause: Option<&str>) -> EndReason {
    match (outcome, cause) {
        (Outcome::Success, _) => EndReason::QuestSuccess,
        (Outcome::Failure, _) => EndReason::QuestFailure,
        (Outcome::Timeout, _) => EndReason::Timeout,
        (Outcome::Error, Some("cancelled")) => EndReason::Cancelled,
        (Outcome::Error, Some(cause)) if cause.starts_with("bridge") => EndReason::BridgeError,
        (Outcome::Error, _) => EndReason::LlmError,
    }
}

/// Write `results/<agent_id>/<quest_slug>/run_<id>/run_summary.json`.
#[instrument(level = "debug", skip(results_dir, run, steps))]
pub async fn write_run_summary(
    results_dir: &Path,
    run: &RunRecord,
    steps: &[StepRecord],
    error_cause: Option<&str>,
) -> Result<PathBuf> {
    let outcome = run
        .outcome
        .context("run_summary requested before an outcome was committed")?;
    let usage = aggregate_usage(steps);
    let end_reason = classify_end_reason(outcome, error_cause);

    let dir = results_dir
        .join(&run.agent_id)
        .join(quest_slug(&run.quest_name))
        .join(format!("run_{}", run.run_id));
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating run summary directory {}", dir.display()))?;

    let summary = json!({
        "run_id": run.run_id,
        "quest_name": run.quest_name,
        "agent_id": run.agent_id,
        "agent_config": run.agent_config_json,
        "start_time": run.start_time.to_rfc3339(),
        "end_time": run.end_time.map(|t| t.to_rfc3339()),
        "outcome": outcome,
        "reward": run.reward,
        "end_reason": end_reason,
        "usage": usage,
        "steps": steps,
    });

    let path = dir.join("run_summary.json");
    write_json_atomically(&path, &summary).await?;
    Ok(path)
}

/// Per-(agent, quest) counters rolled up for the benchmark summary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OutcomeCounts {
    pub ok: u32,
    pub fail: u32,
    pub timeout: u32,
    pub error: u32,
}

impl OutcomeCounts {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.ok += 1,
            Outcome::Failure => self.fail += 1,
            Outcome::Timeout => self.timeout += 1,
            Outcome::Error => self.error += 1,
        }
    }
}

/// Write `results/benchmarks/<benchmark_id>/benchmark_summary.json`.
#[instrument(level = "debug", skip(results_dir, per_agent, per_quest, run_ids))]
pub async fn write_benchmark_summary(
    results_dir: &Path,
    benchmark_id: &str,
    status: BenchmarkStatus,
    per_agent: &std::collections::BTreeMap<String, OutcomeCounts>,
    per_quest: &std::collections::BTreeMap<String, OutcomeCounts>,
    run_ids: &[String],
) -> Result<PathBuf> {
    let dir = results_dir.join("benchmarks").join(benchmark_id);
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating benchmark summary directory {}", dir.display()))?;

    let summary = json!({
        "benchmark_id": benchmark_id,
        "status": status,
        "per_agent": per_agent,
        "per_quest": per_quest,
        "total_runs": run_ids.len(),
        "run_ids": run_ids,
    });

    let path = dir.join("benchmark_summary.json");
    write_json_atomically(&path, &summary).await?;
    Ok(path)
}

/// Write to a sibling temp file and rename into place, so a reader never
/// observes a partially-written artifact.
async fn write_json_atomically(path: &Path, value: &Value) -> Result<()> {
    let body = serde_json::to_vec_pretty(value).context("serializing artifact JSON")?;
    let tmp_path = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("creating {}", tmp_path.display()))?;
    file.write_all(&body).await?;
    file.flush().await?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("renaming into place: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quest_slug_replaces_unsafe_chars() {
        assert_eq!(quest_slug("Desert Bus / 2"), "Desert_Bus___2");
        assert_eq!(quest_slug("castle-1"), "castle-1");
    }

    #[test]
    fn outcome_counts_tally_each_bucket() {
        let mut counts = OutcomeCounts::default();
        counts.record(Outcome::Success);
        counts.record(Outcome::Success);
        counts.record(Outcome::Failure);
        assert_eq!(counts.ok, 2);
        assert_eq!(counts.fail, 1);
        assert_eq!(counts.timeout, 0);
    }

    #[test]
    fn classify_end_reason_matches_bridge_error_cause() {
        // The run loop's cause string carries the bridge error's own
        // Display text after the "bridge: " prefix, so this must match on
        // the prefix rather than the exact literal "bridge".
        let cause = format!("bridge: {}", "connection reset");
        assert_eq!(
            classify_end_reason(Outcome::Error, Some(&cause)),
            EndReason::BridgeError
        );
    }

    #[test]
    fn classify_end_reason_other_causes() {
        assert_eq!(
            classify_end_reason(Outcome::Error, Some("cancelled")),
            EndReason::Cancelled
        );
        assert_eq!(
            classify_end_reason(Outcome::Error, Some("step_cap_exceeded")),
            EndReason::LlmError
        );
    }
}
