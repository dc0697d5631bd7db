//! The Benchmark Scheduler: expands a quest x agent matrix and dispatches
//! it to a bounded worker pool, one independent Run Loop per pair.
//!
//! The bounded-concurrency idiom is the same one this codebase already
//! uses to bound in-flight I/O-bound work (`futures::StreamExt`-driven
//! concurrency limiting), generalized here from "chat completion items" to
//! "(quest, agent) pairs, each producing a finished `RunRecord`." Because
//! the full set of pairs is known upfront -- unlike a streamed stdin input
//! -- there's no need for the submission-channel half of that pattern; a
//! `for_each_concurrent` over the expanded pair list is the whole of it.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::{StreamExt as _, stream};
use tokio::fs;
use uuid::Uuid;

use crate::{
    agent::{Agent, AgentConfig},
    models::{BenchmarkRecord, BenchmarkStatus, Outcome},
    persistence::{
        Db,
        artifact::{OutcomeCounts, quest_slug, write_benchmark_summary},
    },
    prelude::*,
    run_loop::{self, RunSpec},
    ui::{ProgressConfig, Ui},
};

/// Input to a benchmark run: the matrix of quests x agents, and the
/// budgets/limits the Scheduler enforces while executing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    pub interpreter_path: PathBuf,

    #[serde(default = "default_language")]
    pub language: String,

    /// `.qm` files, or directories to expand (recursively) into `.qm`
    /// files below them, in stable lexicographic order.
    pub quests: Vec<PathBuf>,

    pub agents: Vec<AgentConfig>,

    pub timeout_per_run_secs: u64,

    #[serde(default)]
    pub step_timeout_secs: Option<u64>,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default)]
    pub max_steps: Option<u32>,

    #[serde(default)]
    pub benchmark_id: Option<String>,

    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
}

fn default_language() -> String {
    "en".to_owned()
}

fn default_max_workers() -> usize {
    num_cpus::get()
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

/// A live snapshot of benchmark progress, updated under a single mutex and
/// read by observers (the CLI's progress bar today; shaped to serialize
/// directly to JSON for a future polling endpoint).
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub total: u32,
    pub running: u32,
    pub completed: u32,
    pub failed: u32,
    pub timeout: u32,
}

struct Shared {
    stats: Mutex<SchedulerStats>,
    cancel: AtomicBool,
}

/// A handle observers can poll for a stats snapshot and use to request an
/// early, cooperative shutdown.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats.lock().expect("stats mutex poisoned").clone()
    }

    /// Request that all workers wind down after their current step.
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::Relaxed);
    }
}

/// Expand `quests` (files and/or directories) into a sorted list of `.qm`
/// files, recursing into directories.
async fn expand_quests(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for path in paths {
        collect_qm_files(path, &mut found).await?;
    }
    found.sort();
    found.dedup();
    Ok(found)
}

fn collect_qm_files<'a>(
    path: &'a Path,
    found: &'a mut Vec<PathBuf>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let metadata = fs::metadata(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        if metadata.is_dir() {
            let mut entries = fs::read_dir(path)
                .await
                .with_context(|| format!("reading directory {}", path.display()))?;
            let mut children = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                children.push(entry.path());
            }
            children.sort();
            for child in children {
                collect_qm_files(&child, found).await?;
            }
        } else if path.extension().is_some_and(|ext| ext == "qm") {
            found.push(path.to_path_buf());
        }
        Ok(())
    })
}

fn quest_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Run a benchmark to completion, writing per-run artifacts as each pair
/// finishes and the aggregate `benchmark_summary.json` once every worker
/// has drained.
#[instrument(level = "info", skip(config, db, ui), fields(max_workers = config.max_workers))]
pub async fn run_benchmark(config: BenchmarkConfig, db: Arc<Db>, ui: &Ui) -> Result<BenchmarkRecord> {
    let benchmark_id = config.benchmark_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let quest_files = expand_quests(&config.quests).await?;
    if quest_files.is_empty() {
        return Err(anyhow!("no .qm files found under the configured quest paths"));
    }

    let pairs: Vec<(PathBuf, AgentConfig)> = quest_files
        .iter()
        .flat_map(|quest| config.agents.iter().map(move |agent| (quest.clone(), agent.clone())))
        .collect();
    let total = pairs.len() as u32;

    let config_json = serde_json::to_value(&config)?;
    db.insert_benchmark(&BenchmarkRecord {
        benchmark_id: benchmark_id.clone(),
        config_json,
        status: BenchmarkStatus::Running,
        total,
        completed: 0,
        failed: 0,
        timed_out: 0,
        summary_json: None,
    })
    .await?;

    let shared = Arc::new(Shared {
        stats: Mutex::new(SchedulerStats { total, ..Default::default() }),
        cancel: AtomicBool::new(false),
    });
    let handle = SchedulerHandle { shared: shared.clone() };

    let progress = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "\u{1F9ED}",
            msg: "benchmark",
            done_msg: "benchmark complete",
        },
        u64::from(total),
    );

    let run_timeout = Duration::from_secs(config.timeout_per_run_secs);
    let step_timeout = config
        .step_timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(run_timeout);

    let per_agent: Arc<Mutex<BTreeMap<String, OutcomeCounts>>> = Arc::new(Mutex::new(BTreeMap::new()));
    let per_quest: Arc<Mutex<BTreeMap<String, OutcomeCounts>>> = Arc::new(Mutex::new(BTreeMap::new()));
    let run_ids: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("received interrupt, letting in-flight runs wind down and commit ERROR(\"cancelled\")");
                handle.cancel();
            }
        });
    }

    stream::iter(pairs.into_iter())
        .for_each_concurrent(config.max_workers.max(1), |(quest_path, agent_config)| {
            let db = db.clone();
            let shared = shared.clone();
            let progress = progress.clone();
            let per_agent = per_agent.clone();
            let per_quest = per_quest.clone();
            let run_ids = run_ids.clone();
            let config = &config;
            let benchmark_id = benchmark_id.clone();
            async move {
                {
                    let mut stats = shared.stats.lock().expect("stats mutex poisoned");
                    stats.running += 1;
                }

                let run_id = Uuid::new_v4().to_string();
                let agent_id = agent_config.agent_id.clone();
                let name = quest_name(&quest_path);
                let agent_config_json = serde_json::to_value(&agent_config).unwrap_or(json!({}));

                let spec = RunSpec {
                    run_id: run_id.clone(),
                    interpreter_path: config.interpreter_path.clone(),
                    quest_path,
                    quest_name: name.clone(),
                    language: config.language.clone(),
                    benchmark_id: Some(benchmark_id.clone()),
                    run_timeout,
                    step_timeout,
                    max_steps: config.max_steps,
                    results_dir: config.results_dir.clone(),
                    agent_config_json,
                };

                let outcome = match Agent::new(agent_config) {
                    Ok(mut agent) => run_loop::run(spec, &db, &mut agent, &shared.cancel)
                        .await
                        .map(|outcome| outcome.outcome),
                    Err(err) => {
                        warn!("failed to build agent {agent_id} for run {run_id}: {err}");
                        Err(err)
                    }
                };

                let outcome = outcome.unwrap_or(Outcome::Error);

                {
                    let mut stats = shared.stats.lock().expect("stats mutex poisoned");
                    stats.running -= 1;
                    match outcome {
                        Outcome::Success | Outcome::Failure => stats.completed += 1,
                        Outcome::Timeout => stats.timeout += 1,
                        Outcome::Error => stats.failed += 1,
                    }
                }
                per_agent.lock().expect("counts mutex poisoned").entry(agent_id).or_default().record(outcome);
                per_quest
                    .lock()
                    .expect("counts mutex poisoned")
                    .entry(quest_slug(&name))
                    .or_default()
                    .record(outcome);
                run_ids.lock().expect("run ids mutex poisoned").push(run_id);
                progress.inc(1);
            }
        })
        .await;

    progress.finish();

    let stats = handle.stats();
    let status = if stats.failed > 0 && stats.completed == 0 && stats.timeout == 0 {
        BenchmarkStatus::Error
    } else {
        BenchmarkStatus::Complete
    };

    let per_agent = per_agent.lock().expect("counts mutex poisoned").clone();
    let per_quest = per_quest.lock().expect("counts mutex poisoned").clone();
    let run_ids = run_ids.lock().expect("run ids mutex poisoned").clone();

    write_benchmark_summary(&config.results_dir, &benchmark_id, status, &per_agent, &per_quest, &run_ids).await?;
    db.update_benchmark_counters(&benchmark_id, stats.completed, stats.failed, stats.timeout).await?;

    let summary_json = json!({
        "per_agent": per_agent,
        "per_quest": per_quest,
        "run_ids": run_ids,
    });
    db.finalize_benchmark(&benchmark_id, status, &summary_json).await?;

    Ok(BenchmarkRecord {
        benchmark_id,
        config_json: serde_json::to_value(&config)?,
        status,
        total,
        completed: stats.completed,
        failed: stats.failed,
        timed_out: stats.timeout,
        summary_json: Some(summary_json),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expand_quests_sorts_and_dedupes_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.qm"), b"").await.unwrap();
        fs::write(dir.path().join("a.qm"), b"").await.unwrap();
        fs::write(dir.path().join("ignore.txt"), b"").await.unwrap();

        let found = expand_quests(&[dir.path().to_path_buf()]).await.unwrap();
        let names: Vec<_> = found.iter().map(|p| quest_name(p)).collect();
        assert_eq!(names, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn scheduler_stats_defaults_to_zero() {
        let stats = SchedulerStats::default();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.running, 0);
    }
}
