//! `run`: play a single quest with a single agent, outside of a benchmark.

use std::{sync::atomic::AtomicBool, time::Duration};

use clap::Args;
use uuid::Uuid;

use crate::{
    agent::{Agent, AgentConfig},
    config::read_json_or_toml,
    models::Outcome,
    persistence::Db,
    prelude::*,
    run_loop::{self, RunSpec},
};

#[derive(Debug, Clone, Args)]
pub struct RunOpts {
    /// Path to the `.qm` quest file.
    #[clap(long)]
    pub quest: PathBuf,

    /// Path to an agent config file (TOML or JSON).
    #[clap(long)]
    pub agent: PathBuf,

    /// Path to the quest interpreter binary.
    #[clap(long)]
    pub interpreter: PathBuf,

    /// Language code passed to the interpreter.
    #[clap(long, default_value = "en")]
    pub language: String,

    /// Wall-clock budget for the whole run, in seconds.
    #[clap(long, default_value = "300")]
    pub timeout: u64,

    /// Per-step budget, in seconds. Defaults to the full run timeout.
    #[clap(long)]
    pub step_timeout: Option<u64>,

    /// Hard cap on the number of steps, independent of the timeout.
    #[clap(long)]
    pub max_steps: Option<u32>,

    /// Directory under which `run_summary.json` is written.
    #[clap(long, default_value = "results")]
    pub results_dir: PathBuf,

    /// Path to the SQLite metrics database.
    #[clap(long, default_value = "metrics.db")]
    pub db: PathBuf,

    /// Raise this run's own tracing spans to `debug`, without touching the
    /// global `RUST_LOG` filter.
    #[clap(long)]
    pub debug: bool,
}

/// Run one playthrough and return its committed outcome, for the caller to
/// translate into a process exit code.
pub async fn cmd_run(opts: &RunOpts) -> Result<Outcome> {
    if opts.debug {
        debug!("debug logging requested for this run");
    }

    let agent_config: AgentConfig = read_json_or_toml(&opts.agent).await?;
    let quest_name = opts
        .quest
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| opts.quest.display().to_string());

    let db = Db::connect_file(&opts.db).await?;
    let run_timeout = Duration::from_secs(opts.timeout);
    let step_timeout = opts
        .step_timeout
        .map(Duration::from_secs)
        .unwrap_or(run_timeout);

    let agent_config_json = serde_json::to_value(&agent_config)?;
    let spec = RunSpec {
        run_id: Uuid::new_v4().to_string(),
        interpreter_path: opts.interpreter.clone(),
        quest_path: opts.quest.clone(),
        quest_name,
        language: opts.language.clone(),
        benchmark_id: None,
        run_timeout,
        step_timeout,
        max_steps: opts.max_steps,
        results_dir: opts.results_dir.clone(),
        agent_config_json,
    };

    let mut agent = Agent::new(agent_config)?;
    let cancel = AtomicBool::new(false);
    let outcome = run_loop::run(spec, &db, &mut agent, &cancel).await?;
    Ok(outcome.outcome)
}
