//! `benchmark`: run a quest x agent matrix to completion and report the
//! aggregate outcome.

use std::sync::Arc;

use clap::Args;

use crate::{
    config::read_json_or_toml,
    models::{BenchmarkRecord, BenchmarkStatus},
    persistence::Db,
    prelude::*,
    scheduler::{self, BenchmarkConfig},
    ui::Ui,
};

#[derive(Debug, Clone, Args)]
pub struct BenchmarkOpts {
    /// Path to a benchmark config file (TOML or JSON).
    #[clap(long)]
    pub config: PathBuf,

    /// Path to the SQLite metrics database.
    #[clap(long, default_value = "metrics.db")]
    pub db: PathBuf,

    /// Raise this benchmark's own tracing spans to `debug`, without
    /// touching the global `RUST_LOG` filter.
    #[clap(long)]
    pub debug: bool,
}

/// Run a benchmark and return its final record, for the caller to report
/// a summary and an exit code (0 iff the config parsed and the scheduler
/// completed -- per-pair outcomes live in the benchmark summary artifact).
pub async fn cmd_benchmark(opts: &BenchmarkOpts, ui: &Ui) -> Result<BenchmarkRecord> {
    if opts.debug {
        debug!("debug logging requested for this benchmark");
    }

    let config: BenchmarkConfig = read_json_or_toml(&opts.config).await?;
    let db = Arc::new(Db::connect_file(&opts.db).await?);

    let record = scheduler::run_benchmark(config, db, ui).await?;
    info!(
        benchmark_id = %record.benchmark_id,
        completed = record.completed,
        failed = record.failed,
        timed_out = record.timed_out,
        total = record.total,
        "benchmark finished"
    );
    if record.status == BenchmarkStatus::Error {
        warn!("every run in this benchmark failed to complete");
    }
    Ok(record)
}
