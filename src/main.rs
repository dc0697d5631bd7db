use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod agent;
mod bridge;
mod cmd;
mod config;
mod environment;
mod llm;
mod models;
mod persistence;
mod prelude;
mod prompt;
mod retry;
mod run_loop;
mod scheduler;
mod ui;

/// Run and benchmark LLM-backed agents against branching text quests.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OPENAI_API_KEY, ANTHROPIC_API_KEY, GOOGLE_API_KEY, DEEPSEEK_API_KEY,
    OPENROUTER_API_KEY: provider credentials, one per supported provider.
  - LLM_QUEST_PRICES_JSON (optional): per-model price table overrides.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Play a single quest with a single agent.
    Run(cmd::run::RunOpts),
    /// Run a quest x agent matrix to completion.
    Benchmark(cmd::benchmark::BenchmarkOpts),
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive = Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    let exit_code = real_main(ui).await?;
    std::process::exit(exit_code)
}

/// Our real entry point. Returns the process exit code: for `run`, `0`
/// SUCCESS / `1` FAILURE / `2` TIMEOUT / `3` ERROR; for `benchmark`, `0`
/// iff the config parsed and the scheduler ran to completion (per-pair
/// outcomes live in the benchmark summary artifact, not the exit code).
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<i32> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Both subcommands report through tracing/progress bars, never stdout,
    // so there's no equivalent of the old "hide progress bars for stdout
    // output" switch here.
    match &opts.subcmd {
        Cmd::Run(run_opts) => {
            let outcome = cmd::run::cmd_run(run_opts).await?;
            Ok(exit_code_for_outcome(outcome))
        }
        Cmd::Benchmark(benchmark_opts) => {
            cmd::benchmark::cmd_benchmark(benchmark_opts, &ui).await?;
            Ok(0)
        }
    }
}

fn exit_code_for_outcome(outcome: models::Outcome) -> i32 {
    match outcome {
        models::Outcome::Success => 0,
        models::Outcome::Failure => 1,
        models::Outcome::Timeout => 2,
        models::Outcome::Error => 3,
    }
}
