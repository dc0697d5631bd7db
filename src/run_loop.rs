//! Drives one quest playthrough: Environment <-> Agent, step cap and
//! wall-clock deadline enforcement, step/event recording, and guaranteed
//! outcome commit plus run-summary artifact on every exit path.

use std::time::Duration;

use tokio::time::Instant;

use crate::{
    agent::Agent,
    bridge::BridgeError,
    environment::{Environment, EnvironmentError},
    models::{Outcome, RunEvent, RunEventKind, RunRecord, StepRecord},
    persistence::{Db, artifact},
    prelude::*,
};

/// Caps the total number of steps a single run may take, independent of
/// the wall-clock timeout, so a quest with no terminal state (a bug in the
/// quest file, not in this engine) can't run forever within its deadline.
const DEFAULT_MAX_STEPS: u32 = 500;

/// What a single run needs to execute: where the interpreter and quest
/// live, who's playing, and the budgets it must respect.
pub struct RunSpec {
    pub run_id: String,
    pub interpreter_path: PathBuf,
    pub quest_path: PathBuf,
    pub quest_name: String,
    pub language: String,
    pub benchmark_id: Option<String>,
    pub run_timeout: Duration,
    pub step_timeout: Duration,
    pub max_steps: Option<u32>,
    pub results_dir: PathBuf,
    pub agent_config_json: Value,
}

/// The four states named by the run loop's state machine. `Stepping` is
/// implicit in the loop body; this enum exists so call sites (and tests)
/// can assert which terminal state a run actually reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Stepping,
    Terminal,
    TimedOut,
    Failed,
}

/// Async RAII guard ensuring the Environment (and therefore the bridge
/// subprocess) is torn down on every exit path, including early returns
/// and cancellation from a surrounding `tokio::select!`.
struct EnvironmentGuard {
    env: Option<Environment>,
}

impl EnvironmentGuard {
    fn new(env: Environment) -> Self {
        EnvironmentGuard { env: Some(env) }
    }

    fn get_mut(&mut self) -> &mut Environment {
        self.env.as_mut().expect("environment taken before guard dropped")
    }

    async fn close(&mut self) {
        if let Some(mut env) = self.env.take() {
            env.close().await;
        }
    }
}

impl Drop for EnvironmentGuard {
    fn drop(&mut self) {
        if let Some(mut env) = self.env.take() {
            tokio::spawn(async move {
                env.close().await;
            });
        }
    }
}

/// Outcome of a single run, returned for the Scheduler's counters.
pub struct RunOutcome {
    pub outcome: Outcome,
    pub reward: Option<f64>,
}

/// Drive one playthrough to completion. Never returns an error for
/// in-run failures (bridge crash, LLM failure, timeout, cancellation) --
/// those are all captured as a committed outcome. Returns `Err` only for
/// genuinely unrecoverable setup failures (can't reach the database,
/// can't even start the bridge).
#[instrument(level = "info", skip(db, agent, cancel), fields(run_id = %spec.run_id))]
pub async fn run(
    spec: RunSpec,
    db: &Db,
    agent: &mut Agent,
    cancel: &std::sync::atomic::AtomicBool,
) -> Result<RunOutcome> {
    let mut state = RunState::Init;
    let max_steps = spec.max_steps.unwrap_or(DEFAULT_MAX_STEPS);
    let start_time = chrono::Utc::now();
    let deadline = Instant::now() + spec.run_timeout;

    let run_record = RunRecord {
        run_id: spec.run_id.clone(),
        quest_name: spec.quest_name.clone(),
        agent_id: agent.config().agent_id.clone(),
        agent_config_json: spec.agent_config_json.clone(),
        start_time,
        end_time: None,
        outcome: None,
        reward: None,
        benchmark_id: spec.benchmark_id.clone(),
    };
    db.insert_run(&run_record).await?;

    let (env, observation) =
        match Environment::reset(&spec.interpreter_path, &spec.quest_path, &spec.language).await {
            Ok(pair) => pair,
            Err(err) => {
                return finish_with_error(db, &spec, "bridge", &err.to_string()).await;
            }
        };
    let mut guard = EnvironmentGuard::new(env);
    state = RunState::Stepping;

    let mut event_sequence: u64 = 0;
    let mut step_number: u32 = 1;
    let mut observation = observation;

    let initial_step = StepRecord {
        step_number,
        location_id: observation.location_id.clone(),
        observation: observation.text.clone(),
        choices: observation.choices_rendered.clone(),
        action: None,
        reward: 0.0,
        llm_decision: None,
        metadata: json!({}),
    };
    db.insert_step(&spec.run_id, &initial_step).await?;
    event_sequence += 1;
    emit_event(db, &spec.run_id, event_sequence, RunEventKind::Step).await;

    let final_state = loop {
        if guard.get_mut().is_terminal() {
            break TerminalKind::Natural;
        }
        if Instant::now() >= deadline {
            state = RunState::TimedOut;
            break TerminalKind::Timeout;
        }
        if step_number >= max_steps {
            break TerminalKind::StepCapExceeded;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let budget = remaining.min(spec.step_timeout);

        if cancel.load(std::sync::atomic::Ordering::Relaxed) {
            break TerminalKind::Cancelled;
        }

        let choice_count = observation.choice_count();
        let (action, llm_decision) = if agent.config().skip_single && choice_count == 1 {
            (1, None)
        } else {
            let decision = agent.decide(&observation, budget).await;
            (decision.action, Some(decision.llm_decision))
        };

        // The bridge read itself has its own internal per-line timeout, but
        // that budget is fixed and independent of this run's deadline -- a
        // slow interpreter must still produce a TIMEOUT outcome, not an
        // ERROR, if it blows through the *run's* wall clock first.
        let step_budget = deadline.saturating_duration_since(Instant::now());
        let (next_observation, step_outcome) = match tokio::time::timeout(
            step_budget,
            guard.get_mut().step(action),
        )
        .await
        {
            Err(_) => {
                state = RunState::TimedOut;
                break TerminalKind::Timeout;
            }
            Ok(Ok(pair)) => pair,
            Ok(Err(EnvironmentError::Bridge(err))) => {
                state = RunState::Failed;
                break TerminalKind::BridgeError(err);
            }
            Ok(Err(EnvironmentError::InvalidAction(err))) => {
                // A programmer error, not a run failure: the agent is
                // supposed to only ever return an in-range index.
                return Err(anyhow!(err));
            }
        };

        step_number += 1;
        let step = StepRecord {
            step_number,
            location_id: next_observation.location_id.clone(),
            observation: next_observation.text.clone(),
            choices: next_observation.choices_rendered.clone(),
            action: Some(action),
            reward: step_outcome.reward,
            llm_decision,
            metadata: json!({}),
        };
        db.insert_step(&spec.run_id, &step).await?;
        event_sequence += 1;
        emit_event(db, &spec.run_id, event_sequence, RunEventKind::Step).await;

        observation = next_observation;
        if step_outcome.done {
            break TerminalKind::Natural;
        }
    };

    let game_state = guard.get_mut().game_state();
    guard.close().await;

    let (outcome, reward, cause) = match final_state {
        TerminalKind::Natural => {
            state = RunState::Terminal;
            let outcome = if game_state == crate::bridge::GameState::Win {
                Outcome::Success
            } else {
                Outcome::Failure
            };
            let reward = if outcome == Outcome::Success { 1.0 } else { 0.0 };
            (outcome, Some(reward), None)
        }
        TerminalKind::Timeout => (Outcome::Timeout, None, None),
        TerminalKind::StepCapExceeded => {
            state = RunState::Failed;
            (Outcome::Error, None, Some("step_cap_exceeded".to_owned()))
        }
        TerminalKind::Cancelled => {
            state = RunState::Failed;
            (Outcome::Error, None, Some("cancelled".to_owned()))
        }
        TerminalKind::BridgeError(err) => (Outcome::Error, None, Some(format!("bridge: {err}"))),
    };

    let end_time = chrono::Utc::now();
    let won_race = db
        .commit_outcome(&spec.run_id, outcome, end_time, reward)
        .await?;
    if !won_race {
        debug!(run_id = %spec.run_id, "outcome commit lost the first-write-wins race");
    }
    event_sequence += 1;
    emit_event(db, &spec.run_id, event_sequence, RunEventKind::Outcome).await;

    let committed_run = db.get_run(&spec.run_id).await?;
    let steps = db.list_steps(&spec.run_id).await?;
    if let Err(err) =
        artifact::write_run_summary(&spec.results_dir, &committed_run, &steps, cause.as_deref())
            .await
    {
        warn!("failed to write run summary artifact: {err}");
    }

    debug!(run_id = %spec.run_id, ?state, ?outcome, "run finished");
    Ok(RunOutcome {
        outcome: committed_run.outcome.unwrap_or(outcome),
        reward: committed_run.reward,
    })
}

enum TerminalKind {
    Natural,
    Timeout,
    StepCapExceeded,
    Cancelled,
    BridgeError(BridgeError),
}

async fn emit_event(db: &Db, run_id: &str, sequence: u64, kind: RunEventKind) {
    let event = RunEvent {
        sequence,
        run_id: run_id.to_owned(),
        kind,
        timestamp: chrono::Utc::now(),
    };
    if let Err(err) = db.insert_event(&event).await {
        warn!("failed to record run event: {err}");
    }
}

async fn finish_with_error(
    db: &Db,
    spec: &RunSpec,
    cause_prefix: &str,
    detail: &str,
) -> Result<RunOutcome> {
    let end_time = chrono::Utc::now();
    // The run row was already inserted by the caller before the bridge
    // was started, so there is nothing further to insert here -- this
    // helper only needs to commit the terminal outcome and write the
    // artifact for whatever landed in the `runs`/`steps` tables so far.
    db.commit_outcome(&spec.run_id, Outcome::Error, end_time, None)
        .await?;
    warn!("run {} failed to start: {cause_prefix}: {detail}", spec.run_id);
    if let Ok(run) = db.get_run(&spec.run_id).await {
        let steps = db.list_steps(&spec.run_id).await.unwrap_or_default();
        if let Err(err) =
            artifact::write_run_summary(&spec.results_dir, &run, &steps, Some(cause_prefix)).await
        {
            warn!("failed to write run summary artifact: {err}");
        }
    }
    Ok(RunOutcome {
        outcome: Outcome::Error,
        reward: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_transitions_are_distinct() {
        assert_ne!(RunState::Init, RunState::Stepping);
        assert_ne!(RunState::Terminal, RunState::TimedOut);
        assert_ne!(RunState::Failed, RunState::Terminal);
    }
}
