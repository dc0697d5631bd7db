//! Shared data model for runs, steps, events and benchmarks.
//!
//! These types are deliberately plain data: persistence (`persistence`),
//! the run loop (`run_loop`), and the scheduler (`scheduler`) all build and
//! consume them, but none of them own serialization-vs-storage decisions.

use crate::{llm::TokenUsage, prelude::*};

/// Final verdict of a run. `TIMEOUT` and `SUCCESS`/`FAILURE` are mutually
/// exclusive by construction: only the first commit to a run's `outcome`
/// column is ever observed (see `persistence::Db::commit_outcome`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
    Error,
}

impl Outcome {
    /// Stored/read as plain `TEXT`, converted by hand at the persistence
    /// boundary rather than via a derive, per the sibling store pattern.
    pub fn as_db_str(self) -> &'static str {
        match self {
            Outcome::Success => "SUCCESS",
            Outcome::Failure => "FAILURE",
            Outcome::Timeout => "TIMEOUT",
            Outcome::Error => "ERROR",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(Outcome::Success),
            "FAILURE" => Some(Outcome::Failure),
            "TIMEOUT" => Some(Outcome::Timeout),
            "ERROR" => Some(Outcome::Error),
            _ => None,
        }
    }
}

/// Why a run ended, recorded on the run-summary artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    QuestSuccess,
    QuestFailure,
    Timeout,
    Cancelled,
    BridgeError,
    LlmError,
}

/// A single playthrough of one quest by one agent.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub quest_name: String,
    pub agent_id: String,
    pub agent_config_json: Value,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    pub outcome: Option<Outcome>,
    pub reward: Option<f64>,
    pub benchmark_id: Option<String>,
}

/// What the Decision Agent actually decided, or how it failed to.
///
/// Recorded on every non-initial [`StepRecord`]. `error` and `override_`
/// are mutually exclusive in practice (an overridden choice came from a
/// successful parse), but both are plain optional fields rather than an
/// enum so the JSON artifact stays a flat, greppable object.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LlmDecision {
    pub analysis: Option<String>,
    pub reasoning: Option<String>,
    pub result: Option<i64>,
    /// e.g. `"llm_call_error: timeout"` or `"parse_error"`.
    pub error: Option<String>,
    /// Set to `"loop_escape"` when the agent overrode a repeated choice.
    #[serde(rename = "override")]
    pub override_: Option<String>,
    pub usage: TokenUsage,
    pub cost_usd: Option<f64>,
}

/// One append-only row of a run's trace. `step_number` is 1-based and
/// strictly increasing; `action` is `None` only for the initial state.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step_number: u32,
    pub location_id: String,
    pub observation: String,
    pub choices: Vec<String>,
    pub action: Option<i64>,
    pub reward: f64,
    pub llm_decision: Option<LlmDecision>,
    pub metadata: Value,
}

/// One entry in a run's observer timeline.
#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub sequence: u64,
    pub run_id: String,
    pub kind: RunEventKind,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    Step,
    Timeout,
    Outcome,
    Error,
}

impl RunEventKind {
    pub fn as_db_str(self) -> &'static str {
        match self {
            RunEventKind::Step => "step",
            RunEventKind::Timeout => "timeout",
            RunEventKind::Outcome => "outcome",
            RunEventKind::Error => "error",
        }
    }
}

/// Status of a benchmark run as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BenchmarkStatus {
    Pending,
    Running,
    Complete,
    Error,
}

impl BenchmarkStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            BenchmarkStatus::Pending => "pending",
            BenchmarkStatus::Running => "running",
            BenchmarkStatus::Complete => "complete",
            BenchmarkStatus::Error => "error",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BenchmarkStatus::Pending),
            "running" => Some(BenchmarkStatus::Running),
            "complete" => Some(BenchmarkStatus::Complete),
            "error" => Some(BenchmarkStatus::Error),
            _ => None,
        }
    }
}

/// The cartesian execution of many runs over a matrix of quests x agents.
#[derive(Debug, Clone)]
pub struct BenchmarkRecord {
    pub benchmark_id: String,
    pub config_json: Value,
    pub status: BenchmarkStatus,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub timed_out: u32,
    pub summary_json: Option<Value>,
}
