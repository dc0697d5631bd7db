//! SQLite-backed storage for runs, steps, run events, and benchmarks, plus
//! the JSON run-summary/benchmark-summary artifact writers.
//!
//! The source codebase ships no database dependency; this layer is modeled
//! on the closest sibling store pattern in the retrieved corpus: a pool
//! handle wrapped in a narrow store type, `sqlx::query` with bound
//! parameters (never string-interpolated), hand-written enum<->TEXT
//! conversions instead of a derive, and a `thiserror` error enum distinct
//! from the ambient `anyhow::Result` used elsewhere.

pub mod artifact;

use std::str::FromStr;

use serde::de::Error as _;
use sqlx::{Row, sqlite::SqlitePoolOptions};

use crate::{
    models::{BenchmarkRecord, BenchmarkStatus, LlmDecision, Outcome, RunEvent, RunRecord, StepRecord},
    prelude::*,
};

/// Errors raised by the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("not found: {0}")]
    NotFound(String),

    /// A write lost the first-write-wins race; not itself a failure.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A pooled connection to the run-metrics SQLite database, with
/// migrate-on-connect schema setup.
#[derive(Clone)]
pub struct Db {
    pool: sqlx::SqlitePool,
}

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS runs (
    run_id            TEXT PRIMARY KEY,
    quest_name        TEXT NOT NULL,
    agent_id          TEXT NOT NULL,
    agent_config_json TEXT NOT NULL,
    start_time        TEXT NOT NULL,
    end_time          TEXT,
    outcome           TEXT,
    reward            REAL,
    benchmark_id      TEXT
);

CREATE TABLE IF NOT EXISTS steps (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id            TEXT NOT NULL,
    step_number       INTEGER NOT NULL,
    location_id       TEXT NOT NULL,
    observation       TEXT NOT NULL,
    choices_json      TEXT NOT NULL,
    action            INTEGER,
    reward            REAL NOT NULL,
    llm_decision_json TEXT,
    metadata_json     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_steps_run_id ON steps (run_id, step_number);

CREATE TABLE IF NOT EXISTS run_events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    sequence   INTEGER NOT NULL,
    run_id     TEXT NOT NULL,
    kind       TEXT NOT NULL,
    timestamp  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_run_events_run_id ON run_events (run_id, sequence);

CREATE TABLE IF NOT EXISTS benchmarks (
    benchmark_id   TEXT PRIMARY KEY,
    config_json    TEXT NOT NULL,
    status         TEXT NOT NULL,
    total          INTEGER NOT NULL,
    completed      INTEGER NOT NULL,
    failed         INTEGER NOT NULL,
    timed_out      INTEGER NOT NULL,
    summary_json   TEXT
);
";

impl Db {
    /// Connect to (and create if absent) the SQLite database file at
    /// `path`, running migrations.
    pub async fn connect_file(path: &Path) -> Result<Self, PersistenceError> {
        Self::connect(&format!("sqlite://{}?mode=rwc", path.display())).await
    }

    /// Connect to (and create if absent) the SQLite database at `url`,
    /// running migrations. Use `sqlite::memory:` or a `tempfile` path for
    /// tests so no fixture database needs to be checked in.
    #[instrument(level = "debug")]
    pub async fn connect(url: &str) -> Result<Self, PersistenceError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await?;
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Db { pool })
    }

    pub async fn insert_run(&self, run: &RunRecord) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO runs \
             (run_id, quest_name, agent_id, agent_config_json, start_time, \
              end_time, outcome, reward, benchmark_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.run_id)
        .bind(&run.quest_name)
        .bind(&run.agent_id)
        .bind(serde_json::to_string(&run.agent_config_json)?)
        .bind(run.start_time.to_rfc3339())
        .bind(run.end_time.map(|t| t.to_rfc3339()))
        .bind(run.outcome.map(Outcome::as_db_str))
        .bind(run.reward)
        .bind(&run.benchmark_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Commit a terminal outcome, but only if no outcome has been written
    /// yet. Returns `true` if this call won the race, `false` if some
    /// earlier writer already committed one.
    #[instrument(level = "debug", skip(self))]
    pub async fn commit_outcome(
        &self,
        run_id: &str,
        outcome: Outcome,
        end_time: chrono::DateTime<chrono::Utc>,
        reward: Option<f64>,
    ) -> Result<bool, PersistenceError> {
        let result = sqlx::query(
            "UPDATE runs SET outcome = ?, end_time = ?, reward = ? \
             WHERE run_id = ? AND outcome IS NULL",
        )
        .bind(outcome.as_db_str())
        .bind(end_time.to_rfc3339())
        .bind(reward)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<RunRecord, PersistenceError> {
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PersistenceError::NotFound(run_id.to_owned()))?;
        run_record_from_row(&row)
    }

    pub async fn insert_step(
        &self,
        run_id: &str,
        step: &StepRecord,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO steps \
             (run_id, step_number, location_id, observation, choices_json, \
              action, reward, llm_decision_json, metadata_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(step.step_number)
        .bind(&step.location_id)
        .bind(&step.observation)
        .bind(serde_json::to_string(&step.choices)?)
        .bind(step.action)
        .bind(step.reward)
        .bind(
            step.llm_decision
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(serde_json::to_string(&step.metadata)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRecord>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT step_number, location_id, observation, choices_json, action, \
                    reward, llm_decision_json, metadata_json \
             FROM steps WHERE run_id = ? ORDER BY step_number",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let choices: Vec<String> =
                    serde_json::from_str(row.try_get::<String, _>("choices_json")?.as_str())?;
                let llm_decision: Option<LlmDecision> = row
                    .try_get::<Option<String>, _>("llm_decision_json")?
                    .map(|s| serde_json::from_str(&s))
                    .transpose()?;
                let metadata: Value =
                    serde_json::from_str(row.try_get::<String, _>("metadata_json")?.as_str())?;
                Ok(StepRecord {
                    step_number: row.try_get::<i64, _>("step_number")? as u32,
                    location_id: row.try_get("location_id")?,
                    observation: row.try_get("observation")?,
                    choices,
                    action: row.try_get("action")?,
                    reward: row.try_get("reward")?,
                    llm_decision,
                    metadata,
                })
            })
            .collect()
    }

    pub async fn insert_event(&self, event: &RunEvent) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO run_events (sequence, run_id, kind, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(event.sequence as i64)
        .bind(&event.run_id)
        .bind(event.kind.as_db_str())
        .bind(event.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_benchmark(&self, benchmark: &BenchmarkRecord) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO benchmarks \
             (benchmark_id, config_json, status, total, completed, failed, timed_out, summary_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&benchmark.benchmark_id)
        .bind(serde_json::to_string(&benchmark.config_json)?)
        .bind(benchmark.status.as_db_str())
        .bind(benchmark.total)
        .bind(benchmark.completed)
        .bind(benchmark.failed)
        .bind(benchmark.timed_out)
        .bind(
            benchmark
                .summary_json
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_benchmark_counters(
        &self,
        benchmark_id: &str,
        completed: u32,
        failed: u32,
        timed_out: u32,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            "UPDATE benchmarks SET completed = ?, failed = ?, timed_out = ? WHERE benchmark_id = ?",
        )
        .bind(completed)
        .bind(failed)
        .bind(timed_out)
        .bind(benchmark_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn finalize_benchmark(
        &self,
        benchmark_id: &str,
        status: BenchmarkStatus,
        summary_json: &Value,
    ) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE benchmarks SET status = ?, summary_json = ? WHERE benchmark_id = ?")
            .bind(status.as_db_str())
            .bind(serde_json::to_string(summary_json)?)
            .bind(benchmark_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn run_record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<RunRecord, PersistenceError> {
    let outcome: Option<String> = row.try_get("outcome")?;
    let start_time: String = row.try_get("start_time")?;
    let end_time: Option<String> = row.try_get("end_time")?;
    Ok(RunRecord {
        run_id: row.try_get("run_id")?,
        quest_name: row.try_get("quest_name")?,
        agent_id: row.try_get("agent_id")?,
        agent_config_json: serde_json::from_str(
            row.try_get::<String, _>("agent_config_json")?.as_str(),
        )?,
        start_time: chrono::DateTime::from_str(&start_time)
            .map_err(|e| PersistenceError::Codec(serde_json::Error::custom(e.to_string())))?,
        end_time: end_time
            .map(|t| chrono::DateTime::from_str(&t))
            .transpose()
            .map_err(|e: chrono::ParseError| {
                PersistenceError::Codec(serde_json::Error::custom(e.to_string()))
            })?,
        outcome: outcome.as_deref().and_then(Outcome::from_db_str),
        reward: row.try_get("reward")?,
        benchmark_id: row.try_get("benchmark_id")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> Db {
        Db::connect("sqlite::memory:").await.unwrap()
    }

    fn sample_run(run_id: &str) -> RunRecord {
        RunRecord {
            run_id: run_id.to_owned(),
            quest_name: "quest-a".to_owned(),
            agent_id: "agent-a".to_owned(),
            agent_config_json: json!({"model": "random_local:seed1"}),
            start_time: chrono::Utc::now(),
            end_time: None,
            outcome: None,
            reward: None,
            benchmark_id: None,
        }
    }

    #[tokio::test]
    async fn first_write_wins_outcome_commit() {
        let db = memory_db().await;
        let run = sample_run("run-1");
        db.insert_run(&run).await.unwrap();

        let now = chrono::Utc::now();
        let won = db
            .commit_outcome("run-1", Outcome::Timeout, now, None)
            .await
            .unwrap();
        assert!(won);

        let lost = db
            .commit_outcome("run-1", Outcome::Failure, now, Some(0.0))
            .await
            .unwrap();
        assert!(!lost);

        let stored = db.get_run("run-1").await.unwrap();
        assert_eq!(stored.outcome, Some(Outcome::Timeout));
    }

    #[tokio::test]
    async fn steps_round_trip() {
        let db = memory_db().await;
        let run = sample_run("run-2");
        db.insert_run(&run).await.unwrap();

        db.insert_step(
            "run-2",
            &StepRecord {
                step_number: 1,
                location_id: "start".to_owned(),
                observation: "you are here".to_owned(),
                choices: vec!["go north".to_owned()],
                action: None,
                reward: 0.0,
                llm_decision: None,
                metadata: json!({}),
            },
        )
        .await
        .unwrap();

        let steps = db.list_steps("run-2").await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].choices, vec!["go north".to_owned()]);
    }
}
