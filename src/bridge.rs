//! The Engine Bridge: a line-JSON session with an external quest
//! interpreter subprocess.
//!
//! The interpreter is an opaque binary that reads a `.qm` file and speaks a
//! line-delimited JSON protocol over stdin/stdout. It may also interleave
//! ad-hoc, non-JSON log lines on stdout (autojump traces and the like); the
//! Bridge's job is to read through that noise without ever mistaking silence
//! or garbage for a valid game state.

use std::{collections::VecDeque, process::Stdio, time::Duration};

use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

use crate::prelude::*;

/// How long we wait for a single line of subprocess output before declaring
/// a timeout. This is a per-read budget, not a budget for the whole call.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// How long we give the subprocess to exit gracefully after closing stdin,
/// before we force-kill it.
const GRACEFUL_SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// How many non-JSON stdout lines we keep around for diagnostics.
const MAX_DIAGNOSTIC_LINES: usize = 32;

/// A choice offered at a location.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Choice {
    #[serde(rename = "jumpId")]
    pub jump_id: i64,
    pub text: String,
}

/// Coarse status of the quest, as reported by the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GameState {
    Running,
    Win,
    Fail,
    Dead,
}

impl GameState {
    /// Is the quest over?
    pub fn is_terminal(self) -> bool {
        self != GameState::Running
    }
}

/// The inner `state` object of a wire-protocol message.
#[derive(Debug, Clone, Deserialize)]
struct WireState {
    text: String,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default, rename = "paramsState")]
    params_state: Vec<String>,
    #[serde(rename = "gameState")]
    game_state: GameState,
}

/// The `saving` object of a wire-protocol message.
#[derive(Debug, Clone, Deserialize)]
struct WireSaving {
    #[serde(rename = "locationId")]
    location_id: String,
}

/// A full wire-protocol message, as emitted by the subprocess.
#[derive(Debug, Clone, Deserialize)]
struct WireMessage {
    state: WireState,
    saving: WireSaving,
}

/// A normalized game state, as presented to the rest of the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestState {
    pub location_id: String,
    pub text: String,
    pub choices: Vec<Choice>,
    pub params_state: Vec<String>,
    pub game_state: GameState,
}

impl From<WireMessage> for QuestState {
    fn from(msg: WireMessage) -> Self {
        QuestState {
            location_id: msg.saving.location_id,
            text: msg.state.text,
            choices: msg.state.choices,
            params_state: msg.state.params_state,
            game_state: msg.state.game_state,
        }
    }
}

/// Errors which can occur while talking to the interpreter subprocess.
///
/// None of these are retried by the Bridge itself; the Run Loop decides
/// what to do with them.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to start quest interpreter: {0}")]
    Startup(String),

    #[error("timed out waiting for a valid state from the quest interpreter")]
    Timeout,

    #[error("quest interpreter emitted malformed state: {0}")]
    Protocol(String),

    #[error("quest interpreter subprocess exited unexpectedly")]
    Crashed,

    #[error("i/o error talking to quest interpreter: {0}")]
    Io(#[from] std::io::Error),
}

/// A live session with a quest interpreter subprocess.
///
/// Owns the child process for its entire lifetime. Dropping a `Bridge`
/// without calling [`Bridge::close`] first still attempts a best-effort
/// kill, but callers should prefer the explicit async close so they can
/// observe failures.
pub struct Bridge {
    child: Option<Child>,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    read_timeout: Duration,
    diagnostics: VecDeque<String>,
}

impl Bridge {
    /// Spawn the interpreter and perform the startup preflight: the
    /// subprocess must be reachable and must emit a schema-matching initial
    /// state before `start` returns.
    #[instrument(level = "debug", skip(quest_path), fields(quest = %quest_path.display()))]
    pub async fn start(
        interpreter_path: &Path,
        quest_path: &Path,
        language: &str,
    ) -> Result<(Self, QuestState), BridgeError> {
        let mut command = Command::new(interpreter_path);
        command
            .arg(quest_path)
            .arg("--language")
            .arg(language)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| BridgeError::Startup(format!("failed to spawn process: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Startup("no stdin handle".to_owned()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Startup("no stdout handle".to_owned()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::Startup("no stderr handle".to_owned()))?;

        let mut bridge = Bridge {
            child: Some(child),
            stdin,
            lines: BufReader::new(stdout).lines(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            diagnostics: VecDeque::with_capacity(MAX_DIAGNOSTIC_LINES),
        };

        match bridge.read_state().await {
            Ok(state) => Ok((bridge, state)),
            Err(err) => {
                let stderr_fragment = read_stderr_fragment(stderr).await;
                let diagnostics = bridge.diagnostics.iter().cloned().collect::<Vec<_>>();
                bridge.force_kill().await;
                Err(BridgeError::Startup(format!(
                    "{err}; stderr: {stderr_fragment:?}; stdout diagnostics: {diagnostics:?}"
                )))
            }
        }
    }

    /// Perform a jump to the given choice's `jump_id`.
    #[instrument(level = "debug", skip(self))]
    pub async fn step(&mut self, jump_id: i64) -> Result<QuestState, BridgeError> {
        self.send_line(&jump_id.to_string()).await?;
        self.read_state().await
    }

    /// Re-request the current state without changing it. Idempotent: two
    /// consecutive calls return identical states.
    #[instrument(level = "debug", skip(self))]
    pub async fn get_state(&mut self) -> Result<QuestState, BridgeError> {
        self.send_line("get_state").await?;
        self.read_state().await
    }

    /// Gracefully close the subprocess, force-killing it if it doesn't exit
    /// within the grace period. Safe to call more than once.
    #[instrument(level = "debug", skip(self))]
    pub async fn close(&mut self) {
        // Dropping stdin signals EOF to well-behaved interpreters.
        let _ = self.stdin.shutdown().await;
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match timeout(GRACEFUL_SHUTDOWN_GRACE_PERIOD, child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("error waiting for quest interpreter to exit: {e}"),
            Err(_) => {
                warn!("quest interpreter did not exit gracefully, killing it");
                self.force_kill().await;
            }
        }
        self.child = None;
    }

    async fn force_kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.child = None;
    }

    async fn send_line(&mut self, line: &str) -> Result<(), BridgeError> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Read lines from stdout until one parses as a schema-matching JSON
    /// state, buffering anything else as diagnostic noise. Never launders
    /// an absence of output into a fabricated terminal state.
    async fn read_state(&mut self) -> Result<QuestState, BridgeError> {
        loop {
            let line = match timeout(self.read_timeout, self.lines.next_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => return Err(BridgeError::Crashed),
                Ok(Err(e)) => return Err(BridgeError::Io(e)),
                Err(_) => return Err(BridgeError::Timeout),
            };

            match serde_json::from_str::<WireMessage>(&line) {
                Ok(msg) => return Ok(msg.into()),
                Err(_) => {
                    // Could be a genuine log line, or JSON that doesn't match
                    // our schema. Either way we don't fail here: we keep
                    // reading until the read timeout fires.
                    if looks_like_json_object(&line) {
                        debug!(%line, "stdout line parsed as JSON but not our schema");
                    }
                    if self.diagnostics.len() == MAX_DIAGNOSTIC_LINES {
                        self.diagnostics.pop_front();
                    }
                    self.diagnostics.push_back(line);
                }
            }
        }
    }
}

fn looks_like_json_object(line: &str) -> bool {
    line.trim_start().starts_with('{')
}

async fn read_stderr_fragment(
    stderr: impl tokio::io::AsyncRead + Unpin,
) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut collected = String::new();
    // Give stderr a brief window to flush its fragment; a hung process
    // shouldn't block the startup error from being reported.
    let _ = timeout(Duration::from_millis(500), async {
        while let Ok(Some(line)) = lines.next_line().await {
            collected.push_str(&line);
            collected.push('\n');
        }
    })
    .await;
    collected
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            // Best-effort; `kill_on_drop(true)` on the `Command` is our real
            // safety net if we're dropped without `close` ever completing.
            let _ = child.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn game_state_terminal() {
        assert!(!GameState::Running.is_terminal());
        assert!(GameState::Win.is_terminal());
        assert!(GameState::Fail.is_terminal());
        assert!(GameState::Dead.is_terminal());
    }

    #[test]
    fn wire_message_maps_to_quest_state() {
        let json = r#"{
            "state": {
                "text": "A",
                "choices": [{"jumpId": 10, "text": "x"}],
                "paramsState": ["hp: 10"],
                "gameState": "running"
            },
            "saving": {"locationId": "loc1"}
        }"#;
        let msg: WireMessage = serde_json::from_str(json).unwrap();
        let state: QuestState = msg.into();
        assert_eq!(state.location_id, "loc1");
        assert_eq!(state.text, "A");
        assert_eq!(state.choices.len(), 1);
        assert_eq!(state.choices[0].jump_id, 10);
        assert_eq!(state.params_state, vec!["hp: 10".to_string()]);
        assert_eq!(state.game_state, GameState::Running);
    }

    #[test]
    fn non_json_noise_does_not_parse_as_wire_message() {
        let line = "[autojump] diagnostic ignore me";
        assert!(serde_json::from_str::<WireMessage>(line).is_err());
        assert!(!looks_like_json_object(line));
    }

    #[test]
    fn empty_choices_matches_terminal_states_only_by_convention() {
        // The bridge itself does not enforce the invariant "choices
        // non-empty iff running" -- that's a property of well-formed
        // interpreter output, checked by the Environment layer instead.
        let json = r#"{
            "state": {"text": "done", "choices": [], "gameState": "win"},
            "saving": {"locationId": "loc9"}
        }"#;
        let msg: WireMessage = serde_json::from_str(json).unwrap();
        let state: QuestState = msg.into();
        assert!(state.choices.is_empty());
        assert!(state.game_state.is_terminal());
    }
}
