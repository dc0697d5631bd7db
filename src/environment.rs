//! The Quest Environment: wraps a [`Bridge`] into the familiar
//! `reset -> step(action)` shape used by decision agents, and hides
//! `jump_id` opacity behind 1-based choice indices.

use std::path::Path;

use crate::{
    bridge::{Bridge, BridgeError, GameState, QuestState},
    prelude::*,
};

/// An observation handed to the agent: everything it's allowed to see about
/// the current state.
#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub location_id: String,
    pub text: String,
    pub choices_rendered: Vec<String>,
    pub params_state: Vec<String>,

    /// 1-based index -> jump_id. Rebuilt on every step, never persisted.
    #[serde(skip)]
    pub choice_map: Vec<i64>,
}

impl Observation {
    fn from_state(state: &QuestState) -> Self {
        Observation {
            location_id: state.location_id.clone(),
            text: state.text.clone(),
            choices_rendered: state.choices.iter().map(|c| c.text.clone()).collect(),
            params_state: state.params_state.clone(),
            choice_map: state.choices.iter().map(|c| c.jump_id).collect(),
        }
    }

    /// Number of valid 1-based choice indices.
    pub fn choice_count(&self) -> usize {
        self.choice_map.len()
    }
}

/// Raised when an agent or run loop passes an out-of-range action. This is
/// a programmer error: it must never reach persistence as a run outcome.
#[derive(Debug, thiserror::Error)]
#[error("invalid action {action}: must be in 1..={choice_count}")]
pub struct InvalidAction {
    pub action: i64,
    pub choice_count: usize,
}

/// Reward, done-flag, and diagnostic info returned from a step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub reward: f64,
    pub done: bool,
}

/// Wraps a [`Bridge`] session with the reset/step interface.
pub struct Environment {
    bridge: Bridge,
    last_state: QuestState,
}

impl Environment {
    /// Start the interpreter and return the initial observation.
    pub async fn reset(
        interpreter_path: &Path,
        quest_path: &Path,
        language: &str,
    ) -> Result<(Self, Observation), BridgeError> {
        let (bridge, state) = Bridge::start(interpreter_path, quest_path, language).await?;
        let observation = Observation::from_state(&state);
        Ok((
            Environment {
                bridge,
                last_state: state,
            },
            observation,
        ))
    }

    /// Is the current state terminal?
    pub fn is_terminal(&self) -> bool {
        self.last_state.game_state.is_terminal()
    }

    /// The current game state, for outcome classification.
    pub fn game_state(&self) -> GameState {
        self.last_state.game_state
    }

    /// Advance the quest by choosing the given 1-based action.
    ///
    /// Preconditions: `1 <= action <= choice_count`. Violating this raises
    /// [`InvalidAction`] without sending anything to the subprocess.
    pub async fn step(
        &mut self,
        action: i64,
    ) -> Result<(Observation, StepOutcome), EnvironmentError> {
        let choice_count = self.last_state.choices.len();
        if action < 1 || action as usize > choice_count {
            return Err(EnvironmentError::InvalidAction(InvalidAction {
                action,
                choice_count,
            }));
        }
        let jump_id = self.last_state.choices[(action - 1) as usize].jump_id;
        let state = self.bridge.step(jump_id).await?;
        let observation = Observation::from_state(&state);
        let reward = reward_for(&state.game_state);
        let done = state.game_state.is_terminal();
        self.last_state = state;
        Ok((observation, StepOutcome { reward, done }))
    }

    /// Terminate the subprocess. Always safe to call more than once; call
    /// sites should prefer wrapping this in an RAII guard so it still runs
    /// on early returns and cancellation (see `run_loop`).
    pub async fn close(&mut self) {
        self.bridge.close().await;
    }
}

fn reward_for(game_state: &GameState) -> f64 {
    match game_state {
        GameState::Win => 1.0,
        _ => 0.0,
    }
}

/// Errors that can occur while stepping the environment.
#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error(transparent)]
    InvalidAction(#[from] InvalidAction),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Choice;

    fn state(choices: Vec<(i64, &str)>, game_state: GameState) -> QuestState {
        QuestState {
            location_id: "loc".to_owned(),
            text: "text".to_owned(),
            choices: choices
                .into_iter()
                .map(|(jump_id, text)| Choice {
                    jump_id,
                    text: text.to_owned(),
                })
                .collect(),
            params_state: vec![],
            game_state,
        }
    }

    #[test]
    fn observation_maps_1_based_indices_to_jump_ids() {
        let s = state(vec![(10, "x"), (11, "y")], GameState::Running);
        let obs = Observation::from_state(&s);
        assert_eq!(obs.choice_map, vec![10, 11]);
        assert_eq!(obs.choices_rendered, vec!["x".to_owned(), "y".to_owned()]);
        assert_eq!(obs.choice_count(), 2);
    }

    #[test]
    fn reward_only_on_win() {
        assert_eq!(reward_for(&GameState::Win), 1.0);
        assert_eq!(reward_for(&GameState::Fail), 0.0);
        assert_eq!(reward_for(&GameState::Dead), 0.0);
        assert_eq!(reward_for(&GameState::Running), 0.0);
    }
}
