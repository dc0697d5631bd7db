//! Loop-awareness: detect when an agent keeps returning to the same state
//! and making the same choice, and deterministically steer it elsewhere.
//!
//! State owned per-run, never persisted; reconstructed fresh on every run.

use std::{
    collections::HashMap,
    hash::{Hash, Hasher},
};

use crate::environment::Observation;

/// Visits required at a fingerprint before loop-escape hints kick in.
pub const DEFAULT_VISIT_THRESHOLD: u32 = 3;
/// Repeats of the same action at a fingerprint before we override it.
pub const DEFAULT_STREAK_THRESHOLD: u32 = 2;

/// Hash identifying a semantically-equivalent state: location, params, and
/// the *set* of available jumps (order-independent, since the interpreter
/// is free to reorder choices between re-visits of the same location).
pub type Fingerprint = u64;

pub fn fingerprint(observation: &Observation) -> Fingerprint {
    let mut jump_ids = observation.choice_map.clone();
    jump_ids.sort_unstable();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    observation.location_id.hash(&mut hasher);
    observation.params_state.hash(&mut hasher);
    jump_ids.hash(&mut hasher);
    hasher.finish()
}

/// Per-run loop-detection state.
#[derive(Debug, Default)]
pub struct LoopState {
    visits: HashMap<Fingerprint, u32>,
    streaks: HashMap<(Fingerprint, i64), u32>,
    visit_threshold: u32,
    streak_threshold: u32,
}

impl LoopState {
    pub fn new() -> Self {
        LoopState {
            visits: HashMap::new(),
            streaks: HashMap::new(),
            visit_threshold: DEFAULT_VISIT_THRESHOLD,
            streak_threshold: DEFAULT_STREAK_THRESHOLD,
        }
    }

    #[cfg(test)]
    pub fn with_thresholds(visit_threshold: u32, streak_threshold: u32) -> Self {
        LoopState {
            visit_threshold,
            streak_threshold,
            ..Self::new()
        }
    }

    /// Record a visit to `fp`, returning the updated visit count. Call once
    /// per step, before asking whether a loop-escape hint is warranted.
    pub fn record_visit(&mut self, fp: Fingerprint) -> u32 {
        let count = self.visits.entry(fp).or_insert(0);
        *count += 1;
        *count
    }

    /// Should the prompt carry a loop-escape hint for this fingerprint,
    /// given the action chosen the *previous* time we were at it (if any)?
    pub fn should_hint(&self, fp: Fingerprint, last_action: Option<i64>) -> bool {
        let Some(last_action) = last_action else {
            return false;
        };
        let visits = self.visits.get(&fp).copied().unwrap_or(0);
        let streak = self.streaks.get(&(fp, last_action)).copied().unwrap_or(0);
        visits >= self.visit_threshold && streak >= self.streak_threshold
    }

    /// Record that `action` was chosen at `fp`, updating the streak table.
    pub fn record_action(&mut self, fp: Fingerprint, action: i64) {
        // Any other action at this fingerprint resets its own streak to 0
        // implicitly (we only ever read the entry for the *matching* action).
        let streak = self.streaks.entry((fp, action)).or_insert(0);
        *streak += 1;
    }

    /// If the model's chosen action should be overridden (it repeated the
    /// action that triggered the hint, and a different choice exists), pick
    /// the smallest different valid index.
    pub fn escape_override(
        &self,
        fp: Fingerprint,
        last_action: Option<i64>,
        chosen: i64,
        choice_count: usize,
    ) -> Option<i64> {
        if !self.should_hint(fp, last_action) {
            return None;
        }
        if Some(chosen) != last_action {
            // The model already diversified on its own.
            return None;
        }
        (1..=choice_count as i64).find(|&candidate| candidate != chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Observation;

    fn obs(location_id: &str, choice_map: Vec<i64>) -> Observation {
        Observation {
            location_id: location_id.to_owned(),
            text: "x".to_owned(),
            choices_rendered: choice_map.iter().map(|_| "c".to_owned()).collect(),
            params_state: vec![],
            choice_map,
        }
    }

    #[test]
    fn fingerprint_is_order_independent_over_choices() {
        let a = fingerprint(&obs("loc", vec![10, 20]));
        let b = fingerprint(&obs("loc", vec![20, 10]));
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_by_location() {
        let a = fingerprint(&obs("loc1", vec![10]));
        let b = fingerprint(&obs("loc2", vec![10]));
        assert_ne!(a, b);
    }

    #[test]
    fn hint_and_override_after_thresholds() {
        let mut state = LoopState::with_thresholds(3, 2);
        let fp = 42;
        // Visits 1 and 2: no hint yet regardless of streak.
        state.record_visit(fp);
        state.record_action(fp, 1);
        assert!(!state.should_hint(fp, Some(1)));

        state.record_visit(fp);
        state.record_action(fp, 1);
        assert!(!state.should_hint(fp, Some(1)));

        // Visit 3 with a streak of 2 on action 1: hint should fire.
        state.record_visit(fp);
        assert!(state.should_hint(fp, Some(1)));

        // Model repeats action 1 -> override to the smallest alternative.
        let over = state.escape_override(fp, Some(1), 1, 2);
        assert_eq!(over, Some(2));

        // Model already diversified -> no override.
        let over = state.escape_override(fp, Some(1), 2, 2);
        assert_eq!(over, None);
    }

    #[test]
    fn no_override_when_only_one_choice_exists() {
        let mut state = LoopState::with_thresholds(1, 1);
        let fp = 7;
        state.record_visit(fp);
        state.record_action(fp, 1);
        state.record_visit(fp);
        assert!(state.should_hint(fp, Some(1)));
        assert_eq!(state.escape_override(fp, Some(1), 1, 1), None);
    }
}
