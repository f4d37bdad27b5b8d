use std::collections::VecDeque;
use std::time::Instant;

use serde_json::Value;

/// One engine state blob keyed by the number of actions applied when it
/// was taken. `at_action_index == k` means "state after the first k
/// actions of the log".
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub at_action_index: usize,
    pub state: Value,
    pub taken_at: Instant,
}

/// Rolling window of recent checkpoints, used to bound the cost of
/// rebuilding state for undo, rewind, and time-travel reads: restore the
/// nearest checkpoint at or below the target index, then replay forward.
#[derive(Debug)]
pub struct CheckpointManager {
    interval: usize,
    window: usize,
    checkpoints: VecDeque<Checkpoint>,
}

impl CheckpointManager {
    pub fn new(interval: usize, window: usize) -> Self {
        Self { interval: interval.max(1), window: window.max(1), checkpoints: VecDeque::new() }
    }

    /// Record a checkpoint if `history_len` lands on the capture
    /// interval. `state` is only invoked when a capture happens.
    pub fn maybe_capture(
        &mut self,
        history_len: usize,
        state: impl FnOnce() -> Option<Value>,
    ) -> bool {
        if history_len == 0 || history_len % self.interval != 0 {
            return false;
        }
        if self.checkpoints.back().map(|c| c.at_action_index) == Some(history_len) {
            return false;
        }
        let Some(state) = state() else { return false };
        self.checkpoints.push_back(Checkpoint {
            at_action_index: history_len,
            state,
            taken_at: Instant::now(),
        });
        while self.checkpoints.len() > self.window {
            self.checkpoints.pop_front();
        }
        true
    }

    /// Newest checkpoint with `at_action_index <= target`.
    pub fn nearest_at_or_below(&self, target: usize) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .rev()
            .find(|c| c.at_action_index <= target)
    }

    /// Discard every checkpoint past a truncated history of `new_len`
    /// actions. Called on undo and rewind.
    pub fn truncate_to(&mut self, new_len: usize) {
        self.checkpoints.retain(|c| c.at_action_index <= new_len);
    }

    pub fn clear(&mut self) {
        self.checkpoints.clear();
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> CheckpointManager {
        CheckpointManager::new(10, 5)
    }

    #[test]
    fn captures_on_interval_only() {
        let mut m = manager();
        assert!(!m.maybe_capture(0, || Some(json!(0))));
        assert!(!m.maybe_capture(9, || Some(json!(9))));
        assert!(m.maybe_capture(10, || Some(json!(10))));
        assert!(!m.maybe_capture(10, || Some(json!(10))));
        assert!(m.maybe_capture(20, || Some(json!(20))));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn window_drops_oldest() {
        let mut m = manager();
        for k in 1..=8 {
            assert!(m.maybe_capture(k * 10, || Some(json!(k * 10))));
        }
        assert_eq!(m.len(), 5);
        // Oldest surviving checkpoint is at index 40.
        assert!(m.nearest_at_or_below(39).is_none());
        assert_eq!(m.nearest_at_or_below(40).unwrap().at_action_index, 40);
    }

    #[test]
    fn nearest_lookup_picks_newest_at_or_below() {
        let mut m = manager();
        m.maybe_capture(10, || Some(json!(10)));
        m.maybe_capture(20, || Some(json!(20)));
        m.maybe_capture(30, || Some(json!(30)));

        assert_eq!(m.nearest_at_or_below(35).unwrap().at_action_index, 30);
        assert_eq!(m.nearest_at_or_below(29).unwrap().at_action_index, 20);
        assert_eq!(m.nearest_at_or_below(10).unwrap().at_action_index, 10);
        assert!(m.nearest_at_or_below(9).is_none());
    }

    #[test]
    fn truncate_discards_crossed_checkpoints() {
        let mut m = manager();
        m.maybe_capture(10, || Some(json!(10)));
        m.maybe_capture(20, || Some(json!(20)));
        m.maybe_capture(30, || Some(json!(30)));

        m.truncate_to(20);
        assert_eq!(m.len(), 2);
        assert_eq!(m.nearest_at_or_below(100).unwrap().at_action_index, 20);

        m.truncate_to(5);
        assert!(m.is_empty());
    }
}
