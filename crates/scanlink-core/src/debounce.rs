//! # Layer Debouncing
//!
//! A layer only changes state after `threshold` consecutive probe results
//! agree, including the first move out of `Unknown`.
//!
//! ```text
//!   probe:    ok   fail  ok   ok   fail fail fail
//!   streak:   +1   -1    +1   +2   -1   -2   -3
//!   state:    ?    ?     ?    UP   UP   DOWN DOWN     (threshold = 2)
//! ```

use crate::types::LayerState;

/// Debounce state machine for one connectivity layer.
#[derive(Debug, Clone)]
pub struct LayerTracker {
    threshold: u32,
    state: LayerState,
    last_result: Option<bool>,
    streak: u32,
}

impl LayerTracker {
    /// Creates a tracker in `Unknown`. A threshold of 0 is treated as 1.
    pub fn new(threshold: u32) -> Self {
        LayerTracker {
            threshold: threshold.max(1),
            state: LayerState::Unknown,
            last_result: None,
            streak: 0,
        }
    }

    pub fn state(&self) -> LayerState {
        self.state
    }

    /// Feeds one probe result. Returns the new state if it changed.
    pub fn observe(&mut self, reachable: bool) -> Option<LayerState> {
        if self.last_result == Some(reachable) {
            self.streak = self.streak.saturating_add(1);
        } else {
            self.last_result = Some(reachable);
            self.streak = 1;
        }

        let candidate = if reachable {
            LayerState::Up
        } else {
            LayerState::Down
        };

        if self.streak >= self.threshold && self.state != candidate {
            self.state = candidate;
            return Some(candidate);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_unknown_until_threshold() {
        let mut tracker = LayerTracker::new(2);
        assert_eq!(tracker.observe(true), None);
        assert_eq!(tracker.state(), LayerState::Unknown);
        assert_eq!(tracker.observe(true), Some(LayerState::Up));
        assert_eq!(tracker.observe(true), None);
    }

    #[test]
    fn test_flapping_never_transitions() {
        let mut tracker = LayerTracker::new(2);
        tracker.observe(true);
        tracker.observe(true);

        for _ in 0..10 {
            assert_eq!(tracker.observe(false), None);
            assert_eq!(tracker.observe(true), None);
        }
        assert_eq!(tracker.state(), LayerState::Up);
    }

    #[test]
    fn test_consistent_failures_go_down() {
        let mut tracker = LayerTracker::new(3);
        tracker.observe(true);
        tracker.observe(true);
        tracker.observe(true);

        assert_eq!(tracker.observe(false), None);
        assert_eq!(tracker.observe(false), None);
        assert_eq!(tracker.observe(false), Some(LayerState::Down));
    }

    #[test]
    fn test_threshold_one_follows_every_probe() {
        let mut tracker = LayerTracker::new(0);
        assert_eq!(tracker.observe(false), Some(LayerState::Down));
        assert_eq!(tracker.observe(true), Some(LayerState::Up));
    }
}
