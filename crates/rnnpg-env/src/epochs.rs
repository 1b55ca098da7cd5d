//! Trial epochs on a discrete time grid

use serde::{Deserialize, Serialize};

/// Half-open time window `[start, end)` in the task's time unit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Epoch {
    /// Start time
    pub start: f64,
    /// End time (exclusive)
    pub end: f64,
}

impl Epoch {
    /// Window `[start, end)`
    #[must_use]
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Window of length `duration` starting where `self` ends
    #[must_use]
    pub fn then(&self, duration: f64) -> Self {
        Self::new(self.end, self.end + duration)
    }

    /// Whether time index `t` on a grid of step `dt` falls in the window
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn contains(&self, t: usize, dt: f64) -> bool {
        let time = t as f64 * dt;
        self.start <= time && time < self.end
    }

    /// Length of the window
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_is_half_open() {
        let fixation = Epoch::new(0.0, 30.0);
        let stimulus = fixation.then(20.0);

        assert!(fixation.contains(0, 10.0));
        assert!(fixation.contains(2, 10.0));
        assert!(!fixation.contains(3, 10.0));
        assert!(stimulus.contains(3, 10.0));
        assert!(!stimulus.contains(5, 10.0));
        approx::assert_relative_eq!(stimulus.duration(), 20.0);
    }
}
