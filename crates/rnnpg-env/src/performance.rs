//! Two-alternative forced-choice bookkeeping

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use rnnpg_core::{Performance, TrialStatus};

/// One of the two choices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// Left target
    Left,
    /// Right target
    Right,
}

impl Side {
    /// `-1` for left, `+1` for right
    #[must_use]
    pub fn sign(self) -> f64 {
        match self {
            Side::Left => -1.0,
            Side::Right => 1.0,
        }
    }
}

/// Status of a two-alternative trial
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TwoAfcStatus {
    /// Whether the trial goes on
    pub running: bool,
    /// Choice made, if any
    pub choice: Option<Side>,
    /// Whether the choice was correct
    pub correct: bool,
    /// Time index of the choice
    pub t_choice: Option<usize>,
}

impl TwoAfcStatus {
    /// Trial still running
    #[must_use]
    pub fn running() -> Self {
        Self {
            running: true,
            choice: None,
            correct: false,
            t_choice: None,
        }
    }

    /// Trial ended without a choice
    #[must_use]
    pub fn aborted() -> Self {
        Self {
            running: false,
            ..Self::running()
        }
    }

    /// Trial ended with a choice at time index `t`
    #[must_use]
    pub fn decided(choice: Side, target: Side, t: usize) -> Self {
        Self {
            running: false,
            choice: Some(choice),
            correct: choice == target,
            t_choice: Some(t),
        }
    }
}

impl TrialStatus for TwoAfcStatus {
    fn continues(&self) -> bool {
        self.running
    }

    fn horizon_exhausted() -> Self {
        Self::aborted()
    }
}

/// Counts of trials, decisions and correct decisions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwoAfcPerformance {
    /// Trials seen
    pub n_trials: usize,
    /// Trials that ended with a choice
    pub n_decision: usize,
    /// Correct choices
    pub n_correct: usize,
}

impl TwoAfcPerformance {
    /// Fraction of trials with a choice
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn p_decision(&self) -> f64 {
        if self.n_trials == 0 {
            0.0
        } else {
            self.n_decision as f64 / self.n_trials as f64
        }
    }

    /// Fraction of choices that were correct
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn p_correct(&self) -> f64 {
        if self.n_decision == 0 {
            0.0
        } else {
            self.n_correct as f64 / self.n_decision as f64
        }
    }
}

impl<Trial> Performance<Trial, TwoAfcStatus> for TwoAfcPerformance {
    fn update(&mut self, _trial: &Trial, status: &TwoAfcStatus) {
        self.n_trials += 1;
        if status.choice.is_some() {
            self.n_decision += 1;
            if status.correct {
                self.n_correct += 1;
            }
        }
    }

    fn summary(&self) -> IndexMap<String, String> {
        let mut items = IndexMap::new();
        items.insert(
            "P(choice)".to_string(),
            format!("{}/{} = {:.3}", self.n_decision, self.n_trials, self.p_decision()),
        );
        items.insert(
            "P(correct)".to_string(),
            format!("{}/{} = {:.3}", self.n_correct, self.n_decision, self.p_correct()),
        );
        items
    }
}

/// Accuracy a task must reach before training stops on its own
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TerminationRule {
    /// Minimum number of trials in the evaluated batch
    pub min_trials: usize,
    /// Minimum fraction of trials with a choice
    pub min_p_decision: f64,
    /// Minimum fraction of correct choices
    pub min_p_correct: f64,
}

impl TerminationRule {
    /// Whether `perf` satisfies the rule; no performance never does
    #[must_use]
    pub fn satisfied(&self, perf: Option<&TwoAfcPerformance>) -> bool {
        perf.is_some_and(|p| {
            p.n_trials >= self.min_trials
                && p.p_decision() >= self.min_p_decision
                && p.p_correct() >= self.min_p_correct
        })
    }
}
