//! Task and performance traits
//!
//! A task generates trial conditions and answers each action with the next
//! observation, a reward and a status. Trials are opaque to the trainer.

use std::fmt::Debug;

use indexmap::IndexMap;
use ndarray::Array1;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::rng::TrainRng;
use crate::Result;

/// Status reported by a task after each step
pub trait TrialStatus: Clone + Debug + Send + Sync {
    /// Whether the trial goes on
    fn continues(&self) -> bool;

    /// Status forced when a trial reaches the last time step
    #[must_use]
    fn horizon_exhausted() -> Self;
}

/// Outcome of one task step
#[derive(Debug, Clone)]
pub struct Step<S> {
    /// Observation for the next network step
    pub observation: Array1<f64>,
    /// Reward for the action just taken
    pub reward: f64,
    /// Trial status after the action
    pub status: S,
}

/// Running aggregate of trial outcomes
pub trait Performance<Trial, Status>: Clone + Debug + Send + Sync + Serialize + DeserializeOwned {
    /// Fold a finished trial into the aggregate
    fn update(&mut self, trial: &Trial, status: &Status);

    /// Ordered key/value summary for reports
    fn summary(&self) -> IndexMap<String, String>;
}

/// An episodic decision task
pub trait Task: Send {
    /// Conditions of one trial
    type Trial: Clone + Debug + Send + Sync;
    /// Status returned with each step
    type Status: TrialStatus;
    /// Performance aggregate for this task
    type Performance: Performance<Self::Trial, Self::Status>;

    /// Observation channel names
    fn inputs(&self) -> Vec<String>;

    /// Action names
    fn actions(&self) -> Vec<String>;

    /// Draw a new trial condition
    fn get_condition(&mut self, rng: &mut TrainRng, dt: f64) -> Result<Self::Trial>;

    /// React to `action` taken at time index `t`
    fn get_step(
        &mut self,
        rng: &mut TrainRng,
        dt: f64,
        trial: &Self::Trial,
        t: usize,
        action: usize,
    ) -> Result<Step<Self::Status>>;

    /// Fresh performance aggregate
    fn new_performance(&self) -> Self::Performance;

    /// Hook run before each trial
    fn start_trial(&mut self) {}

    /// Hook run once before training starts
    fn start_session(&mut self, _rng: &mut TrainRng) {}

    /// Task-specific stopping rule evaluated on the best performance so far
    fn terminate(&self, _best: Option<&Self::Performance>) -> bool {
        false
    }
}
