//! Persisted training state
//!
//! The controller writes a [`Checkpoint`] at every checkpoint tick. It holds
//! enough to rebuild both networks, both optimizers and the random stream, so a
//! resumed run continues exactly where the saved one stopped.

use chrono::{DateTime, Utc};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::config::{Config, LoadMode};
use crate::network::{NetworkConfig, Params};
use crate::rng::TrainRng;

/// Adam accumulator state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdamState {
    /// Number of updates applied
    pub step: u64,
    /// First moment estimates per parameter
    pub first_moment: Params,
    /// Second moment estimates per parameter
    pub second_moment: Params,
}

/// Output and state of a network carried into the next trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkState {
    /// Network output at the carried state
    pub output: Array1<f64>,
    /// Hidden state
    pub state: Array1<f64>,
}

/// Carryover of both networks in continuous mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Carryover {
    /// Policy network
    pub policy: NetworkState,
    /// Baseline network
    pub baseline: NetworkState,
}

/// One validation report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord<P> {
    /// Iteration of the checkpoint tick
    pub iter: usize,
    /// Validation reward per trial
    pub mean_reward: f64,
    /// Training trials consumed so far
    pub n_trials: usize,
    /// Validation performance
    pub perf: P,
    /// Whether this record improved the best reward
    pub new_best: bool,
    /// Wall-clock time of the report
    pub timestamp: DateTime<Utc>,
}

/// Full training state at a checkpoint tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint<P> {
    /// Iteration at which the checkpoint was taken
    pub iter: usize,
    /// Training configuration
    pub config: Config,
    /// Policy network configuration
    pub policy_config: NetworkConfig,
    /// Baseline network configuration
    pub baseline_config: NetworkConfig,
    /// Policy parameters at this tick
    pub current_policy_params: Params,
    /// Baseline parameters at this tick
    pub current_baseline_params: Params,
    /// Iteration of the best validation reward
    pub best_iter: Option<usize>,
    /// Best validation reward
    pub best_reward: f64,
    /// Validation performance at the best iteration
    pub best_perf: Option<P>,
    /// Policy parameters at the best iteration
    pub best_policy_params: Params,
    /// Baseline parameters at the best iteration
    pub best_baseline_params: Params,
    /// Random stream, captured before validation
    pub rng_state: TrainRng,
    /// Continuous-mode carryover
    pub carry: Option<Carryover>,
    /// Live training performance
    pub perf: Option<P>,
    /// Validation reports
    pub training_history: Vec<HistoryRecord<P>>,
    /// Training trials consumed so far
    pub trials_tot: usize,
    /// Policy optimizer accumulators
    pub policy_optimizer: AdamState,
    /// Baseline optimizer accumulators
    pub baseline_optimizer: AdamState,
}

impl<P> Checkpoint<P> {
    /// Parameter pair selected by `mode`
    #[must_use]
    pub fn params(&self, mode: LoadMode) -> (&Params, &Params) {
        match mode {
            LoadMode::Best => (&self.best_policy_params, &self.best_baseline_params),
            LoadMode::Current => (&self.current_policy_params, &self.current_baseline_params),
        }
    }
}
