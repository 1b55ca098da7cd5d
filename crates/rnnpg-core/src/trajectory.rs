//! Trajectory storage for one batch of trials
//!
//! All tensors are dense, zero-initialised and indexed `[time, trial, feature...]`.
//! Steps after a trial ends keep their zeros; every reduction is gated on `mask`.

use ndarray::{s, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};

use crate::{PgError, Result};

/// Tensors produced by one rollout batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryBuffer {
    /// Observations `[T, n, Nin]`; entry `t` is the input to step `t + 1`
    pub inputs: Array3<f64>,
    /// Policy noise `[T, n, noise_dim]`
    pub noise: Array3<f64>,
    /// Baseline noise `[T, n, noise_dim_b]`
    pub baseline_noise: Array3<f64>,
    /// Policy outputs `[T, n, n_actions]`
    pub outputs: Array3<f64>,
    /// Baseline predictions `[T, n]`
    pub baseline_outputs: Array2<f64>,
    /// One-hot actions `[T, n, n_actions]`
    pub actions: Array3<f64>,
    /// Rewards `[T, n]`
    pub rewards: Array2<f64>,
    /// Validity mask `[T, n]`
    pub mask: Array2<f64>,
    /// Policy firing rates `[T, n, N]`, when requested
    pub policy_rates: Option<Array3<f64>>,
    /// Baseline firing rates `[T, n, N_b]`, when requested
    pub baseline_rates: Option<Array3<f64>>,
}

impl TrajectoryBuffer {
    /// Allocate a zeroed buffer
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn zeros(
        horizon: usize,
        n_trials: usize,
        n_inputs: usize,
        n_actions: usize,
        noise_dim: usize,
        baseline_noise_dim: usize,
        rates: Option<(usize, usize)>,
    ) -> Self {
        Self {
            inputs: Array3::zeros((horizon, n_trials, n_inputs)),
            noise: Array3::zeros((horizon, n_trials, noise_dim)),
            baseline_noise: Array3::zeros((horizon, n_trials, baseline_noise_dim)),
            outputs: Array3::zeros((horizon, n_trials, n_actions)),
            baseline_outputs: Array2::zeros((horizon, n_trials)),
            actions: Array3::zeros((horizon, n_trials, n_actions)),
            rewards: Array2::zeros((horizon, n_trials)),
            mask: Array2::zeros((horizon, n_trials)),
            policy_rates: rates.map(|(n, _)| Array3::zeros((horizon, n_trials, n))),
            baseline_rates: rates.map(|(_, n)| Array3::zeros((horizon, n_trials, n))),
        }
    }

    /// Number of time steps
    #[must_use]
    pub fn horizon(&self) -> usize {
        self.mask.nrows()
    }

    /// Number of trials
    #[must_use]
    pub fn n_trials(&self) -> usize {
        self.mask.ncols()
    }

    /// Valid steps per trial
    #[must_use]
    pub fn valid_steps(&self) -> Vec<usize> {
        self.mask
            .axis_iter(Axis(1))
            .map(|column| column.iter().filter(|&&m| m > 0.0).count())
            .collect()
    }

    /// Check that every trial's mask is a run of ones followed by zeros
    pub fn check_mask(&self) -> Result<()> {
        for (n, column) in self.mask.axis_iter(Axis(1)).enumerate() {
            let mut ended = false;
            for (t, &m) in column.iter().enumerate() {
                if m == 0.0 {
                    ended = true;
                } else if ended || m != 1.0 {
                    return Err(PgError::InvalidConfig(format!(
                        "mask of trial {n} is not a prefix of ones at step {t}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Masked reward-to-go, `out[k] = sum_{j >= k} R[j] M[j]`
    #[must_use]
    pub fn reward_to_go(&self) -> Array2<f64> {
        let masked = &self.rewards * &self.mask;
        let mut out = Array2::zeros(masked.raw_dim());
        let mut running = ndarray::Array1::<f64>::zeros(self.n_trials());
        for t in (0..self.horizon()).rev() {
            running += &masked.row(t);
            out.row_mut(t).assign(&running);
        }
        out
    }

    /// Total masked reward divided by the number of trials
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean_reward(&self) -> f64 {
        let n = self.n_trials();
        if n == 0 {
            return 0.0;
        }
        (&self.rewards * &self.mask).sum() / n as f64
    }

    /// Root-mean-square error of `values` against the masked reward-to-go
    #[must_use]
    pub fn prediction_error(&self, values: &Array2<f64>) -> f64 {
        let total = self.mask.sum();
        if total == 0.0 {
            return 0.0;
        }
        let diff = &self.baseline_outputs - values;
        ((&diff * &diff * &self.mask).sum() / total).sqrt()
    }

    /// Baseline inputs for the recurrent steps, `[r_policy[t + 1], A[t]]` for `t < T - 1`
    pub fn baseline_inputs(&self) -> Result<Array3<f64>> {
        let rates = self.policy_rates.as_ref().ok_or_else(|| {
            PgError::InvalidConfig("baseline inputs require recorded policy firing rates".to_string())
        })?;
        let steps = self.horizon().saturating_sub(1);
        let rates = rates.slice(s![1..steps + 1, .., ..]);
        let actions = self.actions.slice(s![..steps, .., ..]);
        Ok(ndarray::concatenate(Axis(2), &[rates, actions])?)
    }
}
