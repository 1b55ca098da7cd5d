//! Rollout engine
//!
//! Runs a batch of trials through the policy and baseline networks one trial at a
//! time, sampling actions from the policy output and feeding them to the task.
//! Everything random comes from the caller's generator, in a fixed order: missing
//! trial conditions, policy noise, baseline noise, then per-step draws.

use ndarray::{concatenate, s, Array1, Array2, Axis};
use tracing::trace;

use rnnpg_core::rng::{gaussian_noise, sample_categorical};
use rnnpg_core::{
    Carryover, Network, NetworkState, Performance, Result, Step, Task, TrainRng,
    TrajectoryBuffer, TrialStatus,
};

/// Fixed quantities of every rollout in a session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RolloutSettings {
    /// Simulation time step passed to the task
    pub dt: f64,
    /// Maximum number of steps per trial
    pub horizon: usize,
    /// Variance of the recurrent noise
    pub noise_variance: f64,
    /// Reward assigned when a trial reaches the horizon
    pub r_aborted: f64,
    /// Whether hidden state carries from one trial to the next
    pub continuous: bool,
}

/// Everything a batch of trials produced
#[derive(Debug, Clone)]
pub struct Rollout<P> {
    /// Trajectory tensors
    pub buffer: TrajectoryBuffer,
    /// State to start the next trial from (continuous mode)
    pub carry: Option<Carryover>,
    /// Policy state at step 0 of every trial `[n, N]` (continuous mode)
    pub x0: Option<Array2<f64>>,
    /// Baseline state at step 0 of every trial `[n, N_b]` (continuous mode)
    pub x0_b: Option<Array2<f64>>,
    /// Performance updated with every trial of the batch
    pub performance: P,
}

/// Drives trials through a policy/baseline network pair
pub struct RolloutEngine<'a> {
    policy: &'a dyn Network,
    baseline: &'a dyn Network,
    settings: RolloutSettings,
}

impl<'a> RolloutEngine<'a> {
    /// Bind the engine to both networks
    #[must_use]
    pub fn new(policy: &'a dyn Network, baseline: &'a dyn Network, settings: RolloutSettings) -> Self {
        Self {
            policy,
            baseline,
            settings,
        }
    }

    /// Run `n_trials` trials
    ///
    /// Conditions already in `trials` are reused in order; missing ones are drawn
    /// from the task and appended. `init` starts the first trial from a carried
    /// state instead of the learned initial state. Firing rates are recorded when
    /// `return_states` is set.
    #[allow(clippy::too_many_arguments)]
    pub fn run<T: Task>(
        &self,
        task: &mut T,
        rng: &mut TrainRng,
        trials: &mut Vec<T::Trial>,
        n_trials: usize,
        init: Option<Carryover>,
        return_states: bool,
        performance: Option<T::Performance>,
    ) -> Result<Rollout<T::Performance>> {
        let settings = self.settings;
        let horizon = settings.horizon;
        let n_actions = self.policy.config().n_out;
        let n_policy = self.policy.n_hidden();
        let n_baseline = self.baseline.n_hidden();

        while trials.len() < n_trials {
            let trial = task.get_condition(rng, settings.dt)?;
            trials.push(trial);
        }

        let mut buffer = TrajectoryBuffer::zeros(
            horizon,
            n_trials,
            self.policy.config().n_in,
            n_actions,
            self.policy.noise_dim(),
            self.baseline.noise_dim(),
            return_states.then_some((n_policy, n_baseline)),
        );
        buffer.noise = gaussian_noise(
            rng,
            (horizon, n_trials, self.policy.noise_dim()),
            settings.noise_variance,
        );
        buffer.baseline_noise = gaussian_noise(
            rng,
            (horizon, n_trials, self.baseline.noise_dim()),
            settings.noise_variance,
        );

        let mut x0 = settings
            .continuous
            .then(|| Array2::zeros((n_trials, n_policy)));
        let mut x0_b = settings
            .continuous
            .then(|| Array2::zeros((n_trials, n_baseline)));
        let mut performance = performance.unwrap_or_else(|| task.new_performance());
        let mut carry = init;

        for (n, trial) in trials.iter().take(n_trials).enumerate() {
            task.start_trial();

            // Step 0
            let (start, start_b) = match carry.take() {
                Some(c) => (
                    (c.policy.output, c.policy.state),
                    (c.baseline.output, c.baseline.state),
                ),
                None => (self.policy.step_0(), self.baseline.step_0()),
            };
            let (mut z, mut x) = start;
            let (z_b, mut x_b) = start_b;
            buffer.outputs.slice_mut(s![0, n, ..]).assign(&z);
            buffer.baseline_outputs[[0, n]] = z_b[0];
            if let Some(x0) = x0.as_mut() {
                x0.row_mut(n).assign(&x);
            }
            if let Some(x0_b) = x0_b.as_mut() {
                x0_b.row_mut(n).assign(&x_b);
            }
            self.record_rates(&mut buffer, 0, n, &x, &x_b);

            let mut action = sample_categorical(rng, z.view())?;
            buffer.actions[[0, n, action]] = 1.0;
            let step = task.get_step(rng, settings.dt, trial, 1, action)?;
            let mut status = Self::record_step(&mut buffer, 0, n, step);

            let mut t = 0;
            while t + 1 < horizon && status.continues() {
                t += 1;

                let (z_t, x_t) = self.policy.step_t(
                    buffer.inputs.slice(s![t - 1, n, ..]),
                    buffer.noise.slice(s![t - 1, n, ..]),
                    x.view(),
                );
                z = z_t;
                x = x_t;
                buffer.outputs.slice_mut(s![t, n, ..]).assign(&z);

                let input_b = self.baseline_input(&x, &buffer, t - 1, n)?;
                let (z_b_t, x_b_t) = self.baseline.step_t(
                    input_b.view(),
                    buffer.baseline_noise.slice(s![t - 1, n, ..]),
                    x_b.view(),
                );
                x_b = x_b_t;
                buffer.baseline_outputs[[t, n]] = z_b_t[0];
                self.record_rates(&mut buffer, t, n, &x, &x_b);

                action = sample_categorical(rng, z.view())?;
                buffer.actions[[t, n, action]] = 1.0;
                let step = if t + 1 < horizon {
                    task.get_step(rng, settings.dt, trial, t + 1, action)?
                } else {
                    Step {
                        observation: Array1::zeros(buffer.inputs.shape()[2]),
                        reward: settings.r_aborted,
                        status: T::Status::horizon_exhausted(),
                    }
                };
                status = Self::record_step(&mut buffer, t, n, step);
            }
            trace!("Trial {} ended after {} steps with {:?}", n, t + 1, status);

            performance.update(trial, &status);

            if settings.continuous {
                let (z_next, x_next) = self.policy.step_t(
                    buffer.inputs.slice(s![t, n, ..]),
                    buffer.noise.slice(s![t, n, ..]),
                    x.view(),
                );
                let input_b = self.baseline_input(&x_next, &buffer, t, n)?;
                let (z_b_next, x_b_next) = self.baseline.step_t(
                    input_b.view(),
                    buffer.baseline_noise.slice(s![t, n, ..]),
                    x_b.view(),
                );
                carry = Some(Carryover {
                    policy: NetworkState {
                        output: z_next,
                        state: x_next,
                    },
                    baseline: NetworkState {
                        output: z_b_next,
                        state: x_b_next,
                    },
                });
            }
        }

        Ok(Rollout {
            buffer,
            carry,
            x0,
            x0_b,
            performance,
        })
    }

    /// Baseline input `[r_policy(x), a]` where `a` is the action taken at step `t`
    fn baseline_input(
        &self,
        x: &Array1<f64>,
        buffer: &TrajectoryBuffer,
        t: usize,
        n: usize,
    ) -> Result<Array1<f64>> {
        let rates = self.policy.firing_rate(x.view());
        Ok(concatenate(
            Axis(0),
            &[rates.view(), buffer.actions.slice(s![t, n, ..])],
        )?)
    }

    fn record_rates(
        &self,
        buffer: &mut TrajectoryBuffer,
        t: usize,
        n: usize,
        x: &Array1<f64>,
        x_b: &Array1<f64>,
    ) {
        if let Some(rates) = buffer.policy_rates.as_mut() {
            rates
                .slice_mut(s![t, n, ..])
                .assign(&self.policy.firing_rate(x.view()));
        }
        if let Some(rates) = buffer.baseline_rates.as_mut() {
            rates
                .slice_mut(s![t, n, ..])
                .assign(&self.baseline.firing_rate(x_b.view()));
        }
    }

    fn record_step<S>(buffer: &mut TrajectoryBuffer, t: usize, n: usize, step: Step<S>) -> S {
        buffer.inputs.slice_mut(s![t, n, ..]).assign(&step.observation);
        buffer.rewards[[t, n]] = step.reward;
        buffer.mask[[t, n]] = 1.0;
        step.status
    }
}
