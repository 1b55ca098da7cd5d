//! Training controller
//!
//! [`PolicyGradient`] owns a task, both networks and the random stream. `train`
//! alternates batches of training trials with baseline and policy updates, and
//! every `checkfreq` iterations validates, tracks the best parameters and persists
//! a [`Checkpoint`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use indexmap::IndexMap;
use ndarray::{s, Array2};
use tracing::{debug, info, warn};

use rnnpg_core::rng::seeded;
use rnnpg_core::{
    AdamState, Carryover, Checkpoint, Config, HistoryRecord, LoadMode, Network, NetworkConfig,
    OutputActivation, Params, Performance, PgError, Result, Task, TrainRng, TrajectoryBuffer,
};

use crate::networks;
use crate::objective::{BaselineBatch, BaselineUpdate, PolicyBatch, PolicyUpdate};
use crate::rollout::{Rollout, RolloutEngine, RolloutSettings};
use crate::store::CheckpointStore;
use crate::utils::{elapsed_since, GradNormLog};

/// Iterations between progress reports when validation is disabled
pub const PROGRESS_EVERY: usize = 100;

/// Cooperative stop signal, polled at the top of every iteration
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Create an untriggered token
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why training stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingOutcome {
    /// Best validation reward reached the target
    TargetReached {
        /// Iteration of the validation that reached it
        iter: usize,
    },
    /// The task's termination predicate accepted the best performance
    TerminationCriterion {
        /// Iteration of the validation that satisfied it
        iter: usize,
    },
    /// All iterations ran
    MaxIterReached,
    /// The cancellation token was triggered
    Interrupted {
        /// Iteration that was about to start
        iter: usize,
    },
}

/// Result of a call to [`PolicyGradient::train`]
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    /// Why training stopped
    pub outcome: TrainingOutcome,
    /// Training iterations completed by this call
    pub iterations: usize,
    /// Finite policy gradient norms, in order
    pub policy_grad_norms: Vec<f64>,
    /// Finite baseline gradient norms, in order
    pub baseline_grad_norms: Vec<f64>,
    /// Trajectories of the last training batch
    pub last_batch: Option<TrajectoryBuffer>,
}

/// Policy network configuration derived from a training configuration
#[must_use]
pub fn policy_network_config(config: &Config, dt: f64) -> NetworkConfig {
    NetworkConfig {
        network_type: config.network_type,
        n_in: config.n_inputs(),
        n_hidden: config.n_hidden,
        n_out: config.n_actions(),
        f_out: OutputActivation::Softmax,
        fix: config.fix.clone(),
        l2_r: config.l2_r,
        l1_wrec: config.l1_wrec,
        l2_wrec: config.l2_wrec,
        lambda_omega: config.lambda_omega,
        alpha: config.alpha(dt),
        p0: config.p0,
        rho: config.rho,
        win: config.win,
        win_mask: config.win_mask.clone(),
        seed: config.policy_seed,
    }
}

/// Baseline network configuration; its inputs are the policy firing rates and the last action
#[must_use]
pub fn baseline_network_config(config: &Config, dt: f64) -> NetworkConfig {
    NetworkConfig {
        network_type: config.network_type,
        n_in: config.n_hidden + config.n_actions(),
        n_hidden: config.n_hidden,
        n_out: 1,
        f_out: OutputActivation::Linear,
        fix: config.baseline_fix.clone(),
        l2_r: config.baseline_l2_r,
        l1_wrec: config.l1_wrec,
        l2_wrec: config.l2_wrec,
        lambda_omega: config.lambda_omega,
        alpha: config.alpha(dt),
        p0: config.p0,
        rho: config.baseline_rho,
        win: config.baseline_win,
        win_mask: config.baseline_win_mask.clone(),
        seed: config.baseline_seed,
    }
}

/// Mutable bookkeeping of one `train` call
struct TrainingState<P> {
    iter_start: usize,
    best_iter: Option<usize>,
    best_reward: f64,
    best_perf: Option<P>,
    best_policy_params: Params,
    best_baseline_params: Params,
    carry: Option<Carryover>,
    perf: Option<P>,
    history: Vec<HistoryRecord<P>>,
    trials_tot: usize,
    policy_update: PolicyUpdate,
    baseline_update: BaselineUpdate,
    policy_norms: GradNormLog,
    baseline_norms: GradNormLog,
}

/// Recurrent policy-gradient training session for one task
pub struct PolicyGradient<T: Task> {
    task: T,
    config: Config,
    dt: f64,
    horizon: usize,
    rng: TrainRng,
    policy: Box<dyn Network>,
    baseline: Box<dyn Network>,
    loaded: Option<Checkpoint<T::Performance>>,
}

impl<T: Task> PolicyGradient<T> {
    /// Create a new model from a configuration
    ///
    /// `dt` overrides the configured step size for the leak and the noise scale.
    pub fn new(task: T, config: Config, seed: u64, dt: Option<f64>) -> Result<Self> {
        config.validate()?;
        let dt = dt.unwrap_or(config.dt);
        let policy = networks::build(policy_network_config(&config, dt), None)?;
        let baseline = networks::build(baseline_network_config(&config, dt), None)?;
        Self::assemble(task, config, seed, dt, policy, baseline, None)
    }

    /// Rebuild a model from a checkpoint, with the `best` or `current` parameters
    pub fn from_checkpoint(
        task: T,
        checkpoint: Checkpoint<T::Performance>,
        seed: u64,
        dt: Option<f64>,
        load: LoadMode,
    ) -> Result<Self> {
        let config = checkpoint.config.clone();
        let dt = dt.unwrap_or(config.dt);
        let alpha = config.alpha(dt);
        let (policy_params, baseline_params) = checkpoint.params(load);

        let mut policy_config = checkpoint.policy_config.clone();
        policy_config.alpha = alpha;
        let policy = networks::build(policy_config, Some(policy_params))?;
        let mut baseline_config = checkpoint.baseline_config.clone();
        baseline_config.alpha = alpha;
        let baseline = networks::build(baseline_config, Some(baseline_params))?;

        info!(
            "Loaded {} parameters, last saved after {} iterations",
            load, checkpoint.iter
        );
        Self::assemble(task, config, seed, dt, policy, baseline, Some(checkpoint))
    }

    fn assemble(
        task: T,
        config: Config,
        seed: u64,
        dt: f64,
        policy: Box<dyn Network>,
        baseline: Box<dyn Network>,
        loaded: Option<Checkpoint<T::Performance>>,
    ) -> Result<Self> {
        if dt <= 0.0 {
            return Err(PgError::InvalidConfig(format!("dt must be positive, got {dt}")));
        }
        if task.inputs().len() != config.n_inputs() {
            return Err(PgError::DimensionMismatch {
                expected: config.n_inputs(),
                actual: task.inputs().len(),
            });
        }
        if task.actions().len() != config.n_actions() {
            return Err(PgError::DimensionMismatch {
                expected: config.n_actions(),
                actual: task.actions().len(),
            });
        }

        debug!("dt = {}, RNG seed {}", dt, seed);
        let horizon = config.horizon();
        Ok(Self {
            task,
            config,
            dt,
            horizon,
            rng: seeded(seed),
            policy,
            baseline,
            loaded,
        })
    }

    /// Training configuration
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Simulation step size
    #[must_use]
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Maximum number of steps per trial
    #[must_use]
    pub fn horizon(&self) -> usize {
        self.horizon
    }

    /// Policy network
    #[must_use]
    pub fn policy(&self) -> &dyn Network {
        self.policy.as_ref()
    }

    /// Baseline network
    #[must_use]
    pub fn baseline(&self) -> &dyn Network {
        self.baseline.as_ref()
    }

    /// The task being trained on
    #[must_use]
    pub fn task(&self) -> &T {
        &self.task
    }

    /// Checkpoint the model was loaded from, if any
    #[must_use]
    pub fn checkpoint(&self) -> Option<&Checkpoint<T::Performance>> {
        self.loaded.as_ref()
    }

    /// Model summary of a loaded checkpoint: last saved iteration, best reward and
    /// best performance
    #[must_use]
    pub fn summary(&self) -> Option<IndexMap<String, String>> {
        let checkpoint = self.loaded.as_ref()?;
        let mut items = IndexMap::new();
        items.insert("Last saved after".to_string(), format!("{} iterations", checkpoint.iter));
        items.insert(
            "Best reward".to_string(),
            format!(
                "{} (after {} iterations)",
                checkpoint.best_reward,
                describe_iter(checkpoint.best_iter)
            ),
        );
        if let Some(best) = &checkpoint.best_perf {
            items.extend(best.summary());
        }
        Some(items)
    }

    fn rollout_settings(&self) -> RolloutSettings {
        RolloutSettings {
            dt: self.dt,
            horizon: self.horizon,
            noise_variance: self.config.scaled_var_rec(self.dt),
            r_aborted: self.config.r_aborted,
            continuous: self.config.is_continuous(),
        }
    }

    /// Run a batch of trials with the current networks
    ///
    /// Conditions missing from `trials` are drawn from the task and appended.
    pub fn run_trials(
        &mut self,
        trials: &mut Vec<T::Trial>,
        n_trials: usize,
        init: Option<Carryover>,
        return_states: bool,
        performance: Option<T::Performance>,
    ) -> Result<Rollout<T::Performance>> {
        let settings = self.rollout_settings();
        let engine = RolloutEngine::new(self.policy.as_ref(), self.baseline.as_ref(), settings);
        engine.run(
            &mut self.task,
            &mut self.rng,
            trials,
            n_trials,
            init,
            return_states,
            performance,
        )
    }

    fn draw_trials(&mut self, n: usize) -> Result<Vec<T::Trial>> {
        let mut trials = Vec::with_capacity(n);
        for _ in 0..n {
            trials.push(self.task.get_condition(&mut self.rng, self.dt)?);
        }
        Ok(trials)
    }

    fn log_settings(&self) {
        let config = &self.config;
        if config.is_continuous() {
            info!("Continuous mode");
        }
        info!("Network type: {}", config.network_type);
        info!("N: {}", config.n_hidden);
        info!("var_rec: {}", config.var_rec);
        info!("dt: {}", self.dt);
        info!("Learning rate (policy): {}", config.lr);
        info!("Learning rate (value): {}", config.baseline_lr);
        info!("Max time steps: {}", self.horizon);
        info!("Num. trials (gradient): {}", config.n_gradient);
        info!("Num. trials (validation): {}", config.n_validation);
    }

    fn fresh_state(&self) -> Result<TrainingState<T::Performance>> {
        let use_x0 = self.config.is_continuous();
        Ok(TrainingState {
            iter_start: 0,
            best_iter: None,
            best_reward: f64::NEG_INFINITY,
            best_perf: None,
            best_policy_params: self.policy.get_values(),
            best_baseline_params: self.baseline.get_values(),
            carry: None,
            perf: None,
            history: Vec::new(),
            trials_tot: 0,
            policy_update: self.policy_update(use_x0, None)?,
            baseline_update: self.baseline_update(use_x0, None)?,
            policy_norms: GradNormLog::new(),
            baseline_norms: GradNormLog::new(),
        })
    }

    fn resumed_state(
        &mut self,
        checkpoint: Checkpoint<T::Performance>,
    ) -> Result<TrainingState<T::Performance>> {
        info!("Resume training.");
        info!("Last saved was after {} iterations.", checkpoint.iter);
        self.policy.set_values(&checkpoint.current_policy_params)?;
        self.baseline.set_values(&checkpoint.current_baseline_params)?;
        debug!("Resetting RNG state");
        self.rng = checkpoint.rng_state;

        let use_x0 = self.config.is_continuous();
        Ok(TrainingState {
            iter_start: checkpoint.iter,
            best_iter: checkpoint.best_iter,
            best_reward: checkpoint.best_reward,
            best_perf: checkpoint.best_perf,
            best_policy_params: checkpoint.best_policy_params,
            best_baseline_params: checkpoint.best_baseline_params,
            carry: checkpoint.carry,
            perf: checkpoint.perf,
            history: checkpoint.training_history,
            trials_tot: checkpoint.trials_tot,
            policy_update: self.policy_update(use_x0, Some(checkpoint.policy_optimizer))?,
            baseline_update: self.baseline_update(use_x0, Some(checkpoint.baseline_optimizer))?,
            policy_norms: GradNormLog::new(),
            baseline_norms: GradNormLog::new(),
        })
    }

    fn policy_update(&self, use_x0: bool, accumulators: Option<AdamState>) -> Result<PolicyUpdate> {
        Ok(
            PolicyUpdate::build(self.policy.as_ref(), self.horizon, use_x0, accumulators)?
                .with_grad_clip(self.config.grad_clip)
                .with_entropy_coef(self.config.entropy_coef),
        )
    }

    fn baseline_update(
        &self,
        use_x0: bool,
        accumulators: Option<AdamState>,
    ) -> Result<BaselineUpdate> {
        Ok(BaselineUpdate::build(self.baseline.as_ref(), use_x0, accumulators)?
            .with_grad_clip(self.config.grad_clip))
    }

    fn snapshot(
        &self,
        iter: usize,
        state: &TrainingState<T::Performance>,
        rng_state: TrainRng,
    ) -> Checkpoint<T::Performance> {
        Checkpoint {
            iter,
            config: self.config.clone(),
            policy_config: self.policy.config().clone(),
            baseline_config: self.baseline.config().clone(),
            current_policy_params: self.policy.get_values(),
            current_baseline_params: self.baseline.get_values(),
            best_iter: state.best_iter,
            best_reward: state.best_reward,
            best_perf: state.best_perf.clone(),
            best_policy_params: state.best_policy_params.clone(),
            best_baseline_params: state.best_baseline_params.clone(),
            rng_state,
            carry: state.carry.clone(),
            perf: state.perf.clone(),
            training_history: state.history.clone(),
            trials_tot: state.trials_tot,
            policy_optimizer: state.policy_update.accumulators().clone(),
            baseline_optimizer: state.baseline_update.accumulators().clone(),
        }
    }

    /// Train until the target reward, the task's termination rule, `max_iter` or
    /// cancellation
    ///
    /// With `recover` the last checkpoint in `store` is restored first, including
    /// the current parameters, optimizer state and random stream.
    pub async fn train(
        &mut self,
        store: &dyn CheckpointStore<T::Performance>,
        recover: bool,
        cancel: &CancellationToken,
    ) -> Result<TrainingSummary> {
        let max_iter = self.config.max_iter;
        let checkfreq = self.config.checkfreq;
        let n_gradient = self.config.n_gradient;
        let n_validation = self.config.n_validation;
        self.log_settings();

        let mut state = if recover {
            let checkpoint = store.load().await?.ok_or_else(|| {
                PgError::Checkpoint("no checkpoint to resume training from".to_string())
            })?;
            self.resumed_state(checkpoint)?
        } else {
            self.fresh_state()?
        };

        self.task.start_session(&mut self.rng);

        let started = Utc::now();
        let mut summary = TrainingSummary {
            outcome: TrainingOutcome::MaxIterReached,
            iterations: 0,
            policy_grad_norms: Vec::new(),
            baseline_grad_norms: Vec::new(),
            last_batch: None,
        };

        for iter in state.iter_start..max_iter {
            if cancel.is_cancelled() {
                warn!("Training interrupted by user during iteration {}", iter);
                summary.outcome = TrainingOutcome::Interrupted { iter };
                return Ok(summary);
            }

            if iter % checkfreq == 0 {
                if n_validation > 0 {
                    info!("After {} iterations ({})", iter, elapsed_since(started));
                    if let Some(outcome) = self.validate(iter, &mut state, store).await? {
                        summary.outcome = outcome;
                        return Ok(summary);
                    }
                } else {
                    let checkpoint = self.snapshot(iter, &state, self.rng.clone());
                    store.save(&checkpoint).await?;
                    if iter % PROGRESS_EVERY == 1 {
                        info!("After {} iterations ({})", iter, elapsed_since(started));
                        if let Some(perf) = &state.perf {
                            log_items(&perf.summary());
                        }
                    }
                }
            }

            let mut trials = self.draw_trials(n_gradient)?;
            let carry = state.carry.take();
            let perf = state.perf.take();
            let rollout = self.run_trials(&mut trials, n_gradient, carry, true, perf)?;
            state.carry = rollout.carry;
            state.perf = Some(rollout.performance);
            let buffer = rollout.buffer;

            // Baseline first; the policy sees its values from before the update
            let returns = buffer.reward_to_go();
            let baseline_inputs = buffer.baseline_inputs()?;
            let (values, norm_b) = state.baseline_update.apply(
                self.baseline.as_mut(),
                BaselineBatch {
                    x0: rollout.x0_b.as_ref().map(Array2::view),
                    inputs: baseline_inputs.view(),
                    noise: buffer.baseline_noise.view(),
                    returns: returns.view(),
                    mask: buffer.mask.view(),
                },
                self.config.baseline_lr,
            )?;
            state.baseline_norms.push(norm_b);
            if norm_b.is_finite() {
                summary.baseline_grad_norms.push(norm_b);
            }

            let steps = self.horizon - 1;
            let norm = state.policy_update.apply(
                self.policy.as_mut(),
                PolicyBatch {
                    x0: rollout.x0.as_ref().map(Array2::view),
                    inputs: buffer.inputs.slice(s![..steps, .., ..]),
                    noise: buffer.noise.view(),
                    actions: buffer.actions.view(),
                    rewards: buffer.rewards.view(),
                    baseline: values.view(),
                    mask: buffer.mask.view(),
                },
                self.config.lr,
            )?;
            state.policy_norms.push(norm);
            if norm.is_finite() {
                summary.policy_grad_norms.push(norm);
            }

            state.trials_tot += n_gradient;
            summary.iterations += 1;
            summary.last_batch = Some(buffer);
        }

        info!("Reached maximum number of iterations ({}).", max_iter);
        Ok(summary)
    }

    /// Validation at a checkpoint tick; returns an outcome when training should stop
    async fn validate(
        &mut self,
        iter: usize,
        state: &mut TrainingState<T::Performance>,
        store: &dyn CheckpointStore<T::Performance>,
    ) -> Result<Option<TrainingOutcome>> {
        let n_validation = self.config.n_validation;
        let rng_state = self.rng.clone();

        let mut trials = self.draw_trials(n_validation)?;
        let rollout = self.run_trials(&mut trials, n_validation, None, false, None)?;
        let buffer = &rollout.buffer;
        let perf = rollout.performance;

        let mean_reward = buffer.mean_reward();
        let new_best = mean_reward > state.best_reward;
        if new_best {
            state.best_iter = Some(iter);
            state.best_reward = mean_reward;
            state.best_perf = Some(perf.clone());
            state.best_policy_params = self.policy.get_values();
            state.best_baseline_params = self.baseline.get_values();
        }
        state.history.push(HistoryRecord {
            iter,
            mean_reward,
            n_trials: state.trials_tot,
            perf: perf.clone(),
            new_best,
            timestamp: Utc::now(),
        });

        let checkpoint = self.snapshot(iter, state, rng_state);
        store.save(&checkpoint).await?;

        info!(
            "Best reward: {} (iteration {})",
            state.best_reward,
            describe_iter(state.best_iter)
        );
        info!("Mean reward: {}", mean_reward);
        log_items(&perf.summary());
        info!(
            "Prediction error: {}",
            buffer.prediction_error(&buffer.reward_to_go())
        );
        if let Some(norms) = state.policy_norms.take_summary() {
            debug!("|grad| (policy): {}", norms);
        }
        if let Some(norms) = state.baseline_norms.take_summary() {
            debug!("|grad| (baseline): {}", norms);
        }

        if state.best_reward >= self.config.target_reward {
            info!("Target reward reached.");
            return Ok(Some(TrainingOutcome::TargetReached { iter }));
        }
        if self.task.terminate(state.best_perf.as_ref()) {
            info!("Termination criterion satisfied.");
            return Ok(Some(TrainingOutcome::TerminationCriterion { iter }));
        }
        Ok(None)
    }
}

fn describe_iter(iter: Option<usize>) -> String {
    iter.map_or_else(|| "none".to_string(), |i| i.to_string())
}

fn log_items(items: &IndexMap<String, String>) {
    for (key, value) in items {
        info!("{}: {}", key, value);
    }
}
