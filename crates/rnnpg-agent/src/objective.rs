//! Policy-gradient and baseline objectives
//!
//! Each update object is bound to one network and owns its optimizer. `apply` runs
//! the batched forward pass, forms the gradient of the objective with respect to
//! the network outputs, back-propagates it through time and takes one Adam step.
//!
//! Policy objective for `n` trials, with `s, t` ranging over steps `1..T`:
//!
//! ```text
//! J0  = mean_n(logpi_0 R_0)
//! J   = 1/n sum_n sum_{s,t} logpi_s C[s,t] R_t M_t        C[s,t] = 1 iff s <= t
//! Jb  = mean_n(logpi_0 b_0) + 1/n sum_n sum_s logpi_s b_s
//! obj = -(J0 + J - Jb) + regs - entropy_coef H
//! ```
//!
//! Baseline objective: `sum((V - R_b)^2 M) / sum(M) + regs`, where `R_b` is the
//! masked reward-to-go and `V` stacks the step-0 value on top of the sequence.

use ndarray::{s, Array1, Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};
use rnnpg_core::{AdamState, ForwardTrace, Network, NetworkType, Params, PgError, Result};
use tracing::debug;

use crate::optim::Adam;

/// Default global gradient-norm clip
pub const DEFAULT_GRAD_CLIP: f64 = 1.0;

/// Upper-triangular causal matrix of size `n`, `C[s, t] = 1` iff `s <= t`
#[must_use]
pub fn causal_matrix(n: usize) -> Array2<f64> {
    Array2::from_shape_fn((n, n), |(s, t)| if s <= t { 1.0 } else { 0.0 })
}

/// Tensors consumed by one policy update
#[derive(Debug, Clone, Copy)]
pub struct PolicyBatch<'a> {
    /// Explicit initial states `[n, N]` (continuous mode)
    pub x0: Option<ArrayView2<'a, f64>>,
    /// Observations feeding steps `1..T`, `[T-1, n, Nin]`
    pub inputs: ArrayView3<'a, f64>,
    /// Policy noise `[T, n, noise_dim]`; only the first `T-1` rows are used
    pub noise: ArrayView3<'a, f64>,
    /// One-hot actions `[T, n, n_actions]`
    pub actions: ArrayView3<'a, f64>,
    /// Rewards `[T, n]`
    pub rewards: ArrayView2<'a, f64>,
    /// Baseline predictions `[T, n]`
    pub baseline: ArrayView2<'a, f64>,
    /// Validity mask `[T, n]`
    pub mask: ArrayView2<'a, f64>,
}

/// Tensors consumed by one baseline update
#[derive(Debug, Clone, Copy)]
pub struct BaselineBatch<'a> {
    /// Explicit initial states `[n, N_b]` (continuous mode)
    pub x0: Option<ArrayView2<'a, f64>>,
    /// Baseline inputs feeding steps `1..T`, `[T-1, n, N + n_actions]`
    pub inputs: ArrayView3<'a, f64>,
    /// Baseline noise `[T, n, noise_dim]`; only the first `T-1` rows are used
    pub noise: ArrayView3<'a, f64>,
    /// Masked reward-to-go `[T, n]`
    pub returns: ArrayView2<'a, f64>,
    /// Validity mask `[T, n]`
    pub mask: ArrayView2<'a, f64>,
}

/// Initial states for a batch: explicit ones, or the learned `x0` broadcast over trials
fn initial_states(
    net: &dyn Network,
    use_x0: bool,
    x0: Option<ArrayView2<'_, f64>>,
    n_trials: usize,
) -> Result<Array2<f64>> {
    if use_x0 {
        let x0 = x0.ok_or_else(|| {
            PgError::InvalidConfig("explicit initial states required in continuous mode".to_string())
        })?;
        if x0.dim() != (n_trials, net.n_hidden()) {
            return Err(PgError::DimensionMismatch {
                expected: n_trials,
                actual: x0.nrows(),
            });
        }
        Ok(x0.to_owned())
    } else {
        let x0 = net.initial_state();
        x0.broadcast((n_trials, x0.len()))
            .map(|view| view.to_owned())
            .ok_or(PgError::DimensionMismatch {
                expected: net.n_hidden(),
                actual: x0.len(),
            })
    }
}

fn check_shape(name: &str, actual: (usize, usize), expected: (usize, usize)) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(PgError::InvalidConfig(format!(
            "{name} has shape {actual:?}, expected {expected:?}"
        )))
    }
}

/// Back-propagate output gradients, add regularization and the structural `Wrec`
/// term, and fill in the initial-state gradient
#[allow(clippy::too_many_arguments)]
fn collect_gradients(
    net: &dyn Network,
    trace: &ForwardTrace,
    mask: ArrayView2<f64>,
    d_out0: ArrayView2<f64>,
    d_out: ArrayView3<f64>,
    d_rates: Option<&Array3<f64>>,
    d_params: Params,
    use_x0: bool,
) -> Params {
    let full = net.backward(trace, d_out0, d_out, d_rates.map(Array3::view));

    let omega = if net.kind() == NetworkType::Simple {
        if d_rates.is_some() {
            let objective_only = net.backward(trace, d_out0, d_out, None);
            net.d_omega_d_wrec(trace, objective_only.state_grads.view(), mask)
        } else {
            net.d_omega_d_wrec(trace, full.state_grads.view(), mask)
        }
    } else {
        None
    };

    let mut grads = full.grads;
    for (name, d) in d_params {
        if let Some(g) = grads.get_mut(&name) {
            *g += &d;
        }
    }
    if let (Some(d_omega), Some(g)) = (omega, grads.get_mut("Wrec")) {
        *g += &d_omega.into_dyn();
    }

    if net.trainables().iter().any(|name| name == "x0") {
        let d_x0 = if use_x0 {
            Array1::zeros(net.n_hidden())
        } else {
            full.d_x0.sum_axis(Axis(0))
        };
        grads.insert("x0".to_string(), d_x0.into_dyn());
    }
    grads
}

/// Policy-gradient update bound to the policy network
#[derive(Debug, Clone)]
pub struct PolicyUpdate {
    horizon: usize,
    use_x0: bool,
    causal: Array2<f64>,
    entropy_coef: f64,
    optimizer: Adam,
}

impl PolicyUpdate {
    /// Build the update for trials of `horizon` steps
    ///
    /// `use_x0` selects explicit initial states (continuous mode); `accumulators`
    /// resumes the optimizer.
    pub fn build(
        net: &dyn Network,
        horizon: usize,
        use_x0: bool,
        accumulators: Option<AdamState>,
    ) -> Result<Self> {
        if horizon == 0 {
            return Err(PgError::InvalidConfig("horizon must be positive".to_string()));
        }
        if net.config().n_out < 2 {
            return Err(PgError::Network(
                "policy network needs at least two actions".to_string(),
            ));
        }
        Ok(Self {
            horizon,
            use_x0,
            causal: causal_matrix(horizon - 1),
            entropy_coef: 0.0,
            optimizer: Adam::new(DEFAULT_GRAD_CLIP, accumulators),
        })
    }

    /// Set the gradient-norm clip
    #[must_use]
    pub fn with_grad_clip(mut self, grad_clip: f64) -> Self {
        self.optimizer = Adam::new(grad_clip, Some(self.optimizer.state().clone()));
        self
    }

    /// Set the entropy bonus weight
    #[must_use]
    pub fn with_entropy_coef(mut self, entropy_coef: f64) -> Self {
        self.entropy_coef = entropy_coef;
        self
    }

    /// Optimizer accumulators for checkpointing
    #[must_use]
    pub fn accumulators(&self) -> &AdamState {
        self.optimizer.state()
    }

    /// Objective value and its gradients with respect to all trainable parameters
    pub fn gradients(&self, net: &dyn Network, batch: &PolicyBatch<'_>) -> Result<(f64, Params)> {
        let t_max = self.horizon;
        let n = batch.rewards.ncols();
        check_shape("rewards", batch.rewards.dim(), (t_max, n))?;
        check_shape("mask", batch.mask.dim(), (t_max, n))?;
        check_shape("baseline", batch.baseline.dim(), (t_max, n))?;
        check_shape(
            "actions",
            (batch.actions.shape()[0], batch.actions.shape()[1]),
            (t_max, n),
        )?;
        if batch.noise.shape()[0] < t_max - 1 {
            return Err(PgError::InvalidConfig("noise shorter than the horizon".to_string()));
        }

        let x0 = initial_states(net, self.use_x0, batch.x0, n)?;
        let noise = batch.noise.slice(s![..t_max - 1, .., ..]);
        let trace = net.get_outputs(batch.inputs, noise, x0.view())?;

        let (objective, d_out0, d_out) = self.objective_terms(&trace, batch);
        let regs = net.get_regs(&trace, batch.mask);

        let grads = collect_gradients(
            net,
            &trace,
            batch.mask,
            d_out0.view(),
            d_out.view(),
            regs.d_rates.as_ref(),
            regs.d_params,
            self.use_x0,
        );
        Ok((objective + regs.value, grads))
    }

    /// One policy update with learning rate `lr`; returns the gradient norm
    pub fn apply(&mut self, net: &mut dyn Network, batch: PolicyBatch<'_>, lr: f64) -> Result<f64> {
        let (objective, grads) = self.gradients(net, &batch)?;
        let norm = self.optimizer.step(net, &grads, lr)?;
        debug!("Policy objective {:.6}, |grad| {:.6}", objective, norm);
        Ok(norm)
    }

    /// Objective value and its gradients with respect to the step-0 and sequence outputs
    #[allow(clippy::cast_precision_loss)]
    fn objective_terms(
        &self,
        trace: &ForwardTrace,
        batch: &PolicyBatch<'_>,
    ) -> (f64, Array2<f64>, Array3<f64>) {
        let n = batch.rewards.ncols() as f64;
        let t_max = self.horizon;
        let rewards = batch.rewards;
        let mask = batch.mask;
        let baseline = batch.baseline;

        // Future masked reward for each step s >= 1
        let masked = &rewards.slice(s![1.., ..]) * &mask.slice(s![1.., ..]);
        let future = self.causal.dot(&masked);

        let mut objective = 0.0;
        let mut d_out0 = Array2::zeros(trace.z0.raw_dim());
        let mut d_out = Array3::zeros(trace.outputs.raw_dim());

        // Step 0
        for trial in 0..batch.rewards.ncols() {
            let weight = (rewards[[0, trial]] - baseline[[0, trial]]) / n;
            let m = mask[[0, trial]];
            for (a, &z) in trace.z0.row(trial).iter().enumerate() {
                let am = batch.actions[[0, trial, a]] * m;
                if am != 0.0 {
                    objective -= am * z.ln() * weight;
                    d_out0[[trial, a]] = -am * weight / z;
                }
            }
        }

        // Steps 1..T
        for k in 0..t_max - 1 {
            for trial in 0..batch.rewards.ncols() {
                let m = mask[[k + 1, trial]];
                if m == 0.0 {
                    continue;
                }
                let weight = (future[[k, trial]] - baseline[[k + 1, trial]]) / n;
                for a in 0..trace.outputs.shape()[2] {
                    let am = batch.actions[[k + 1, trial, a]] * m;
                    if am != 0.0 {
                        let z = trace.outputs[[k, trial, a]];
                        objective -= am * z.ln() * weight;
                        d_out[[k, trial, a]] = -am * weight / z;
                    }
                }
            }
        }

        if self.entropy_coef != 0.0 {
            objective -= self.entropy_bonus(trace, mask, &mut d_out0, &mut d_out);
        }

        (objective, d_out0, d_out)
    }

    /// Add the gradient of `-entropy_coef * H` and return `entropy_coef * H`
    fn entropy_bonus(
        &self,
        trace: &ForwardTrace,
        mask: ArrayView2<f64>,
        d_out0: &mut Array2<f64>,
        d_out: &mut Array3<f64>,
    ) -> f64 {
        let total = mask.sum();
        if total == 0.0 {
            return 0.0;
        }
        let scale = self.entropy_coef / total;
        let mut entropy = 0.0;

        let mut accumulate = |z: ArrayView2<f64>,
                              mut d: ndarray::ArrayViewMut2<f64>,
                              m: ndarray::ArrayView1<f64>| {
            Zip::from(z.rows())
                .and(d.rows_mut())
                .and(&m)
                .for_each(|z_row, mut d_row, &m| {
                    if m == 0.0 {
                        return;
                    }
                    for (d, &z) in d_row.iter_mut().zip(z_row) {
                        let z = z.max(f64::MIN_POSITIVE);
                        entropy -= m * z * z.ln();
                        *d += scale * m * (z.ln() + 1.0);
                    }
                });
        };

        accumulate(trace.z0.view(), d_out0.view_mut(), mask.row(0));
        for k in 0..trace.steps() {
            accumulate(
                trace.outputs.index_axis(Axis(0), k),
                d_out.index_axis_mut(Axis(0), k),
                mask.row(k + 1),
            );
        }
        scale * entropy
    }
}

/// Baseline regression update bound to the baseline network
#[derive(Debug, Clone)]
pub struct BaselineUpdate {
    use_x0: bool,
    optimizer: Adam,
}

impl BaselineUpdate {
    /// Build the update; `use_x0` selects explicit initial states
    pub fn build(net: &dyn Network, use_x0: bool, accumulators: Option<AdamState>) -> Result<Self> {
        if net.config().n_out != 1 {
            return Err(PgError::Network(
                "baseline network must have a single output".to_string(),
            ));
        }
        Ok(Self {
            use_x0,
            optimizer: Adam::new(DEFAULT_GRAD_CLIP, accumulators),
        })
    }

    /// Set the gradient-norm clip
    #[must_use]
    pub fn with_grad_clip(mut self, grad_clip: f64) -> Self {
        self.optimizer = Adam::new(grad_clip, Some(self.optimizer.state().clone()));
        self
    }

    /// Optimizer accumulators for checkpointing
    #[must_use]
    pub fn accumulators(&self) -> &AdamState {
        self.optimizer.state()
    }

    /// Value predictions `[T, n]`, loss and gradients at the current parameters
    pub fn gradients(
        &self,
        net: &dyn Network,
        batch: &BaselineBatch<'_>,
    ) -> Result<(Array2<f64>, f64, Params)> {
        let (t_max, n) = batch.returns.dim();
        check_shape("mask", batch.mask.dim(), (t_max, n))?;
        if t_max == 0 || batch.noise.shape()[0] < t_max - 1 {
            return Err(PgError::InvalidConfig("noise shorter than the horizon".to_string()));
        }

        let x0 = initial_states(net, self.use_x0, batch.x0, n)?;
        let noise = batch.noise.slice(s![..t_max - 1, .., ..]);
        let trace = net.get_outputs(batch.inputs, noise, x0.view())?;

        let mut values = Array2::zeros((t_max, n));
        values.row_mut(0).assign(&trace.z0.column(0));
        values
            .slice_mut(s![1.., ..])
            .assign(&trace.outputs.index_axis(Axis(2), 0));

        let total = batch.mask.sum();
        let (loss, d_values) = if total > 0.0 {
            let diff = &values - &batch.returns;
            let loss = (&diff * &diff * &batch.mask).sum() / total;
            (loss, diff * &batch.mask * (2.0 / total))
        } else {
            (0.0, Array2::zeros((t_max, n)))
        };

        let d_out0 = d_values.row(0).to_owned().insert_axis(Axis(1));
        let d_out = d_values.slice(s![1.., ..]).to_owned().insert_axis(Axis(2));
        let regs = net.get_regs(&trace, batch.mask);

        let grads = collect_gradients(
            net,
            &trace,
            batch.mask,
            d_out0.view(),
            d_out.view(),
            regs.d_rates.as_ref(),
            regs.d_params,
            self.use_x0,
        );
        Ok((values, loss + regs.value, grads))
    }

    /// One baseline update with learning rate `lr`
    ///
    /// Returns the value predictions computed before the update and the gradient norm.
    pub fn apply(
        &mut self,
        net: &mut dyn Network,
        batch: BaselineBatch<'_>,
        lr: f64,
    ) -> Result<(Array2<f64>, f64)> {
        let (values, loss, grads) = self.gradients(net, &batch)?;
        let norm = self.optimizer.step(net, &grads, lr)?;
        debug!("Baseline loss {:.6}, |grad| {:.6}", loss, norm);
        Ok((values, norm))
    }
}
