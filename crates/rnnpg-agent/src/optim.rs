//! Adam with global gradient-norm clipping
//!
//! The accumulators live in [`AdamState`] so they can be checkpointed and handed
//! back to a rebuilt optimizer on resume.

use ndarray::ArrayD;
use rnnpg_core::{AdamState, Network, Params, PgError, Result};
use tracing::warn;

/// Exponential decay of the first moment
pub const BETA1: f64 = 0.9;
/// Exponential decay of the second moment
pub const BETA2: f64 = 0.999;
/// Denominator guard
pub const EPSILON: f64 = 1e-8;

/// Adam optimizer bound to one network's trainable parameters
#[derive(Debug, Clone)]
pub struct Adam {
    state: AdamState,
    grad_clip: f64,
}

impl Adam {
    /// Create an optimizer, resuming from `state` when given
    #[must_use]
    pub fn new(grad_clip: f64, state: Option<AdamState>) -> Self {
        Self {
            state: state.unwrap_or_default(),
            grad_clip,
        }
    }

    /// Accumulator state for checkpointing
    #[must_use]
    pub fn state(&self) -> &AdamState {
        &self.state
    }

    /// Global L2 norm of a gradient set
    #[must_use]
    pub fn global_norm(grads: &Params) -> f64 {
        grads
            .values()
            .map(|g| g.iter().map(|v| v * v).sum::<f64>())
            .sum::<f64>()
            .sqrt()
    }

    /// Apply one update with learning rate `lr` and return the pre-clip gradient norm
    ///
    /// A non-finite norm leaves both the parameters and the accumulators untouched.
    #[allow(clippy::cast_precision_loss)]
    pub fn step(&mut self, net: &mut dyn Network, grads: &Params, lr: f64) -> Result<f64> {
        let norm = Self::global_norm(grads);
        if !norm.is_finite() {
            warn!("Skipping update with non-finite gradient norm {}", norm);
            return Ok(norm);
        }

        let scale = if norm > self.grad_clip {
            self.grad_clip / norm
        } else {
            1.0
        };

        let values = net.get_values();
        let t = (self.state.step + 1) as f64;
        let correction1 = 1.0 - BETA1.powf(t);
        let correction2 = 1.0 - BETA2.powf(t);

        let mut updated = Params::new();
        let mut first = self.state.first_moment.clone();
        let mut second = self.state.second_moment.clone();
        for name in net.trainables() {
            let grad = grads
                .get(&name)
                .ok_or_else(|| PgError::Optimizer(format!("missing gradient for {name}")))?;
            let param = values
                .get(&name)
                .ok_or_else(|| PgError::Optimizer(format!("unknown parameter {name}")))?;
            if grad.shape() != param.shape() {
                return Err(PgError::Optimizer(format!(
                    "gradient for {name} has shape {:?}, parameter has {:?}",
                    grad.shape(),
                    param.shape()
                )));
            }

            let clipped = grad * scale;
            let m = first
                .entry(name.clone())
                .or_insert_with(|| ArrayD::zeros(param.raw_dim()));
            *m = &*m * BETA1 + &clipped * (1.0 - BETA1);
            let v = second
                .entry(name.clone())
                .or_insert_with(|| ArrayD::zeros(param.raw_dim()));
            *v = &*v * BETA2 + clipped.mapv(|g| g * g) * (1.0 - BETA2);

            let mut step = param.clone();
            ndarray::Zip::from(&mut step)
                .and(&*m)
                .and(&*v)
                .for_each(|p, &m, &v| {
                    *p -= lr * (m / correction1) / ((v / correction2).sqrt() + EPSILON);
                });
            updated.insert(name, step);
        }

        net.set_values(&updated)?;
        self.state.step += 1;
        self.state.first_moment = first;
        self.state.second_moment = second;
        Ok(norm)
    }
}
