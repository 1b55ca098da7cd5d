//! Recurrent network abstraction
//!
//! The trainer drives two networks through this trait: the policy (softmax over
//! actions) and the baseline (scalar value). Implementations own their parameters
//! and provide a batched forward pass together with its exact backward pass, which
//! is all the objective builder needs to compute parameter gradients.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use ndarray::{Array1, Array2, Array3, ArrayD, ArrayView1, ArrayView2, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::{PgError, Result};

/// Named parameter tensors, in a stable order
pub type Params = IndexMap<String, ArrayD<f64>>;

/// Recurrent architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Leaky rectified recurrent network
    Simple,
    /// Leaky gated recurrent unit
    #[default]
    Gru,
}

impl FromStr for NetworkType {
    type Err = PgError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "simple" => Ok(Self::Simple),
            "gru" => Ok(Self::Gru),
            other => Err(PgError::UnknownNetworkType(other.to_string())),
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple => f.write_str("simple"),
            Self::Gru => f.write_str("gru"),
        }
    }
}

/// Nonlinearity applied to the readout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputActivation {
    /// Probability vector over actions
    Softmax,
    /// Identity readout
    Linear,
}

/// Everything needed to rebuild a network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Architecture
    pub network_type: NetworkType,
    /// Input dimension
    pub n_in: usize,
    /// Hidden units
    pub n_hidden: usize,
    /// Output dimension
    pub n_out: usize,
    /// Readout nonlinearity
    pub f_out: OutputActivation,
    /// Parameters excluded from training
    pub fix: Vec<String>,
    /// Firing-rate L2 penalty
    pub l2_r: f64,
    /// L1 penalty on `Wrec`
    pub l1_wrec: f64,
    /// L2 penalty on `Wrec`
    pub l2_wrec: f64,
    /// Vanishing-gradient regularizer coefficient
    pub lambda_omega: f64,
    /// Leak `dt / tau`
    pub alpha: f64,
    /// Recurrent connection probability
    pub p0: f64,
    /// Initial spectral radius of `Wrec`
    pub rho: f64,
    /// Input weight scale
    pub win: f64,
    /// Per-input-channel mask on `Win`
    pub win_mask: Option<Vec<f64>>,
    /// Initialization seed
    pub seed: u64,
}

/// Intermediate values of a batched forward pass
///
/// Time index `k` of the sequence tensors refers to step `k + 1` of the trial;
/// step 0 lives in `x0` / `z0`.
#[derive(Debug, Clone)]
pub struct ForwardTrace {
    /// Inputs `[T-1, n, Nin]`
    pub inputs: Array3<f64>,
    /// Initial states `[n, N]`
    pub x0: Array2<f64>,
    /// Outputs at step 0 `[n, Nout]`
    pub z0: Array2<f64>,
    /// States `[T-1, n, N]`
    pub states: Array3<f64>,
    /// Firing rates `[T-1, n, N]`
    pub rates: Array3<f64>,
    /// Outputs `[T-1, n, Nout]`
    pub outputs: Array3<f64>,
    /// Architecture-specific intermediates (gates, pre-activations)
    pub aux: Vec<Array3<f64>>,
}

impl ForwardTrace {
    /// Number of recurrent steps after step 0
    #[must_use]
    pub fn steps(&self) -> usize {
        self.states.shape()[0]
    }

    /// Number of trials in the batch
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.x0.nrows()
    }

    /// State before step `k + 1` of the stored sequence
    #[must_use]
    pub fn previous_state(&self, k: usize) -> ArrayView2<'_, f64> {
        if k == 0 {
            self.x0.view()
        } else {
            self.states.index_axis(ndarray::Axis(0), k - 1)
        }
    }
}

/// Regularization value and its gradients
#[derive(Debug, Clone)]
pub struct Regularization {
    /// Scalar penalty
    pub value: f64,
    /// Gradient with respect to the firing rates, when rates are penalized
    pub d_rates: Option<Array3<f64>>,
    /// Direct gradients with respect to parameters
    pub d_params: Params,
}

/// Result of back-propagation through time
#[derive(Debug, Clone)]
pub struct Backprop {
    /// Gradients of every trainable parameter
    pub grads: Params,
    /// Gradient with respect to the supplied initial states `[n, N]`
    pub d_x0: Array2<f64>,
    /// Gradient with respect to the states `[T-1, n, N]`
    pub state_grads: Array3<f64>,
}

/// A recurrent network with a differentiable batched forward pass
pub trait Network: Send + Sync {
    /// Configuration the network was built from
    fn config(&self) -> &NetworkConfig;

    /// Architecture discriminator
    fn kind(&self) -> NetworkType {
        self.config().network_type
    }

    /// Number of hidden units
    fn n_hidden(&self) -> usize {
        self.config().n_hidden
    }

    /// Dimension of the recurrent noise
    fn noise_dim(&self) -> usize {
        self.config().n_hidden
    }

    /// Learned initial state
    fn initial_state(&self) -> Array1<f64>;

    /// Output and state at step 0
    fn step_0(&self) -> (Array1<f64>, Array1<f64>) {
        let x0 = self.initial_state();
        let z0 = self.get_outputs_0(x0.view().insert_axis(ndarray::Axis(0)));
        (z0.row(0).to_owned(), x0)
    }

    /// One recurrent step, returning the new output and state
    fn step_t(
        &self,
        input: ArrayView1<f64>,
        noise: ArrayView1<f64>,
        state: ArrayView1<f64>,
    ) -> (Array1<f64>, Array1<f64>);

    /// Firing rate of a state
    fn firing_rate(&self, state: ArrayView1<f64>) -> Array1<f64>;

    /// Batched outputs from initial states `[n, N]`
    fn get_outputs_0(&self, x0: ArrayView2<f64>) -> Array2<f64>;

    /// Batched forward pass over `inputs [T-1, n, Nin]` and `noise [T-1, n, noise_dim]`
    fn get_outputs(
        &self,
        inputs: ArrayView3<f64>,
        noise: ArrayView3<f64>,
        x0: ArrayView2<f64>,
    ) -> Result<ForwardTrace>;

    /// Regularization penalty of a forward pass under the validity mask `[T, n]`
    fn get_regs(&self, trace: &ForwardTrace, mask: ArrayView2<f64>) -> Regularization;

    /// Back-propagate output gradients (and optional firing-rate gradients)
    fn backward(
        &self,
        trace: &ForwardTrace,
        d_out0: ArrayView2<f64>,
        d_out: ArrayView3<f64>,
        d_rates: Option<ArrayView3<f64>>,
    ) -> Backprop;

    /// Gradient of the vanishing-gradient regularizer with respect to `Wrec`
    ///
    /// Only architectures that define the regularizer return a value.
    fn d_omega_d_wrec(
        &self,
        _trace: &ForwardTrace,
        _state_grads: ArrayView3<f64>,
        _mask: ArrayView2<f64>,
    ) -> Option<Array2<f64>> {
        None
    }

    /// Snapshot of all parameters
    fn get_values(&self) -> Params;

    /// Replace parameters by name
    fn set_values(&mut self, values: &Params) -> Result<()>;

    /// Names of parameters updated by training
    fn trainables(&self) -> Vec<String>;
}
