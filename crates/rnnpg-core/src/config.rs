//! Training configuration
//!
//! A [`Config`] is built once from a JSON mapping and never mutated afterwards.
//! Keys keep the spelling used by existing configuration files (`N`, `R_ABORTED`,
//! `L2_r`, ...), so older files load unchanged.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::network::NetworkType;
use crate::{PgError, Result};

/// Keys that every configuration must provide
pub const REQUIRED_KEYS: [&str; 5] = ["inputs", "actions", "tmax", "n_gradient", "n_validation"];

/// Whether hidden state resets per episode or chains across episodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Every trial starts from the network's own initial state
    #[default]
    Episodic,
    /// Hidden state carries over from one trial to the next
    Continuous,
}

impl FromStr for ExecutionMode {
    type Err = PgError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "episodic" => Ok(Self::Episodic),
            "continuous" => Ok(Self::Continuous),
            other => Err(PgError::UnknownMode(other.to_string())),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Episodic => f.write_str("episodic"),
            Self::Continuous => f.write_str("continuous"),
        }
    }
}

/// Which parameter set to restore from a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadMode {
    /// Parameters that achieved the best validation reward
    #[default]
    Best,
    /// Parameters at the last checkpoint tick
    Current,
}

impl FromStr for LoadMode {
    type Err = PgError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "best" => Ok(Self::Best),
            "current" => Ok(Self::Current),
            other => Err(PgError::UnknownLoadMode(other.to_string())),
        }
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Best => f.write_str("best"),
            Self::Current => f.write_str("current"),
        }
    }
}

mod defaults {
    pub fn n_hidden() -> usize {
        100
    }
    pub fn p0() -> f64 {
        0.1
    }
    pub fn lr() -> f64 {
        0.004
    }
    pub fn max_iter() -> usize {
        100_000
    }
    pub fn target_reward() -> f64 {
        f64::INFINITY
    }
    pub fn r_aborted() -> f64 {
        -1.0
    }
    pub fn checkfreq() -> usize {
        50
    }
    pub fn dt() -> f64 {
        10.0
    }
    pub fn tau() -> f64 {
        100.0
    }
    pub fn var_rec() -> f64 {
        0.02
    }
    pub fn win() -> f64 {
        1.0
    }
    pub fn rho() -> f64 {
        2.0
    }
    pub fn policy_seed() -> u64 {
        1
    }
    pub fn baseline_seed() -> u64 {
        2
    }
    pub fn lambda_omega() -> f64 {
        2.0
    }
    pub fn grad_clip() -> f64 {
        1.0
    }
}

/// Hyperparameters of one training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Names of the observation channels
    pub inputs: Vec<String>,
    /// Names of the discrete actions
    pub actions: Vec<String>,
    /// Trial duration (same time unit as `dt`)
    pub tmax: f64,
    /// Trials per gradient batch
    pub n_gradient: usize,
    /// Trials per validation batch (0 disables validation)
    pub n_validation: usize,

    /// Hidden units per network
    #[serde(rename = "N", default = "defaults::n_hidden")]
    pub n_hidden: usize,
    /// Recurrent connection probability
    #[serde(default = "defaults::p0")]
    pub p0: f64,
    /// Policy learning rate
    #[serde(default = "defaults::lr")]
    pub lr: f64,
    /// Baseline learning rate
    #[serde(default = "defaults::lr")]
    pub baseline_lr: f64,
    /// Iteration limit
    #[serde(default = "defaults::max_iter")]
    pub max_iter: usize,
    /// Policy parameters excluded from training
    #[serde(default)]
    pub fix: Vec<String>,
    /// Baseline parameters excluded from training
    #[serde(default)]
    pub baseline_fix: Vec<String>,
    /// Validation reward at which training stops
    #[serde(default = "defaults::target_reward")]
    pub target_reward: f64,
    /// Episodic or continuous execution
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Recurrent architecture of both networks
    #[serde(default)]
    pub network_type: NetworkType,
    /// Reward assigned when a trial exhausts the horizon
    #[serde(rename = "R_ABORTED", default = "defaults::r_aborted")]
    pub r_aborted: f64,
    /// Iterations between checkpoint ticks
    #[serde(default = "defaults::checkfreq")]
    pub checkfreq: usize,
    /// Simulation time step
    #[serde(default = "defaults::dt")]
    pub dt: f64,
    /// Network time constant
    #[serde(default = "defaults::tau")]
    pub tau: f64,
    /// Recurrent noise variance (before the `2 tau / dt` scaling)
    #[serde(default = "defaults::var_rec")]
    pub var_rec: f64,
    /// Firing-rate L2 penalty of the policy network
    #[serde(rename = "L2_r", default)]
    pub l2_r: f64,
    /// Firing-rate L2 penalty of the baseline network
    #[serde(rename = "baseline_L2_r", default)]
    pub baseline_l2_r: f64,
    /// Input weight scale of the policy network
    #[serde(rename = "Win", default = "defaults::win")]
    pub win: f64,
    /// Input weight scale of the baseline network
    #[serde(rename = "baseline_Win", default = "defaults::win")]
    pub baseline_win: f64,
    /// Per-input-channel mask on the policy input weights
    #[serde(rename = "Win_mask", default)]
    pub win_mask: Option<Vec<f64>>,
    /// Per-input-channel mask on the baseline input weights
    #[serde(rename = "baseline_Win_mask", default)]
    pub baseline_win_mask: Option<Vec<f64>>,
    /// Initial spectral radius of the policy recurrent weights
    #[serde(default = "defaults::rho")]
    pub rho: f64,
    /// Initial spectral radius of the baseline recurrent weights
    #[serde(default = "defaults::rho")]
    pub baseline_rho: f64,
    /// L1 penalty on recurrent weights
    #[serde(rename = "L1_Wrec", default)]
    pub l1_wrec: f64,
    /// L2 penalty on recurrent weights
    #[serde(rename = "L2_Wrec", default)]
    pub l2_wrec: f64,
    /// Seed for policy weight initialization
    #[serde(default = "defaults::policy_seed")]
    pub policy_seed: u64,
    /// Seed for baseline weight initialization
    #[serde(default = "defaults::baseline_seed")]
    pub baseline_seed: u64,
    /// Coefficient of the vanishing-gradient regularizer (simple networks only)
    #[serde(rename = "lambda_Omega", default = "defaults::lambda_omega")]
    pub lambda_omega: f64,
    /// Gradient norm above which updates are rescaled
    #[serde(default = "defaults::grad_clip")]
    pub grad_clip: f64,
    /// Weight of the policy entropy bonus
    #[serde(default)]
    pub entropy_coef: f64,
}

impl Config {
    /// Build a configuration from a JSON mapping
    ///
    /// Required keys are checked before anything else, then the discriminators,
    /// so the first error reported is the most fundamental one.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        {
            let map = value.as_object().ok_or_else(|| {
                PgError::InvalidConfig("configuration must be a JSON object".to_string())
            })?;

            for key in REQUIRED_KEYS {
                if !map.contains_key(key) {
                    return Err(PgError::MissingConfigKey(key.to_string()));
                }
            }

            if let Some(network_type) = map.get("network_type") {
                let name = network_type.as_str().ok_or_else(|| {
                    PgError::InvalidConfig("network_type must be a string".to_string())
                })?;
                name.parse::<NetworkType>()?;
            }
            if let Some(mode) = map.get("mode") {
                let name = mode.as_str().ok_or_else(|| {
                    PgError::InvalidConfig("mode must be a string".to_string())
                })?;
                name.parse::<ExecutionMode>()?;
            }
        }

        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration from a JSON file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        Self::from_value(value)
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(PgError::InvalidConfig("inputs must not be empty".to_string()));
        }
        if self.actions.is_empty() {
            return Err(PgError::InvalidConfig("actions must not be empty".to_string()));
        }
        if self.dt <= 0.0 || self.tau <= 0.0 {
            return Err(PgError::InvalidConfig("dt and tau must be positive".to_string()));
        }
        if self.tmax < 0.0 {
            return Err(PgError::InvalidConfig("tmax must not be negative".to_string()));
        }
        if self.n_gradient == 0 {
            return Err(PgError::InvalidConfig("n_gradient must be positive".to_string()));
        }
        if self.checkfreq == 0 {
            return Err(PgError::InvalidConfig("checkfreq must be positive".to_string()));
        }
        if self.n_hidden == 0 {
            return Err(PgError::InvalidConfig("N must be positive".to_string()));
        }
        if !(self.p0 > 0.0 && self.p0 <= 1.0) {
            return Err(PgError::InvalidConfig(format!("p0 must lie in (0, 1], got {}", self.p0)));
        }
        if self.var_rec < 0.0 {
            return Err(PgError::InvalidConfig("var_rec must not be negative".to_string()));
        }
        if self.grad_clip <= 0.0 {
            return Err(PgError::InvalidConfig("grad_clip must be positive".to_string()));
        }
        if let Some(mask) = &self.win_mask {
            if mask.len() != self.n_inputs() {
                return Err(PgError::DimensionMismatch {
                    expected: self.n_inputs(),
                    actual: mask.len(),
                });
            }
        }
        if let Some(mask) = &self.baseline_win_mask {
            let expected = self.n_hidden + self.n_actions();
            if mask.len() != expected {
                return Err(PgError::DimensionMismatch {
                    expected,
                    actual: mask.len(),
                });
            }
        }
        Ok(())
    }

    /// Number of observation channels
    #[must_use]
    pub fn n_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Number of discrete actions
    #[must_use]
    pub fn n_actions(&self) -> usize {
        self.actions.len()
    }

    /// Maximum number of time steps per trial, `floor(tmax / dt) + 1`
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn horizon(&self) -> usize {
        (self.tmax / self.dt) as usize + 1
    }

    /// Leak of the network dynamics for step size `dt`
    #[must_use]
    pub fn alpha(&self, dt: f64) -> f64 {
        dt / self.tau
    }

    /// Recurrent noise variance scaled by `2 tau / dt`
    #[must_use]
    pub fn scaled_var_rec(&self, dt: f64) -> f64 {
        2.0 * self.tau / dt * self.var_rec
    }

    /// Whether hidden state chains across trials
    #[must_use]
    pub fn is_continuous(&self) -> bool {
        self.mode == ExecutionMode::Continuous
    }
}
