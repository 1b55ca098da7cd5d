//! Recurrent policy-gradient agent
//!
//! This crate provides the moving parts of training:
//! - Simple and gated recurrent networks with exact back-propagation through time
//! - Adam with gradient-norm clipping
//! - The rollout engine that plays trials against a task
//! - Policy-gradient and baseline objectives
//! - The training controller and checkpoint persistence

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod networks;
pub mod objective;
pub mod optim;
pub mod rollout;
pub mod store;
pub mod trainer;
pub mod utils;

// Re-export the training entry points
pub use trainer::{CancellationToken, PolicyGradient, TrainingOutcome, TrainingSummary};

// Re-export building blocks
pub use networks::{GruNetwork, SimpleNetwork};
pub use objective::{BaselineBatch, BaselineUpdate, PolicyBatch, PolicyUpdate};
pub use optim::Adam;
pub use rollout::{Rollout, RolloutEngine, RolloutSettings};
pub use store::{CheckpointStore, FileCheckpointStore};
pub use utils::{GradNormLog, NormSummary};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        CancellationToken, CheckpointStore, FileCheckpointStore, PolicyGradient,
        TrainingOutcome, TrainingSummary,
    };
    pub use rnnpg_core::prelude::*;
}
