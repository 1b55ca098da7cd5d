//! Core traits and types for recurrent-network policy-gradient training
//!
//! This crate holds the plain data and the seams of the system: configuration,
//! errors, the network and task traits, the trajectory buffer produced by a
//! rollout and the checkpoint record persisted by the trainer.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod network;
pub mod rng;
pub mod task;
pub mod trajectory;

// Re-export core traits and types
pub use checkpoint::{AdamState, Carryover, Checkpoint, HistoryRecord, NetworkState};
pub use config::{Config, ExecutionMode, LoadMode};
pub use error::{PgError, Result};
pub use network::{
    Backprop, ForwardTrace, Network, NetworkConfig, NetworkType, OutputActivation, Params,
    Regularization,
};
pub use rng::TrainRng;
pub use task::{Performance, Step, Task, TrialStatus};
pub use trajectory::TrajectoryBuffer;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        Checkpoint, Config, LoadMode, Network, NetworkType, Performance, PgError, Result, Step,
        Task, TrainRng, TrajectoryBuffer, TrialStatus,
    };
}
