//! Cognitive tasks for recurrent policy-gradient training
//!
//! This crate provides:
//! - Random-dots motion discrimination
//! - Cued two-alternative choice
//! - Two-alternative performance tracking and termination rules
//! - A registry mapping task names to tasks and default configurations

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cued_choice;
pub mod epochs;
pub mod performance;
pub mod rdm;
pub mod registry;

// Re-export tasks
pub use cued_choice::{CuedChoiceConfig, CuedChoiceTask, CuedTrial};
pub use rdm::{RdmConfig, RdmTask, RdmTrial};

// Re-export shared types
pub use epochs::Epoch;
pub use performance::{Side, TerminationRule, TwoAfcPerformance, TwoAfcStatus};
pub use registry::TaskKind;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{CuedChoiceTask, RdmTask, TaskKind, TwoAfcPerformance, TwoAfcStatus};
    pub use rnnpg_core::prelude::*;
}
