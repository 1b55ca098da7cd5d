//! Task registry
//!
//! Tasks have their own trial, status and performance types, so the registry is a
//! closed enum: callers match on [`TaskKind`] and construct the concrete task.

use std::fmt;
use std::str::FromStr;

use serde_json::{json, Value};

use rnnpg_core::{Config, PgError, Result};

use crate::{cued_choice, rdm};

/// Registered tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Random-dots motion discrimination
    Rdm,
    /// Cued two-alternative choice
    CuedChoice,
}

impl TaskKind {
    /// Every registered task
    pub const ALL: [TaskKind; 2] = [TaskKind::Rdm, TaskKind::CuedChoice];

    /// Registry name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            TaskKind::Rdm => "rdm",
            TaskKind::CuedChoice => "cued-choice",
        }
    }

    /// One-line description
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            TaskKind::Rdm => "random-dots motion discrimination, fixed stimulus duration",
            TaskKind::CuedChoice => "cued two-alternative choice",
        }
    }

    /// Default training configuration as JSON
    #[must_use]
    pub fn default_config(self) -> Value {
        match self {
            TaskKind::Rdm => {
                let task = rdm::RdmConfig::default();
                json!({
                    "inputs": rdm::INPUTS,
                    "actions": rdm::ACTIONS,
                    "tmax": task.tmax(),
                    "n_gradient": 20,
                    "n_validation": 500,
                    "N": 100,
                    "R_ABORTED": task.r_aborted,
                })
            }
            TaskKind::CuedChoice => {
                let task = cued_choice::CuedChoiceConfig::default();
                json!({
                    "inputs": cued_choice::INPUTS,
                    "actions": cued_choice::ACTIONS,
                    "tmax": task.cue + 20.0,
                    "n_gradient": 20,
                    "n_validation": 100,
                    "N": 20,
                    "checkfreq": 10,
                    "target_reward": 0.97,
                })
            }
        }
    }

    /// Default configuration, with `overrides` merged over it key by key
    pub fn config(self, overrides: Option<Value>) -> Result<Config> {
        let mut value = self.default_config();
        if let Some(overrides) = overrides {
            let overrides = match overrides {
                Value::Object(map) => map,
                _ => {
                    return Err(PgError::InvalidConfig(
                        "configuration overrides must be a JSON object".to_string(),
                    ))
                }
            };
            if let Value::Object(base) = &mut value {
                base.extend(overrides);
            }
        }
        Config::from_value(value)
    }
}

impl FromStr for TaskKind {
    type Err = PgError;

    fn from_str(s: &str) -> Result<Self> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| PgError::Task(format!("unknown task: {s}")))
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
