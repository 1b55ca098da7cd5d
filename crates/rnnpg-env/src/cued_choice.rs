//! Cued two-alternative choice
//!
//! A cue names the rewarded side for a short period; the first action after the
//! cue is the choice and ends the trial.

use ndarray::Array1;
use rand::Rng;
use serde::{Deserialize, Serialize};

use rnnpg_core::{PgError, Result, Step, Task, TrainRng};

use crate::epochs::Epoch;
use crate::performance::{Side, TerminationRule, TwoAfcPerformance, TwoAfcStatus};

/// Observation channels
pub const INPUTS: [&str; 2] = ["CUE-LEFT", "CUE-RIGHT"];
/// Actions
pub const ACTIONS: [&str; 2] = ["CHOOSE-LEFT", "CHOOSE-RIGHT"];

/// Cue and reward settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CuedChoiceConfig {
    /// Cue length
    pub cue: f64,
    /// Reward for a correct choice
    pub r_correct: f64,
    /// When training may stop early
    pub termination: TerminationRule,
}

impl Default for CuedChoiceConfig {
    fn default() -> Self {
        Self {
            cue: 100.0,
            r_correct: 1.0,
            termination: TerminationRule {
                min_trials: 100,
                min_p_decision: 0.99,
                min_p_correct: 0.95,
            },
        }
    }
}

/// Conditions of one cued trial
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CuedTrial {
    /// Cued side
    pub target: Side,
    /// Cue epoch
    pub cue: Epoch,
}

/// Cued choice task
#[derive(Debug, Clone, Default)]
pub struct CuedChoiceTask {
    config: CuedChoiceConfig,
}

impl CuedChoiceTask {
    /// Create the task
    pub fn new(config: CuedChoiceConfig) -> Result<Self> {
        if config.cue < 0.0 {
            return Err(PgError::Task(format!("negative cue length {}", config.cue)));
        }
        Ok(Self { config })
    }
}

impl Task for CuedChoiceTask {
    type Trial = CuedTrial;
    type Status = TwoAfcStatus;
    type Performance = TwoAfcPerformance;

    fn inputs(&self) -> Vec<String> {
        INPUTS.iter().map(ToString::to_string).collect()
    }

    fn actions(&self) -> Vec<String> {
        ACTIONS.iter().map(ToString::to_string).collect()
    }

    fn get_condition(&mut self, rng: &mut TrainRng, _dt: f64) -> Result<CuedTrial> {
        let target = if rng.gen::<bool>() {
            Side::Right
        } else {
            Side::Left
        };
        Ok(CuedTrial {
            target,
            cue: Epoch::new(0.0, self.config.cue),
        })
    }

    fn get_step(
        &mut self,
        _rng: &mut TrainRng,
        dt: f64,
        trial: &CuedTrial,
        t: usize,
        action: usize,
    ) -> Result<Step<TwoAfcStatus>> {
        let acted = t.saturating_sub(1);
        let mut observation = Array1::zeros(INPUTS.len());

        // Actions during the cue are ignored
        if trial.cue.contains(acted, dt) {
            if trial.cue.contains(t, dt) {
                let channel = match trial.target {
                    Side::Left => 0,
                    Side::Right => 1,
                };
                observation[channel] = 1.0;
            }
            return Ok(Step {
                observation,
                reward: 0.0,
                status: TwoAfcStatus::running(),
            });
        }

        let choice = match action {
            0 => Side::Left,
            1 => Side::Right,
            other => return Err(PgError::Task(format!("unknown action {other}"))),
        };
        let status = TwoAfcStatus::decided(choice, trial.target, acted);
        let reward = if status.correct {
            self.config.r_correct
        } else {
            0.0
        };
        Ok(Step {
            observation,
            reward,
            status,
        })
    }

    fn new_performance(&self) -> TwoAfcPerformance {
        TwoAfcPerformance::default()
    }

    fn terminate(&self, best: Option<&TwoAfcPerformance>) -> bool {
        self.config.termination.satisfied(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rnnpg_core::rng::seeded;
    use rnnpg_core::TrialStatus;

    #[test]
    fn test_cue_then_choice() {
        let mut task = CuedChoiceTask::new(CuedChoiceConfig {
            cue: 20.0,
            ..CuedChoiceConfig::default()
        })
        .unwrap();
        let mut rng = seeded(1);
        let trial = CuedTrial {
            target: Side::Right,
            cue: Epoch::new(0.0, 20.0),
        };

        let step = task.get_step(&mut rng, 10.0, &trial, 1, 0).unwrap();
        assert!(step.status.continues());
        assert_eq!(step.observation.to_vec(), vec![0.0, 1.0]);

        // Last cue step: the next observation is blank
        let step = task.get_step(&mut rng, 10.0, &trial, 2, 0).unwrap();
        assert!(step.status.continues());
        assert_eq!(step.observation.sum(), 0.0);

        let step = task.get_step(&mut rng, 10.0, &trial, 3, 1).unwrap();
        assert!(!step.status.continues());
        assert!(step.status.correct);
        assert_eq!(step.reward, 1.0);

        let step = task.get_step(&mut rng, 10.0, &trial, 3, 0).unwrap();
        assert!(!step.status.correct);
        assert_eq!(step.reward, 0.0);
    }

    #[test]
    fn test_zero_length_cue_decides_immediately() {
        let mut task = CuedChoiceTask::new(CuedChoiceConfig {
            cue: 0.0,
            ..CuedChoiceConfig::default()
        })
        .unwrap();
        let mut rng = seeded(1);
        let trial = task.get_condition(&mut rng, 10.0).unwrap();

        let step = task.get_step(&mut rng, 10.0, &trial, 1, 1).unwrap();
        assert!(!step.status.continues());
        assert_eq!(step.status.choice, Some(Side::Right));
    }
}
