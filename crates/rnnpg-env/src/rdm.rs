//! Random-dots motion discrimination with a fixed stimulus duration
//!
//! The network holds fixation through a fixation and a stimulus epoch, during
//! which two noisy evidence channels favour the correct side by an amount set by
//! the motion coherence. In the decision epoch it reports the side. Breaking
//! fixation early aborts the trial.

use ndarray::Array1;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use rnnpg_core::{PgError, Result, Step, Task, TrainRng};

use crate::epochs::Epoch;
use crate::performance::{Side, TerminationRule, TwoAfcPerformance, TwoAfcStatus};

/// Observation channels
pub const INPUTS: [&str; 3] = ["FIXATION", "LEFT", "RIGHT"];
/// Actions
pub const ACTIONS: [&str; 3] = ["FIXATE", "CHOOSE-LEFT", "CHOOSE-RIGHT"];

const FIXATION: usize = 0;
const LEFT: usize = 1;
const RIGHT: usize = 2;

const FIXATE: usize = 0;
const CHOOSE_LEFT: usize = 1;
const CHOOSE_RIGHT: usize = 2;

/// Motion coherences, in percent
pub const COHERENCES: [f64; 7] = [0.0, 1.6, 3.2, 6.4, 12.8, 25.6, 51.2];

/// Timing and reward settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdmConfig {
    /// Fixation epoch length
    pub fixation: f64,
    /// Stimulus epoch length
    pub stimulus: f64,
    /// Decision epoch length
    pub decision: f64,
    /// Coherences to draw from
    pub coherences: Vec<f64>,
    /// Standard deviation of the evidence noise, before the `1/sqrt(dt)` scaling
    pub input_noise: f64,
    /// Reward for breaking fixation
    pub r_aborted: f64,
    /// Reward for a correct choice
    pub r_correct: f64,
    /// When training may stop early
    pub termination: TerminationRule,
}

impl Default for RdmConfig {
    fn default() -> Self {
        Self {
            fixation: 750.0,
            stimulus: 800.0,
            decision: 500.0,
            coherences: COHERENCES.to_vec(),
            input_noise: (2.0_f64 * 100.0 * 0.01).sqrt(),
            r_aborted: -1.0,
            r_correct: 1.0,
            termination: TerminationRule {
                min_trials: 500,
                min_p_decision: 0.99,
                min_p_correct: 0.85,
            },
        }
    }
}

impl RdmConfig {
    /// Total trial duration
    #[must_use]
    pub fn tmax(&self) -> f64 {
        self.fixation + self.stimulus + self.decision
    }
}

/// Conditions of one trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RdmTrial {
    /// Correct side
    pub target: Side,
    /// Motion coherence in percent
    pub coherence: f64,
    /// Fixation epoch
    pub fixation: Epoch,
    /// Stimulus epoch
    pub stimulus: Epoch,
    /// Decision epoch
    pub decision: Epoch,
}

/// Random-dots motion task
#[derive(Debug, Clone, Default)]
pub struct RdmTask {
    config: RdmConfig,
}

impl RdmTask {
    /// Create the task
    pub fn new(config: RdmConfig) -> Result<Self> {
        if config.coherences.is_empty() {
            return Err(PgError::Task("at least one coherence is required".to_string()));
        }
        if config.fixation < 0.0 || config.stimulus < 0.0 || config.decision <= 0.0 {
            return Err(PgError::Task(format!(
                "invalid epoch durations {}/{}/{}",
                config.fixation, config.stimulus, config.decision
            )));
        }
        Ok(Self { config })
    }

    /// Task settings
    #[must_use]
    pub fn config(&self) -> &RdmConfig {
        &self.config
    }

    /// Evidence level of a signed coherence, in `[0, 1]`
    #[must_use]
    pub fn scale(coherence: f64) -> f64 {
        (1.0 + coherence / 100.0) / 2.0
    }
}

impl Task for RdmTask {
    type Trial = RdmTrial;
    type Status = TwoAfcStatus;
    type Performance = TwoAfcPerformance;

    fn inputs(&self) -> Vec<String> {
        INPUTS.iter().map(ToString::to_string).collect()
    }

    fn actions(&self) -> Vec<String> {
        ACTIONS.iter().map(ToString::to_string).collect()
    }

    fn get_condition(&mut self, rng: &mut TrainRng, _dt: f64) -> Result<RdmTrial> {
        let target = if rng.gen::<bool>() {
            Side::Right
        } else {
            Side::Left
        };
        let coherence = *self
            .config
            .coherences
            .choose(rng)
            .ok_or_else(|| PgError::Task("no coherences to draw from".to_string()))?;

        let fixation = Epoch::new(0.0, self.config.fixation);
        let stimulus = fixation.then(self.config.stimulus);
        let decision = stimulus.then(self.config.decision);
        Ok(RdmTrial {
            target,
            coherence,
            fixation,
            stimulus,
            decision,
        })
    }

    fn get_step(
        &mut self,
        rng: &mut TrainRng,
        dt: f64,
        trial: &RdmTrial,
        t: usize,
        action: usize,
    ) -> Result<Step<TwoAfcStatus>> {
        // The action was taken at t - 1
        let acted = t.saturating_sub(1);
        let mut status = TwoAfcStatus::running();
        let mut reward = 0.0;
        if trial.fixation.contains(acted, dt) || trial.stimulus.contains(acted, dt) {
            if action != FIXATE {
                status = TwoAfcStatus::aborted();
                reward = self.config.r_aborted;
            }
        } else if trial.decision.contains(acted, dt) {
            let choice = match action {
                CHOOSE_LEFT => Some(Side::Left),
                CHOOSE_RIGHT => Some(Side::Right),
                _ => None,
            };
            if let Some(choice) = choice {
                status = TwoAfcStatus::decided(choice, trial.target, acted);
                if status.correct {
                    reward = self.config.r_correct;
                }
            }
        }

        let mut observation = Array1::zeros(INPUTS.len());
        if trial.fixation.contains(t, dt) || trial.stimulus.contains(t, dt) {
            observation[FIXATION] = 1.0;
        }
        if trial.stimulus.contains(t, dt) {
            let signed = trial.target.sign() * trial.coherence;
            let noise_scale = self.config.input_noise / dt.sqrt();
            let left: f64 = rng.sample(StandardNormal);
            let right: f64 = rng.sample(StandardNormal);
            observation[LEFT] = Self::scale(-signed) + noise_scale * left;
            observation[RIGHT] = Self::scale(signed) + noise_scale * right;
        }

        Ok(Step {
            observation,
            reward,
            status,
        })
    }

    fn new_performance(&self) -> TwoAfcPerformance {
        TwoAfcPerformance::default()
    }

    fn start_session(&mut self, _rng: &mut TrainRng) {
        debug!(
            "Random dots: {} coherences, trial length {}",
            self.config.coherences.len(),
            self.config.tmax()
        );
    }

    fn terminate(&self, best: Option<&TwoAfcPerformance>) -> bool {
        self.config.termination.satisfied(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rnnpg_core::rng::seeded;
    use rnnpg_core::TrialStatus;

    fn trial(target: Side, coherence: f64) -> RdmTrial {
        let fixation = Epoch::new(0.0, 30.0);
        let stimulus = fixation.then(20.0);
        let decision = stimulus.then(20.0);
        RdmTrial {
            target,
            coherence,
            fixation,
            stimulus,
            decision,
        }
    }

    #[test]
    fn test_breaking_fixation_aborts() {
        let mut task = RdmTask::default();
        let mut rng = seeded(0);
        let trial = trial(Side::Left, 12.8);

        let step = task.get_step(&mut rng, 10.0, &trial, 1, CHOOSE_LEFT).unwrap();
        assert!(!step.status.continues());
        assert!(step.status.choice.is_none());
        assert_relative_eq!(step.reward, -1.0);

        let step = task.get_step(&mut rng, 10.0, &trial, 1, FIXATE).unwrap();
        assert!(step.status.continues());
        assert_relative_eq!(step.observation[FIXATION], 1.0);
    }

    #[test]
    fn test_evidence_favours_target() {
        let mut task = RdmTask::new(RdmConfig {
            input_noise: 0.0,
            ..RdmConfig::default()
        })
        .unwrap();
        let mut rng = seeded(0);
        let trial = trial(Side::Right, 51.2);

        // Time index 3 is the first stimulus step
        let step = task.get_step(&mut rng, 10.0, &trial, 3, FIXATE).unwrap();
        assert_relative_eq!(step.observation[RIGHT], RdmTask::scale(51.2));
        assert_relative_eq!(step.observation[LEFT], RdmTask::scale(-51.2));
        assert!(step.observation[RIGHT] > step.observation[LEFT]);

        // Fixation cue goes off in the decision epoch
        let step = task.get_step(&mut rng, 10.0, &trial, 5, FIXATE).unwrap();
        assert_relative_eq!(step.observation.sum(), 0.0);
    }

    #[test]
    fn test_decision_is_scored() {
        let mut task = RdmTask::default();
        let mut rng = seeded(0);
        let trial = trial(Side::Right, 6.4);

        // Holding fixation in the decision epoch keeps the trial going
        let step = task.get_step(&mut rng, 10.0, &trial, 6, FIXATE).unwrap();
        assert!(step.status.continues());

        let step = task.get_step(&mut rng, 10.0, &trial, 6, CHOOSE_RIGHT).unwrap();
        assert!(step.status.correct);
        assert_eq!(step.status.t_choice, Some(5));
        assert_relative_eq!(step.reward, 1.0);

        let step = task.get_step(&mut rng, 10.0, &trial, 6, CHOOSE_LEFT).unwrap();
        assert!(!step.status.continues());
        assert!(!step.status.correct);
        assert_relative_eq!(step.reward, 0.0);
    }

    #[test]
    fn test_conditions_cover_both_sides() {
        let mut task = RdmTask::default();
        let mut rng = seeded(4);
        let trials: Vec<_> = (0..50)
            .map(|_| task.get_condition(&mut rng, 10.0).unwrap())
            .collect();

        assert!(trials.iter().any(|t| t.target == Side::Left));
        assert!(trials.iter().any(|t| t.target == Side::Right));
        assert!(trials.iter().all(|t| COHERENCES.contains(&t.coherence)));
        assert_relative_eq!(trials[0].decision.end, RdmConfig::default().tmax());
    }

    #[test]
    fn test_empty_coherences_rejected() {
        let config = RdmConfig {
            coherences: vec![],
            ..RdmConfig::default()
        };
        assert!(matches!(RdmTask::new(config), Err(PgError::Task(_))));
    }
}
