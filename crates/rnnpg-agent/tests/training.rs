//! End-to-end training scenarios

use indexmap::IndexMap;
use ndarray::{s, Array1};
use rand::Rng;
use serde::{Deserialize, Serialize};

use rnnpg_agent::prelude::*;
use rnnpg_core::Params;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
enum Outcome {
    Running,
    Done { correct: bool },
    Aborted,
}

impl TrialStatus for Outcome {
    fn continues(&self) -> bool {
        *self == Outcome::Running
    }

    fn horizon_exhausted() -> Self {
        Outcome::Aborted
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tally {
    trials: usize,
    correct: usize,
    aborted: usize,
}

impl Performance<usize, Outcome> for Tally {
    fn update(&mut self, _trial: &usize, status: &Outcome) {
        self.trials += 1;
        match status {
            Outcome::Done { correct: true } => self.correct += 1,
            Outcome::Aborted => self.aborted += 1,
            _ => {}
        }
    }

    fn summary(&self) -> IndexMap<String, String> {
        let mut items = IndexMap::new();
        items.insert("Trials".to_string(), self.trials.to_string());
        items.insert("Correct".to_string(), self.correct.to_string());
        items
    }
}

/// Shows a cue for `duration - 1` steps, then scores the next action against it
#[derive(Debug, Clone)]
struct Cued {
    duration: usize,
    min_correct: Option<usize>,
}

impl Cued {
    fn new(duration: usize) -> Self {
        Self {
            duration,
            min_correct: None,
        }
    }
}

impl Task for Cued {
    type Trial = usize;
    type Status = Outcome;
    type Performance = Tally;

    fn inputs(&self) -> Vec<String> {
        vec!["CUE-A".to_string(), "CUE-B".to_string()]
    }

    fn actions(&self) -> Vec<String> {
        vec!["A".to_string(), "B".to_string()]
    }

    fn get_condition(&mut self, rng: &mut TrainRng, _dt: f64) -> Result<usize> {
        Ok(rng.gen_range(0..2))
    }

    fn get_step(
        &mut self,
        _rng: &mut TrainRng,
        _dt: f64,
        trial: &usize,
        t: usize,
        action: usize,
    ) -> Result<Step<Outcome>> {
        let mut observation = Array1::zeros(2);
        if t < self.duration {
            observation[*trial] = 1.0;
            return Ok(Step {
                observation,
                reward: 0.0,
                status: Outcome::Running,
            });
        }
        let correct = action == *trial;
        Ok(Step {
            observation,
            reward: if correct { 1.0 } else { 0.0 },
            status: Outcome::Done { correct },
        })
    }

    fn new_performance(&self) -> Tally {
        Tally::default()
    }

    fn terminate(&self, best: Option<&Tally>) -> bool {
        match (self.min_correct, best) {
            (Some(k), Some(perf)) => perf.correct >= k,
            _ => false,
        }
    }
}

fn config(tmax: f64, overrides: serde_json::Value) -> Config {
    let mut value = serde_json::json!({
        "inputs": ["CUE-A", "CUE-B"],
        "actions": ["A", "B"],
        "tmax": tmax,
        "n_gradient": 4,
        "n_validation": 2,
        "N": 5,
        "dt": 10.0,
        "tau": 50.0,
        "max_iter": 1,
        "checkfreq": 1,
    });
    if let (Some(target), Some(extra)) = (value.as_object_mut(), overrides.as_object()) {
        for (key, v) in extra {
            target.insert(key.clone(), v.clone());
        }
    }
    Config::from_value(value).unwrap()
}

fn assert_params_eq(a: &Params, b: &Params) {
    assert_eq!(a.keys().collect::<Vec<_>>(), b.keys().collect::<Vec<_>>());
    for (name, value) in a {
        assert_eq!(value, &b[name], "parameter {name} differs");
    }
}

#[tokio::test]
async fn test_single_iteration_with_three_steps() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path().join("model.ckpt"));
    let mut pg = PolicyGradient::new(Cued::new(10), config(20.0, serde_json::json!({})), 3, None)
        .unwrap();
    assert_eq!(pg.horizon(), 3);

    let summary = pg
        .train(&store, false, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.outcome, TrainingOutcome::MaxIterReached);
    assert_eq!(summary.iterations, 1);
    assert_eq!(summary.policy_grad_norms.len(), 1);
    assert_eq!(summary.baseline_grad_norms.len(), 1);

    let batch = summary.last_batch.unwrap();
    assert_eq!(batch.rewards.dim(), (3, 4));
    assert_eq!(batch.inputs.dim(), (3, 4, 2));
    assert_eq!(batch.noise.dim(), (3, 4, 5));
    assert_eq!(batch.policy_rates.as_ref().unwrap().dim(), (3, 4, 5));
    assert!(batch.mask.iter().all(|&m| m == 1.0));
    // Every trial outlasts the horizon and is aborted on the last step
    assert!(batch.rewards.row(2).iter().all(|&r| r == -1.0));
    assert!(batch.rewards.slice(s![..2, ..]).iter().all(|&r| r == 0.0));

    let checkpoint: Checkpoint<Tally> = store.load().await.unwrap().unwrap();
    assert_eq!(checkpoint.iter, 0);
    assert_eq!(checkpoint.trials_tot, 0);
    assert_eq!(checkpoint.best_iter, Some(0));
    approx::assert_relative_eq!(checkpoint.best_reward, -1.0);
    assert_eq!(checkpoint.training_history.len(), 1);
    assert!(checkpoint.training_history[0].new_best);
    assert_eq!(checkpoint.training_history[0].perf.aborted, 2);

    // The checkpoint precedes the update
    assert_ne!(checkpoint.current_baseline_params, pg.baseline().get_values());
}

#[tokio::test]
async fn test_trials_that_stop_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path().join("model.ckpt"));
    let mut pg = PolicyGradient::new(
        Cued::new(1),
        config(50.0, serde_json::json!({ "max_iter": 2 })),
        5,
        None,
    )
    .unwrap();

    let summary = pg
        .train(&store, false, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.outcome, TrainingOutcome::MaxIterReached);
    assert_eq!(summary.iterations, 2);
    let batch = summary.last_batch.unwrap();
    assert_eq!(batch.horizon(), 6);
    assert_eq!(batch.valid_steps(), vec![1; 4]);
    assert!(batch.rewards.slice(s![1.., ..]).iter().all(|&r| r == 0.0));
    assert!(batch.actions.slice(s![1.., .., ..]).iter().all(|&a| a == 0.0));
    assert!(summary.policy_grad_norms.iter().all(|n| n.is_finite()));

    let checkpoint: Checkpoint<Tally> = store.load().await.unwrap().unwrap();
    assert_eq!(checkpoint.iter, 1);
    assert_eq!(checkpoint.trials_tot, 4);
    assert_eq!(checkpoint.perf.unwrap().trials, 4);
}

#[tokio::test]
async fn test_target_reward_stops_training() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path().join("model.ckpt"));
    let mut pg = PolicyGradient::new(
        Cued::new(10),
        config(20.0, serde_json::json!({ "max_iter": 50, "target_reward": -1.0 })),
        3,
        None,
    )
    .unwrap();

    let summary = pg
        .train(&store, false, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.outcome, TrainingOutcome::TargetReached { iter: 0 });
    assert_eq!(summary.iterations, 0);
    let checkpoint: Checkpoint<Tally> = store.load().await.unwrap().unwrap();
    assert_eq!(checkpoint.iter, 0);
}

#[tokio::test]
async fn test_task_termination_rule() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path().join("model.ckpt"));
    let task = Cued {
        duration: 1,
        min_correct: Some(0),
    };
    let mut pg = PolicyGradient::new(
        task,
        config(30.0, serde_json::json!({ "max_iter": 10, "checkfreq": 3 })),
        3,
        None,
    )
    .unwrap();

    let summary = pg
        .train(&store, false, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.outcome, TrainingOutcome::TerminationCriterion { iter: 0 });
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path().join("model.ckpt"));
    let mut pg = PolicyGradient::new(Cued::new(2), config(30.0, serde_json::json!({})), 3, None)
        .unwrap();
    let token = CancellationToken::new();
    token.cancel();

    let summary = pg.train(&store, false, &token).await.unwrap();

    assert_eq!(summary.outcome, TrainingOutcome::Interrupted { iter: 0 });
    assert_eq!(summary.iterations, 0);
    let loaded: Option<Checkpoint<Tally>> = store.load().await.unwrap();
    assert!(loaded.is_none());
}

#[tokio::test]
async fn test_resume_reproduces_uninterrupted_run() {
    let overrides = |max_iter: usize| {
        serde_json::json!({ "max_iter": max_iter, "checkfreq": 2, "network_type": "simple" })
    };
    let dir = tempfile::tempdir().unwrap();

    let store_a = FileCheckpointStore::new(dir.path().join("a.ckpt"));
    let mut uninterrupted =
        PolicyGradient::new(Cued::new(3), config(40.0, overrides(4)), 7, None).unwrap();
    uninterrupted
        .train(&store_a, false, &CancellationToken::new())
        .await
        .unwrap();

    // Stops after the checkpoint at iteration 2
    let store_b = FileCheckpointStore::new(dir.path().join("b.ckpt"));
    let mut first_leg =
        PolicyGradient::new(Cued::new(3), config(40.0, overrides(3)), 7, None).unwrap();
    first_leg
        .train(&store_b, false, &CancellationToken::new())
        .await
        .unwrap();

    let mut resumed =
        PolicyGradient::new(Cued::new(3), config(40.0, overrides(4)), 99, None).unwrap();
    let summary = resumed
        .train(&store_b, true, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.iterations, 2);
    assert_params_eq(
        &resumed.policy().get_values(),
        &uninterrupted.policy().get_values(),
    );
    assert_params_eq(
        &resumed.baseline().get_values(),
        &uninterrupted.baseline().get_values(),
    );
}

#[tokio::test]
async fn test_recover_without_checkpoint_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path().join("missing.ckpt"));
    let mut pg = PolicyGradient::new(Cued::new(2), config(30.0, serde_json::json!({})), 3, None)
        .unwrap();

    let result = pg.train(&store, true, &CancellationToken::new()).await;
    assert!(matches!(result, Err(PgError::Checkpoint(_))));
}

#[tokio::test]
async fn test_load_best_and_current_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path().join("model.ckpt"));
    let mut pg = PolicyGradient::new(
        Cued::new(2),
        config(30.0, serde_json::json!({ "max_iter": 3 })),
        11,
        None,
    )
    .unwrap();
    pg.train(&store, false, &CancellationToken::new())
        .await
        .unwrap();
    let checkpoint: Checkpoint<Tally> = store.load().await.unwrap().unwrap();
    assert_eq!(checkpoint.iter, 2);

    let current = PolicyGradient::from_checkpoint(
        Cued::new(2),
        checkpoint.clone(),
        0,
        None,
        LoadMode::Current,
    )
    .unwrap();
    assert_params_eq(&current.policy().get_values(), &checkpoint.current_policy_params);
    assert_params_eq(&current.baseline().get_values(), &checkpoint.current_baseline_params);

    let best = PolicyGradient::from_checkpoint(
        Cued::new(2),
        checkpoint.clone(),
        0,
        Some(5.0),
        "best".parse().unwrap(),
    )
    .unwrap();
    assert_params_eq(&best.policy().get_values(), &checkpoint.best_policy_params);
    approx::assert_relative_eq!(best.policy().config().alpha, 0.1);
    approx::assert_relative_eq!(best.dt(), 5.0);

    let summary = best.summary().unwrap();
    assert_eq!(summary["Last saved after"], "2 iterations");
    assert!(summary.contains_key("Best reward"));
    let best_perf = checkpoint.best_perf.as_ref().unwrap();
    assert_eq!(summary["Trials"], best_perf.summary()["Trials"]);
}

#[tokio::test]
async fn test_continuous_mode_carries_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path().join("model.ckpt"));
    let mut pg = PolicyGradient::new(
        Cued::new(2),
        config(
            30.0,
            serde_json::json!({ "max_iter": 2, "mode": "continuous", "network_type": "simple" }),
        ),
        13,
        None,
    )
    .unwrap();

    let summary = pg
        .train(&store, false, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.iterations, 2);

    let checkpoint: Checkpoint<Tally> = store.load().await.unwrap().unwrap();
    assert_eq!(checkpoint.iter, 1);
    let carry = checkpoint.carry.unwrap();
    assert_eq!(carry.policy.state.len(), 5);
    assert_eq!(carry.baseline.output.len(), 1);
}

#[test]
fn test_task_and_config_must_agree() {
    let mismatched = config(
        30.0,
        serde_json::json!({ "actions": ["A", "B", "C"] }),
    );
    assert!(matches!(
        PolicyGradient::new(Cued::new(2), mismatched, 1, None),
        Err(PgError::DimensionMismatch { .. })
    ));
}
