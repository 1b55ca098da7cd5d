//! Checkpoint persistence
//!
//! Checkpoints are bincode-encoded and gzip-compressed. A save writes a sibling
//! temporary file, syncs it and renames it over the target, so a reader never
//! sees a half-written checkpoint.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use rnnpg_core::{Checkpoint, PgError, Result};

/// Storage backend for training checkpoints
#[async_trait]
pub trait CheckpointStore<P>: Send + Sync
where
    P: Serialize + DeserializeOwned + Send + Sync,
{
    /// Persist a checkpoint, replacing any previous one
    async fn save(&self, checkpoint: &Checkpoint<P>) -> Result<()>;

    /// Load the last persisted checkpoint, if there is one
    async fn load(&self) -> Result<Option<Checkpoint<P>>>;
}

/// Checkpoint store backed by a single file
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    /// Store checkpoints at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Target file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Encode and compress a checkpoint
    pub fn encode<P: Serialize>(checkpoint: &Checkpoint<P>) -> Result<Vec<u8>> {
        let data = bincode::serialize(checkpoint)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&data)?;
        Ok(encoder.finish()?)
    }

    /// Decompress and decode a checkpoint
    pub fn decode<P: DeserializeOwned>(compressed: &[u8]) -> Result<Checkpoint<P>> {
        let mut decoder = GzDecoder::new(compressed);
        let mut data = Vec::new();
        decoder
            .read_to_end(&mut data)
            .map_err(|e| PgError::Checkpoint(format!("corrupt checkpoint: {e}")))?;
        Ok(bincode::deserialize(&data)?)
    }
}

#[async_trait]
impl<P> CheckpointStore<P> for FileCheckpointStore
where
    P: Serialize + DeserializeOwned + Send + Sync,
{
    async fn save(&self, checkpoint: &Checkpoint<P>) -> Result<()> {
        let compressed = Self::encode(checkpoint)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let temp = self.temp_path();
        let mut file = fs::File::create(&temp).await?;
        file.write_all(&compressed).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp, &self.path).await?;

        debug!(
            "Saved checkpoint for iteration {} to {:?} ({} bytes)",
            checkpoint.iter,
            self.path,
            compressed.len()
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<Checkpoint<P>>> {
        let compressed = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint = Self::decode(&compressed)?;
        info!(
            "Loaded checkpoint for iteration {} from {:?}",
            checkpoint.iter, self.path
        );
        Ok(Some(checkpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use ndarray::{arr1, ArrayD, IxDyn};
    use rnnpg_core::rng::seeded;
    use rnnpg_core::{
        AdamState, Carryover, Config, HistoryRecord, NetworkConfig, NetworkState, NetworkType,
        OutputActivation, Params,
    };

    fn network_config(n_in: usize, n_out: usize, f_out: OutputActivation) -> NetworkConfig {
        NetworkConfig {
            network_type: NetworkType::Gru,
            n_in,
            n_hidden: 2,
            n_out,
            f_out,
            fix: vec![],
            l2_r: 0.0,
            l1_wrec: 0.0,
            l2_wrec: 0.0,
            lambda_omega: 2.0,
            alpha: 0.1,
            p0: 1.0,
            rho: 1.5,
            win: 1.0,
            win_mask: None,
            seed: 1,
        }
    }

    fn params(value: f64) -> Params {
        let mut params = IndexMap::new();
        params.insert(
            "Wrec".to_string(),
            ArrayD::from_elem(IxDyn(&[2, 2]), value),
        );
        params.insert("x0".to_string(), ArrayD::from_elem(IxDyn(&[2]), 0.1));
        params
    }

    fn checkpoint() -> Checkpoint<Vec<usize>> {
        let config = Config::from_value(serde_json::json!({
            "inputs": ["FIXATION", "LEFT"],
            "actions": ["FIXATE", "CHOOSE"],
            "tmax": 30.0,
            "n_gradient": 4,
            "n_validation": 2,
        }))
        .unwrap();

        let mut rng = seeded(11);
        let _ = rand::Rng::gen::<f64>(&mut rng);

        Checkpoint {
            iter: 7,
            config,
            policy_config: network_config(2, 2, OutputActivation::Softmax),
            baseline_config: network_config(4, 1, OutputActivation::Linear),
            current_policy_params: params(0.5),
            current_baseline_params: params(-0.5),
            best_iter: None,
            best_reward: f64::NEG_INFINITY,
            best_perf: None,
            best_policy_params: params(0.25),
            best_baseline_params: params(-0.25),
            rng_state: rng,
            carry: Some(Carryover {
                policy: NetworkState {
                    output: arr1(&[0.4, 0.6]),
                    state: arr1(&[0.1, -0.2]),
                },
                baseline: NetworkState {
                    output: arr1(&[0.3]),
                    state: arr1(&[0.0, 0.5]),
                },
            }),
            perf: Some(vec![1, 2, 3]),
            training_history: vec![HistoryRecord {
                iter: 5,
                mean_reward: 0.5,
                n_trials: 20,
                perf: vec![4],
                new_best: true,
                timestamp: chrono::Utc::now(),
            }],
            trials_tot: 28,
            policy_optimizer: AdamState::default(),
            baseline_optimizer: AdamState {
                step: 3,
                first_moment: params(0.01),
                second_moment: params(0.001),
            },
        }
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("run").join("model.ckpt"));
        let saved = checkpoint();

        store.save(&saved).await.unwrap();
        let loaded: Checkpoint<Vec<usize>> = store.load().await.unwrap().unwrap();

        assert_eq!(loaded.iter, saved.iter);
        assert_eq!(loaded.config, saved.config);
        assert_eq!(loaded.policy_config, saved.policy_config);
        assert_eq!(loaded.current_policy_params, saved.current_policy_params);
        assert_eq!(loaded.best_baseline_params, saved.best_baseline_params);
        assert_eq!(loaded.best_iter, None);
        assert!(loaded.best_reward.is_infinite() && loaded.best_reward < 0.0);
        assert_eq!(loaded.rng_state, saved.rng_state);
        assert_eq!(loaded.carry, saved.carry);
        assert_eq!(loaded.perf, saved.perf);
        assert_eq!(loaded.training_history.len(), 1);
        assert_eq!(loaded.training_history[0].timestamp, saved.training_history[0].timestamp);
        assert_eq!(loaded.trials_tot, 28);
        assert_eq!(loaded.baseline_optimizer, saved.baseline_optimizer);
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_missing_file_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("absent.ckpt"));
        let loaded: Option<Checkpoint<Vec<usize>>> = store.load().await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ckpt");
        tokio::fs::write(&path, b"not a checkpoint").await.unwrap();
        let store = FileCheckpointStore::new(path);
        let loaded: Result<Option<Checkpoint<Vec<usize>>>> = store.load().await;
        assert!(loaded.is_err());
    }

    #[tokio::test]
    async fn test_save_overwrites_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("model.ckpt"));
        let mut saved = checkpoint();
        store.save(&saved).await.unwrap();
        saved.iter = 9;
        store.save(&saved).await.unwrap();

        let loaded: Checkpoint<Vec<usize>> = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.iter, 9);
    }
}
