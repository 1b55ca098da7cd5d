//! Shared random number generation
//!
//! One [`TrainRng`] drives trial generation, recurrent noise, action sampling
//! and task randomness. Its state is serializable so a resumed run continues
//! the exact stream.

use ndarray::{Array3, ArrayView1};
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::{PgError, Result};

/// Generator used for everything stochastic during training
pub type TrainRng = rand_chacha::ChaCha8Rng;

/// Create a generator from a seed
#[must_use]
pub fn seeded(seed: u64) -> TrainRng {
    TrainRng::seed_from_u64(seed)
}

/// Gaussian noise of shape `(time, trials, dim)` with the given variance
///
/// Draws happen in row-major order. A zero variance or an empty shape returns
/// zeros without touching the generator.
pub fn gaussian_noise(
    rng: &mut TrainRng,
    shape: (usize, usize, usize),
    variance: f64,
) -> Array3<f64> {
    let mut noise = Array3::zeros(shape);
    if variance <= 0.0 || noise.is_empty() {
        return noise;
    }

    let std = variance.sqrt();
    for value in &mut noise {
        let draw: f64 = rng.sample(StandardNormal);
        *value = std * draw;
    }
    noise
}

/// Sample an index from unnormalized non-negative weights
///
/// The weights are normalized to a categorical distribution and inverted with a
/// single uniform draw.
pub fn sample_categorical(rng: &mut TrainRng, weights: ArrayView1<f64>) -> Result<usize> {
    let total: f64 = weights.sum();
    if !(total.is_finite() && total > 0.0) {
        return Err(PgError::Network(format!(
            "cannot sample from policy output with total mass {total}"
        )));
    }

    let u: f64 = rng.gen();
    let mut cumsum = 0.0;
    for (i, &w) in weights.iter().enumerate() {
        cumsum += w / total;
        if u < cumsum {
            return Ok(i);
        }
    }

    // Rounding can leave the cumulative sum just below one
    Ok(weights
        .iter()
        .rposition(|&w| w > 0.0)
        .unwrap_or(weights.len() - 1))
}
