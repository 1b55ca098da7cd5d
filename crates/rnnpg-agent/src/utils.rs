//! Utility functions and helpers for the trainer

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wall-clock time since `start`, formatted as `H:MM:SS`
#[must_use]
pub fn elapsed_since(start: DateTime<Utc>) -> String {
    format_duration(Utc::now() - start)
}

fn format_duration(duration: chrono::Duration) -> String {
    let total = duration.num_seconds().max(0);
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

/// Count, minimum, maximum and mean of a set of gradient norms
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormSummary {
    /// Number of norms
    pub count: usize,
    /// Smallest norm
    pub min: f64,
    /// Largest norm
    pub max: f64,
    /// Mean norm
    pub mean: f64,
}

impl fmt::Display for NormSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {:.6}, {:.6}, {:.6}]",
            self.count, self.min, self.max, self.mean
        )
    }
}

/// Gradient norms collected between checkpoint reports
///
/// Only finite norms are kept.
#[derive(Debug, Clone, Default)]
pub struct GradNormLog {
    norms: Vec<f64>,
}

impl GradNormLog {
    /// Create an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a norm, ignoring non-finite values
    pub fn push(&mut self, norm: f64) {
        if norm.is_finite() {
            self.norms.push(norm);
        }
    }

    /// Number of recorded norms
    #[must_use]
    pub fn len(&self) -> usize {
        self.norms.len()
    }

    /// Whether nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.norms.is_empty()
    }

    /// Recorded norms in insertion order
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.norms
    }

    /// Summary of the recorded norms, if any
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn summary(&self) -> Option<NormSummary> {
        if self.norms.is_empty() {
            return None;
        }
        let min = self.norms.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self.norms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = self.norms.iter().sum::<f64>() / self.norms.len() as f64;
        Some(NormSummary {
            count: self.norms.len(),
            min,
            max,
            mean,
        })
    }

    /// Summarize and clear
    pub fn take_summary(&mut self) -> Option<NormSummary> {
        let summary = self.summary();
        self.norms.clear();
        summary
    }
}
