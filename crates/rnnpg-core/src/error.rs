//! Error types for the policy-gradient core

use thiserror::Error;

/// Core error type for training operations
#[derive(Error, Debug)]
pub enum PgError {
    /// A required configuration key is absent
    #[error("Missing required configuration key: {0}")]
    MissingConfigKey(String),

    /// Configuration present but unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unrecognized checkpoint load-mode selector
    #[error("Unknown load mode: {0} (expected \"best\" or \"current\")")]
    UnknownLoadMode(String),

    /// Unrecognized network-type key
    #[error("Unknown network type: {0}")]
    UnknownNetworkType(String),

    /// Unrecognized execution mode
    #[error("Unknown execution mode: {0} (expected \"episodic\" or \"continuous\")")]
    UnknownMode(String),

    /// Dimension mismatch
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Network-related errors
    #[error("Network error: {0}")]
    Network(String),

    /// Task-related errors
    #[error("Task error: {0}")]
    Task(String),

    /// Optimizer-related errors
    #[error("Optimizer error: {0}")]
    Optimizer(String),

    /// Checkpoint persistence errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Array shape error
    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary encoding error
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for training operations
pub type Result<T> = std::result::Result<T, PgError>;
