//! Error types for routenet

use thiserror::Error;

/// Main error type for routenet
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Invalid action {action}: layer has {choices} choices")]
    InvalidAction { action: usize, choices: usize },

    #[error("Unsupported layer: {0}")]
    UnsupportedLayer(String),

    #[error("Model has no routing/module parameter split: {0}")]
    MissingParameterSplit(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RoutingError {
    /// Shape error built from an expected/actual pair
    pub fn shape(context: &str, expected: impl std::fmt::Debug, actual: impl std::fmt::Debug) -> Self {
        RoutingError::Shape(format!("{context}: expected {expected:?}, got {actual:?}"))
    }
}

impl From<ndarray::ShapeError> for RoutingError {
    fn from(e: ndarray::ShapeError) -> Self {
        RoutingError::Shape(e.to_string())
    }
}

/// Result type alias for routenet operations
pub type Result<T> = std::result::Result<T, RoutingError>;
