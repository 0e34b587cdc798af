//! Error types for the equivex-ml crate.

use thiserror::Error;

/// Top-level error type for explanation and robustness operations.
#[derive(Debug, Error)]
pub enum XaiError {
    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Symmetry error: {0}")]
    Symmetry(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Autograd error: {0}")]
    Autograd(String),

    #[error("Hook error: {0}")]
    Hook(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl XaiError {
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    pub fn cache(msg: impl Into<String>) -> Self {
        Self::Cache(msg.into())
    }

    pub fn symmetry(msg: impl Into<String>) -> Self {
        Self::Symmetry(msg.into())
    }

    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn autograd(msg: impl Into<String>) -> Self {
        Self::Autograd(msg.into())
    }

    pub fn hook(msg: impl Into<String>) -> Self {
        Self::Hook(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

impl From<Box<figment::Error>> for XaiError {
    fn from(err: Box<figment::Error>) -> Self {
        Self::Config(err.to_string())
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, XaiError>;
