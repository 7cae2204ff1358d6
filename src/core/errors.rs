// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the supervisor.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum FleetdError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Transport error while contacting '{peer}': {reason}")]
    Transport { peer: String, reason: String },

    #[error("Unknown address '{0}'")]
    UnknownAddress(String),

    #[error("Unknown process '{0}'")]
    UnknownProcess(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No resource available for '{0}'")]
    NoResource(String),

    #[error("Operation not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for FleetdError {
    fn from(e: std::io::Error) -> Self {
        FleetdError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for FleetdError {
    fn from(e: serde_json::Error) -> Self {
        FleetdError::Serialization(e.to_string())
    }
}
