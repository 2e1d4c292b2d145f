use thiserror::Error;

use crate::types::EngineKind;

#[derive(Debug, Error)]
pub enum LatticeError {
    // Partition errors
    #[error("Invalid DAG: {0}")]
    PartitionInput(String),

    // Engine errors
    #[error("Engine launch failed: {engine}: {message}")]
    EngineLaunch { engine: EngineKind, message: String },

    #[error("Segment {segment} failed on {engine} engine: {message}")]
    EngineDispatch {
        engine: EngineKind,
        segment: usize,
        message: String,
    },

    #[error("Segment {segment} timed out on {engine} engine after {timeout_secs}s")]
    DispatchTimeout {
        engine: EngineKind,
        segment: usize,
        timeout_secs: u64,
    },

    #[error("No {0} engine available")]
    EngineUnavailable(EngineKind),

    // Registry errors
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    // Session errors
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    // Job errors
    #[error("Job execution failed: {0}")]
    JobExecution(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidJobTransition { id: String, from: String, to: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LatticeError {
    /// Engine a request-level failure is attributed to, if any.
    pub fn engine(&self) -> Option<EngineKind> {
        match self {
            Self::EngineLaunch { engine, .. }
            | Self::EngineDispatch { engine, .. }
            | Self::DispatchTimeout { engine, .. } => Some(*engine),
            Self::EngineUnavailable(engine) => Some(*engine),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LatticeError>;
