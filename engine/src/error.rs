//! Error types for the generation engine.

use thiserror::Error;

use crate::unit::{UnitId, UnitStatus};

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned synchronously by engine operations.
///
/// Stream failures never show up here: they end up as the affected unit's
/// `error` status instead.
#[derive(Error, Debug)]
pub enum EngineError {
    /// No unit with this id is known to the store.
    #[error("content unit not found: {0}")]
    UnitNotFound(UnitId),

    /// A unit with this id already exists.
    #[error("content unit already exists: {0}")]
    DuplicateUnit(UnitId),

    /// The unit has a change awaiting the author's decision.
    #[error("content unit {0} has a change awaiting approval")]
    DecisionConflict(UnitId),

    /// Approve/reject was requested for a unit without a proposal.
    #[error("content unit {0} has no pending change")]
    NoPendingChange(UnitId),

    /// An orchestration run is still active for the unit.
    #[error("content unit {0} is still being generated")]
    RunInProgress(UnitId),

    /// The operation is not valid in the unit's current status.
    #[error("cannot {operation} content unit {id} in status {status}")]
    InvalidState {
        id: UnitId,
        status: UnitStatus,
        operation: &'static str,
    },

    /// Backend or repository failure.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed.
    #[error("invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors talking to the generation backend or the course repository.
#[derive(Error, Debug)]
pub enum BackendError {
    /// HTTP transport error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    /// No response or chunk arrived within the idle timeout.
    #[error("no data received for {0:?}")]
    Timeout(std::time::Duration),

    /// The byte stream failed for another reason.
    #[error("stream error: {0}")]
    Stream(String),

    /// Invalid response body.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}
