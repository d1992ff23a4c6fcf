use thiserror::Error;

use crate::engine::EngineError;

/// An engine call, timeout, interruption or agent failure surfaced at the
/// machine/bootstrap boundary.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct InfrastructureError {
    message: String,
    #[source]
    source: Option<EngineError>,
}

impl InfrastructureError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(message: impl Into<String>, source: EngineError) -> Self {
        Self {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn engine_error(&self) -> Option<&EngineError> {
        self.source.as_ref()
    }
}

impl From<EngineError> for InfrastructureError {
    fn from(err: EngineError) -> Self {
        Self::with_source(err.to_string(), err)
    }
}

/// Commit, push or interruption failure while snapshotting a machine.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SnapshotError {
    message: String,
    #[source]
    source: Option<EngineError>,
}

impl SnapshotError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn engine_error(&self) -> Option<&EngineError> {
        self.source.as_ref()
    }
}

impl From<EngineError> for SnapshotError {
    fn from(err: EngineError) -> Self {
        Self {
            message: err.to_string(),
            source: Some(err),
        }
    }
}
