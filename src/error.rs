//! Error Types
//!
//! Run-level errors returned to callers of the engine, and the per-node
//! failure signal the dispatcher hands back to the run loop.

use thiserror::Error;

use crate::ports::generation::GenerationError;
use crate::text::response::ParseError;
use crate::text::template::TemplateError;

/// Errors that stop a run from starting or end it.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Checked before a run starts; the run never begins
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("workflow '{0}' is running")]
    AlreadyRunning(String),

    #[error("start position {index} is out of range for {len} nodes")]
    StartOutOfRange { index: usize, len: usize },

    /// A node failed; resuming retries the same position
    #[error("node '{node_id}' at position {index} failed: {message}")]
    NodeFailed {
        node_id: String,
        index: usize,
        message: String,
    },
}

/// Why a node did not finish.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeFailure {
    /// The run's token fired; the run pauses
    #[error("cancelled")]
    Cancelled,

    /// A newer run took over; results are discarded
    #[error("superseded by a newer run")]
    Stale,

    #[error("{0}")]
    Fatal(String),
}

impl NodeFailure {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }
}

impl From<GenerationError> for NodeFailure {
    fn from(error: GenerationError) -> Self {
        match error {
            GenerationError::Aborted => Self::Cancelled,
            other => Self::Fatal(other.to_string()),
        }
    }
}

impl From<ParseError> for NodeFailure {
    fn from(error: ParseError) -> Self {
        Self::Fatal(error.to_string())
    }
}

impl From<TemplateError> for NodeFailure {
    fn from(error: TemplateError) -> Self {
        Self::Fatal(error.to_string())
    }
}
