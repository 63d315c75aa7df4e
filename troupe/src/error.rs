//! Error types for the troupe runtime.
//!
//! Two taxonomies cover the whole crate: [`Error`] for everything an agent,
//! workflow, or runner can surface, and [`ToolError`] for failures raised
//! inside tool execution. [`ToolError::InterruptAndRerun`] is a sentinel, not
//! a failure: engines that see it suspend the current run and re-execute the
//! originating tool call on resume.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for agent operations.
///
/// Errors are cheap to clone and serializable, so they can ride inside
/// events that are mirrored into the session log and checkpointed.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Error {
    /// The chat model call failed.
    #[error("model error: {message}")]
    Model {
        /// The underlying error message.
        message: String,
    },

    /// A tool invocation failed.
    #[error("tool '{tool_name}' failed: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool_name: String,
        /// The underlying error message.
        message: String,
    },

    /// Invalid configuration, or mutation of a frozen agent.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration issue.
        message: String,
    },

    /// The reasoning loop ran past its iteration cap.
    #[error("exceeded max iterations")]
    MaxIterations,

    /// A transfer named an agent that is neither a child nor the parent.
    #[error("transfer failed: agent '{dest}' not found when transferring from '{from}'")]
    TransferFailed {
        /// The requested destination agent name.
        dest: String,
        /// The agent that attempted the transfer.
        from: String,
    },

    /// `resume` was called on a runner without a checkpoint store.
    #[error("failed to resume: store is nil")]
    ResumeStoreMissing,

    /// No checkpoint was stored under the given id.
    #[error("checkpoint[{id}] is not existed")]
    CheckpointNotFound {
        /// The requested checkpoint id.
        id: String,
    },

    /// An interrupt occurred but its payload could not be located.
    #[error("interrupt has happened, but cannot find interrupt info")]
    MissingInterruptInfo,

    /// Message chunks could not be concatenated.
    #[error("cannot concat messages: {message}")]
    MessageConcat {
        /// What did not line up between the chunks.
        message: String,
    },

    /// The ambient context was cancelled.
    #[error("run cancelled")]
    Cancelled,

    /// JSON serialization or deserialization failed.
    #[error("json error: {message}")]
    Json {
        /// The underlying error message.
        message: String,
    },

    /// A background producer panicked.
    #[error("panic in {location}: {message}")]
    Panic {
        /// Which producer panicked.
        location: String,
        /// The captured panic payload, rendered as text.
        message: String,
    },

    /// Generic internal error.
    #[error("internal error: {message}")]
    Internal {
        /// The underlying error message.
        message: String,
    },
}

impl Error {
    /// Create a new model error.
    #[must_use]
    pub fn model(message: impl Into<String>) -> Self {
        Self::Model {
            message: message.into(),
        }
    }

    /// Create a new tool execution error.
    #[must_use]
    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Create a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new transfer resolution error.
    #[must_use]
    pub fn transfer_failed(dest: impl Into<String>, from: impl Into<String>) -> Self {
        Self::TransferFailed {
            dest: dest.into(),
            from: from.into(),
        }
    }

    /// Create a new message concatenation error.
    #[must_use]
    pub fn concat(message: impl Into<String>) -> Self {
        Self::MessageConcat {
            message: message.into(),
        }
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Build a panic error from a payload captured by `catch_unwind` or a
    /// crashed task.
    #[must_use]
    pub fn from_panic(location: &str, payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_owned());
        Self::Panic {
            location: location.to_owned(),
            message,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

/// A type alias for `Result<T, ToolError>`.
pub type ToolResult<T> = std::result::Result<T, ToolError>;

/// Errors raised by tool execution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ToolError {
    /// Sentinel: the tool wants the enclosing run suspended and this call
    /// re-executed on resume. Engines translate it into an interrupt; it is
    /// never shown to the user as a failure.
    #[error("interrupt and rerun")]
    InterruptAndRerun,

    /// The tool ran and failed.
    #[error("execution failed: {message}")]
    Execution {
        /// The underlying error message.
        message: String,
    },

    /// The argument JSON did not match the tool's schema.
    #[error("invalid arguments: {message}")]
    InvalidArguments {
        /// The parsing error message.
        message: String,
    },

    /// The requested tool is not registered.
    #[error("tool '{name}' not found")]
    NotFound {
        /// The requested tool name.
        name: String,
    },
}

impl ToolError {
    /// Create a new execution error.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Create a new invalid-arguments error.
    #[must_use]
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            message: message.into(),
        }
    }

    /// Whether this is the interrupt sentinel rather than a real failure.
    #[must_use]
    pub const fn is_interrupt(&self) -> bool {
        matches!(self, Self::InterruptAndRerun)
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArguments {
            message: err.to_string(),
        }
    }
}
