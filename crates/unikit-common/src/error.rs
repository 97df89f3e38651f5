//! Unified error types for the unikit workspace.
//!
//! Variants are ordered roughly by severity: user input problems first,
//! backend and store corruption last. Higher-level crates return these
//! directly rather than wrapping them in per-crate enums.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum UnikitError {
    /// Malformed user input: port/volume/network strings, byte quantities,
    /// unknown platform aliases.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of the rejected input.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A uniqueness or reservation constraint was violated.
    #[error("{message}")]
    Conflict {
        /// Description of the conflicting resource.
        message: String,
    },

    /// A catalog query, pull, or unarchive failed in a way that may succeed
    /// on retry.
    #[error("transient I/O failure: {message}")]
    TransientIo {
        /// Description of the failed operation.
        message: String,
    },

    /// An operation was requested that the machine state machine forbids.
    #[error("invalid state transition: cannot {requested} a machine in state {current}")]
    InvalidStateTransition {
        /// State the machine is currently in.
        current: String,
        /// The requested operation.
        requested: String,
    },

    /// The VMM process or one of its resources failed.
    #[error("backend error: {message}")]
    Backend {
        /// Description of the backend failure.
        message: String,
    },

    /// Sentinel emitted exactly once on a watch/log error channel when the
    /// machine reaches a terminal state.
    #[error("machine {name} reached terminal state {state}")]
    MachineTerminated {
        /// Machine name.
        name: String,
        /// The terminal state that was observed.
        state: String,
    },

    /// Another process holds the advisory lock for this record.
    #[error("object {name} is busy: locked by another process")]
    Busy {
        /// Name of the contended record.
        name: String,
    },

    /// The operation's context was cancelled or its deadline expired.
    #[error("operation canceled")]
    Canceled,

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// Several underlying operations failed and no single error dominates.
    #[error("{message}")]
    Aggregate {
        /// Pre-joined description of every underlying failure.
        message: String,
    },

    /// Unrecoverable condition: corrupt store record, missing runtime
    /// directory permissions.
    #[error("fatal: {message}")]
    Fatal {
        /// Description of the condition.
        message: String,
    },
}

impl UnikitError {
    /// Builds an [`UnikitError::Io`] from a path and source error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Joins multiple failures into a single [`UnikitError::Aggregate`].
    pub fn aggregate(context: &str, errors: Vec<Self>) -> Self {
        let joined = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Self::Aggregate {
            message: format!("{context}: {joined}"),
        }
    }

    /// Whether a single retry (with remote update enabled where applicable)
    /// is worthwhile.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo { .. })
    }

    /// Whether this error is the watch/log terminal-state sentinel.
    #[must_use]
    pub const fn is_terminal_sentinel(&self) -> bool {
        matches!(self, Self::MachineTerminated { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, UnikitError>;
