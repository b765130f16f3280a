//! Error types shared by the array management clients.

use thiserror::Error;

use crate::command::CommandError;

/// Errors raised by array management clients.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ArrayError {
    /// Raised when a named object is absent where the caller required it.
    #[error("{kind} '{name}' not found on the array")]
    NotFound {
        /// Object kind, such as `lun` or `storage group`.
        kind: String,
        /// Name or identifier that was looked up.
        name: String,
    },
    /// Raised when creating an object whose name is already taken.
    #[error("name '{name}' is already in use on the array")]
    NameInUse {
        /// Conflicting name.
        name: String,
    },
    /// Raised when a LUN is already mapped to a host group.
    #[error("lun '{lun}' is already mapped to '{group}'")]
    AlreadyMapped {
        /// LUN name.
        lun: String,
        /// Host group that already holds the mapping.
        group: String,
    },
    /// Raised when a host group has no free host LUN number left.
    #[error("no host lun number available for '{lun}' in '{group}'")]
    NoHluAvailable {
        /// LUN name.
        lun: String,
        /// Host group that ran out of slots.
        group: String,
    },
    /// Raised when the array family cannot perform an operation.
    #[error("operation not supported by this array: {operation}")]
    Unsupported {
        /// Operation that was requested.
        operation: String,
    },
    /// Raised when the management endpoint rejects the credentials.
    #[error("authentication failed: {message}")]
    Authentication {
        /// Message returned by the array.
        message: String,
    },
    /// Raised when the management endpoint cannot be reached.
    #[error("transport error: {message}")]
    Transport {
        /// Transport level failure description.
        message: String,
    },
    /// Raised when the array returns an error status.
    #[error("array returned status {status}: {message}")]
    Api {
        /// HTTP status or CLI error code.
        status: u16,
        /// Message returned by the array.
        message: String,
    },
    /// Raised when a response cannot be interpreted.
    #[error("unexpected array response: {message}")]
    UnexpectedResponse {
        /// Description of the mismatch.
        message: String,
    },
    /// Raised when a management CLI invocation fails.
    #[error("management command failed: {0}")]
    Command(#[from] CommandError),
}

impl ArrayError {
    /// Shorthand for [`ArrayError::NotFound`].
    #[must_use]
    pub fn not_found(kind: &str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.to_owned(),
            name: name.into(),
        }
    }

    /// Shorthand for [`ArrayError::UnexpectedResponse`].
    #[must_use]
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::UnexpectedResponse {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for ArrayError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport {
            message: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for ArrayError {
    fn from(value: serde_json::Error) -> Self {
        Self::UnexpectedResponse {
            message: value.to_string(),
        }
    }
}
