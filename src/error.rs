//! Error taxonomy surfaced by the block device API.

use thiserror::Error;

use crate::array::ArrayError;
use crate::connector::ConnectorError;
use crate::metadata::MetadataError;
use crate::volume::BlockDeviceId;

/// Errors returned by [`crate::BlockDeviceApi`] verbs.
#[derive(Debug, Error)]
pub enum BlockDeviceError {
    /// The identifier does not resolve to a LUN or metadata record.
    #[error("unknown volume {id}")]
    UnknownVolume {
        /// Identifier that failed to resolve.
        id: BlockDeviceId,
    },
    /// The volume is mapped to a host, so the verb cannot proceed.
    #[error("volume {id} is already attached")]
    AlreadyAttachedVolume {
        /// Identifier of the attached volume.
        id: BlockDeviceId,
    },
    /// The volume has no host mapping.
    #[error("volume {id} is not attached")]
    UnattachedVolume {
        /// Identifier of the unattached volume.
        id: BlockDeviceId,
    },
    /// No managed pool has room for the request.
    #[error("no storage pool has {size_bytes} bytes free (candidates: {pools})")]
    CapacityExhausted {
        /// Requested size after rounding.
        size_bytes: u64,
        /// Comma-separated candidate pool names.
        pools: String,
    },
    /// The array could not be reached or answered unexpectedly.
    #[error("backend unavailable for {subject}: {message}")]
    BackendUnavailable {
        /// Volume, pool or host the call concerned.
        subject: String,
        /// Description of the failure.
        message: String,
        /// Underlying array error, when there is one.
        #[source]
        source: Option<ArrayError>,
    },
    /// A profile, pool, protocol or host is not provisioned as configured.
    #[error("configuration error for {subject}: {message}")]
    ConfigurationError {
        /// Profile, pool or setting name.
        subject: String,
        /// Description of the mismatch.
        message: String,
    },
    /// A bounded poll loop ran out of time.
    #[error("timed out waiting for {action} on {subject}")]
    Timeout {
        /// What was being waited on.
        action: String,
        /// Volume or LUN being waited on.
        subject: String,
    },
}

impl BlockDeviceError {
    /// Wraps an array error raised while handling `subject`.
    #[must_use]
    pub fn backend(subject: impl ToString, source: ArrayError) -> Self {
        match source {
            ArrayError::Unsupported { operation } => Self::ConfigurationError {
                subject: subject.to_string(),
                message: format!("not supported by this array: {operation}"),
            },
            other => Self::BackendUnavailable {
                subject: subject.to_string(),
                message: other.to_string(),
                source: Some(other),
            },
        }
    }

    /// Builds a [`BlockDeviceError::ConfigurationError`].
    #[must_use]
    pub fn configuration(subject: impl ToString, message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            subject: subject.to_string(),
            message: message.into(),
        }
    }

    /// Wraps a host connectivity failure raised while handling `subject`.
    #[must_use]
    pub fn connector(subject: impl ToString, source: ConnectorError) -> Self {
        match source {
            ConnectorError::Timeout { action, .. } => Self::Timeout {
                action,
                subject: subject.to_string(),
            },
            ConnectorError::Unsupported { message } => Self::ConfigurationError {
                subject: subject.to_string(),
                message,
            },
            other => Self::BackendUnavailable {
                subject: subject.to_string(),
                message: other.to_string(),
                source: None,
            },
        }
    }

    /// Wraps a metadata store failure raised while handling `subject`.
    #[must_use]
    pub fn metadata(subject: impl ToString, source: &MetadataError) -> Self {
        Self::BackendUnavailable {
            subject: subject.to_string(),
            message: format!("metadata store: {source}"),
            source: None,
        }
    }
}
