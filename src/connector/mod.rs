//! Host-side SCSI plumbing: initiator identity, bus rescans and device lookup.
//!
//! [`Connector`] is the seam the orchestrator uses for everything that
//! happens on the local host rather than on the array. [`HostConnector`]
//! implements it by reading well-known host files and running the usual
//! initiator utilities through a [`crate::command::CommandRunner`].

use std::future::Future;
use std::pin::Pin;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::array::{ArrayFamily, Initiator, TargetPortal, Transport};
use crate::command::CommandError;

mod host;
mod lookup;
mod registration;

pub use host::{HostConnector, HostPaths};
pub use lookup::{find_by_id, parse_initiator_name, parse_inq_sym_wwn, parse_lsscsi};
pub use registration::{ensure_host_group, ensure_initiator_registered};

/// Future returned by connector operations.
pub type ConnectorFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ConnectorError>> + Send + 'a>>;

/// Errors raised by host connectivity operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConnectorError {
    /// Raised when a host file cannot be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// File that could not be read.
        path: Utf8PathBuf,
        /// Error reported by the operating system.
        message: String,
    },
    /// Raised when a host utility fails.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Raised when the host has no initiator identity for the transport.
    #[error("no {transport} initiator found on this host ({hint})")]
    MissingInitiator {
        /// Transport whose identity is missing.
        transport: Transport,
        /// Where the identity was looked for.
        hint: String,
    },
    /// Raised when a bounded poll loop expires.
    #[error("timed out waiting for {action} on {subject}")]
    Timeout {
        /// What was being waited on.
        action: String,
        /// LUN being waited on.
        subject: String,
    },
    /// Raised when the host cannot serve the request with this transport.
    #[error("{message}")]
    Unsupported {
        /// Description of the mismatch.
        message: String,
    },
}

/// What the host needs to know to find the block device of a mapped LUN.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceTarget {
    /// Array family, selecting the lookup strategy.
    pub family: ArrayFamily,
    /// Array-assigned LUN identifier.
    pub lun_id: String,
    /// Host LUN number the LUN is exposed under.
    pub hlu: u32,
    /// World wide name, when the array reports one.
    pub wwn: Option<String>,
}

/// Local host operations the orchestrator depends on.
pub trait Connector: Send + Sync {
    /// Identity the array should grant access to.
    fn initiator(&self) -> ConnectorFuture<'_, Initiator>;

    /// Name this host registers under on the array.
    fn instance_id(&self) -> ConnectorFuture<'_, String>;

    /// Rescans the SCSI bus. Failures are logged, never returned.
    fn rescan(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Logs in to the given iSCSI portals; a no-op for other transports.
    fn login_targets<'a>(&'a self, portals: &'a [TargetPortal]) -> ConnectorFuture<'a, ()>;

    /// Waits for the device node of `target` to appear and returns its path.
    fn resolve_device_path<'a>(&'a self, target: &'a DeviceTarget)
    -> ConnectorFuture<'a, Utf8PathBuf>;
}

#[cfg(test)]
mod tests;
