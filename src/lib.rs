//! Block device backends for EMC storage arrays.
//!
//! The crate adapts XtremIO, VNX, Unity, VMAX and ScaleIO arrays to one
//! block device contract: create, destroy, attach, detach, resize and list
//! volumes, and find the device node of an attached volume on this host.
//! [`BlockDeviceApi`] orchestrates those verbs over an [`ArrayClient`], a
//! host [`Connector`] and, for arrays that cannot keep volume identity in LUN
//! names, a [`MetadataStore`].

pub mod array;
pub mod command;
pub mod config;
pub mod connector;
pub mod error;
pub mod metadata;
pub mod naming;
pub mod orchestrator;
pub mod scheduler;
pub mod test_support;
pub mod volume;

pub use array::{ArrayClient, ArrayError, ArrayFamily, Transport};
pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ArrayConfig, ConfigError, ConfiguredApi};
pub use connector::{Connector, ConnectorError, HostConnector};
pub use error::BlockDeviceError;
pub use metadata::{HashStore, MemoryHashStore, MetadataError, MetadataStore, RedisHashStore};
pub use orchestrator::BlockDeviceApi;
pub use scheduler::{ManagedPools, Profile};
pub use volume::{ArrayHandle, BlockDeviceId, ClusterId, DatasetId, Volume};
