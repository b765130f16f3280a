//! Array management abstraction implemented once per vendor.
//!
//! The orchestrator only ever talks to [`ArrayClient`]; each vendor module
//! translates these calls into its own REST or CLI dialect and folds vendor
//! error codes into [`ArrayError`].

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

mod error;
mod family;
pub(crate) mod http;
pub mod scaleio;
pub mod unity;
pub mod vmax;
pub mod vnx;
pub mod xtremio;

pub use error::ArrayError;
pub use family::{ArrayFamily, UnknownFamily};

/// Future returned by array client operations.
pub type ArrayFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ArrayError>> + Send + 'a>>;

/// Capacity container LUNs are provisioned from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoragePool {
    /// Array-assigned pool identifier.
    pub id: String,
    /// Pool name, matched against the configured glob patterns.
    pub name: String,
    /// Free capacity in bytes.
    pub free_bytes: u64,
    /// Total capacity in bytes.
    pub total_bytes: u64,
}

/// Provisioning state reported for a LUN.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LunState {
    /// The array is still allocating the LUN.
    Initializing,
    /// The LUN is usable.
    Ready,
    /// The LUN is usable but degraded.
    Faulted,
    /// A background operation (expansion, migration) is still running.
    Busy,
    /// The LUN is being removed.
    Destroying,
    /// Any other vendor state; never becomes ready on its own.
    Other(String),
}

/// Outcome of checking a LUN while waiting for it to become usable.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Readiness {
    /// Keep polling.
    Pending,
    /// The LUN accepts I/O.
    Ready,
    /// The LUN reached a state it will not leave by itself.
    Failed(String),
}

impl LunState {
    /// Maps the state onto the create-wait decision.
    #[must_use]
    pub fn readiness(&self) -> Readiness {
        match self {
            Self::Initializing | Self::Busy => Readiness::Pending,
            Self::Ready | Self::Faulted => Readiness::Ready,
            Self::Destroying => Readiness::Failed(String::from("destroying")),
            Self::Other(state) => Readiness::Failed(state.clone()),
        }
    }
}

impl fmt::Display for LunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => f.write_str("initializing"),
            Self::Ready => f.write_str("ready"),
            Self::Faulted => f.write_str("faulted"),
            Self::Busy => f.write_str("busy"),
            Self::Destroying => f.write_str("destroying"),
            Self::Other(state) => f.write_str(state),
        }
    }
}

/// Logical unit as reported by the array.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Lun {
    /// Array-assigned identifier (ALU, volume id, device id).
    pub id: String,
    /// Array-side name.
    pub name: String,
    /// Provisioned size in bytes.
    pub size_bytes: u64,
    /// Provisioning state.
    pub state: LunState,
    /// Pool the LUN was carved from, when reported.
    pub pool: Option<String>,
    /// World wide name, when reported.
    pub wwn: Option<String>,
    /// Vendor keys carried into the volume's array handle.
    pub keys: BTreeMap<String, String>,
}

impl Lun {
    /// Returns `true` while the LUN is being removed.
    #[must_use]
    pub const fn is_destroying(&self) -> bool {
        matches!(self.state, LunState::Destroying)
    }
}

/// Association between a LUN and a host group.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LunMapping {
    /// Array identifier of the mapped LUN.
    pub lun_id: String,
    /// Host LUN number the host sees.
    pub hlu: u32,
}

/// Initiator group, storage group, host object or SDC: whatever the array
/// uses to grant a host access to LUNs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostGroup {
    /// Array-assigned identifier.
    pub id: String,
    /// Group name; equals the compute instance id it serves.
    pub name: String,
    /// Registered initiator identities.
    pub initiators: Vec<String>,
    /// Current LUN mappings.
    pub mappings: Vec<LunMapping>,
}

impl HostGroup {
    /// Host LUN number of `lun` in this group, if mapped.
    #[must_use]
    pub fn hlu_for(&self, lun: &Lun) -> Option<u32> {
        self.mappings
            .iter()
            .find(|mapping| mapping.lun_id == lun.id)
            .map(|mapping| mapping.hlu)
    }

    /// Returns `true` when `lun` is mapped into this group.
    #[must_use]
    pub fn has_lun(&self, lun: &Lun) -> bool {
        self.hlu_for(lun).is_some()
    }

    /// Returns `true` when `initiator` is already registered.
    #[must_use]
    pub fn has_initiator(&self, initiator: &str) -> bool {
        self.initiators
            .iter()
            .any(|known| known.eq_ignore_ascii_case(initiator))
    }
}

/// Host transport used to reach LUNs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transport {
    /// iSCSI over TCP.
    Iscsi,
    /// Fibre Channel.
    Fc,
    /// ScaleIO data client.
    Sdc,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Iscsi => f.write_str("iSCSI"),
            Self::Fc => f.write_str("FC"),
            Self::Sdc => f.write_str("SDC"),
        }
    }
}

/// Identity of the local host as seen by the array.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Initiator {
    /// Transport the identity belongs to.
    pub transport: Transport,
    /// IQN, WWPN or SDC GUID.
    pub id: String,
    /// Host address used for automatic iSCSI registration.
    pub host_ip: Option<String>,
}

/// iSCSI target endpoint exposed by the array.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TargetPortal {
    /// Target IQN.
    pub iqn: String,
    /// `address:port` of the portal.
    pub portal: String,
}

/// Management operations every vendor client provides.
pub trait ArrayClient: Send + Sync {
    /// Product line of the array.
    fn family(&self) -> ArrayFamily;

    /// Lists the pools LUNs may be created in.
    fn pools(&self) -> ArrayFuture<'_, Vec<StoragePool>>;

    /// Identifiers of pools carrying the given capability usage tag.
    fn capability_pools<'a>(&'a self, usage_tag: &'a str) -> ArrayFuture<'a, Vec<String>> {
        Box::pin(async move {
            Err(ArrayError::Unsupported {
                operation: format!("capability profile {usage_tag}"),
            })
        })
    }

    /// Looks up a LUN by name; absence is `Ok(None)`.
    fn lun<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, Option<Lun>>;

    /// Lists every LUN visible to the client.
    fn luns(&self) -> ArrayFuture<'_, Vec<Lun>>;

    /// Creates a LUN; a taken name is [`ArrayError::NameInUse`].
    fn create_lun<'a>(
        &'a self,
        pool: &'a StoragePool,
        name: &'a str,
        size_bytes: u64,
    ) -> ArrayFuture<'a, Lun>;

    /// Deletes a LUN.
    fn delete_lun<'a>(&'a self, lun: &'a Lun) -> ArrayFuture<'a, ()>;

    /// Grows a LUN to `size_bytes`.
    fn resize_lun<'a>(&'a self, lun: &'a Lun, size_bytes: u64) -> ArrayFuture<'a, ()>;

    /// Lists every host group with its mappings.
    fn host_groups(&self) -> ArrayFuture<'_, Vec<HostGroup>>;

    /// Looks up a host group by name; absence is `Ok(None)`.
    fn host_group<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, Option<HostGroup>>;

    /// Creates a host group; a taken name is [`ArrayError::NameInUse`].
    fn create_host_group<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, HostGroup>;

    /// Registers `initiator` with `group`.
    fn register_initiator<'a>(
        &'a self,
        group: &'a HostGroup,
        initiator: &'a Initiator,
    ) -> ArrayFuture<'a, ()>;

    /// Maps `lun` into `group` and returns the host LUN number.
    fn map_lun<'a>(&'a self, group: &'a HostGroup, lun: &'a Lun) -> ArrayFuture<'a, u32>;

    /// Removes the mapping of `lun` from `group`.
    fn unmap_lun<'a>(&'a self, group: &'a HostGroup, lun: &'a Lun) -> ArrayFuture<'a, ()>;

    /// iSCSI portals hosts should log in to.
    fn target_portals(&self) -> ArrayFuture<'_, Vec<TargetPortal>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

impl<T: ArrayClient + ?Sized> ArrayClient for Box<T> {
    fn family(&self) -> ArrayFamily {
        (**self).family()
    }

    fn pools(&self) -> ArrayFuture<'_, Vec<StoragePool>> {
        (**self).pools()
    }

    fn capability_pools<'a>(&'a self, usage_tag: &'a str) -> ArrayFuture<'a, Vec<String>> {
        (**self).capability_pools(usage_tag)
    }

    fn lun<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, Option<Lun>> {
        (**self).lun(name)
    }

    fn luns(&self) -> ArrayFuture<'_, Vec<Lun>> {
        (**self).luns()
    }

    fn create_lun<'a>(
        &'a self,
        pool: &'a StoragePool,
        name: &'a str,
        size_bytes: u64,
    ) -> ArrayFuture<'a, Lun> {
        (**self).create_lun(pool, name, size_bytes)
    }

    fn delete_lun<'a>(&'a self, lun: &'a Lun) -> ArrayFuture<'a, ()> {
        (**self).delete_lun(lun)
    }

    fn resize_lun<'a>(&'a self, lun: &'a Lun, size_bytes: u64) -> ArrayFuture<'a, ()> {
        (**self).resize_lun(lun, size_bytes)
    }

    fn host_groups(&self) -> ArrayFuture<'_, Vec<HostGroup>> {
        (**self).host_groups()
    }

    fn host_group<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, Option<HostGroup>> {
        (**self).host_group(name)
    }

    fn create_host_group<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, HostGroup> {
        (**self).create_host_group(name)
    }

    fn register_initiator<'a>(
        &'a self,
        group: &'a HostGroup,
        initiator: &'a Initiator,
    ) -> ArrayFuture<'a, ()> {
        (**self).register_initiator(group, initiator)
    }

    fn map_lun<'a>(&'a self, group: &'a HostGroup, lun: &'a Lun) -> ArrayFuture<'a, u32> {
        (**self).map_lun(group, lun)
    }

    fn unmap_lun<'a>(&'a self, group: &'a HostGroup, lun: &'a Lun) -> ArrayFuture<'a, ()> {
        (**self).unmap_lun(group, lun)
    }

    fn target_portals(&self) -> ArrayFuture<'_, Vec<TargetPortal>> {
        (**self).target_portals()
    }
}
