//! Volume lifecycle orchestration shared by every array family.
//!
//! [`BlockDeviceApi`] owns the verb set the volume framework calls and keeps
//! the per-volume state machine consistent: a volume is created unattached,
//! mapped to at most one host at a time, and can only be resized or destroyed
//! while unmapped. Attachment is always read back from the array's live host
//! group mappings; metadata records only remember what the array cannot.

use std::time::Duration;

use camino::Utf8PathBuf;
use tracing::{debug, warn};

use crate::array::{ArrayClient, ArrayFamily};
use crate::connector::{Connector, DeviceTarget};
use crate::error::BlockDeviceError;
use crate::metadata::{HashStore, MemoryHashStore, MetadataStore};
use crate::naming::LunNaming;
use crate::scheduler::{ManagedPools, PoolScheduler, ProfileScheduler};
use crate::volume::{BlockDeviceId, ClusterId, Volume};

mod mapping;
mod provision;
mod resolve;

const DEFAULT_LUN_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_LUN_TIMEOUT: Duration = Duration::from_secs(600);
const MAP_ATTEMPTS: u32 = 3;

/// Block device verbs implemented on top of one array.
pub struct BlockDeviceApi<A, C, S = MemoryHashStore> {
    array: A,
    connector: C,
    metadata: Option<MetadataStore<S>>,
    naming: LunNaming,
    pools: ManagedPools,
    scheduler: Box<dyn PoolScheduler>,
    lun_poll_interval: Duration,
    lun_timeout: Duration,
}

impl<A: ArrayClient, C: Connector> BlockDeviceApi<A, C> {
    /// Builds the API for a family whose LUN names carry volume identity.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::ConfigurationError`] when the array family
    /// needs a metadata store.
    pub fn new(
        array: A,
        connector: C,
        cluster: ClusterId,
        pools: ManagedPools,
    ) -> Result<Self, BlockDeviceError> {
        Self::from_parts(array, connector, cluster, pools, None)
    }
}

impl<A: ArrayClient, C: Connector, S: HashStore> BlockDeviceApi<A, C, S> {
    /// Builds the API for a family that keeps volume identity in `metadata`.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::ConfigurationError`] when the array family
    /// keeps identity in LUN names instead.
    pub fn with_metadata(
        array: A,
        connector: C,
        cluster: ClusterId,
        pools: ManagedPools,
        metadata: MetadataStore<S>,
    ) -> Result<Self, BlockDeviceError> {
        Self::from_parts(array, connector, cluster, pools, Some(metadata))
    }

    /// Builds the API, checking that a metadata store is supplied exactly
    /// when the array family needs one.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::ConfigurationError`] on a mismatch.
    pub fn from_parts(
        array: A,
        connector: C,
        cluster: ClusterId,
        pools: ManagedPools,
        metadata: Option<MetadataStore<S>>,
    ) -> Result<Self, BlockDeviceError> {
        let family = array.family();
        match (family.requires_metadata(), metadata.is_some()) {
            (true, false) => Err(BlockDeviceError::configuration(
                family,
                "this array family needs a metadata store (set dbhost)",
            )),
            (false, true) => Err(BlockDeviceError::configuration(
                family,
                "this array family keeps volume identity in LUN names; drop dbhost",
            )),
            _ => Ok(Self::assemble(array, connector, cluster, pools, metadata)),
        }
    }

    fn assemble(
        array: A,
        connector: C,
        cluster: ClusterId,
        pools: ManagedPools,
        metadata: Option<MetadataStore<S>>,
    ) -> Self {
        let naming = LunNaming::new(array.family().name_scheme(), cluster);
        Self {
            array,
            connector,
            metadata,
            naming,
            pools,
            scheduler: Box::new(ProfileScheduler),
            lun_poll_interval: DEFAULT_LUN_POLL_INTERVAL,
            lun_timeout: DEFAULT_LUN_TIMEOUT,
        }
    }

    /// Replaces the pool selection strategy.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: impl PoolScheduler + 'static) -> Self {
        self.scheduler = Box::new(scheduler);
        self
    }

    /// Overrides how often and how long a new LUN is polled for readiness.
    #[must_use]
    pub const fn with_lun_polling(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.lun_poll_interval = poll_interval;
        self.lun_timeout = timeout;
        self
    }

    /// Array family served by this instance.
    #[must_use]
    pub fn family(&self) -> ArrayFamily {
        self.array.family()
    }

    /// Underlying array client.
    #[must_use]
    pub const fn array(&self) -> &A {
        &self.array
    }

    /// Host connector.
    #[must_use]
    pub const fn connector(&self) -> &C {
        &self.connector
    }

    /// LUN name codec for this cluster.
    #[must_use]
    pub const fn naming(&self) -> &LunNaming {
        &self.naming
    }

    /// Sizing granularity of the array family in bytes.
    #[must_use]
    pub fn allocation_unit(&self) -> u64 {
        self.family().allocation_unit()
    }

    /// Identity of this host as the array knows it.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError`] when the host identity cannot be read.
    pub async fn compute_instance_id(&self) -> Result<String, BlockDeviceError> {
        self.connector
            .instance_id()
            .await
            .map_err(|err| BlockDeviceError::connector("compute instance id", err))
    }

    /// Lists every volume of this cluster with its live attachment.
    ///
    /// LUNs that vanish while the list is assembled are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::BackendUnavailable`] when the array or the
    /// metadata store cannot be enumerated.
    pub async fn list_volumes(&self) -> Result<Vec<Volume>, BlockDeviceError> {
        let groups = self
            .array
            .host_groups()
            .await
            .map_err(|err| BlockDeviceError::backend("host groups", err))?;

        let Some(store) = &self.metadata else {
            let luns = self
                .array
                .luns()
                .await
                .map_err(|err| BlockDeviceError::backend("luns", err))?;
            return Ok(luns
                .iter()
                .filter(|lun| !lun.is_destroying() && self.naming.owns(&lun.name))
                .filter_map(|lun| self.describe(lun, None, &groups))
                .collect());
        };

        let records = store
            .get_all()
            .await
            .map_err(|err| BlockDeviceError::metadata(store.container(), &err))?;
        let mut volumes = Vec::with_capacity(records.len());
        for record in &records {
            match self.array.lun(&record.name).await {
                Ok(Some(lun)) if !lun.is_destroying() => {
                    volumes.extend(self.describe(&lun, Some(record), &groups));
                }
                Ok(_) => debug!(record = %record.id, lun = %record.name, "skipping vanished lun"),
                Err(err) => warn!(
                    record = %record.id,
                    lun = %record.name,
                    error = %err,
                    "skipping lun that could not be read"
                ),
            }
        }
        Ok(volumes)
    }

    /// Resolves the local block device of an attached volume.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::UnknownVolume`],
    /// [`BlockDeviceError::UnattachedVolume`] or [`BlockDeviceError::Timeout`]
    /// when the device node never appears.
    pub async fn get_device_path(&self, id: &BlockDeviceId) -> Result<Utf8PathBuf, BlockDeviceError> {
        debug!(%id, "get_device_path");
        let located = self.locate(id).await?;
        let groups = self.groups_for(id).await?;
        let hlu = groups
            .iter()
            .find_map(|group| group.hlu_for(&located.lun))
            .ok_or_else(|| BlockDeviceError::UnattachedVolume { id: id.clone() })?;

        let target = DeviceTarget {
            family: self.family(),
            lun_id: located.lun.id.clone(),
            hlu,
            wwn: located.lun.wwn.clone(),
        };
        let path = self
            .connector
            .resolve_device_path(&target)
            .await
            .map_err(|err| BlockDeviceError::connector(id, err))?;
        debug!(%id, %path, "resolved device path");
        Ok(path)
    }
}
