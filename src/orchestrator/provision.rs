//! Create, resize and destroy.

use std::time::Instant;

use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::array::{ArrayClient, ArrayError, Lun, Readiness, StoragePool};
use crate::connector::Connector;
use crate::error::BlockDeviceError;
use crate::metadata::{HashStore, VolumeRecord, placement};
use crate::scheduler::{PlacementRequest, Profile, ProfileFilter};
use crate::volume::{ArrayHandle, BlockDeviceId, DatasetId, Volume, round_up};

use super::BlockDeviceApi;

const GB: u64 = 1 << 30;

impl<A: ArrayClient, C: Connector, S: HashStore> BlockDeviceApi<A, C, S> {
    /// Creates an unattached volume of at least `size_bytes` for `dataset_id`.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::CapacityExhausted`] when no managed pool
    /// has room, and [`BlockDeviceError::BackendUnavailable`] or
    /// [`BlockDeviceError::Timeout`] when the array misbehaves.
    pub async fn create_volume(
        &self,
        dataset_id: DatasetId,
        size_bytes: u64,
    ) -> Result<Volume, BlockDeviceError> {
        self.create_volume_with_profile(dataset_id, size_bytes, None)
            .await
    }

    /// Creates a volume, placing it in a pool carrying `profile` when given.
    ///
    /// Repeating a create for the same dataset resolves to the LUN the first
    /// call made.
    ///
    /// # Errors
    ///
    /// As [`BlockDeviceApi::create_volume`], plus
    /// [`BlockDeviceError::ConfigurationError`] when the array cannot
    /// honour profiles.
    pub async fn create_volume_with_profile(
        &self,
        dataset_id: DatasetId,
        size_bytes: u64,
        profile: Option<Profile>,
    ) -> Result<Volume, BlockDeviceError> {
        debug!(%dataset_id, size_bytes, ?profile, "create_volume");
        let size = round_up(size_bytes, self.allocation_unit()).ok_or_else(|| {
            BlockDeviceError::configuration(dataset_id, format!("size {size_bytes} is too large"))
        })?;
        let name = self.naming.encode(dataset_id);

        let pools = self
            .array
            .pools()
            .await
            .map_err(|err| BlockDeviceError::backend(&name, err))?;
        let candidates = self.pools.filter(pools)?;
        let request = PlacementRequest {
            size_bytes: size,
            profile: self.profile_filter(profile).await?,
        };
        let pool = self.scheduler.select(&candidates, &request)?;
        debug!(lun = %name, pool = %pool.name, size, "selected pool");

        let (lun, created) = match self.array.create_lun(pool, &name, size).await {
            Ok(lun) => {
                info!(lun = %name, pool = %pool.name, size, "created lun");
                (lun, true)
            }
            Err(ArrayError::NameInUse { .. }) => {
                info!(lun = %name, "lun already exists, reusing it");
                let existing = self
                    .array
                    .lun(&name)
                    .await
                    .map_err(|err| BlockDeviceError::backend(&name, err))?
                    .ok_or_else(|| BlockDeviceError::BackendUnavailable {
                        subject: name.clone(),
                        message: String::from("name in use but lun not found"),
                        source: None,
                    })?;
                (existing, false)
            }
            Err(err) => return Err(BlockDeviceError::backend(&name, err)),
        };

        let ready = match self.wait_until_ready(&name).await {
            Ok(ready) => ready,
            Err(err) => {
                if created {
                    self.discard(&lun).await;
                }
                return Err(err);
            }
        };

        let record = match self.persist(dataset_id, &ready, pool, profile).await {
            Ok(record) => record,
            Err(err) => {
                if created {
                    self.discard(&ready).await;
                }
                return Err(err);
            }
        };

        self.describe(&ready, record.as_ref(), &[]).ok_or_else(|| {
            BlockDeviceError::BackendUnavailable {
                subject: name,
                message: String::from("created lun name does not decode"),
                source: None,
            }
        })
    }

    async fn profile_filter(
        &self,
        profile: Option<Profile>,
    ) -> Result<Option<ProfileFilter>, BlockDeviceError> {
        let Some(profile) = profile else {
            return Ok(None);
        };
        let pool_ids = if self.scheduler.honours_profiles() {
            self.array
                .capability_pools(profile.usage_tag())
                .await
                .map_err(|err| BlockDeviceError::backend(profile, err))?
        } else {
            Vec::new()
        };
        Ok(Some(ProfileFilter { profile, pool_ids }))
    }

    async fn wait_until_ready(&self, name: &str) -> Result<Lun, BlockDeviceError> {
        let deadline = Instant::now() + self.lun_timeout;
        loop {
            let observed = self
                .array
                .lun(name)
                .await
                .map_err(|err| BlockDeviceError::backend(name, err))?;
            if let Some(lun) = observed {
                match lun.state.readiness() {
                    Readiness::Ready => return Ok(lun),
                    Readiness::Failed(state) => {
                        return Err(BlockDeviceError::BackendUnavailable {
                            subject: name.to_owned(),
                            message: format!("lun entered state {state}"),
                            source: None,
                        });
                    }
                    Readiness::Pending => debug!(lun = name, state = %lun.state, "lun not ready yet"),
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep(self.lun_poll_interval).await;
        }
        Err(BlockDeviceError::Timeout {
            action: String::from("wait_for_lun_ready"),
            subject: name.to_owned(),
        })
    }

    /// Writes (or reuses) the metadata record of a new LUN.
    async fn persist(
        &self,
        dataset_id: DatasetId,
        lun: &Lun,
        pool: &StoragePool,
        profile: Option<Profile>,
    ) -> Result<Option<VolumeRecord>, BlockDeviceError> {
        let Some(store) = &self.metadata else {
            return Ok(None);
        };
        let subject = &lun.name;
        if let Some(existing) = store
            .get_by_name(&lun.name)
            .await
            .map_err(|err| BlockDeviceError::metadata(subject, &err))?
        {
            debug!(lun = %lun.name, record = %existing.id, "reusing metadata record");
            return Ok(Some(existing));
        }

        let host = self
            .connector
            .instance_id()
            .await
            .map_err(|err| BlockDeviceError::connector(subject, err))?;
        let mut record = VolumeRecord {
            id: Uuid::nil(),
            name: lun.name.clone(),
            dataset_id,
            size: lun.size_bytes.div_ceil(GB),
            actual_size: lun.size_bytes,
            attach_to: None,
            host: placement(&host, self.family().as_str(), &pool.name),
            profile: profile.map(|profile| profile.to_string()),
            provider_location: ArrayHandle {
                family: self.family(),
                lun_id: lun.id.clone(),
                lun_name: lun.name.clone(),
                keys: lun.keys.clone(),
            },
        };
        record.id = store
            .add(record.clone())
            .await
            .map_err(|err| BlockDeviceError::metadata(subject, &err))?;
        info!(lun = %lun.name, record = %record.id, "stored metadata record");
        Ok(Some(record))
    }

    /// Best-effort removal of a LUN this call created.
    async fn discard(&self, lun: &Lun) {
        match self.array.delete_lun(lun).await {
            Ok(()) => info!(lun = %lun.name, "removed lun after failed create"),
            Err(err) => warn!(lun = %lun.name, error = %err, "failed to remove lun after failed create"),
        }
    }

    /// Grows an unattached volume to at least `size_bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::UnknownVolume`],
    /// [`BlockDeviceError::AlreadyAttachedVolume`] while mapped, or
    /// [`BlockDeviceError::ConfigurationError`] for a shrink.
    pub async fn resize_volume(
        &self,
        id: &BlockDeviceId,
        size_bytes: u64,
    ) -> Result<Volume, BlockDeviceError> {
        debug!(%id, size_bytes, "resize_volume");
        let located = self.locate(id).await?;
        let groups = self.groups_for(id).await?;
        if groups.iter().any(|group| group.has_lun(&located.lun)) {
            return Err(BlockDeviceError::AlreadyAttachedVolume { id: id.clone() });
        }

        let size = round_up(size_bytes, self.allocation_unit()).ok_or_else(|| {
            BlockDeviceError::configuration(id, format!("size {size_bytes} is too large"))
        })?;
        if size < located.lun.size_bytes {
            return Err(BlockDeviceError::configuration(
                id,
                format!(
                    "cannot shrink from {} to {size} bytes",
                    located.lun.size_bytes
                ),
            ));
        }

        if size > located.lun.size_bytes {
            self.array
                .resize_lun(&located.lun, size)
                .await
                .map_err(|err| BlockDeviceError::backend(id, err))?;
            info!(%id, from = located.lun.size_bytes, to = size, "resized volume");
            self.connector.rescan().await;
            self.update_record(&located, |record| {
                record.size = size.div_ceil(GB);
                record.actual_size = size;
            })
            .await?;
        }

        let resized = Lun {
            size_bytes: size,
            ..located.lun.clone()
        };
        self.describe(&resized, located.record.as_ref(), &groups)
            .ok_or_else(|| BlockDeviceError::UnknownVolume { id: id.clone() })
    }

    /// Deletes an unattached volume and its metadata record.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::UnknownVolume`] for a missing volume and
    /// [`BlockDeviceError::AlreadyAttachedVolume`] while it is mapped.
    pub async fn destroy_volume(&self, id: &BlockDeviceId) -> Result<(), BlockDeviceError> {
        debug!(%id, "destroy_volume");
        let located = self.locate(id).await?;
        let groups = self.groups_for(id).await?;
        if let Some(group) = groups.iter().find(|group| group.has_lun(&located.lun)) {
            debug!(%id, host = %group.name, "refusing to destroy attached volume");
            return Err(BlockDeviceError::AlreadyAttachedVolume { id: id.clone() });
        }

        match self.array.delete_lun(&located.lun).await {
            Ok(()) => {}
            Err(ArrayError::NotFound { .. }) => {
                return Err(BlockDeviceError::UnknownVolume { id: id.clone() });
            }
            Err(err) => return Err(BlockDeviceError::backend(id, err)),
        }
        info!(%id, lun = %located.lun.name, "destroyed volume");

        if let (Some(store), Some(record)) = (&self.metadata, &located.record) {
            store
                .delete(record.id)
                .await
                .map_err(|err| BlockDeviceError::metadata(id, &err))?;
        }
        Ok(())
    }
}
