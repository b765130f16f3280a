//! Attach and detach.

use tracing::{debug, info, warn};

use crate::array::{ArrayClient, ArrayError, HostGroup, Lun};
use crate::connector::{Connector, ensure_host_group, ensure_initiator_registered};
use crate::error::BlockDeviceError;
use crate::metadata::HashStore;
use crate::volume::{BlockDeviceId, Volume};

use super::{BlockDeviceApi, MAP_ATTEMPTS};

impl<A: ArrayClient, C: Connector, S: HashStore> BlockDeviceApi<A, C, S> {
    /// Maps the volume to `host` and makes it visible on this machine.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::UnknownVolume`] for a missing volume and
    /// [`BlockDeviceError::AlreadyAttachedVolume`] when any host already has
    /// it mapped.
    pub async fn attach_volume(
        &self,
        id: &BlockDeviceId,
        host: &str,
    ) -> Result<Volume, BlockDeviceError> {
        debug!(%id, host, "attach_volume");
        let located = self.locate(id).await?;
        let groups = self.groups_for(id).await?;
        if let Some(holder) = groups.iter().find(|group| group.has_lun(&located.lun)) {
            debug!(%id, holder = %holder.name, "volume already mapped");
            return Err(BlockDeviceError::AlreadyAttachedVolume { id: id.clone() });
        }

        let group = ensure_host_group(&self.array, host)
            .await
            .map_err(|err| BlockDeviceError::backend(host, err))?;
        let initiator = self
            .connector
            .initiator()
            .await
            .map_err(|err| BlockDeviceError::connector(host, err))?;
        ensure_initiator_registered(&self.array, &group, &initiator)
            .await
            .map_err(|err| BlockDeviceError::backend(host, err))?;

        let hlu = self.map_with_retry(id, &group, &located.lun).await?;
        info!(%id, host, hlu, "attached volume");

        match self.array.target_portals().await {
            Ok(portals) if !portals.is_empty() => {
                if let Err(err) = self.connector.login_targets(&portals).await {
                    warn!(%id, error = %err, "iSCSI target login failed");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(%id, error = %err, "could not list iSCSI target portals"),
        }
        self.connector.rescan().await;

        self.update_record(&located, |record| {
            record.attach_to = Some(host.to_owned());
        })
        .await?;

        let volume = self
            .describe(&located.lun, located.record.as_ref(), &[])
            .ok_or_else(|| BlockDeviceError::UnknownVolume { id: id.clone() })?;
        Ok(volume.with_attached_to(Some(host.to_owned())))
    }

    /// A concurrent attacher may take the last free host LUN number between
    /// our lookup and the mapping call, so that case is retried.
    async fn map_with_retry(
        &self,
        id: &BlockDeviceId,
        group: &HostGroup,
        lun: &Lun,
    ) -> Result<u32, BlockDeviceError> {
        let mut attempt = 1;
        loop {
            match self.array.map_lun(group, lun).await {
                Ok(hlu) => return Ok(hlu),
                Err(ArrayError::AlreadyMapped { group: holder, .. }) => {
                    debug!(%id, %holder, "mapping raced with another attacher");
                    return Err(BlockDeviceError::AlreadyAttachedVolume { id: id.clone() });
                }
                Err(ArrayError::NoHluAvailable { .. }) if attempt < MAP_ATTEMPTS => {
                    warn!(%id, group = %group.name, attempt, "no host lun number free, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(BlockDeviceError::backend(id, err)),
            }
        }
    }

    /// Removes the volume's host mapping.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::UnknownVolume`] for a missing volume and
    /// [`BlockDeviceError::UnattachedVolume`] when nothing maps it.
    pub async fn detach_volume(&self, id: &BlockDeviceId) -> Result<(), BlockDeviceError> {
        debug!(%id, "detach_volume");
        let located = self.locate(id).await?;
        let groups = self.groups_for(id).await?;
        let group = groups
            .iter()
            .find(|group| group.has_lun(&located.lun))
            .ok_or_else(|| BlockDeviceError::UnattachedVolume { id: id.clone() })?;

        match self.array.unmap_lun(group, &located.lun).await {
            Ok(()) => {}
            Err(ArrayError::NotFound { .. }) => {
                return Err(BlockDeviceError::UnattachedVolume { id: id.clone() });
            }
            Err(err) => return Err(BlockDeviceError::backend(id, err)),
        }
        info!(%id, host = %group.name, "detached volume");
        self.connector.rescan().await;

        self.update_record(&located, |record| record.attach_to = None)
            .await
    }
}
