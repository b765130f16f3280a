//! Volume lookup and descriptor assembly.

use crate::array::{ArrayClient, HostGroup, Lun};
use crate::connector::Connector;
use crate::error::BlockDeviceError;
use crate::metadata::{HashStore, VolumeRecord};
use crate::volume::{ArrayHandle, BlockDeviceId, Volume};

use super::BlockDeviceApi;

/// A volume id resolved to its LUN and, for metadata families, its record.
pub(super) struct Located {
    pub(super) lun: Lun,
    pub(super) record: Option<VolumeRecord>,
}

impl<A: ArrayClient, C: Connector, S: HashStore> BlockDeviceApi<A, C, S> {
    /// Resolves `id`; anything that does not lead to a live LUN is unknown.
    pub(super) async fn locate(&self, id: &BlockDeviceId) -> Result<Located, BlockDeviceError> {
        let unknown = || BlockDeviceError::UnknownVolume { id: id.clone() };

        let (name, record) = match &self.metadata {
            None => {
                let dataset = id.dataset().ok_or_else(unknown)?;
                (self.naming.encode(dataset), None)
            }
            Some(store) => {
                let record_id = id.record_id().ok_or_else(unknown)?;
                let record = store
                    .get_by_id(record_id)
                    .await
                    .map_err(|err| BlockDeviceError::metadata(id, &err))?
                    .ok_or_else(unknown)?;
                (record.name.clone(), Some(record))
            }
        };

        let lun = self
            .array
            .lun(&name)
            .await
            .map_err(|err| BlockDeviceError::backend(id, err))?
            .filter(|lun| !lun.is_destroying())
            .ok_or_else(unknown)?;
        Ok(Located { lun, record })
    }

    pub(super) async fn groups_for(
        &self,
        id: &BlockDeviceId,
    ) -> Result<Vec<HostGroup>, BlockDeviceError> {
        self.array
            .host_groups()
            .await
            .map_err(|err| BlockDeviceError::backend(id, err))
    }

    /// Builds the descriptor of `lun`; `None` when its identity cannot be
    /// recovered.
    pub(super) fn describe(
        &self,
        lun: &Lun,
        record: Option<&VolumeRecord>,
        groups: &[HostGroup],
    ) -> Option<Volume> {
        let (blockdevice_id, dataset_id) = match record {
            Some(record) => (BlockDeviceId::for_record(record.id), record.dataset_id),
            None => {
                let dataset = self.naming.decode(&lun.name)?;
                (BlockDeviceId::for_dataset(dataset), dataset)
            }
        };
        Some(Volume {
            blockdevice_id,
            dataset_id,
            size_bytes: lun.size_bytes,
            attached_to: groups
                .iter()
                .find(|group| group.has_lun(lun))
                .map(|group| group.name.clone()),
            cluster_id: self.naming.cluster(),
            array_handle: ArrayHandle {
                family: self.family(),
                lun_id: lun.id.clone(),
                lun_name: lun.name.clone(),
                keys: lun.keys.clone(),
            },
        })
    }

    /// Rewrites the metadata record of `located`, if it has one.
    pub(super) async fn update_record(
        &self,
        located: &Located,
        change: impl FnOnce(&mut VolumeRecord),
    ) -> Result<(), BlockDeviceError> {
        let (Some(store), Some(record)) = (&self.metadata, &located.record) else {
            return Ok(());
        };
        let mut updated = record.clone();
        change(&mut updated);
        store
            .update(record.id, &updated)
            .await
            .map_err(|err| BlockDeviceError::metadata(record.id, &err))
    }
}
