//! ScaleIO gateway payloads and their translation into array types.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::array::http::{RestResponse, lenient_u64};
use crate::array::{HostGroup, Lun, LunMapping, LunState, StoragePool};

const KIB: u64 = 1024;

/// ScaleIO error code for a volume already mapped to another SDC.
const SINGLE_SDC_ONLY: u64 = 306;

#[derive(Clone, Debug, Deserialize)]
pub(super) struct Named {
    pub(super) id: String,
    pub(super) name: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PoolStatistics {
    #[serde(deserialize_with = "lenient_u64", default)]
    pub(super) max_capacity_in_kb: u64,
    #[serde(deserialize_with = "lenient_u64", default)]
    pub(super) capacity_in_use_in_kb: u64,
}

impl PoolStatistics {
    pub(super) fn to_pool(&self, pool: Named) -> StoragePool {
        StoragePool {
            id: pool.id,
            name: pool.name,
            free_bytes: self
                .max_capacity_in_kb
                .saturating_sub(self.capacity_in_use_in_kb)
                .saturating_mul(KIB),
            total_bytes: self.max_capacity_in_kb.saturating_mul(KIB),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct MappedSdc {
    pub(super) sdc_id: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SioVolume {
    pub(super) id: String,
    #[serde(default)]
    pub(super) name: Option<String>,
    #[serde(deserialize_with = "lenient_u64")]
    pub(super) size_in_kb: u64,
    #[serde(default)]
    pub(super) storage_pool_id: Option<String>,
    #[serde(default)]
    pub(super) mapped_sdc_info: Option<Vec<MappedSdc>>,
}

impl SioVolume {
    pub(super) fn to_lun(&self) -> Lun {
        let mut keys = BTreeMap::new();
        keys.insert(String::from("volume_id"), self.id.clone());
        Lun {
            id: self.id.clone(),
            name: self.name.clone().unwrap_or_default(),
            size_bytes: self.size_in_kb.saturating_mul(KIB),
            state: LunState::Ready,
            pool: self.storage_pool_id.clone(),
            wwn: None,
            keys,
        }
    }

    fn mapped_to(&self, sdc_id: &str) -> bool {
        self.mapped_sdc_info
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|mapped| mapped.sdc_id == sdc_id)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct Sdc {
    pub(super) id: String,
    pub(super) sdc_guid: String,
}

/// SDCs stand in for host groups: the group name is the lowercase GUID the
/// connector reports as instance id. SDC mappings have no host LUN number.
pub(super) fn sdc_groups(sdcs: Vec<Sdc>, volumes: &[SioVolume]) -> Vec<HostGroup> {
    sdcs.into_iter()
        .map(|sdc| {
            let guid = sdc.sdc_guid.to_ascii_lowercase();
            HostGroup {
                mappings: volumes
                    .iter()
                    .filter(|volume| volume.mapped_to(&sdc.id))
                    .map(|volume| LunMapping {
                        lun_id: volume.id.clone(),
                        hlu: 0,
                    })
                    .collect(),
                initiators: vec![guid.clone()],
                id: sdc.id,
                name: guid,
            }
        })
        .collect()
}

/// Gateway error classes the client reacts to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Fault {
    NotFound,
    NameInUse,
    AlreadyMapped,
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(deserialize_with = "lenient_u64", default)]
    error_code: u64,
}

pub(super) fn fault(response: &RestResponse) -> Fault {
    let Ok(body) = response.json::<ErrorBody>() else {
        return Fault::Other;
    };
    let message = body.message.to_ascii_lowercase();
    if body.error_code == SINGLE_SDC_ONLY {
        Fault::AlreadyMapped
    } else if message.contains("already in use") || message.contains("already exists") {
        Fault::NameInUse
    } else if message.contains("could not find") || message.contains("not found") {
        Fault::NotFound
    } else {
        Fault::Other
    }
}

/// The gateway answers JSON strings, such as login tokens, with quotes.
pub(super) fn json_string(response: &RestResponse) -> String {
    response
        .json::<String>()
        .unwrap_or_else(|_| response.text().trim().trim_matches('"').to_owned())
}
