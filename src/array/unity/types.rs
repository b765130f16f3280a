//! Unisphere REST payloads and their translation into array types.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::array::http::{RestResponse, lenient_u64};
use crate::array::{ArrayError, HostGroup, Lun, LunMapping, LunState, StoragePool, TargetPortal};

/// Health value Unisphere reports for a fully usable object.
const HEALTH_OK: u64 = 5;
/// Healthy, but an operation such as initial allocation is still running.
const HEALTH_OK_BUT: u64 = 7;
const HEALTH_DEGRADED: u64 = 10;
const HEALTH_UNKNOWN: u64 = 0;

/// Error codes Unisphere uses for name collisions.
const LUN_NAME_IN_USE: u64 = 108_007_744;
const HOST_NAME_IN_USE: u64 = 131_149_829;
const ALU_ALREADY_ATTACHED: u64 = 108_007_573;

const ISCSI_PORT: u16 = 3260;

/// `{"entries": [{"content": ...}]}` collection envelope.
#[derive(Debug, Deserialize)]
pub(super) struct Collection<T> {
    #[serde(default = "Vec::new")]
    entries: Vec<Entry<T>>,
}

#[derive(Debug, Deserialize)]
pub(super) struct Entry<T> {
    pub(super) content: T,
}

impl<T> Collection<T> {
    pub(super) fn into_items(self) -> Vec<T> {
        self.entries.into_iter().map(|entry| entry.content).collect()
    }
}

/// Decodes a collection response.
pub(super) fn collection<T: DeserializeOwned>(response: RestResponse) -> Result<Vec<T>, ArrayError> {
    Ok(response.success_json::<Collection<T>>()?.into_items())
}

/// `{"id": ...}` reference to another resource.
#[derive(Clone, Debug, Deserialize)]
pub(super) struct IdRef {
    pub(super) id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct Health {
    #[serde(deserialize_with = "lenient_u64")]
    pub(super) value: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct UnityPool {
    pub(super) id: String,
    pub(super) name: String,
    #[serde(deserialize_with = "lenient_u64", default)]
    pub(super) size_free: u64,
    #[serde(deserialize_with = "lenient_u64", default)]
    pub(super) size_total: u64,
}

impl From<UnityPool> for StoragePool {
    fn from(pool: UnityPool) -> Self {
        Self {
            id: pool.id,
            name: pool.name,
            free_bytes: pool.size_free,
            total_bytes: pool.size_total,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct UnityLun {
    pub(super) id: String,
    pub(super) name: String,
    #[serde(deserialize_with = "lenient_u64", default)]
    pub(super) size_total: u64,
    #[serde(default)]
    pub(super) health: Option<Health>,
    #[serde(default)]
    pub(super) pool: Option<IdRef>,
    #[serde(default)]
    pub(super) wwn: Option<String>,
    pub(super) storage_resource: IdRef,
}

impl UnityLun {
    pub(super) fn to_lun(&self) -> Lun {
        let mut keys = BTreeMap::new();
        keys.insert(
            String::from("storage_resource"),
            self.storage_resource.id.clone(),
        );
        Lun {
            id: self.id.clone(),
            name: self.name.clone(),
            size_bytes: self.size_total,
            state: self
                .health
                .as_ref()
                .map_or(LunState::Initializing, |health| lun_state(health.value)),
            pool: self.pool.as_ref().map(|pool| pool.id.clone()),
            wwn: self
                .wwn
                .as_ref()
                .map(|wwn| wwn.replace(':', "").to_ascii_lowercase()),
            keys,
        }
    }
}

/// Unisphere health values as LUN states.
pub(super) fn lun_state(health: u64) -> LunState {
    match health {
        HEALTH_OK => LunState::Ready,
        HEALTH_OK_BUT | HEALTH_UNKNOWN => LunState::Initializing,
        HEALTH_DEGRADED => LunState::Faulted,
        other => LunState::Other(format!("health {other}")),
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct UnityHost {
    pub(super) id: String,
    pub(super) name: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct UnityInitiator {
    pub(super) initiator_id: String,
    #[serde(default)]
    pub(super) parent_host: Option<IdRef>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct UnityHostLun {
    pub(super) host: IdRef,
    #[serde(default)]
    pub(super) lun: Option<IdRef>,
    #[serde(deserialize_with = "lenient_u64")]
    pub(super) hlu: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CapabilityProfile {
    #[serde(default)]
    pub(super) usage_tags: Vec<String>,
    pub(super) pool: IdRef,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct IscsiPortal {
    pub(super) ip_address: String,
    pub(super) iscsi_node: IdRef,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct IscsiNode {
    pub(super) id: String,
    pub(super) name: String,
}

/// Joins hosts, their initiators and host LUN rows.
pub(super) fn assemble_hosts(
    hosts: Vec<UnityHost>,
    initiators: &[UnityInitiator],
    host_luns: &[UnityHostLun],
) -> Vec<HostGroup> {
    hosts
        .into_iter()
        .map(|host| HostGroup {
            initiators: initiators
                .iter()
                .filter(|initiator| {
                    initiator
                        .parent_host
                        .as_ref()
                        .is_some_and(|parent| parent.id == host.id)
                })
                .map(|initiator| initiator.initiator_id.clone())
                .collect(),
            mappings: host_luns
                .iter()
                .filter(|row| row.host.id == host.id)
                .filter_map(|row| {
                    Some(LunMapping {
                        lun_id: row.lun.as_ref()?.id.clone(),
                        hlu: u32::try_from(row.hlu).ok()?,
                    })
                })
                .collect(),
            id: host.id,
            name: host.name,
        })
        .collect()
}

/// Pairs each portal address with the IQN of its iSCSI node.
pub(super) fn portals(portals: &[IscsiPortal], nodes: &[IscsiNode]) -> Vec<TargetPortal> {
    portals
        .iter()
        .filter_map(|portal| {
            let node = nodes.iter().find(|node| node.id == portal.iscsi_node.id)?;
            Some(TargetPortal {
                iqn: node.name.clone(),
                portal: format!("{}:{ISCSI_PORT}", portal.ip_address),
            })
        })
        .collect()
}

/// Unisphere error classes the client reacts to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Fault {
    NotFound,
    NameInUse,
    AlreadyAttached,
    Other,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    error_code: u64,
}

pub(super) fn fault(response: &RestResponse) -> Fault {
    if response.status.as_u16() == 404 {
        return Fault::NotFound;
    }
    match response.json::<ErrorEnvelope>() {
        Ok(envelope) => match envelope.error.error_code {
            LUN_NAME_IN_USE | HOST_NAME_IN_USE => Fault::NameInUse,
            ALU_ALREADY_ATTACHED => Fault::AlreadyAttached,
            _ => Fault::Other,
        },
        Err(_) => Fault::Other,
    }
}
