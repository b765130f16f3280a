//! XMS JSON payloads and their translation into array types.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::array::http::{RestResponse, lenient_u64};
use crate::array::{ArrayError, HostGroup, Lun, LunMapping, LunState, StoragePool, TargetPortal};

const KIB: u64 = 1024;
const ISCSI_PORT: u16 = 3260;

/// `{"content": ...}` wrapper of single-object lookups.
#[derive(Debug, Deserialize)]
pub(super) struct Content<T> {
    pub(super) content: T,
}

/// Cluster summary used for the version gate and capacity.
#[derive(Clone, Debug, Deserialize)]
pub(super) struct ClusterInfo {
    pub(super) name: String,
    #[serde(rename = "sys-sw-version")]
    pub(super) version: String,
    #[serde(rename = "ud-ssd-space", deserialize_with = "lenient_u64", default)]
    pub(super) space_kb: u64,
    #[serde(
        rename = "ud-ssd-space-in-use",
        deserialize_with = "lenient_u64",
        default
    )]
    pub(super) used_kb: u64,
}

impl ClusterInfo {
    /// The cluster is the only capacity container XtremIO has.
    pub(super) fn as_pool(&self) -> StoragePool {
        StoragePool {
            id: self.name.clone(),
            name: self.name.clone(),
            free_bytes: self.space_kb.saturating_sub(self.used_kb).saturating_mul(KIB),
            total_bytes: self.space_kb.saturating_mul(KIB),
        }
    }
}

/// `[guid, name, index]` reference triple.
#[derive(Clone, Debug, Deserialize)]
pub(super) struct ObjectRef(
    pub(super) String,
    pub(super) String,
    #[serde(deserialize_with = "lenient_u64")] pub(super) u64,
);

/// Entry of a volume's `lun-mapping-list`.
#[derive(Clone, Debug, Deserialize)]
pub(super) struct MappingEntry(
    pub(super) ObjectRef,
    pub(super) ObjectRef,
    #[serde(deserialize_with = "lenient_u64")] pub(super) u64,
);

#[derive(Clone, Debug, Deserialize)]
pub(super) struct XioVolume {
    pub(super) name: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub(super) index: u64,
    #[serde(rename = "vol-size", deserialize_with = "lenient_u64")]
    pub(super) size_kb: u64,
    #[serde(rename = "naa-name", default)]
    pub(super) naa: Option<String>,
    #[serde(rename = "lun-mapping-list", default)]
    pub(super) mappings: Vec<MappingEntry>,
}

impl XioVolume {
    pub(super) fn to_lun(&self) -> Lun {
        let mut keys = BTreeMap::new();
        keys.insert(String::from("vol-index"), self.index.to_string());
        Lun {
            id: self.index.to_string(),
            name: self.name.clone(),
            size_bytes: self.size_kb.saturating_mul(KIB),
            state: LunState::Ready,
            pool: None,
            wwn: self.naa.clone().filter(|naa| !naa.is_empty()),
            keys,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct XioGroup {
    pub(super) name: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub(super) index: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct XioInitiator {
    #[serde(rename = "port-address")]
    pub(super) port_address: String,
    #[serde(rename = "ig-id")]
    pub(super) group: ObjectRef,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct XioPortal {
    #[serde(rename = "ip-addr")]
    pub(super) address: String,
    #[serde(rename = "ip-port", default)]
    pub(super) port: Option<u16>,
    #[serde(rename = "port-address")]
    pub(super) iqn: String,
}

impl XioPortal {
    /// XMS reports the portal address in CIDR form.
    pub(super) fn to_portal(&self) -> TargetPortal {
        let address = self
            .address
            .split_once('/')
            .map_or(self.address.as_str(), |(address, _)| address);
        TargetPortal {
            iqn: self.iqn.clone(),
            portal: format!("{address}:{}", self.port.unwrap_or(ISCSI_PORT)),
        }
    }
}

/// Joins groups, initiators and volume mappings into host groups.
pub(super) fn assemble_groups(
    groups: Vec<XioGroup>,
    initiators: &[XioInitiator],
    volumes: &[XioVolume],
) -> Vec<HostGroup> {
    groups
        .into_iter()
        .map(|group| HostGroup {
            id: group.index.to_string(),
            initiators: initiators
                .iter()
                .filter(|initiator| initiator.group.1 == group.name)
                .map(|initiator| initiator.port_address.clone())
                .collect(),
            mappings: volumes
                .iter()
                .flat_map(|volume| {
                    volume
                        .mappings
                        .iter()
                        .filter(|entry| entry.0.1 == group.name)
                        .filter_map(|entry| {
                            Some(LunMapping {
                                lun_id: volume.index.to_string(),
                                hlu: u32::try_from(entry.2).ok()?,
                            })
                        })
                })
                .collect(),
            name: group.name,
        })
        .collect()
}

/// Decodes the array found under `kind` in a `?full=1` listing.
pub(super) fn listing<T: DeserializeOwned>(response: RestResponse, kind: &str) -> Result<Vec<T>, ArrayError> {
    let mut body: serde_json::Map<String, Value> = response.success_json()?;
    match body.remove(kind) {
        Some(items) => serde_json::from_value(items).map_err(ArrayError::from),
        None => Ok(Vec::new()),
    }
}

/// XMS error classes the clients react to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Fault {
    NotFound,
    NameNotUnique,
    AlreadyMapped,
    Other,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// XMS answers domain errors with HTTP 400 and a symbolic `message`.
pub(super) fn fault(response: &RestResponse) -> Fault {
    if response.status.as_u16() != 400 {
        return Fault::Other;
    }
    let Ok(body) = response.json::<ErrorBody>() else {
        return Fault::Other;
    };
    if body.message.ends_with("obj_not_found") {
        Fault::NotFound
    } else if body.message.contains("name_not_unique") {
        Fault::NameNotUnique
    } else if body.message.contains("already_mapped") || body.message.contains("already_exists") {
        Fault::AlreadyMapped
    } else {
        Fault::Other
    }
}

/// Parses `major.minor` out of a `sys-sw-version` such as `4.0.2-80`.
pub(super) fn software_version(raw: &str) -> Option<(u32, u32)> {
    let release = raw.split('-').next()?;
    let mut parts = release.split('.');
    let major = parts.next()?.trim().parse().ok()?;
    let minor = parts.next().map_or(Some(0), |minor| minor.trim().parse().ok())?;
    Some((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use reqwest::header::HeaderMap;
    use rstest::rstest;

    fn response(status: StatusCode, body: &str) -> RestResponse {
        RestResponse {
            status,
            headers: HeaderMap::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    fn volume(raw: &str) -> XioVolume {
        serde_json::from_str(raw).unwrap_or_else(|err| panic!("volume should decode: {err}"))
    }

    #[rstest]
    #[case("2.4.0-25", Some((2, 4)))]
    #[case("4.0.2-80", Some((4, 0)))]
    #[case("3", Some((3, 0)))]
    #[case("beta", None)]
    fn parses_software_versions(#[case] raw: &str, #[case] expected: Option<(u32, u32)>) {
        assert_eq!(software_version(raw), expected);
    }

    #[rstest]
    #[case(r#"{"message": "obj_not_found", "error_code": 400}"#, Fault::NotFound)]
    #[case(r#"{"message": "vol_obj_name_not_unique", "error_code": 400}"#, Fault::NameNotUnique)]
    #[case(r#"{"message": "ig_obj_name_not_unique", "error_code": 400}"#, Fault::NameNotUnique)]
    #[case(r#"{"message": "vol_already_mapped", "error_code": 400}"#, Fault::AlreadyMapped)]
    #[case(r#"{"message": "bad_request"}"#, Fault::Other)]
    #[case("not json", Fault::Other)]
    fn classifies_bad_requests(#[case] body: &str, #[case] expected: Fault) {
        assert_eq!(fault(&response(StatusCode::BAD_REQUEST, body)), expected);
    }

    #[test]
    fn server_errors_are_never_domain_faults() {
        let failure = response(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"message": "obj_not_found"}"#,
        );
        assert_eq!(fault(&failure), Fault::Other);
    }

    #[test]
    fn volume_sizes_are_reported_in_kib() {
        let lun = volume(
            r#"{"name": "flocker--1a2b3c4d--block-x", "index": "7", "vol-size": "1048576",
                "naa-name": "514f0c5e3b800007"}"#,
        )
        .to_lun();
        assert_eq!(lun.id, "7");
        assert_eq!(lun.size_bytes, 1 << 30);
        assert_eq!(lun.wwn.as_deref(), Some("514f0c5e3b800007"));
        assert_eq!(lun.state, LunState::Ready);
    }

    #[test]
    fn cluster_capacity_becomes_a_single_pool() {
        let cluster: ClusterInfo = serde_json::from_str(
            r#"{"name": "xbrick1", "sys-sw-version": "4.0.2-80",
                "ud-ssd-space": "10485760", "ud-ssd-space-in-use": "2097152"}"#,
        )
        .unwrap_or_else(|err| panic!("cluster should decode: {err}"));
        let pool = cluster.as_pool();
        assert_eq!(pool.name, "xbrick1");
        assert_eq!(pool.total_bytes, 10 << 30);
        assert_eq!(pool.free_bytes, 8 << 30);
    }

    #[test]
    fn mappings_attach_to_their_initiator_group() {
        let volumes = vec![volume(
            r#"{"name": "v1", "index": 3, "vol-size": 1024,
                "lun-mapping-list": [[["g1", "node-a", 2], ["t1", "Default", 1], 5]]}"#,
        )];
        let groups: Vec<XioGroup> = serde_json::from_str(
            r#"[{"name": "node-a", "index": 2}, {"name": "node-b", "index": "4"}]"#,
        )
        .unwrap_or_else(|err| panic!("groups should decode: {err}"));
        let initiators: Vec<XioInitiator> = serde_json::from_str(
            r#"[{"port-address": "iqn.1994-05.com.redhat:a", "ig-id": ["g1", "node-a", 2]}]"#,
        )
        .unwrap_or_else(|err| panic!("initiators should decode: {err}"));

        let assembled = assemble_groups(groups, &initiators, &volumes);
        let node_a = assembled
            .iter()
            .find(|group| group.name == "node-a")
            .unwrap_or_else(|| panic!("node-a missing: {assembled:?}"));
        assert_eq!(node_a.id, "2");
        assert_eq!(node_a.initiators, vec![String::from("iqn.1994-05.com.redhat:a")]);
        assert_eq!(
            node_a.mappings,
            vec![LunMapping {
                lun_id: String::from("3"),
                hlu: 5
            }]
        );
        let node_b = assembled
            .iter()
            .find(|group| group.name == "node-b")
            .unwrap_or_else(|| panic!("node-b missing: {assembled:?}"));
        assert!(node_b.mappings.is_empty());
    }

    #[test]
    fn portal_strips_prefix_length() {
        let portal: XioPortal = serde_json::from_str(
            r#"{"ip-addr": "10.0.0.5/24", "port-address": "iqn.2008-05.com.xtremio:xio00"}"#,
        )
        .unwrap_or_else(|err| panic!("portal should decode: {err}"));
        assert_eq!(portal.to_portal().portal, "10.0.0.5:3260");
    }

    #[test]
    fn listing_tolerates_missing_collection() {
        let items: Vec<XioGroup> = listing(response(StatusCode::OK, "{}"), "initiator-groups")
            .unwrap_or_else(|err| panic!("empty listing should decode: {err}"));
        assert!(items.is_empty());
    }
}
