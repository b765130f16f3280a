//! Unisphere for VMAX payloads, naming rules and unit conversions.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Number, Value, json};

use crate::array::http::{RestResponse, lenient_u64};
use crate::array::{Lun, LunState, StoragePool};

/// One VMAX cylinder: 15 tracks of 128 KiB.
pub(super) const CYLINDER: u64 = 1920 * 1024;
const GIB: u64 = 1 << 30;
const MILLI: u64 = 1000;

/// `{"srpId": [...]}`, `{"hostId": [...]}` and friends.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct IdList {
    #[serde(default)]
    pub(super) srp_id: Vec<String>,
    #[serde(default)]
    pub(super) host_id: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct Srp {
    pub(super) srp_id: String,
    #[serde(rename = "total_usable_cap_gb", default)]
    pub(super) usable_gb: Option<Number>,
    #[serde(rename = "total_allocated_cap_gb", default)]
    pub(super) allocated_gb: Option<Number>,
}

impl Srp {
    pub(super) fn to_pool(&self) -> StoragePool {
        let total = self.usable_gb.as_ref().and_then(gigabytes).unwrap_or(0);
        let used = self.allocated_gb.as_ref().and_then(gigabytes).unwrap_or(0);
        StoragePool {
            id: self.srp_id.clone(),
            name: self.srp_id.clone(),
            free_bytes: total.saturating_sub(used),
            total_bytes: total,
        }
    }
}

/// Converts a decimal GB figure to bytes, keeping three fractional digits.
pub(super) fn gigabytes(value: &Number) -> Option<u64> {
    let text = value.to_string();
    let (whole, fraction) = text.split_once('.').unwrap_or((text.as_str(), ""));
    let whole: u64 = whole.parse().ok()?;
    let digits: String = fraction.chars().chain("000".chars()).take(3).collect();
    let thousandths: u64 = digits.parse().ok()?;
    let fractional = GIB.checked_mul(thousandths)?.checked_div(MILLI)?;
    whole.checked_mul(GIB)?.checked_add(fractional)
}

/// Cylinders needed to hold `size_bytes`.
pub(super) const fn cylinders(size_bytes: u64) -> u64 {
    size_bytes.div_ceil(CYLINDER)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct VolumeQuery {
    #[serde(default)]
    pub(super) result_list: Option<ResultList>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ResultList {
    #[serde(default)]
    pub(super) result: Vec<VolumeRef>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct VolumeRef {
    pub(super) volume_id: String,
}

impl VolumeQuery {
    pub(super) fn ids(self) -> Vec<String> {
        self.result_list
            .map(|list| list.result.into_iter().map(|found| found.volume_id).collect())
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct VmaxVolume {
    pub(super) volume_id: String,
    #[serde(rename = "volume_identifier", default)]
    pub(super) identifier: Option<String>,
    #[serde(rename = "cap_cyl", deserialize_with = "lenient_u64")]
    pub(super) cylinders: u64,
    #[serde(default)]
    pub(super) wwn: Option<String>,
    #[serde(default)]
    pub(super) storage_group_id: Vec<String>,
}

impl VmaxVolume {
    pub(super) fn to_lun(&self, symmetrix_id: &str) -> Lun {
        let mut keys = BTreeMap::new();
        keys.insert(String::from("DeviceID"), self.volume_id.clone());
        keys.insert(String::from("SystemName"), symmetrix_id.to_owned());
        keys.insert(
            String::from("StorageGroups"),
            self.storage_group_id.join(","),
        );
        Lun {
            id: self.volume_id.clone(),
            name: self.identifier.clone().unwrap_or_default(),
            size_bytes: self.cylinders.saturating_mul(CYLINDER),
            state: LunState::Ready,
            pool: None,
            wwn: self.wwn.as_ref().map(|wwn| wwn.to_ascii_lowercase()),
            keys,
        }
    }
}

/// Storage groups recorded on a LUN by [`VmaxVolume::to_lun`].
pub(super) fn storage_groups(lun: &Lun) -> Vec<String> {
    lun.keys
        .get("StorageGroups")
        .map(|groups| {
            groups
                .split(',')
                .filter(|group| !group.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct VmaxHost {
    pub(super) host_id: String,
    #[serde(default)]
    pub(super) initiator: Vec<String>,
    #[serde(default)]
    pub(super) maskingview: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct Connections {
    #[serde(default)]
    pub(super) masking_view_connection: Vec<Connection>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct Connection {
    pub(super) volume_id: String,
    pub(super) host_lun_address: String,
}

/// Host LUN addresses are hexadecimal strings such as `0001`.
pub(super) fn host_lun(address: &str) -> Option<u32> {
    u32::from_str_radix(address.trim().trim_start_matches("0x"), 16).ok()
}

/// Per-SRP storage group new volumes are created in.
pub(super) fn default_storage_group(srp: &str) -> String {
    format!("FLOCKER_{srp}_SG")
}

/// Per-host storage group holding the host's mapped volumes.
pub(super) fn host_storage_group(host: &str) -> String {
    format!("{host}_SG")
}

/// Per-host masking view tying host, port group and storage group.
pub(super) fn masking_view(host: &str) -> String {
    format!("{host}_MV")
}

pub(super) fn add_volume_payload(name: &str, size_bytes: u64) -> Value {
    json!({
        "editStorageGroupActionParam": {
            "expandStorageGroupParam": {
                "addVolumeParam": {
                    "num_of_vols": 1,
                    "emulation": "FBA",
                    "volumeAttribute": {
                        "volume_size": cylinders(size_bytes).to_string(),
                        "capacityUnit": "CYL",
                    },
                    "volumeIdentifier": {
                        "identifier_name": name,
                        "volumeIdentifierChoice": "identifier_name",
                    },
                },
            },
        },
    })
}

pub(super) fn expand_volume_payload(size_bytes: u64) -> Value {
    json!({
        "editVolumeActionParam": {
            "expandVolumeParam": {
                "volumeAttribute": {
                    "volume_size": cylinders(size_bytes).to_string(),
                    "capacityUnit": "CYL",
                },
            },
        },
    })
}

pub(super) fn add_existing_volume_payload(volume_id: &str) -> Value {
    json!({
        "editStorageGroupActionParam": {
            "expandStorageGroupParam": {
                "addSpecificVolumeParam": { "volumeId": [volume_id] },
            },
        },
    })
}

pub(super) fn remove_volume_payload(volume_id: &str) -> Value {
    json!({
        "editStorageGroupActionParam": {
            "removeVolumeParam": { "volumeId": [volume_id] },
        },
    })
}

pub(super) fn masking_view_payload(host: &str, port_group: &str) -> Value {
    json!({
        "maskingViewId": masking_view(host),
        "hostOrHostGroupSelection": {
            "useExistingHostParam": { "hostId": host },
        },
        "portGroupSelection": {
            "useExistingPortGroupParam": { "portGroupId": port_group },
        },
        "storageGroupSelection": {
            "useExistingStorageGroupParam": { "storageGroupId": host_storage_group(host) },
        },
    })
}

/// Unisphere error classes the client reacts to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Fault {
    NotFound,
    AlreadyExists,
    Other,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

pub(super) fn fault(response: &RestResponse) -> Fault {
    if response.status.as_u16() == 404 {
        return Fault::NotFound;
    }
    let message = response
        .json::<ErrorBody>()
        .map(|body| body.message)
        .unwrap_or_else(|_| response.text())
        .to_ascii_lowercase();
    if message.contains("already exists") || message.contains("already in use") {
        Fault::AlreadyExists
    } else if message.contains("cannot be found") || message.contains("does not exist") {
        Fault::NotFound
    } else {
        Fault::Other
    }
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

    #[rstest]
    #[case("100", Some(100 << 30))]
    #[case("1.5", Some(GIB + (GIB >> 1)))]
    #[case("0.25", Some(GIB >> 2))]
    fn decimal_gigabytes_become_bytes(#[case] raw: &str, #[case] expected: Option<u64>) {
        let number: Number =
            serde_json::from_str(raw).unwrap_or_else(|err| panic!("{raw} should parse: {err}"));
        assert_eq!(gigabytes(&number), expected);
    }

    #[test]
    fn srp_capacity_becomes_a_pool() {
        let srp: Srp = serde_json::from_str(
            r#"{"srpId": "SRP_1", "total_usable_cap_gb": 1000.0, "total_allocated_cap_gb": 250.5}"#,
        )
        .unwrap_or_else(|err| panic!("srp should decode: {err}"));
        let pool = srp.to_pool();
        assert_eq!(pool.name, "SRP_1");
        assert_eq!(pool.total_bytes, 1000 << 30);
        assert_eq!(pool.free_bytes, (1000 << 30) - (250 << 30) - (GIB >> 1));
    }

    #[test]
    fn gib_rounds_to_whole_cylinders() {
        assert_eq!(cylinders(GIB), 547);
        assert_eq!(cylinders(547 * CYLINDER), 547);
    }

    #[test]
    fn volume_keeps_device_keys_and_groups() {
        let volume: VmaxVolume = serde_json::from_str(
            r#"{"volumeId": "0012A", "volume_identifier": "FLOCKER--1a2b3c4d--x",
                "cap_cyl": 547, "wwn": "60000970000197600123533030313241",
                "storageGroupId": ["FLOCKER_SRP_1_SG", "node-a_SG"]}"#,
        )
        .unwrap_or_else(|err| panic!("volume should decode: {err}"));
        let lun = volume.to_lun("000197600123");
        assert_eq!(lun.size_bytes, 547 * CYLINDER);
        assert_eq!(lun.keys.get("DeviceID").map(String::as_str), Some("0012A"));
        assert_eq!(
            lun.keys.get("SystemName").map(String::as_str),
            Some("000197600123")
        );
        assert_eq!(
            storage_groups(&lun),
            vec![String::from("FLOCKER_SRP_1_SG"), String::from("node-a_SG")]
        );
    }

    #[test]
    fn empty_query_has_no_ids() {
        let query: VolumeQuery = serde_json::from_str(r#"{"count": 0}"#)
            .unwrap_or_else(|err| panic!("query should decode: {err}"));
        assert!(query.ids().is_empty());
    }

    #[rstest]
    #[case("0001", Some(1))]
    #[case("00FF", Some(255))]
    #[case("zz", None)]
    fn host_lun_addresses_are_hex(#[case] raw: &str, #[case] expected: Option<u32>) {
        assert_eq!(host_lun(raw), expected);
    }

    #[test]
    fn masking_view_binds_host_objects() {
        let payload = masking_view_payload("node-a", "PG_ISCSI");
        assert_eq!(payload["maskingViewId"], "node-a_MV");
        assert_eq!(
            payload["storageGroupSelection"]["useExistingStorageGroupParam"]["storageGroupId"],
            "node-a_SG"
        );
        assert_eq!(
            payload["portGroupSelection"]["useExistingPortGroupParam"]["portGroupId"],
            "PG_ISCSI"
        );
    }

    #[test]
    fn new_volumes_are_sized_in_cylinders() {
        let payload = add_volume_payload("FLOCKER--x", GIB);
        let attribute = &payload["editStorageGroupActionParam"]["expandStorageGroupParam"]
            ["addVolumeParam"]["volumeAttribute"];
        assert_eq!(attribute["volume_size"], "547");
        assert_eq!(attribute["capacityUnit"], "CYL");
    }

    #[rstest]
    #[case(StatusCode::NOT_FOUND, "", Fault::NotFound)]
    #[case(
        StatusCode::BAD_REQUEST,
        r#"{"message": "A Storage Group with the name node-a_SG already exists"}"#,
        Fault::AlreadyExists
    )]
    #[case(
        StatusCode::BAD_REQUEST,
        r#"{"message": "Masking View node-a_MV cannot be found"}"#,
        Fault::NotFound
    )]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, "oops", Fault::Other)]
    fn classifies_errors(#[case] status: StatusCode, #[case] body: &str, #[case] expected: Fault) {
        assert_eq!(fault(&response(status, body)), expected);
    }
}
