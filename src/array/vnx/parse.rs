//! Parsers for `naviseccli` listing output.

use std::collections::BTreeMap;

use crate::array::{HostGroup, Lun, LunMapping, LunState, StoragePool, TargetPortal};

const BLOCK_SIZE: u64 = 512;
const ISCSI_PORT: u16 = 3260;

/// One `key: value` record of a listing.
pub(super) type Record = BTreeMap<String, String>;

/// Splits listing output into records, each starting at `first_key`.
///
/// Header lines without a colon (`LOGICAL UNIT NUMBER 5`) are keyed by
/// `first_key` with the rest of the line as value.
pub(super) fn records(output: &str, first_key: &str) -> Vec<Record> {
    let mut found: Vec<Record> = Vec::new();
    for line in output.lines().map(str::trim) {
        let entry = line
            .split_once(':')
            .map(|(key, value)| (key.trim(), value.trim()))
            .or_else(|| {
                line.strip_prefix(first_key)
                    .map(|rest| (first_key, rest.trim()))
            });
        let Some((key, value)) = entry else {
            continue;
        };
        if key == first_key {
            found.push(Record::new());
        }
        if let Some(current) = found.last_mut() {
            current
                .entry(key.to_owned())
                .or_insert_with(|| value.to_owned());
        }
    }
    found
}

fn blocks(record: &Record, key: &str) -> u64 {
    record
        .get(key)
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(0)
        .saturating_mul(BLOCK_SIZE)
}

/// Pools from `storagepool -list -availableCap -userCap`.
pub(super) fn pools(output: &str) -> Vec<StoragePool> {
    records(output, "Pool Name")
        .iter()
        .filter_map(|record| {
            let name = record.get("Pool Name")?.clone();
            Some(StoragePool {
                id: record.get("Pool ID").cloned().unwrap_or_else(|| name.clone()),
                free_bytes: blocks(record, "Available Capacity (Blocks)"),
                total_bytes: blocks(record, "User Capacity (Blocks)"),
                name,
            })
        })
        .collect()
}

/// VNX states, refined by the pending operation.
pub(super) fn lun_state(state: &str, operation: Option<&str>) -> LunState {
    let idle = operation.is_none_or(|operation| operation.eq_ignore_ascii_case("none"));
    match state.to_ascii_lowercase().as_str() {
        "initializing" => LunState::Initializing,
        "ready" if idle => LunState::Ready,
        "faulted" if idle => LunState::Faulted,
        "ready" | "faulted" => LunState::Busy,
        "destroying" => LunState::Destroying,
        _ => LunState::Other(state.to_owned()),
    }
}

/// LUNs from `lun -list -all`.
pub(super) fn luns(output: &str) -> Vec<Lun> {
    records(output, "LOGICAL UNIT NUMBER")
        .iter()
        .filter_map(|record| {
            let id = record.get("LOGICAL UNIT NUMBER")?.clone();
            let name = record.get("Name")?.clone();
            let mut keys = BTreeMap::new();
            keys.insert(String::from("alu"), id.clone());
            Some(Lun {
                size_bytes: blocks(record, "User Capacity (Blocks)"),
                state: lun_state(
                    record.get("Current State").map_or("", String::as_str),
                    record.get("Current Operation").map(String::as_str),
                ),
                pool: record.get("Pool Name").cloned(),
                wwn: record
                    .get("UID")
                    .map(|uid| uid.replace(':', "").to_ascii_lowercase()),
                id,
                name,
                keys,
            })
        })
        .collect()
}

#[derive(Clone, Copy)]
enum Section {
    Header,
    Initiators,
    Mappings,
}

/// Storage groups from `storagegroup -list`.
pub(super) fn storage_groups(output: &str) -> Vec<HostGroup> {
    let mut groups: Vec<HostGroup> = Vec::new();
    let mut section = Section::Header;
    for line in output.lines().map(str::trim) {
        if let Some(name) = line.strip_prefix("Storage Group Name:") {
            groups.push(HostGroup {
                id: name.trim().to_owned(),
                name: name.trim().to_owned(),
                initiators: Vec::new(),
                mappings: Vec::new(),
            });
            section = Section::Header;
            continue;
        }
        let Some(group) = groups.last_mut() else {
            continue;
        };
        if line.starts_with("HBA UID") {
            section = Section::Initiators;
            continue;
        }
        if line.starts_with("HLU/ALU Pairs") {
            section = Section::Mappings;
            continue;
        }
        if line.is_empty() || line.starts_with('-') || line.starts_with("HLU Number") {
            continue;
        }
        match section {
            Section::Header => {}
            Section::Initiators => {
                if line.ends_with(':') || line.starts_with("Shareable") {
                    section = Section::Header;
                    continue;
                }
                if let Some(uid) = line.split_whitespace().next() {
                    let normalized = normalize_hba_uid(uid);
                    if !group.initiators.contains(&normalized) {
                        group.initiators.push(normalized);
                    }
                }
            }
            Section::Mappings => {
                let mut numbers = line.split_whitespace().map(str::parse::<u32>);
                match (numbers.next(), numbers.next()) {
                    (Some(Ok(hlu)), Some(Ok(alu))) => group.mappings.push(LunMapping {
                        lun_id: alu.to_string(),
                        hlu,
                    }),
                    _ => section = Section::Header,
                }
            }
        }
    }
    groups
}

/// FC HBA UIDs are `WWNN:WWPN` in colon notation; the port name is what the
/// host reports, so only that half is kept. iSCSI names pass through.
pub(super) fn normalize_hba_uid(uid: &str) -> String {
    let hex: String = uid.chars().filter(|c| *c != ':').collect();
    let is_fc = hex.len() == 32 && hex.chars().all(|c| c.is_ascii_hexdigit());
    if is_fc {
        hex.chars().skip(16).collect::<String>().to_ascii_lowercase()
    } else {
        uid.to_owned()
    }
}

/// iSCSI ports from `connection -getport -address`.
pub(super) fn target_portals(output: &str) -> Vec<TargetPortal> {
    records(output, "SP")
        .iter()
        .filter_map(|record| {
            let iqn = record.get("Port WWN")?;
            let address = record.get("IP Address")?;
            if !iqn.starts_with("iqn.") || address.is_empty() || address == "N/A" {
                return None;
            }
            Some(TargetPortal {
                iqn: iqn.clone(),
                portal: format!("{address}:{ISCSI_PORT}"),
            })
        })
        .collect()
}

/// Front-end port an initiator path is registered against.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct SpPort {
    /// Lowercase storage processor letter, `a` or `b`.
    pub(super) sp: String,
    pub(super) port_id: String,
    pub(super) virtual_port: Option<String>,
}

fn sp_letter(value: &str) -> Option<String> {
    let letter = value.trim().trim_start_matches("SP").trim();
    (!letter.is_empty()).then(|| letter.to_ascii_lowercase())
}

/// iSCSI ports with a target name, from `connection -getport -address -vlanid`.
pub(super) fn iscsi_ports(output: &str) -> Vec<SpPort> {
    records(output, "SP")
        .iter()
        .filter(|record| {
            record
                .get("Port WWN")
                .is_some_and(|wwn| wwn.starts_with("iqn."))
        })
        .filter_map(|record| {
            Some(SpPort {
                sp: sp_letter(record.get("SP")?)?,
                port_id: record.get("Port ID")?.clone(),
                virtual_port: Some(
                    record
                        .get("Virtual Port ID")
                        .cloned()
                        .unwrap_or_else(|| String::from("0")),
                ),
            })
        })
        .collect()
}

/// Fibre Channel ports from `port -list -sp`.
pub(super) fn fc_ports(output: &str) -> Vec<SpPort> {
    let mut found: Vec<SpPort> = Vec::new();
    for record in records(output, "SP Name") {
        let wwn_uid = record
            .get("SP UID")
            .is_some_and(|uid| !uid.starts_with("iqn."));
        let (Some(name), Some(port_id)) = (record.get("SP Name"), record.get("SP Port ID")) else {
            continue;
        };
        let Some(sp) = sp_letter(name).filter(|_| wwn_uid) else {
            continue;
        };
        let port = SpPort {
            sp,
            port_id: port_id.clone(),
            virtual_port: None,
        };
        if !found.contains(&port) {
            found.push(port);
        }
    }
    found
}

/// `WWNN:WWPN` HBA UID for a port name; the node name shares the port name's
/// vendor bytes with a leading `20:00`.
pub(super) fn fc_hba_uid(wwpn: &str) -> String {
    let hex: String = wwpn
        .chars()
        .filter(char::is_ascii_hexdigit)
        .collect::<String>()
        .to_ascii_uppercase();
    let vendor: String = hex.chars().skip(4).collect();
    let node = format!("2000{vendor}");
    let pairs = |digits: &str| {
        digits
            .as_bytes()
            .chunks(2)
            .map(|pair| String::from_utf8_lossy(pair).into_owned())
            .collect::<Vec<_>>()
            .join(":")
    };
    format!("{}:{}", pairs(&node), pairs(&hex))
}

/// Smallest host LUN number not used by `group`.
pub(super) fn free_hlu(group: &HostGroup, max: u32) -> Option<u32> {
    (1..=max).find(|hlu| !group.mappings.iter().any(|mapping| mapping.hlu == *hlu))
}

/// `naviseccli` failure classes the client reacts to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Fault {
    NotFound,
    NameInUse,
    AlreadyMapped,
    HluTaken,
    Other,
}

/// Classifies the text of a failed `naviseccli` run.
pub(super) fn fault(text: &str) -> Fault {
    let lower = text.to_ascii_lowercase();
    if lower.contains("0x712d8d04") || lower.contains("name already exists") {
        Fault::NameInUse
    } else if lower.contains("host lun number is already in use") {
        Fault::HluTaken
    } else if lower.contains("already exists in the specified storage group")
        || lower.contains("already been added")
    {
        Fault::AlreadyMapped
    } else if lower.contains("already in use") {
        Fault::NameInUse
    } else if lower.contains("may not exist")
        || lower.contains("does not exist")
        || lower.contains("does not match any")
    {
        Fault::NotFound
    } else {
        Fault::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const LUN_LIST: &str = "\
LOGICAL UNIT NUMBER 5
Name:  flocker--1a2b3c4d--block-5e1f
UID:  60:06:01:60:3A:B0:33:00:8C:2E:7F:2C:FC:3C:E6:11
Current Owner:  SP A
User Capacity (Blocks):  2097152
User Capacity (GBs):  1.000
Pool Name:  Pool 0
Current State:  Ready
Current Operation:  None

LOGICAL UNIT NUMBER 6
Name:  flocker--1a2b3c4d--block-77aa
User Capacity (Blocks):  4194304
Current State:  Ready
Current Operation:  Expand
";

    const STORAGE_GROUPS: &str = "\
Storage Group Name:    node-a
Storage Group UID:     0B:1A:2B:3C:4D:5E:6F:70:81:92:A3:B4:C5:D6:E7:F8
HBA/SP Pairs:

  HBA UID                                          SP Name     SPPort
  -------                                          -------     ------
  iqn.1994-05.com.redhat:node-a                     SP A         4
  iqn.1994-05.com.redhat:node-a                     SP B         4
  20:00:00:00:C9:12:34:56:10:00:00:00:C9:12:34:56   SP A         0

HLU/ALU Pairs:

  HLU Number     ALU Number
  ----------     ----------
    1               5
    3               9
Shareable:             YES

Storage Group Name:    node-b
Storage Group UID:     0C:1A:2B:3C:4D:5E:6F:70:81:92:A3:B4:C5:D6:E7:F8
Shareable:             YES
";

    #[test]
    fn luns_carry_capacity_state_and_wwn() {
        let parsed = luns(LUN_LIST);
        assert_eq!(parsed.len(), 2);
        let first = parsed.first().unwrap_or_else(|| panic!("first lun"));
        assert_eq!(first.id, "5");
        assert_eq!(first.name, "flocker--1a2b3c4d--block-5e1f");
        assert_eq!(first.size_bytes, 1 << 30);
        assert_eq!(first.state, LunState::Ready);
        assert_eq!(first.pool.as_deref(), Some("Pool 0"));
        assert_eq!(
            first.wwn.as_deref(),
            Some("600601603ab033008c2e7f2cfc3ce611")
        );
        let second = parsed.get(1).unwrap_or_else(|| panic!("second lun"));
        assert_eq!(second.state, LunState::Busy);
    }

    #[rstest]
    #[case("Initializing", None, LunState::Initializing)]
    #[case("Ready", Some("None"), LunState::Ready)]
    #[case("Faulted", Some("None"), LunState::Faulted)]
    #[case("Faulted", Some("Migration"), LunState::Busy)]
    #[case("Destroying", None, LunState::Destroying)]
    #[case("Offline", None, LunState::Other(String::from("Offline")))]
    fn states_follow_operation(
        #[case] state: &str,
        #[case] operation: Option<&str>,
        #[case] expected: LunState,
    ) {
        assert_eq!(lun_state(state, operation), expected);
    }

    #[test]
    fn storage_groups_collect_initiators_and_pairs() {
        let groups = storage_groups(STORAGE_GROUPS);
        assert_eq!(groups.len(), 2);
        let node_a = groups.first().unwrap_or_else(|| panic!("node-a"));
        assert_eq!(node_a.name, "node-a");
        assert_eq!(
            node_a.initiators,
            vec![
                String::from("iqn.1994-05.com.redhat:node-a"),
                String::from("10000000c9123456"),
            ]
        );
        assert_eq!(
            node_a.mappings,
            vec![
                LunMapping {
                    lun_id: String::from("5"),
                    hlu: 1
                },
                LunMapping {
                    lun_id: String::from("9"),
                    hlu: 3
                },
            ]
        );
        let node_b = groups.get(1).unwrap_or_else(|| panic!("node-b"));
        assert!(node_b.initiators.is_empty());
        assert!(node_b.mappings.is_empty());
    }

    #[test]
    fn free_hlu_fills_gaps() {
        let groups = storage_groups(STORAGE_GROUPS);
        let node_a = groups.first().unwrap_or_else(|| panic!("node-a"));
        assert_eq!(free_hlu(node_a, 255), Some(2));
        assert_eq!(free_hlu(node_a, 1), None);
    }

    #[test]
    fn pools_report_block_capacity() {
        let parsed = pools(
            "Pool Name:  Pool 0\nPool ID:  0\nUser Capacity (Blocks):  2097152000\n\
             Available Capacity (Blocks):  1048576000\n\nPool Name:  flocker_pool\nPool ID:  1\n",
        );
        assert_eq!(parsed.len(), 2);
        let first = parsed.first().unwrap_or_else(|| panic!("first pool"));
        assert_eq!(first.id, "0");
        assert_eq!(first.total_bytes, 1000 << 30);
        assert_eq!(first.free_bytes, 500 << 30);
    }

    #[test]
    fn portals_skip_ports_without_address() {
        let found = target_portals(
            "SP:  A\nPort ID:  4\nPort WWN:  iqn.1992-04.com.emc:cx.apm00123.a4\n\
             IP Address:  10.0.0.21\n\nSP:  B\nPort ID:  0\n\
             Port WWN:  50:06:01:60:88:60:01:95:50:06:01:68:08:60:01:95\nIP Address:  N/A\n",
        );
        assert_eq!(
            found,
            vec![TargetPortal {
                iqn: String::from("iqn.1992-04.com.emc:cx.apm00123.a4"),
                portal: String::from("10.0.0.21:3260"),
            }]
        );
    }

    #[test]
    fn iscsi_ports_keep_sp_and_port() {
        let ports = iscsi_ports(
            "SP:  A\nPort ID:  4\nPort WWN:  iqn.1992-04.com.emc:cx.apm00123.a4\n\
             Virtual Port ID:  0\nIP Address:  10.0.0.21\n\nSP:  B\nPort ID:  0\n\
             Port WWN:  50:06:01:60:88:60:01:95:50:06:01:68:08:60:01:95\n",
        );
        assert_eq!(
            ports,
            vec![SpPort {
                sp: String::from("a"),
                port_id: String::from("4"),
                virtual_port: Some(String::from("0")),
            }]
        );
    }

    #[test]
    fn fc_ports_skip_iscsi_entries() {
        let ports = fc_ports(
            "SP Name:             SP A\nSP Port ID:          0\n\
             SP UID:              50:06:01:60:88:60:01:95:50:06:01:60:08:60:01:95\n\n\
             SP Name:             SP B\nSP Port ID:          4\n\
             SP UID:              iqn.1992-04.com.emc:cx.apm00123.b4\n",
        );
        assert_eq!(
            ports,
            vec![SpPort {
                sp: String::from("a"),
                port_id: String::from("0"),
                virtual_port: None,
            }]
        );
    }

    #[test]
    fn hba_uid_prefixes_node_name() {
        assert_eq!(
            fc_hba_uid("10000000c9123456"),
            "20:00:00:00:C9:12:34:56:10:00:00:00:C9:12:34:56"
        );
        assert_eq!(
            normalize_hba_uid(&fc_hba_uid("10000000c9123456")),
            "10000000c9123456"
        );
    }

    #[rstest]
    #[case("Error returned from Agent: 0x712d8d04 LUN name already exists", Fault::NameInUse)]
    #[case("Storage Group name already in use", Fault::NameInUse)]
    #[case("Requested Host LUN Number is already in use", Fault::HluTaken)]
    #[case("LUN already exists in the specified storage group", Fault::AlreadyMapped)]
    #[case("Could not retrieve the specified (pool lun). The (pool lun) may not exist", Fault::NotFound)]
    #[case("The group name or UID does not match any storage groups", Fault::NotFound)]
    #[case("Security file not found", Fault::Other)]
    fn classifies_cli_failures(#[case] text: &str, #[case] expected: Fault) {
        assert_eq!(fault(text), expected);
    }
}
