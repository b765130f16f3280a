//! Tests for host initiator discovery, rescans and device lookup.

use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::array::{ArrayClient, ArrayError, HostGroup};
use crate::test_support::{ScriptedRunner, SimulatedArray};

const LSSCSI: &str = "\
[0:0:0:0]    disk    ATA      SAMSUNG SSD 860  4B6Q  /dev/sda
[3:0:0:0]    disk    DGC      LUNZ             0532  -
[3:0:0:1]    disk    DGC      VRAID            0532  /dev/sdb
[3:0:0:2]    disk    DGC      VRAID            0532  /dev/sdc
[4:0:0:2]    disk    XtremIO  XtremApp         40f0  /dev/sdd
";

const INQ: &str = "\
Inquiry utility, Version V7.3-1214 (Rev 1.0)      (SIL Version V7.2.1.0 (Edit Level 1214)
Copyright (C) by EMC Corporation, all rights reserved.
For help type inq -h.

-------------------------------------------------------------------
Symmetrix Device   Symm Serial #  Device #    WWN
-------------------------------------------------------------------
/dev/sdb           000196800123   00A1B       60000970000196800123533030413142
/dev/sdc           000196800123   00A1C       60000970000196800123533030413143
";

struct Scratch {
    _dir: TempDir,
    root: Utf8PathBuf,
}

#[fixture]
fn scratch() -> Scratch {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-UTF-8 tempdir {}", path.display()));
    Scratch { _dir: dir, root }
}

fn write(path: &Utf8Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap_or_else(|err| panic!("mkdir {parent}: {err}"));
    }
    fs::write(path, contents).unwrap_or_else(|err| panic!("write {path}: {err}"));
}

fn paths(root: &Utf8Path) -> HostPaths {
    HostPaths {
        initiator_file: root.join("iscsi/initiatorname.iscsi"),
        fc_port_glob: format!("{root}/fc_host/host*/port_name"),
        by_id_dir: root.join("by-id"),
        drv_cfg: String::from("drv_cfg"),
    }
}

fn connector(runner: &ScriptedRunner, transport: Transport, root: &Utf8Path) -> HostConnector<ScriptedRunner> {
    HostConnector::new(runner.clone(), transport)
        .with_paths(paths(root))
        .with_polling(Duration::from_millis(1), Duration::from_millis(50))
}

fn target(family: ArrayFamily, lun_id: &str, hlu: u32) -> DeviceTarget {
    DeviceTarget {
        family,
        lun_id: lun_id.to_owned(),
        hlu,
        wwn: None,
    }
}

#[rstest]
#[case("InitiatorName=iqn.1994-05.com.redhat:node-a\n", Some("iqn.1994-05.com.redhat:node-a"))]
#[case("## generated\n# InitiatorName=iqn.ignored\nInitiatorName= iqn.2016-04.com.example:b \n", Some("iqn.2016-04.com.example:b"))]
#[case("InitiatorName=\n", None)]
#[case("", None)]
fn initiator_name_is_parsed(#[case] contents: &str, #[case] expected: Option<&str>) {
    assert_eq!(parse_initiator_name(contents).as_deref(), expected);
}

#[rstest]
#[case("DGC", 1, Some("/dev/sdb"))]
#[case("DGC", 2, Some("/dev/sdc"))]
#[case("XtremApp", 2, Some("/dev/sdd"))]
#[case("DGC", 7, None)]
#[case("DGC", 0, None)]
fn lsscsi_lookup_matches_vendor_and_hlu(
    #[case] vendor: &str,
    #[case] hlu: u32,
    #[case] expected: Option<&str>,
) {
    assert_eq!(
        parse_lsscsi(LSSCSI, vendor, hlu),
        expected.map(Utf8PathBuf::from)
    );
}

#[test]
fn inq_lookup_matches_device_id_or_wwn() {
    assert_eq!(
        parse_inq_sym_wwn(INQ, "00a1c", None),
        Some(Utf8PathBuf::from("/dev/sdc"))
    );
    assert_eq!(
        parse_inq_sym_wwn(INQ, "FFFFF", Some("60000970000196800123533030413142")),
        Some(Utf8PathBuf::from("/dev/sdb"))
    );
    assert_eq!(parse_inq_sym_wwn(INQ, "FFFFF", None), None);
}

#[rstest]
#[tokio::test]
async fn iscsi_initiator_reads_host_file(scratch: Scratch) {
    write(
        &scratch.root.join("iscsi/initiatorname.iscsi"),
        "InitiatorName=iqn.1994-05.com.redhat:node-a\n",
    );
    let runner = ScriptedRunner::new();
    let initiator = connector(&runner, Transport::Iscsi, &scratch.root)
        .with_host_ip(Some(String::from("10.0.0.5")))
        .initiator()
        .await
        .unwrap_or_else(|err| panic!("initiator: {err}"));
    assert_eq!(initiator.id, "iqn.1994-05.com.redhat:node-a");
    assert_eq!(initiator.host_ip.as_deref(), Some("10.0.0.5"));
    assert!(runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn missing_initiator_file_is_io_error(scratch: Scratch) {
    let runner = ScriptedRunner::new();
    let err = connector(&runner, Transport::Iscsi, &scratch.root)
        .initiator()
        .await
        .expect_err("no initiator file");
    assert!(matches!(err, ConnectorError::Io { .. }), "unexpected error: {err}");
}

#[rstest]
#[tokio::test]
async fn fc_initiator_strips_prefix(scratch: Scratch) {
    write(&scratch.root.join("fc_host/host3/port_name"), "0x10000090FA5B1C2D\n");
    write(&scratch.root.join("fc_host/host4/port_name"), "0x10000090fa5b1c2e\n");
    let runner = ScriptedRunner::new();
    let initiator = connector(&runner, Transport::Fc, &scratch.root)
        .initiator()
        .await
        .unwrap_or_else(|err| panic!("initiator: {err}"));
    assert_eq!(initiator.transport, Transport::Fc);
    assert_eq!(initiator.id, "10000090fa5b1c2d");
}

#[rstest]
#[tokio::test]
async fn fc_without_adapters_is_missing_initiator(scratch: Scratch) {
    let runner = ScriptedRunner::new();
    let err = connector(&runner, Transport::Fc, &scratch.root)
        .initiator()
        .await
        .expect_err("no adapters");
    assert!(
        matches!(err, ConnectorError::MissingInitiator { transport: Transport::Fc, .. }),
        "unexpected error: {err}"
    );
}

#[rstest]
#[tokio::test]
async fn sdc_guid_is_lowercased_and_used_as_instance_id(scratch: Scratch) {
    let runner = ScriptedRunner::new();
    runner.push_stdout("B3F2A4C1-77E0-4F0B-9E3A-0C2F1D4E5A6B\n");
    let instance_id = connector(&runner, Transport::Sdc, &scratch.root)
        .instance_id()
        .await
        .unwrap_or_else(|err| panic!("instance id: {err}"));
    assert_eq!(instance_id, "b3f2a4c1-77e0-4f0b-9e3a-0c2f1d4e5a6b");
    assert_eq!(runner.command_strings(), vec!["drv_cfg --query_guid"]);
}

#[rstest]
#[tokio::test]
async fn instance_id_falls_back_to_hostname(scratch: Scratch) {
    let runner = ScriptedRunner::new();
    runner.push_stdout("node-a\n");
    let instance_id = connector(&runner, Transport::Iscsi, &scratch.root)
        .instance_id()
        .await
        .unwrap_or_else(|err| panic!("instance id: {err}"));
    assert_eq!(instance_id, "node-a");
    assert_eq!(runner.command_strings(), vec!["uname -n"]);
}

#[rstest]
#[tokio::test]
async fn configured_instance_id_skips_discovery(scratch: Scratch) {
    let runner = ScriptedRunner::new();
    let instance_id = connector(&runner, Transport::Iscsi, &scratch.root)
        .with_instance_id(Some(String::from("compute-7")))
        .instance_id()
        .await
        .unwrap_or_else(|err| panic!("instance id: {err}"));
    assert_eq!(instance_id, "compute-7");
    assert!(runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn rescan_swallows_failures(scratch: Scratch) {
    let runner = ScriptedRunner::new();
    runner.push_failure(21);
    runner.push_success();
    connector(&runner, Transport::Iscsi, &scratch.root)
        .rescan()
        .await;
    assert_eq!(
        runner.command_strings(),
        vec!["iscsiadm -m session --rescan", "rescan-scsi-bus.sh -r -l"]
    );
}

#[rstest]
#[tokio::test]
async fn sdc_rescan_uses_drv_cfg(scratch: Scratch) {
    let runner = ScriptedRunner::new();
    connector(&runner, Transport::Sdc, &scratch.root)
        .rescan()
        .await;
    assert_eq!(runner.command_strings(), vec!["drv_cfg --rescan"]);
}

#[rstest]
#[tokio::test]
async fn login_tolerates_existing_session(scratch: Scratch) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_failure(15);
    let portals = [TargetPortal {
        iqn: String::from("iqn.1992-04.com.emc:cx.apm00123"),
        portal: String::from("10.0.0.10:3260"),
    }];
    connector(&runner, Transport::Iscsi, &scratch.root)
        .login_targets(&portals)
        .await
        .unwrap_or_else(|err| panic!("login: {err}"));
    assert_eq!(
        runner.command_strings(),
        vec![
            "iscsiadm -m discovery -t sendtargets -p 10.0.0.10:3260",
            "iscsiadm -m node -T iqn.1992-04.com.emc:cx.apm00123 -p 10.0.0.10:3260 --login",
        ]
    );
}

#[rstest]
#[tokio::test]
async fn single_path_logs_in_to_first_portal(scratch: Scratch) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_success();
    let portals = [
        TargetPortal {
            iqn: String::from("iqn.1992-04.com.emc:cx.apm00123.a4"),
            portal: String::from("10.0.0.10:3260"),
        },
        TargetPortal {
            iqn: String::from("iqn.1992-04.com.emc:cx.apm00123.b4"),
            portal: String::from("10.0.0.11:3260"),
        },
    ];
    connector(&runner, Transport::Iscsi, &scratch.root)
        .with_multipath(false)
        .login_targets(&portals)
        .await
        .unwrap_or_else(|err| panic!("login: {err}"));
    assert_eq!(runner.invocations().len(), 2);
    assert!(
        runner
            .command_strings()
            .iter()
            .all(|command| command.contains("10.0.0.10:3260"))
    );
}

#[rstest]
#[tokio::test]
async fn fc_skips_target_login(scratch: Scratch) {
    let runner = ScriptedRunner::new();
    let portals = [TargetPortal {
        iqn: String::from("iqn.ignored"),
        portal: String::from("10.0.0.10:3260"),
    }];
    connector(&runner, Transport::Fc, &scratch.root)
        .login_targets(&portals)
        .await
        .unwrap_or_else(|err| panic!("login: {err}"));
    assert!(runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn lsscsi_lookup_polls_until_device_appears(scratch: Scratch) {
    let runner = ScriptedRunner::new();
    runner.push_stdout("[0:0:0:0]    disk    ATA      SAMSUNG SSD 860  4B6Q  /dev/sda\n");
    runner.push_stdout(LSSCSI);
    let path = connector(&runner, Transport::Iscsi, &scratch.root)
        .resolve_device_path(&target(ArrayFamily::Unity, "sv_12", 2))
        .await
        .unwrap_or_else(|err| panic!("resolve: {err}"));
    assert_eq!(path, Utf8PathBuf::from("/dev/sdc"));
    assert_eq!(runner.invocations().len(), 2);
}

#[rstest]
#[tokio::test]
async fn lookup_times_out_when_device_never_appears(scratch: Scratch) {
    let runner = ScriptedRunner::new();
    for _ in 0..200 {
        runner.push_failure(1);
    }
    let err = connector(&runner, Transport::Iscsi, &scratch.root)
        .resolve_device_path(&target(ArrayFamily::Vnx, "42", 9))
        .await
        .expect_err("device never appears");
    assert_eq!(
        err,
        ConnectorError::Timeout {
            action: String::from("resolve_device_path"),
            subject: String::from("42"),
        }
    );
}

#[rstest]
#[tokio::test]
async fn vmax_lookup_uses_inq(scratch: Scratch) {
    let runner = ScriptedRunner::new();
    runner.push_stdout(INQ);
    let path = connector(&runner, Transport::Fc, &scratch.root)
        .resolve_device_path(&target(ArrayFamily::Vmax, "00A1B", 1))
        .await
        .unwrap_or_else(|err| panic!("resolve: {err}"));
    assert_eq!(path, Utf8PathBuf::from("/dev/sdb"));
    assert_eq!(runner.command_strings(), vec!["inq -sym_wwn"]);
}

#[rstest]
#[tokio::test]
async fn scaleio_lookup_globs_by_id_links(scratch: Scratch) {
    let device = scratch.root.join("by-id/emc-vol-6c2a0b1d00000000-f1a2b3c400000004");
    write(&device, "");
    let runner = ScriptedRunner::new();
    let path = connector(&runner, Transport::Sdc, &scratch.root)
        .resolve_device_path(&target(ArrayFamily::ScaleIo, "f1a2b3c400000004", 0))
        .await
        .unwrap_or_else(|err| panic!("resolve: {err}"));
    let expected = device
        .canonicalize_utf8()
        .unwrap_or_else(|err| panic!("canonicalize: {err}"));
    assert_eq!(path, expected);
    assert!(runner.invocations().is_empty());
}

#[tokio::test]
async fn ensure_host_group_creates_once() {
    let array = SimulatedArray::new(ArrayFamily::Vnx);
    let first = ensure_host_group(&array, "node-a")
        .await
        .unwrap_or_else(|err| panic!("ensure: {err}"));
    let second = ensure_host_group(&array, "node-a")
        .await
        .unwrap_or_else(|err| panic!("ensure: {err}"));
    assert_eq!(first.id, second.id);
}

#[tokio::test]
async fn ensure_host_group_surfaces_fixed_group_arrays() {
    let array = SimulatedArray::new(ArrayFamily::ScaleIo).with_fixed_groups();
    let err = ensure_host_group(&array, "unknown-sdc")
        .await
        .expect_err("groups cannot be created");
    assert!(matches!(err, ArrayError::Unsupported { .. }), "unexpected error: {err}");
}

#[tokio::test]
async fn initiator_registration_is_idempotent() {
    let array = SimulatedArray::new(ArrayFamily::Unity);
    array.insert_group("node-a", &["iqn.1994-05.com.redhat:node-a"]);
    let group: HostGroup = array
        .host_group("node-a")
        .await
        .unwrap_or_else(|err| panic!("lookup: {err}"))
        .unwrap_or_else(|| panic!("group missing"));
    let initiator = Initiator {
        transport: Transport::Iscsi,
        id: String::from("IQN.1994-05.COM.REDHAT:NODE-A"),
        host_ip: None,
    };
    ensure_initiator_registered(&array, &group, &initiator)
        .await
        .unwrap_or_else(|err| panic!("register: {err}"));
    let after = array.group("node-a").unwrap_or_else(|| panic!("group missing"));
    assert_eq!(after.initiators.len(), 1);

    let second = Initiator {
        id: String::from("iqn.1994-05.com.redhat:node-a2"),
        ..initiator
    };
    ensure_initiator_registered(&array, &after, &second)
        .await
        .unwrap_or_else(|err| panic!("register: {err}"));
    let updated = array.group("node-a").unwrap_or_else(|| panic!("group missing"));
    assert_eq!(updated.initiators.len(), 2);
}
