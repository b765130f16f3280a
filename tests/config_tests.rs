//! Configuration validation and loading tests.

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use emc_blockdevice::test_support::EnvGuard;
use emc_blockdevice::{ArrayConfig, ArrayFamily, ConfigError, Profile, Transport};
use rstest::*;
use tempfile::TempDir;

const CLUSTER: &str = "1a2b3c4d-0000-4000-8000-000000000001";

#[fixture]
fn vmax_config() -> ArrayConfig {
    ArrayConfig {
        backend: Some(String::from("vmax")),
        cluster_id: Some(String::from(CLUSTER)),
        ip: Some(String::from("10.0.0.9")),
        port: Some(8443),
        user: Some(String::from("smc")),
        password: Some(String::from("smc")),
        proto: String::from("iSCSI"),
        multipath: true,
        dbhost: Some(String::from("127.0.0.1")),
        array_id: Some(String::from("000197800123")),
        port_group: Some(String::from("flocker_pg")),
        ..ArrayConfig::default()
    }
}

#[fixture]
fn scaleio_config() -> ArrayConfig {
    ArrayConfig {
        backend: Some(String::from("scaleio")),
        protection_domain: Some(String::from("default")),
        port_group: None,
        array_id: None,
        ..vmax_config()
    }
}

fn assert_actionable(
    mut cfg: ArrayConfig,
    mutate: impl FnOnce(&mut ArrayConfig),
    env_var: &str,
    toml_key: &str,
) {
    mutate(&mut cfg);
    let error = cfg
        .validate()
        .err()
        .unwrap_or_else(|| panic!("validation should fail without {toml_key}"));
    let ConfigError::MissingField(ref message) = error else {
        panic!("expected MissingField for {toml_key}, got {error:?}");
    };
    assert!(
        message.contains(env_var),
        "error should mention env var {env_var}: {message}"
    );
    assert!(
        message.contains("emc-blockdevice.toml"),
        "error should mention config file: {message}"
    );
    assert!(
        message.contains(toml_key),
        "error should mention TOML key {toml_key}: {message}"
    );
}

#[rstest]
fn complete_configurations_validate(vmax_config: ArrayConfig, scaleio_config: ArrayConfig) {
    assert_eq!(vmax_config.validate(), Ok(()));
    assert_eq!(scaleio_config.validate(), Ok(()));
    assert_eq!(scaleio_config.transport(), Ok(Transport::Sdc));
}

/// Every required field names its environment variable, its TOML key and
/// the configuration file.
#[rstest]
fn missing_fields_produce_actionable_errors(vmax_config: ArrayConfig, scaleio_config: ArrayConfig) {
    assert_actionable(vmax_config.clone(), |cfg| cfg.backend = None, "EMC_BACKEND", "backend");
    assert_actionable(
        vmax_config.clone(),
        |cfg| cfg.cluster_id = None,
        "EMC_CLUSTER_ID",
        "cluster_id",
    );
    assert_actionable(vmax_config.clone(), |cfg| cfg.ip = None, "EMC_IP", "ip");
    assert_actionable(vmax_config.clone(), |cfg| cfg.user = None, "EMC_USER", "user");
    assert_actionable(
        vmax_config.clone(),
        |cfg| cfg.password = Some(String::new()),
        "EMC_PASSWORD",
        "password",
    );
    assert_actionable(
        vmax_config.clone(),
        |cfg| cfg.array_id = None,
        "EMC_ARRAY_ID",
        "array_id",
    );
    assert_actionable(
        vmax_config.clone(),
        |cfg| cfg.port_group = None,
        "EMC_PORT_GROUP",
        "port_group",
    );
    assert_actionable(vmax_config, |cfg| cfg.dbhost = None, "EMC_DBHOST", "dbhost");
    assert_actionable(
        scaleio_config,
        |cfg| cfg.protection_domain = None,
        "EMC_PROTECTION_DOMAIN",
        "protection_domain",
    );
}

#[rstest]
#[case("backend", |cfg: &mut ArrayConfig| cfg.backend = Some(String::from("isilon")))]
#[case("cluster_id", |cfg: &mut ArrayConfig| cfg.cluster_id = Some(String::from("not-a-uuid")))]
#[case("profile", |cfg: &mut ArrayConfig| cfg.profile = Some(String::from("platinum")))]
#[case("proto", |cfg: &mut ArrayConfig| cfg.proto = String::from("nvme"))]
fn uninterpretable_values_name_their_key(
    mut vmax_config: ArrayConfig,
    #[case] expected_key: &str,
    #[case] mutate: fn(&mut ArrayConfig),
) {
    mutate(&mut vmax_config);
    let error = vmax_config.validate();
    assert!(
        matches!(error, Err(ConfigError::Invalid { key, .. }) if key == expected_key),
        "expected {expected_key} to be invalid: {error:?}"
    );
}

#[rstest]
fn profile_is_parsed_case_insensitively(mut vmax_config: ArrayConfig) {
    vmax_config.profile = Some(String::from("gold"));
    assert_eq!(vmax_config.default_profile(), Ok(Some(Profile::Gold)));
}

#[rstest]
fn name_derived_families_do_not_need_a_database(mut vmax_config: ArrayConfig) {
    vmax_config.backend = Some(String::from("XtremIO"));
    vmax_config.dbhost = None;
    vmax_config.array_id = None;
    vmax_config.port_group = None;
    assert_eq!(vmax_config.validate(), Ok(()));
    assert_eq!(vmax_config.family(), Ok(ArrayFamily::XtremIo));
}

fn write_config(dir: &TempDir, contents: &str) -> String {
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp dir should be utf8: {}", path.display()));
    Dir::open_ambient_dir(&root, ambient_authority())
        .unwrap_or_else(|err| panic!("open temp dir: {err}"))
        .write("emc-blockdevice.toml", contents)
        .unwrap_or_else(|err| panic!("write config: {err}"));
    root.join("emc-blockdevice.toml").into_string()
}

#[tokio::test]
async fn configuration_loads_from_file_named_by_env() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = write_config(
        &tmp,
        concat!(
            "backend = \"unity\"\n",
            "cluster_id = \"1a2b3c4d-0000-4000-8000-000000000001\"\n",
            "ip = \"10.0.0.5\"\n",
            "user = \"admin\"\n",
            "password = \"secret\"\n",
            "proto = \"FC\"\n",
            "multipath = false\n",
        ),
    );
    let _guard = EnvGuard::set_vars(&[("EMC_BLOCKDEVICE_CONFIG_PATH", path.as_str())]).await;

    let config = ArrayConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("config should load: {err}"));

    assert_eq!(config.family(), Ok(ArrayFamily::Unity));
    assert_eq!(config.transport(), Ok(Transport::Fc));
    assert!(!config.multipath);
    assert!(!config.verify_tls);
    assert_eq!(config.validate(), Ok(()));
}

#[tokio::test]
async fn environment_overrides_file_values() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = write_config(&tmp, "backend = \"unity\"\nip = \"10.0.0.5\"\n");
    let _guard = EnvGuard::set_vars(&[
        ("EMC_BLOCKDEVICE_CONFIG_PATH", path.as_str()),
        ("EMC_BACKEND", "vnx"),
    ])
    .await;

    let config = ArrayConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("config should load: {err}"));

    assert_eq!(config.family(), Ok(ArrayFamily::Vnx));
    assert_eq!(config.ip.as_deref(), Some("10.0.0.5"));
    assert_eq!(config.proto, "iSCSI");
    assert!(config.multipath);
}
