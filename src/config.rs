//! Configuration loading via `ortho-config`.
//!
//! One [`ArrayConfig`] describes one array backend. Values merge defaults,
//! the discovered `emc-blockdevice.toml`, and `EMC_*` environment variables;
//! [`ArrayConfig::connect`] then assembles the matching client, host
//! connector and metadata store into a [`ConfiguredApi`].

use std::ffi::OsString;
use std::str::FromStr;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::array::scaleio::ScaleIoClient;
use crate::array::unity::UnityClient;
use crate::array::vmax::VmaxClient;
use crate::array::vnx::VnxClient;
use crate::array::xtremio::XtremIoClient;
use crate::array::{ArrayClient, ArrayFamily, Transport};
use crate::command::ProcessCommandRunner;
use crate::connector::HostConnector;
use crate::error::BlockDeviceError;
use crate::metadata::{
    DEFAULT_CONTAINER, DEFAULT_REDIS_PORT, HashStore, MetadataStore, RedisHashStore,
};
use crate::orchestrator::BlockDeviceApi;
use crate::scheduler::{ManagedPools, Profile};
use crate::volume::ClusterId;

const APP_NAME: &str = "emc-blockdevice";

/// Block device API assembled from configuration.
pub type ConfiguredApi =
    BlockDeviceApi<Box<dyn ArrayClient>, HostConnector<ProcessCommandRunner>, Box<dyn HashStore>>;

/// Array backend settings derived from environment variables and
/// configuration files.
#[derive(Clone, Debug, Default, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "EMC",
    discovery(
        app_name = "emc-blockdevice",
        env_var = "EMC_BLOCKDEVICE_CONFIG_PATH",
        config_file_name = "emc-blockdevice.toml",
        dotfile_name = ".emc-blockdevice.toml",
        project_file_name = "emc-blockdevice.toml"
    )
)]
pub struct ArrayConfig {
    /// Array family keyword: `xtremio`, `vnx`, `unity`, `vmax` or `scaleio`.
    pub backend: Option<String>,
    /// UUID of the volume framework cluster; scopes LUN names and folders.
    pub cluster_id: Option<String>,
    /// Management address: XMS, storage processor, Unisphere or gateway/MDM.
    #[serde(alias = "host", alias = "mdm")]
    pub ip: Option<String>,
    /// Management port, when not the vendor default.
    pub port: Option<u16>,
    /// Management user.
    #[serde(alias = "username")]
    pub user: Option<String>,
    /// Management password.
    pub password: Option<String>,
    /// Host transport, `iSCSI` or `FC`. Ignored for ScaleIO.
    #[ortho_config(default = "iSCSI".to_owned())]
    pub proto: String,
    /// Comma-separated glob patterns of the pools this host may use.
    pub storage_pools: Option<String>,
    /// Whether to log in to every iSCSI portal the array reports.
    #[ortho_config(default = true)]
    pub multipath: bool,
    /// Address registered alongside the iSCSI initiator.
    pub host_ip: Option<String>,
    /// Redis host keeping volume records for VMAX and ScaleIO.
    #[serde(alias = "database")]
    pub dbhost: Option<String>,
    /// Redis port; defaults to 6379.
    pub dbport: Option<u16>,
    /// ScaleIO protection domain.
    pub protection_domain: Option<String>,
    /// ScaleIO storage pool, narrowing provisioning to one pool.
    pub storage_pool: Option<String>,
    /// VMAX symmetrix id.
    pub array_id: Option<String>,
    /// VMAX port group bound into every masking view.
    pub port_group: Option<String>,
    /// Fixed name this host registers under, bypassing discovery.
    pub compute_instance_id: Option<String>,
    /// Whether to verify the management endpoint's TLS certificate.
    #[ortho_config(default = false)]
    pub verify_tls: bool,
    /// Default service profile for new volumes.
    pub profile: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

const BACKEND: FieldMetadata = FieldMetadata::new("array backend", "EMC_BACKEND", "backend");
const CLUSTER_ID: FieldMetadata = FieldMetadata::new("cluster UUID", "EMC_CLUSTER_ID", "cluster_id");
const IP: FieldMetadata = FieldMetadata::new("management address", "EMC_IP", "ip");
const USER: FieldMetadata = FieldMetadata::new("management user", "EMC_USER", "user");
const PASSWORD: FieldMetadata =
    FieldMetadata::new("management password", "EMC_PASSWORD", "password");
const PROTECTION_DOMAIN: FieldMetadata = FieldMetadata::new(
    "ScaleIO protection domain",
    "EMC_PROTECTION_DOMAIN",
    "protection_domain",
);
const ARRAY_ID: FieldMetadata = FieldMetadata::new("VMAX array id", "EMC_ARRAY_ID", "array_id");
const PORT_GROUP: FieldMetadata =
    FieldMetadata::new("VMAX port group", "EMC_PORT_GROUP", "port_group");
const DBHOST: FieldMetadata = FieldMetadata::new("metadata store host", "EMC_DBHOST", "dbhost");

impl ArrayConfig {
    fn require<'a>(value: Option<&'a str>, metadata: &FieldMetadata) -> Result<&'a str, ConfigError> {
        match value.map(str::trim) {
            Some(present) if !present.is_empty() => Ok(present),
            _ => Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to {APP_NAME}.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            ))),
        }
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from(APP_NAME)])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Array family named by `backend`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when unset and
    /// [`ConfigError::Invalid`] for an unknown keyword.
    pub fn family(&self) -> Result<ArrayFamily, ConfigError> {
        let raw = Self::require(self.backend.as_deref(), &BACKEND)?;
        ArrayFamily::from_str(raw).map_err(|err| ConfigError::Invalid {
            key: "backend",
            message: err.to_string(),
        })
    }

    /// Cluster identity parsed from `cluster_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the value is not a UUID.
    pub fn cluster(&self) -> Result<ClusterId, ConfigError> {
        let raw = Self::require(self.cluster_id.as_deref(), &CLUSTER_ID)?;
        Uuid::parse_str(raw)
            .map(ClusterId::new)
            .map_err(|err| ConfigError::Invalid {
                key: "cluster_id",
                message: format!("'{raw}' is not a UUID: {err}"),
            })
    }

    /// Host transport: SDC for ScaleIO, otherwise `proto`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a protocol other than iSCSI or FC.
    pub fn transport(&self) -> Result<Transport, ConfigError> {
        if self.family()? == ArrayFamily::ScaleIo {
            return Ok(Transport::Sdc);
        }
        match self.proto.trim().to_ascii_lowercase().as_str() {
            "iscsi" => Ok(Transport::Iscsi),
            "fc" => Ok(Transport::Fc),
            other => Err(ConfigError::Invalid {
                key: "proto",
                message: format!("unknown protocol '{other}' (expected iSCSI or FC)"),
            }),
        }
    }

    /// Default profile, when configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unknown profile name.
    pub fn default_profile(&self) -> Result<Option<Profile>, ConfigError> {
        self.profile
            .as_deref()
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .map(|raw| {
                Profile::from_str(raw).map_err(|err| ConfigError::Invalid {
                    key: "profile",
                    message: err.to_string(),
                })
            })
            .transpose()
    }

    /// Performs semantic validation on required fields. Error messages include
    /// guidance on how to provide missing values via environment variables or
    /// configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] when a value cannot be interpreted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let family = self.family()?;
        self.cluster()?;
        Self::require(self.ip.as_deref(), &IP)?;
        Self::require(self.user.as_deref(), &USER)?;
        Self::require(self.password.as_deref(), &PASSWORD)?;
        self.transport()?;
        self.default_profile()?;
        match family {
            ArrayFamily::ScaleIo => {
                Self::require(self.protection_domain.as_deref(), &PROTECTION_DOMAIN)?;
            }
            ArrayFamily::Vmax => {
                Self::require(self.array_id.as_deref(), &ARRAY_ID)?;
                Self::require(self.port_group.as_deref(), &PORT_GROUP)?;
            }
            ArrayFamily::XtremIo | ArrayFamily::Vnx | ArrayFamily::Unity => {}
        }
        if family.requires_metadata() {
            Self::require(self.dbhost.as_deref(), &DBHOST)?;
        }
        Ok(())
    }

    fn endpoint(&self) -> Result<String, ConfigError> {
        let ip = Self::require(self.ip.as_deref(), &IP)?;
        Ok(self
            .port
            .map_or_else(|| ip.to_owned(), |port| format!("{ip}:{port}")))
    }

    /// Builds the management client for the configured family.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::ConfigurationError`] for invalid settings
    /// and [`BlockDeviceError::BackendUnavailable`] when XMS cannot be
    /// reached.
    pub async fn array_client(&self) -> Result<Box<dyn ArrayClient>, BlockDeviceError> {
        self.validate()?;
        let family = self.family()?;
        let user = Self::require(self.user.as_deref(), &USER)?;
        let password = Self::require(self.password.as_deref(), &PASSWORD)?;
        let client: Box<dyn ArrayClient> = match family {
            ArrayFamily::XtremIo => {
                let xms = XtremIoClient::new(
                    &self.endpoint()?,
                    user,
                    password,
                    self.cluster()?,
                    self.verify_tls,
                )
                .connect()
                .await
                .map_err(|err| BlockDeviceError::backend(family, err))?;
                Box::new(xms)
            }
            ArrayFamily::Vnx => Box::new(VnxClient::new(
                Self::require(self.ip.as_deref(), &IP)?,
                user,
                password,
            )),
            ArrayFamily::Unity => Box::new(UnityClient::new(
                &self.endpoint()?,
                user,
                password,
                self.verify_tls,
            )),
            ArrayFamily::Vmax => Box::new(VmaxClient::new(
                Self::require(self.ip.as_deref(), &IP)?,
                self.port,
                user,
                password,
                Self::require(self.array_id.as_deref(), &ARRAY_ID)?,
                Self::require(self.port_group.as_deref(), &PORT_GROUP)?,
                self.verify_tls,
            )),
            ArrayFamily::ScaleIo => Box::new(ScaleIoClient::new(
                &self.endpoint()?,
                user,
                password,
                Self::require(self.protection_domain.as_deref(), &PROTECTION_DOMAIN)?,
                self.storage_pool.as_deref(),
                self.verify_tls,
            )),
        };
        Ok(client)
    }

    /// Builds the host connector for the configured transport.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unknown protocol.
    pub fn connector(&self) -> Result<HostConnector<ProcessCommandRunner>, ConfigError> {
        Ok(HostConnector::new(ProcessCommandRunner, self.transport()?)
            .with_host_ip(self.host_ip.clone())
            .with_instance_id(self.compute_instance_id.clone())
            .with_multipath(self.multipath))
    }

    /// Connects to the metadata store when the family keeps one.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::BackendUnavailable`] when Redis cannot be
    /// reached.
    pub async fn metadata_store(
        &self,
    ) -> Result<Option<MetadataStore<Box<dyn HashStore>>>, BlockDeviceError> {
        if !self.family()?.requires_metadata() {
            return Ok(None);
        }
        let host = Self::require(self.dbhost.as_deref(), &DBHOST)?;
        let port = self.dbport.unwrap_or(DEFAULT_REDIS_PORT);
        let store = RedisHashStore::connect(host, port, 0)
            .await
            .map_err(|err| BlockDeviceError::metadata(host, &err))?;
        let boxed: Box<dyn HashStore> = Box::new(store);
        Ok(Some(MetadataStore::new(boxed, DEFAULT_CONTAINER)))
    }

    /// Assembles the block device API described by this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::ConfigurationError`] for invalid settings
    /// and [`BlockDeviceError::BackendUnavailable`] when the array or the
    /// metadata store cannot be reached.
    pub async fn connect(&self) -> Result<ConfiguredApi, BlockDeviceError> {
        let array = self.array_client().await?;
        let family = array.family();
        let connector = self.connector()?;
        let pools = ManagedPools::parse(self.storage_pools.as_deref())?;
        let metadata = self.metadata_store().await?;
        info!(%family, endpoint = self.ip.as_deref().unwrap_or_default(), "array backend configured");
        BlockDeviceApi::from_parts(array, connector, self.cluster()?, pools, metadata)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a value that cannot be interpreted.
    #[error("invalid configuration value for {key}: {message}")]
    Invalid {
        /// Configuration key holding the value.
        key: &'static str,
        /// Description of the problem.
        message: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

impl From<ConfigError> for BlockDeviceError {
    fn from(value: ConfigError) -> Self {
        let subject = match &value {
            ConfigError::Invalid { key, .. } => (*key).to_owned(),
            ConfigError::MissingField(_) | ConfigError::Parse(_) => String::from("configuration"),
        };
        Self::ConfigurationError {
            subject,
            message: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn unity() -> ArrayConfig {
        ArrayConfig {
            backend: Some(String::from("unity")),
            cluster_id: Some(String::from("1a2b3c4d-0000-4000-8000-000000000001")),
            ip: Some(String::from("10.0.0.5")),
            user: Some(String::from("admin")),
            password: Some(String::from("secret")),
            proto: String::from("iSCSI"),
            multipath: true,
            ..ArrayConfig::default()
        }
    }

    #[rstest]
    fn complete_configuration_validates(unity: ArrayConfig) {
        assert_eq!(unity.validate(), Ok(()));
        assert_eq!(unity.transport(), Ok(Transport::Iscsi));
        assert_eq!(unity.family(), Ok(ArrayFamily::Unity));
    }

    #[rstest]
    fn missing_password_names_env_and_key(mut unity: ArrayConfig) {
        unity.password = Some(String::from("  "));
        let Err(ConfigError::MissingField(message)) = unity.validate() else {
            panic!("expected a missing field error");
        };
        assert!(message.contains("EMC_PASSWORD"), "message: {message}");
        assert!(message.contains("password"), "message: {message}");
    }

    #[rstest]
    #[case("fc", Transport::Fc)]
    #[case("FC", Transport::Fc)]
    #[case("iscsi", Transport::Iscsi)]
    fn protocols_are_case_insensitive(
        mut unity: ArrayConfig,
        #[case] proto: &str,
        #[case] expected: Transport,
    ) {
        unity.proto = proto.to_owned();
        assert_eq!(unity.transport(), Ok(expected));
    }

    #[rstest]
    fn unknown_protocol_is_invalid(mut unity: ArrayConfig) {
        unity.proto = String::from("nvme");
        assert!(matches!(
            unity.validate(),
            Err(ConfigError::Invalid { key: "proto", .. })
        ));
    }

    #[rstest]
    fn scaleio_ignores_protocol_and_needs_metadata(mut unity: ArrayConfig) {
        unity.backend = Some(String::from("ScaleIO"));
        unity.proto = String::from("nvme");
        unity.protection_domain = Some(String::from("pd1"));
        assert_eq!(unity.transport(), Ok(Transport::Sdc));
        let Err(ConfigError::MissingField(message)) = unity.validate() else {
            panic!("expected dbhost to be required");
        };
        assert!(message.contains("EMC_DBHOST"), "message: {message}");
        unity.dbhost = Some(String::from("redis.local"));
        assert_eq!(unity.validate(), Ok(()));
    }

    #[rstest]
    fn vmax_needs_array_and_port_group(mut unity: ArrayConfig) {
        unity.backend = Some(String::from("vmax"));
        unity.dbhost = Some(String::from("redis.local"));
        unity.array_id = Some(String::from("000196800123"));
        let Err(ConfigError::MissingField(message)) = unity.validate() else {
            panic!("expected port_group to be required");
        };
        assert!(message.contains("EMC_PORT_GROUP"), "message: {message}");
    }

    #[rstest]
    fn malformed_cluster_id_is_invalid(mut unity: ArrayConfig) {
        unity.cluster_id = Some(String::from("not-a-uuid"));
        assert!(matches!(
            unity.validate(),
            Err(ConfigError::Invalid {
                key: "cluster_id",
                ..
            })
        ));
    }

    #[rstest]
    fn unknown_backend_is_invalid(mut unity: ArrayConfig) {
        unity.backend = Some(String::from("isilon"));
        assert!(matches!(
            unity.family(),
            Err(ConfigError::Invalid { key: "backend", .. })
        ));
    }

    #[rstest]
    fn profile_is_checked(mut unity: ArrayConfig) {
        unity.profile = Some(String::from("gold"));
        assert_eq!(unity.default_profile(), Ok(Some(Profile::Gold)));
        unity.profile = Some(String::from("platinum"));
        assert!(unity.validate().is_err());
    }

    #[rstest]
    fn port_joins_the_endpoint(mut unity: ArrayConfig) {
        assert_eq!(unity.endpoint(), Ok(String::from("10.0.0.5")));
        unity.port = Some(4443);
        assert_eq!(unity.endpoint(), Ok(String::from("10.0.0.5:4443")));
    }

    #[rstest]
    fn config_errors_become_configuration_errors(mut unity: ArrayConfig) {
        unity.proto = String::from("nvme");
        let err = unity
            .connector()
            .map(drop)
            .map_err(BlockDeviceError::from);
        assert!(matches!(
            err,
            Err(BlockDeviceError::ConfigurationError { ref subject, .. }) if subject == "proto"
        ));
    }
}
