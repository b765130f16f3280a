//! [`Connector`] backed by the local host's files and initiator utilities.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::lookup::{find_by_id, parse_initiator_name, parse_inq_sym_wwn, parse_lsscsi};
use super::{Connector, ConnectorError, ConnectorFuture, DeviceTarget};
use crate::array::{ArrayFamily, Initiator, TargetPortal, Transport};
use crate::command::{CommandError, CommandRunner, args};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_DEVICE_TIMEOUT: Duration = Duration::from_secs(60);
/// `iscsiadm` exit status for "session already exists".
const ISCSI_ERR_SESS_EXISTS: i32 = 15;

/// Host locations consulted for identities and device links.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostPaths {
    /// File holding the `InitiatorName=` line.
    pub initiator_file: Utf8PathBuf,
    /// Glob matching the WWPN files of FC host adapters.
    pub fc_port_glob: String,
    /// Directory of persistent by-id device links.
    pub by_id_dir: Utf8PathBuf,
    /// ScaleIO data client control utility.
    pub drv_cfg: String,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            initiator_file: Utf8PathBuf::from("/etc/iscsi/initiatorname.iscsi"),
            fc_port_glob: String::from("/sys/class/fc_host/host*/port_name"),
            by_id_dir: Utf8PathBuf::from("/dev/disk/by-id"),
            drv_cfg: String::from("/opt/emc/scaleio/sdc/bin/drv_cfg"),
        }
    }
}

/// Connector that runs host utilities through a [`CommandRunner`].
#[derive(Clone, Debug)]
pub struct HostConnector<R> {
    runner: R,
    transport: Transport,
    host_ip: Option<String>,
    instance_override: Option<String>,
    multipath: bool,
    paths: HostPaths,
    poll_interval: Duration,
    timeout: Duration,
}

impl<R: CommandRunner> HostConnector<R> {
    /// Creates a connector for `transport` with the default host paths.
    #[must_use]
    pub fn new(runner: R, transport: Transport) -> Self {
        Self {
            runner,
            transport,
            host_ip: None,
            instance_override: None,
            multipath: true,
            paths: HostPaths::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_DEVICE_TIMEOUT,
        }
    }

    /// Replaces the host paths.
    #[must_use]
    pub fn with_paths(mut self, paths: HostPaths) -> Self {
        self.paths = paths;
        self
    }

    /// Address reported alongside the iSCSI initiator.
    #[must_use]
    pub fn with_host_ip(mut self, host_ip: Option<String>) -> Self {
        self.host_ip = host_ip;
        self
    }

    /// Fixed instance id, bypassing host discovery.
    #[must_use]
    pub fn with_instance_id(mut self, instance_id: Option<String>) -> Self {
        self.instance_override = instance_id;
        self
    }

    /// Logs in to every reported portal when set, otherwise only the first.
    #[must_use]
    pub const fn with_multipath(mut self, multipath: bool) -> Self {
        self.multipath = multipath;
        self
    }

    /// Overrides the device lookup poll interval and deadline.
    #[must_use]
    pub const fn with_polling(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.timeout = timeout;
        self
    }

    /// Transport this connector serves.
    #[must_use]
    pub const fn transport(&self) -> Transport {
        self.transport
    }

    fn iscsi_initiator(&self) -> Result<String, ConnectorError> {
        let path = &self.paths.initiator_file;
        let contents = read_host_file(path)?;
        parse_initiator_name(&contents).ok_or_else(|| ConnectorError::MissingInitiator {
            transport: Transport::Iscsi,
            hint: format!("no InitiatorName= line in {path}"),
        })
    }

    fn fc_initiator(&self) -> Result<String, ConnectorError> {
        let pattern = &self.paths.fc_port_glob;
        let mut ports: Vec<Utf8PathBuf> = glob::glob(pattern)
            .map_err(|err| ConnectorError::Unsupported {
                message: format!("invalid FC port glob {pattern}: {err}"),
            })?
            .filter_map(Result::ok)
            .filter_map(|path| Utf8PathBuf::from_path_buf(path).ok())
            .collect();
        ports.sort();

        for port in &ports {
            let raw = read_host_file(port)?;
            let trimmed = raw.trim();
            let wwpn = trimmed.strip_prefix("0x").unwrap_or(trimmed);
            if !wwpn.is_empty() {
                return Ok(wwpn.to_ascii_lowercase());
            }
        }

        Err(ConnectorError::MissingInitiator {
            transport: Transport::Fc,
            hint: format!("nothing readable at {pattern}"),
        })
    }

    fn sdc_guid(&self) -> Result<String, ConnectorError> {
        let output = self
            .runner
            .run_checked(&self.paths.drv_cfg, &args(["--query_guid"]))?;
        let guid = output.stdout.trim().to_ascii_lowercase();
        if guid.is_empty() {
            return Err(ConnectorError::MissingInitiator {
                transport: Transport::Sdc,
                hint: format!("{} --query_guid printed nothing", self.paths.drv_cfg),
            });
        }
        Ok(guid)
    }

    fn hostname(&self) -> Result<String, ConnectorError> {
        let output = self.runner.run_checked("uname", &args(["-n"]))?;
        Ok(output.stdout.trim().to_owned())
    }

    fn discover_initiator(&self) -> Result<Initiator, ConnectorError> {
        let id = match self.transport {
            Transport::Iscsi => self.iscsi_initiator()?,
            Transport::Fc => self.fc_initiator()?,
            Transport::Sdc => self.sdc_guid()?,
        };
        debug!(transport = %self.transport, initiator = %id, "discovered local initiator");
        Ok(Initiator {
            transport: self.transport,
            id,
            host_ip: self.host_ip.clone(),
        })
    }

    fn discover_instance_id(&self) -> Result<String, ConnectorError> {
        if let Some(instance_id) = &self.instance_override {
            return Ok(instance_id.clone());
        }
        match self.transport {
            Transport::Sdc => self.sdc_guid(),
            Transport::Iscsi | Transport::Fc => self.hostname(),
        }
    }

    fn run_best_effort(&self, program: &str, arguments: &[&str]) {
        match self.runner.run_checked(program, &args(arguments.iter().copied())) {
            Ok(_) => debug!(program, ?arguments, "host command succeeded"),
            Err(err) => warn!(program, ?arguments, error = %err, "host command failed"),
        }
    }

    fn rescan_now(&self) {
        match self.transport {
            Transport::Iscsi => {
                self.run_best_effort("iscsiadm", &["-m", "session", "--rescan"]);
                self.run_best_effort("rescan-scsi-bus.sh", &["-r", "-l"]);
            }
            Transport::Fc => self.run_best_effort("rescan-scsi-bus.sh", &["-r", "-l"]),
            Transport::Sdc => self.run_best_effort(&self.paths.drv_cfg, &["--rescan"]),
        }
    }

    fn login(&self, portal: &TargetPortal) {
        self.run_best_effort(
            "iscsiadm",
            &["-m", "discovery", "-t", "sendtargets", "-p", portal.portal.as_str()],
        );
        let login = args([
            "-m",
            "node",
            "-T",
            portal.iqn.as_str(),
            "-p",
            portal.portal.as_str(),
            "--login",
        ]);
        match self.runner.run("iscsiadm", &login) {
            Ok(output) if output.is_success() => {
                info!(iqn = %portal.iqn, portal = %portal.portal, "logged in to iSCSI target");
            }
            Ok(output) if output.code == Some(ISCSI_ERR_SESS_EXISTS) => {
                debug!(iqn = %portal.iqn, portal = %portal.portal, "iSCSI session already exists");
            }
            Ok(output) => warn!(
                iqn = %portal.iqn,
                portal = %portal.portal,
                error = %CommandError::failed("iscsiadm", &output),
                "iSCSI login failed"
            ),
            Err(err) => warn!(iqn = %portal.iqn, error = %err, "iSCSI login failed"),
        }
    }

    /// Output of an enumeration utility; a non-zero exit reads as "nothing
    /// yet" so the poll loop keeps going.
    fn enumerate(&self, program: &str, arguments: &[&str]) -> Result<String, ConnectorError> {
        let output = self.runner.run(program, &args(arguments.iter().copied()))?;
        if output.is_success() {
            Ok(output.stdout)
        } else {
            debug!(program, error = %CommandError::failed(program, &output), "enumeration failed");
            Ok(String::new())
        }
    }

    fn lookup(&self, target: &DeviceTarget) -> Result<Option<Utf8PathBuf>, ConnectorError> {
        match target.family {
            ArrayFamily::ScaleIo => Ok(find_by_id(&self.paths.by_id_dir, &target.lun_id)),
            ArrayFamily::Vmax => {
                let output = self.enumerate("inq", &["-sym_wwn"])?;
                Ok(parse_inq_sym_wwn(
                    &output,
                    &target.lun_id,
                    target.wwn.as_deref(),
                ))
            }
            family => {
                let vendor = family
                    .scsi_vendor()
                    .ok_or_else(|| ConnectorError::Unsupported {
                        message: format!("no SCSI vendor tag known for {family}"),
                    })?;
                let output = self.enumerate("lsscsi", &[])?;
                Ok(parse_lsscsi(&output, vendor, target.hlu))
            }
        }
    }
}

impl<R: CommandRunner> Connector for HostConnector<R> {
    fn initiator(&self) -> ConnectorFuture<'_, Initiator> {
        Box::pin(async move { self.discover_initiator() })
    }

    fn instance_id(&self) -> ConnectorFuture<'_, String> {
        Box::pin(async move { self.discover_instance_id() })
    }

    fn rescan(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move { self.rescan_now() })
    }

    fn login_targets<'a>(&'a self, portals: &'a [TargetPortal]) -> ConnectorFuture<'a, ()> {
        Box::pin(async move {
            if self.transport != Transport::Iscsi {
                return Ok(());
            }
            let paths = if self.multipath { portals.len() } else { 1 };
            for portal in portals.iter().take(paths) {
                self.login(portal);
            }
            Ok(())
        })
    }

    fn resolve_device_path<'a>(
        &'a self,
        target: &'a DeviceTarget,
    ) -> ConnectorFuture<'a, Utf8PathBuf> {
        Box::pin(async move {
            let deadline = Instant::now() + self.timeout;
            loop {
                if let Some(path) = self.lookup(target)? {
                    debug!(lun = %target.lun_id, hlu = target.hlu, %path, "resolved device path");
                    return Ok(path);
                }
                if Instant::now() >= deadline {
                    break;
                }
                sleep(self.poll_interval).await;
            }
            Err(ConnectorError::Timeout {
                action: String::from("resolve_device_path"),
                subject: target.lun_id.clone(),
            })
        })
    }
}

fn read_host_file(path: &Utf8Path) -> Result<String, ConnectorError> {
    let io_error = |message: String| ConnectorError::Io {
        path: path.to_owned(),
        message,
    };
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let name = path
        .file_name()
        .ok_or_else(|| io_error(String::from("path has no file name")))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| io_error(err.to_string()))?;
    dir.read_to_string(name)
        .map_err(|err| io_error(err.to_string()))
}
