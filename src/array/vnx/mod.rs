//! VNX client driving `naviseccli`.
//!
//! Block storage on VNX is only reachable through the Navisphere CLI, so every
//! operation is one `naviseccli` invocation whose text output is parsed in
//! [`parse`]. Storage groups play the part of host groups; LUNs are addressed
//! by name and mapped by ALU.

use std::ffi::OsString;

use tracing::{debug, info, warn};

use super::{
    ArrayClient, ArrayError, ArrayFamily, ArrayFuture, HostGroup, Initiator, Lun, StoragePool,
    TargetPortal, Transport,
};
use crate::command::{CommandOutput, CommandRunner, ProcessCommandRunner};

mod parse;

use parse::{Fault, SpPort, fault};

const NAVISECCLI: &str = "naviseccli";
const GIB: u64 = 1 << 30;
/// Highest host LUN number a storage group accepts.
const MAX_HLU: u32 = 255;
/// Initiator type 3 is CLARiiON open systems.
const INITIATOR_TYPE: &str = "3";
/// ALUA failover mode.
const FAILOVER_MODE: &str = "4";

/// `naviseccli` client for one storage processor address.
pub struct VnxClient<R: CommandRunner = ProcessCommandRunner> {
    runner: R,
    address: String,
    user: String,
    password: String,
}

impl VnxClient {
    /// Builds a client that spawns the real `naviseccli`.
    #[must_use]
    pub fn new(address: &str, user: &str, password: &str) -> Self {
        Self::with_runner(ProcessCommandRunner, address, user, password)
    }
}

impl<R: CommandRunner> VnxClient<R> {
    /// Builds a client over an arbitrary command runner.
    #[must_use]
    pub fn with_runner(runner: R, address: &str, user: &str, password: &str) -> Self {
        Self {
            runner,
            address: address.to_owned(),
            user: user.to_owned(),
            password: password.to_owned(),
        }
    }

    fn invoke(&self, command: &[&str]) -> Result<CommandOutput, ArrayError> {
        let mut argv: Vec<OsString> = vec![
            "-h".into(),
            self.address.as_str().into(),
            "-user".into(),
            self.user.as_str().into(),
            "-password".into(),
            self.password.as_str().into(),
            "-scope".into(),
            "0".into(),
        ];
        argv.extend(command.iter().map(OsString::from));
        debug!(command = %command.join(" "), "running naviseccli");
        Ok(self.runner.run(NAVISECCLI, &argv)?)
    }

    /// Runs `command` and returns stdout, or the failure class with its error.
    fn navi(&self, command: &[&str]) -> Result<String, (Fault, ArrayError)> {
        let output = self
            .invoke(command)
            .map_err(|err| (Fault::Other, err))?;
        if output.is_success() {
            return Ok(output.stdout);
        }
        let text = format!("{}\n{}", output.stdout, output.stderr);
        let status = output
            .code
            .and_then(|code| u16::try_from(code).ok())
            .unwrap_or(u16::MAX);
        Err((
            fault(&text),
            ArrayError::Api {
                status,
                message: text.trim().to_owned(),
            },
        ))
    }

    fn lookup_lun(&self, name: &str) -> Result<Option<Lun>, ArrayError> {
        match self.navi(&["lun", "-list", "-name", name, "-all"]) {
            Ok(stdout) => Ok(parse::luns(&stdout)
                .into_iter()
                .find(|lun| lun.name == name && !lun.is_destroying())),
            Err((Fault::NotFound, _)) => Ok(None),
            Err((_, err)) => Err(err),
        }
    }

    fn lookup_group(&self, name: &str) -> Result<Option<HostGroup>, ArrayError> {
        match self.navi(&["storagegroup", "-list", "-gname", name]) {
            Ok(stdout) => Ok(parse::storage_groups(&stdout)
                .into_iter()
                .find(|group| group.name == name)),
            Err((Fault::NotFound, _)) => Ok(None),
            Err((_, err)) => Err(err),
        }
    }

    fn fresh_group(&self, group: &HostGroup) -> Result<HostGroup, ArrayError> {
        self.lookup_group(&group.name)?
            .ok_or_else(|| ArrayError::not_found("storage group", &group.name))
    }

    fn ports_for(&self, transport: Transport) -> Result<Vec<SpPort>, ArrayError> {
        let ports = match transport {
            Transport::Iscsi => self
                .navi(&["connection", "-getport", "-address", "-vlanid"])
                .map(|stdout| parse::iscsi_ports(&stdout)),
            Transport::Fc => self
                .navi(&["port", "-list", "-sp"])
                .map(|stdout| parse::fc_ports(&stdout)),
            Transport::Sdc => {
                return Err(ArrayError::Unsupported {
                    operation: String::from("SDC initiators on VNX"),
                });
            }
        };
        ports.map_err(|(_, err)| err)
    }

    fn set_path(
        &self,
        group: &HostGroup,
        initiator: &Initiator,
        hba_uid: &str,
        port: &SpPort,
    ) -> Result<(), ArrayError> {
        let mut command = vec![
            "storagegroup",
            "-setpath",
            "-gname",
            group.name.as_str(),
            "-hbauid",
            hba_uid,
            "-sp",
            port.sp.as_str(),
            "-spport",
            port.port_id.as_str(),
        ];
        if let Some(vport) = port.virtual_port.as_deref() {
            command.extend(["-spvport", vport]);
        }
        command.extend([
            "-type",
            INITIATOR_TYPE,
            "-host",
            group.name.as_str(),
            "-failovermode",
            FAILOVER_MODE,
            "-arraycommpath",
            "1",
        ]);
        if let Some(ip) = initiator.host_ip.as_deref() {
            command.extend(["-ip", ip]);
        }
        command.push("-o");
        match self.navi(&command) {
            Ok(_) | Err((Fault::NameInUse, _)) => Ok(()),
            Err((_, err)) => Err(err),
        }
    }
}

impl<R: CommandRunner> ArrayClient for VnxClient<R> {
    fn family(&self) -> ArrayFamily {
        ArrayFamily::Vnx
    }

    fn pools(&self) -> ArrayFuture<'_, Vec<StoragePool>> {
        Box::pin(async move {
            let stdout = self
                .navi(&["storagepool", "-list", "-availableCap", "-userCap"])
                .map_err(|(_, err)| err)?;
            Ok(parse::pools(&stdout))
        })
    }

    fn lun<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, Option<Lun>> {
        Box::pin(async move { self.lookup_lun(name) })
    }

    fn luns(&self) -> ArrayFuture<'_, Vec<Lun>> {
        Box::pin(async move {
            let stdout = self
                .navi(&["lun", "-list", "-all"])
                .map_err(|(_, err)| err)?;
            Ok(parse::luns(&stdout)
                .into_iter()
                .filter(|lun| !lun.is_destroying())
                .collect())
        })
    }

    fn create_lun<'a>(
        &'a self,
        pool: &'a StoragePool,
        name: &'a str,
        size_bytes: u64,
    ) -> ArrayFuture<'a, Lun> {
        Box::pin(async move {
            let capacity = size_bytes.div_ceil(GIB).to_string();
            let command = [
                "lun",
                "-create",
                "-type",
                "Thin",
                "-capacity",
                capacity.as_str(),
                "-sq",
                "gb",
                "-poolName",
                pool.name.as_str(),
                "-name",
                name,
            ];
            match self.navi(&command) {
                Ok(_) => {}
                Err((Fault::NameInUse, _)) => {
                    return Err(ArrayError::NameInUse {
                        name: name.to_owned(),
                    });
                }
                Err((_, err)) => return Err(err),
            }
            info!(lun = name, pool = %pool.name, "created VNX LUN");
            self.lookup_lun(name)?
                .ok_or_else(|| ArrayError::unexpected(format!("created LUN {name} is missing")))
        })
    }

    fn delete_lun<'a>(&'a self, lun: &'a Lun) -> ArrayFuture<'a, ()> {
        Box::pin(async move {
            match self.navi(&["lun", "-destroy", "-name", lun.name.as_str(), "-o"]) {
                Ok(_) => Ok(()),
                Err((Fault::NotFound, _)) => Err(ArrayError::not_found("lun", &lun.name)),
                Err((_, err)) => Err(err),
            }
        })
    }

    fn resize_lun<'a>(&'a self, lun: &'a Lun, size_bytes: u64) -> ArrayFuture<'a, ()> {
        Box::pin(async move {
            let capacity = size_bytes.div_ceil(GIB).to_string();
            let command = [
                "lun",
                "-expand",
                "-name",
                lun.name.as_str(),
                "-capacity",
                capacity.as_str(),
                "-sq",
                "gb",
                "-o",
                "-ignoreThresholds",
            ];
            self.navi(&command).map(drop).map_err(|(_, err)| err)
        })
    }

    fn host_groups(&self) -> ArrayFuture<'_, Vec<HostGroup>> {
        Box::pin(async move {
            match self.navi(&["storagegroup", "-list"]) {
                Ok(stdout) => Ok(parse::storage_groups(&stdout)),
                Err((Fault::NotFound, _)) => Ok(Vec::new()),
                Err((_, err)) => Err(err),
            }
        })
    }

    fn host_group<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, Option<HostGroup>> {
        Box::pin(async move { self.lookup_group(name) })
    }

    fn create_host_group<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, HostGroup> {
        Box::pin(async move {
            match self.navi(&["storagegroup", "-create", "-gname", name]) {
                Ok(_) => {}
                Err((Fault::NameInUse, _)) => {
                    return Err(ArrayError::NameInUse {
                        name: name.to_owned(),
                    });
                }
                Err((_, err)) => return Err(err),
            }
            info!(group = name, "created storage group");
            Ok(self.lookup_group(name)?.unwrap_or_else(|| HostGroup {
                id: name.to_owned(),
                name: name.to_owned(),
                initiators: Vec::new(),
                mappings: Vec::new(),
            }))
        })
    }

    fn register_initiator<'a>(
        &'a self,
        group: &'a HostGroup,
        initiator: &'a Initiator,
    ) -> ArrayFuture<'a, ()> {
        Box::pin(async move {
            let hba_uid = match initiator.transport {
                Transport::Fc => parse::fc_hba_uid(&initiator.id),
                Transport::Iscsi | Transport::Sdc => initiator.id.clone(),
            };
            let ports = self.ports_for(initiator.transport)?;
            if ports.is_empty() {
                warn!(group = %group.name, transport = %initiator.transport, "no front-end ports to register against");
            }
            for port in &ports {
                self.set_path(group, initiator, &hba_uid, port)?;
            }
            info!(group = %group.name, initiator = %initiator.id, paths = ports.len(), "registered initiator");
            Ok(())
        })
    }

    fn map_lun<'a>(&'a self, group: &'a HostGroup, lun: &'a Lun) -> ArrayFuture<'a, u32> {
        Box::pin(async move {
            // The caller's copy may be stale after a lost HLU race.
            let current = self.fresh_group(group)?;
            if let Some(hlu) = current.hlu_for(lun) {
                return Ok(hlu);
            }
            let no_hlu = || ArrayError::NoHluAvailable {
                lun: lun.name.clone(),
                group: group.name.clone(),
            };
            let hlu = parse::free_hlu(&current, MAX_HLU).ok_or_else(no_hlu)?;
            let hlu_arg = hlu.to_string();
            let alu = lun.keys.get("alu").unwrap_or(&lun.id);
            let command = [
                "storagegroup",
                "-addhlu",
                "-gname",
                group.name.as_str(),
                "-hlu",
                hlu_arg.as_str(),
                "-alu",
                alu.as_str(),
            ];
            match self.navi(&command) {
                Ok(_) => {
                    info!(lun = %lun.name, group = %group.name, hlu, "mapped LUN");
                    Ok(hlu)
                }
                Err((Fault::HluTaken, _)) => Err(no_hlu()),
                Err((Fault::AlreadyMapped, _)) => Err(ArrayError::AlreadyMapped {
                    lun: lun.name.clone(),
                    group: group.name.clone(),
                }),
                Err((_, err)) => Err(err),
            }
        })
    }

    fn unmap_lun<'a>(&'a self, group: &'a HostGroup, lun: &'a Lun) -> ArrayFuture<'a, ()> {
        Box::pin(async move {
            let current = self.fresh_group(group)?;
            let hlu = current
                .hlu_for(lun)
                .ok_or_else(|| ArrayError::not_found("mapping", &lun.name))?
                .to_string();
            let command = [
                "storagegroup",
                "-removehlu",
                "-gname",
                group.name.as_str(),
                "-hlu",
                hlu.as_str(),
                "-o",
            ];
            self.navi(&command).map(drop).map_err(|(_, err)| err)
        })
    }

    fn target_portals(&self) -> ArrayFuture<'_, Vec<TargetPortal>> {
        Box::pin(async move {
            let stdout = self
                .navi(&["connection", "-getport", "-address", "-vlanid"])
                .map_err(|(_, err)| err)?;
            Ok(parse::target_portals(&stdout))
        })
    }
}
