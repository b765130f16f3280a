//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use camino::Utf8PathBuf;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::array::{
    ArrayClient, ArrayError, ArrayFamily, ArrayFuture, HostGroup, Initiator, Lun, LunMapping,
    LunState, StoragePool, TargetPortal, Transport,
};
use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::connector::{Connector, ConnectorError, ConnectorFuture, DeviceTarget};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Returns the recorded invocations rendered as command strings.
    #[must_use]
    pub fn command_strings(&self) -> Vec<String> {
        lock(&self.invocations)
            .iter()
            .map(CommandInvocation::command_string)
            .collect()
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a successful exit status with the given stdout.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

#[derive(Debug, Default)]
struct SimulatedState {
    pools: Vec<StoragePool>,
    capabilities: BTreeMap<String, Vec<String>>,
    luns: Vec<Lun>,
    groups: Vec<HostGroup>,
    portals: Vec<TargetPortal>,
    next_id: u64,
    initializing_polls: u32,
    hlu_exhaustions: u32,
    fixed_groups: bool,
    create_calls: usize,
}

/// In-memory array that enforces the same rules a real array does: unique
/// names, single mapping per LUN, capacity accounting and refusal to delete
/// a mapped LUN.
#[derive(Clone, Debug)]
pub struct SimulatedArray {
    family: ArrayFamily,
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedArray {
    /// Creates an empty array of `family`.
    #[must_use]
    pub fn new(family: ArrayFamily) -> Self {
        Self {
            family,
            state: Arc::new(Mutex::new(SimulatedState {
                next_id: 1,
                ..SimulatedState::default()
            })),
        }
    }

    /// Adds a pool with `free_bytes` of capacity.
    #[must_use]
    pub fn with_pool(self, id: &str, name: &str, free_bytes: u64) -> Self {
        lock(&self.state).pools.push(StoragePool {
            id: id.to_owned(),
            name: name.to_owned(),
            free_bytes,
            total_bytes: free_bytes,
        });
        self
    }

    /// Declares which pools carry `usage_tag`.
    #[must_use]
    pub fn with_capability(self, usage_tag: &str, pool_ids: &[&str]) -> Self {
        lock(&self.state).capabilities.insert(
            usage_tag.to_owned(),
            pool_ids.iter().map(|id| (*id).to_owned()).collect(),
        );
        self
    }

    /// Exposes an iSCSI target portal.
    #[must_use]
    pub fn with_portal(self, iqn: &str, portal: &str) -> Self {
        lock(&self.state).portals.push(TargetPortal {
            iqn: iqn.to_owned(),
            portal: portal.to_owned(),
        });
        self
    }

    /// Host groups cannot be created, as with ScaleIO data clients.
    #[must_use]
    pub fn with_fixed_groups(self) -> Self {
        lock(&self.state).fixed_groups = true;
        self
    }

    /// New LUNs report `Initializing` for the next `polls` lookups.
    pub fn set_initializing_polls(&self, polls: u32) {
        lock(&self.state).initializing_polls = polls;
    }

    /// The next `attempts` mapping calls fail with no free host LUN number.
    pub fn exhaust_hlus(&self, attempts: u32) {
        lock(&self.state).hlu_exhaustions = attempts;
    }

    /// Adds a pre-existing LUN, for example one owned by another cluster.
    pub fn insert_lun(&self, name: &str, size_bytes: u64) -> Lun {
        let mut state = lock(&self.state);
        let lun = state.new_lun(name, size_bytes, None, LunState::Ready);
        state.luns.push(lun.clone());
        lun
    }

    /// Sets the state reported for the LUN called `name`.
    pub fn set_lun_state(&self, name: &str, lun_state: LunState) {
        let mut state = lock(&self.state);
        if let Some(lun) = state.luns.iter_mut().find(|lun| lun.name == name) {
            lun.state = lun_state;
        }
    }

    /// Removes a LUN behind the client's back.
    pub fn remove_lun(&self, name: &str) {
        lock(&self.state).luns.retain(|lun| lun.name != name);
    }

    /// Adds a pre-existing host group.
    pub fn insert_group(&self, name: &str, initiators: &[&str]) {
        let mut state = lock(&self.state);
        let id = state.allocate_id("hg");
        state.groups.push(HostGroup {
            id,
            name: name.to_owned(),
            initiators: initiators.iter().map(|id| (*id).to_owned()).collect(),
            mappings: Vec::new(),
        });
    }

    /// Names of every LUN on the array.
    #[must_use]
    pub fn lun_names(&self) -> Vec<String> {
        lock(&self.state)
            .luns
            .iter()
            .map(|lun| lun.name.clone())
            .collect()
    }

    /// Snapshot of the host group called `name`.
    #[must_use]
    pub fn group(&self, name: &str) -> Option<HostGroup> {
        lock(&self.state)
            .groups
            .iter()
            .find(|group| group.name == name)
            .cloned()
    }

    /// Free bytes left in pool `id`.
    #[must_use]
    pub fn pool_free(&self, id: &str) -> Option<u64> {
        lock(&self.state)
            .pools
            .iter()
            .find(|pool| pool.id == id)
            .map(|pool| pool.free_bytes)
    }

    /// Number of `create_lun` calls received.
    #[must_use]
    pub fn create_calls(&self) -> usize {
        lock(&self.state).create_calls
    }
}

impl SimulatedState {
    fn allocate_id(&mut self, prefix: &str) -> String {
        let id = format!("{prefix}-{}", self.next_id);
        self.next_id += 1;
        id
    }

    fn new_lun(
        &mut self,
        name: &str,
        size_bytes: u64,
        pool: Option<String>,
        state: LunState,
    ) -> Lun {
        let number = self.next_id;
        let id = self.allocate_id("lun");
        Lun {
            id: id.clone(),
            name: name.to_owned(),
            size_bytes,
            state,
            pool,
            wwn: Some(format!("6000097{number:025x}")),
            keys: BTreeMap::from([(String::from("lun_id"), id)]),
        }
    }

    fn observe(&mut self, name: &str) -> Option<Lun> {
        let pending = self.initializing_polls;
        let lun = self.luns.iter_mut().find(|lun| lun.name == name)?;
        if lun.state == LunState::Initializing {
            if pending == 0 {
                lun.state = LunState::Ready;
            } else {
                self.initializing_polls = pending - 1;
            }
        }
        Some(lun.clone())
    }

    fn group_mut(&mut self, id: &str) -> Result<&mut HostGroup, ArrayError> {
        self.groups
            .iter_mut()
            .find(|group| group.id == id)
            .ok_or_else(|| ArrayError::not_found("host group", id))
    }
}

impl ArrayClient for SimulatedArray {
    fn family(&self) -> ArrayFamily {
        self.family
    }

    fn pools(&self) -> ArrayFuture<'_, Vec<StoragePool>> {
        Box::pin(async move { Ok(lock(&self.state).pools.clone()) })
    }

    fn capability_pools<'a>(&'a self, usage_tag: &'a str) -> ArrayFuture<'a, Vec<String>> {
        Box::pin(async move {
            Ok(lock(&self.state)
                .capabilities
                .get(usage_tag)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn lun<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, Option<Lun>> {
        Box::pin(async move { Ok(lock(&self.state).observe(name)) })
    }

    fn luns(&self) -> ArrayFuture<'_, Vec<Lun>> {
        Box::pin(async move { Ok(lock(&self.state).luns.clone()) })
    }

    fn create_lun<'a>(
        &'a self,
        pool: &'a StoragePool,
        name: &'a str,
        size_bytes: u64,
    ) -> ArrayFuture<'a, Lun> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.create_calls += 1;
            if state.luns.iter().any(|lun| lun.name == name) {
                return Err(ArrayError::NameInUse {
                    name: name.to_owned(),
                });
            }
            let stored = state
                .pools
                .iter_mut()
                .find(|stored| stored.id == pool.id)
                .ok_or_else(|| ArrayError::not_found("pool", pool.id.as_str()))?;
            stored.free_bytes = stored
                .free_bytes
                .checked_sub(size_bytes)
                .ok_or_else(|| ArrayError::Api {
                    status: 507,
                    message: format!("pool {} is full", pool.name),
                })?;
            let initial = if state.initializing_polls > 0 {
                LunState::Initializing
            } else {
                LunState::Ready
            };
            let lun = state.new_lun(name, size_bytes, Some(pool.id.clone()), initial);
            state.luns.push(lun.clone());
            Ok(lun)
        })
    }

    fn delete_lun<'a>(&'a self, lun: &'a Lun) -> ArrayFuture<'a, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            if state.groups.iter().any(|group| group.has_lun(lun)) {
                return Err(ArrayError::Api {
                    status: 409,
                    message: format!("lun {} is mapped", lun.name),
                });
            }
            let position = state
                .luns
                .iter()
                .position(|stored| stored.id == lun.id)
                .ok_or_else(|| ArrayError::not_found("lun", lun.name.as_str()))?;
            let removed = state.luns.remove(position);
            if let Some(pool) = removed
                .pool
                .as_ref()
                .and_then(|id| state.pools.iter_mut().find(|pool| pool.id == *id))
            {
                pool.free_bytes += removed.size_bytes;
            }
            Ok(())
        })
    }

    fn resize_lun<'a>(&'a self, lun: &'a Lun, size_bytes: u64) -> ArrayFuture<'a, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            let stored = state
                .luns
                .iter_mut()
                .find(|stored| stored.id == lun.id)
                .ok_or_else(|| ArrayError::not_found("lun", lun.name.as_str()))?;
            stored.size_bytes = size_bytes;
            Ok(())
        })
    }

    fn host_groups(&self) -> ArrayFuture<'_, Vec<HostGroup>> {
        Box::pin(async move { Ok(lock(&self.state).groups.clone()) })
    }

    fn host_group<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, Option<HostGroup>> {
        Box::pin(async move { Ok(self.group(name)) })
    }

    fn create_host_group<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, HostGroup> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            if state.fixed_groups {
                return Err(ArrayError::Unsupported {
                    operation: format!("create host group {name}"),
                });
            }
            if state.groups.iter().any(|group| group.name == name) {
                return Err(ArrayError::NameInUse {
                    name: name.to_owned(),
                });
            }
            let group = HostGroup {
                id: state.allocate_id("hg"),
                name: name.to_owned(),
                initiators: Vec::new(),
                mappings: Vec::new(),
            };
            state.groups.push(group.clone());
            Ok(group)
        })
    }

    fn register_initiator<'a>(
        &'a self,
        group: &'a HostGroup,
        initiator: &'a Initiator,
    ) -> ArrayFuture<'a, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            let stored = state.group_mut(&group.id)?;
            if !stored.has_initiator(&initiator.id) {
                stored.initiators.push(initiator.id.clone());
            }
            Ok(())
        })
    }

    fn map_lun<'a>(&'a self, group: &'a HostGroup, lun: &'a Lun) -> ArrayFuture<'a, u32> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            if state.hlu_exhaustions > 0 {
                state.hlu_exhaustions -= 1;
                return Err(ArrayError::NoHluAvailable {
                    lun: lun.name.clone(),
                    group: group.name.clone(),
                });
            }
            if let Some(holder) = state.groups.iter().find(|held| held.has_lun(lun)) {
                return Err(ArrayError::AlreadyMapped {
                    lun: lun.name.clone(),
                    group: holder.name.clone(),
                });
            }
            let stored = state.group_mut(&group.id)?;
            let used: BTreeSet<u32> = stored.mappings.iter().map(|mapping| mapping.hlu).collect();
            let hlu = (1..).find(|candidate| !used.contains(candidate)).unwrap_or(1);
            stored.mappings.push(LunMapping {
                lun_id: lun.id.clone(),
                hlu,
            });
            Ok(hlu)
        })
    }

    fn unmap_lun<'a>(&'a self, group: &'a HostGroup, lun: &'a Lun) -> ArrayFuture<'a, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            let stored = state.group_mut(&group.id)?;
            let before = stored.mappings.len();
            stored.mappings.retain(|mapping| mapping.lun_id != lun.id);
            if stored.mappings.len() == before {
                return Err(ArrayError::not_found("lun mapping", lun.name.as_str()));
            }
            Ok(())
        })
    }

    fn target_portals(&self) -> ArrayFuture<'_, Vec<TargetPortal>> {
        Box::pin(async move { Ok(lock(&self.state).portals.clone()) })
    }
}

#[derive(Debug, Default)]
struct FakeConnectorState {
    rescans: usize,
    logins: Vec<TargetPortal>,
    resolved: Vec<DeviceTarget>,
    device_missing: bool,
}

/// Connector double that records calls and fabricates device paths.
#[derive(Clone, Debug)]
pub struct FakeConnector {
    initiator: Initiator,
    instance_id: String,
    state: Arc<Mutex<FakeConnectorState>>,
}

impl FakeConnector {
    /// Creates an iSCSI connector for host `instance_id`.
    #[must_use]
    pub fn new(instance_id: &str) -> Self {
        Self {
            initiator: Initiator {
                transport: Transport::Iscsi,
                id: format!("iqn.1994-05.com.redhat:{instance_id}"),
                host_ip: None,
            },
            instance_id: instance_id.to_owned(),
            state: Arc::new(Mutex::new(FakeConnectorState::default())),
        }
    }

    /// Device nodes never appear, so lookups time out.
    pub fn hide_devices(&self) {
        lock(&self.state).device_missing = true;
    }

    /// Identity reported by [`Connector::initiator`].
    #[must_use]
    pub fn initiator_id(&self) -> &str {
        &self.initiator.id
    }

    /// Number of rescans requested.
    #[must_use]
    pub fn rescans(&self) -> usize {
        lock(&self.state).rescans
    }

    /// Portals logged in to.
    #[must_use]
    pub fn logins(&self) -> Vec<TargetPortal> {
        lock(&self.state).logins.clone()
    }

    /// Device lookups performed.
    #[must_use]
    pub fn resolved(&self) -> Vec<DeviceTarget> {
        lock(&self.state).resolved.clone()
    }
}

impl Connector for FakeConnector {
    fn initiator(&self) -> ConnectorFuture<'_, Initiator> {
        Box::pin(async move { Ok(self.initiator.clone()) })
    }

    fn instance_id(&self) -> ConnectorFuture<'_, String> {
        Box::pin(async move { Ok(self.instance_id.clone()) })
    }

    fn rescan(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            lock(&self.state).rescans += 1;
        })
    }

    fn login_targets<'a>(&'a self, portals: &'a [TargetPortal]) -> ConnectorFuture<'a, ()> {
        Box::pin(async move {
            lock(&self.state).logins.extend_from_slice(portals);
            Ok(())
        })
    }

    fn resolve_device_path<'a>(
        &'a self,
        target: &'a DeviceTarget,
    ) -> ConnectorFuture<'a, Utf8PathBuf> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.resolved.push(target.clone());
            if state.device_missing {
                return Err(ConnectorError::Timeout {
                    action: String::from("resolve_device_path"),
                    subject: target.lun_id.clone(),
                });
            }
            Ok(Utf8PathBuf::from(format!(
                "/dev/disk/by-path/fake-lun-{}",
                target.hlu
            )))
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
