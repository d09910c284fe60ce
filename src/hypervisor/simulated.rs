//! In-memory cluster used for dry runs (`hypervisor.simulated = true`) and tests.
//!
//! It follows the hypervisor's observable rules closely enough for the engine to
//! trip over the same problems it would in production: linked clones only from
//! templates on the same node, templates with linked children cannot be deleted,
//! running VMs cannot be deleted, and clone tasks finish asynchronously.
//! Faults (lock contention, clone, conversion or delete failures) can be injected.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

use super::{
    ClusterVm, CloneSpec, DiskEntry, HypervisorApi, NodeSnapshot, StorageInfo, TaskHandle,
    TaskState, VmConfig, VmRef, VmShellSpec,
};
use crate::errors::HypervisorError;

const DEFAULT_STORAGE: &str = "local-lvm";
const FIRST_VMID: u32 = 100;

#[derive(Debug, Clone)]
struct SimVm {
    node: String,
    name: String,
    template: bool,
    running: bool,
    memory_mb: u64,
    cores: u32,
    // Raw config lines: disks, boot order, cloud-init, network.
    config: BTreeMap<String, String>,
    lock_polls_remaining: u32,
    snapshots: Vec<String>,
}

impl SimVm {
    fn linked_base(&self) -> Option<u32> {
        self.to_config().linked_base()
    }

    fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("name".into(), Value::from(self.name.clone()));
        map.insert("memory".into(), Value::from(self.memory_mb));
        map.insert("cores".into(), Value::from(self.cores));
        if self.template {
            map.insert("template".into(), Value::from(1));
        }
        for (key, value) in &self.config {
            map.insert(key.clone(), Value::from(value.clone()));
        }
        Value::Object(map)
    }

    fn to_config(&self) -> VmConfig {
        // Infallible for an object payload.
        VmConfig::from_api(&self.to_json()).unwrap_or_default()
    }
}

#[derive(Debug)]
struct SimTask {
    polls_remaining: u32,
    exit_status: String,
}

#[derive(Debug, Default)]
struct SimState {
    nodes: Vec<NodeSnapshot>,
    storages: HashMap<String, StorageInfo>,
    vms: BTreeMap<u32, SimVm>,
    tasks: HashMap<String, SimTask>,
    task_seq: u64,
    task_polls: u32,
    lock_polls: u32,
    locked_clone_submits: u32,
    clone_faults: HashMap<String, String>,
    convert_faults: HashSet<String>,
    delete_faults: HashMap<String, String>,
    clone_log: Vec<CloneSpec>,
    start_log: Vec<(u32, Instant)>,
}

impl SimState {
    fn node_online(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n.node == node && n.online)
    }

    fn vm_on(&self, vm: &VmRef) -> Result<&SimVm, HypervisorError> {
        self.vms
            .get(&vm.vmid)
            .filter(|v| v.node == vm.node)
            .ok_or_else(|| missing_config(vm))
    }

    fn vm_on_mut(&mut self, vm: &VmRef) -> Result<&mut SimVm, HypervisorError> {
        self.vms
            .get_mut(&vm.vmid)
            .filter(|v| v.node == vm.node)
            .ok_or_else(|| missing_config(vm))
    }

    fn spawn_task(&mut self, node: &str, kind: &str, vmid: u32) -> TaskHandle {
        self.spawn_task_with_exit(node, kind, vmid, "OK")
    }

    fn spawn_task_with_exit(
        &mut self,
        node: &str,
        kind: &str,
        vmid: u32,
        exit: &str,
    ) -> TaskHandle {
        self.task_seq += 1;
        let upid = format!("UPID:{}:{:08X}:{}:{}:root@pam:", node, self.task_seq, kind, vmid);
        self.tasks.insert(
            upid.clone(),
            SimTask {
                polls_remaining: self.task_polls,
                exit_status: exit.to_string(),
            },
        );
        TaskHandle {
            node: node.to_string(),
            upid,
        }
    }

    fn storage_supports_linked(&self, disk: &DiskEntry) -> bool {
        disk.storage()
            .and_then(|storage| self.storages.get(storage))
            .is_some_and(|info| info.supports_linked_clone(disk.format()))
    }
}

fn missing_config(vm: &VmRef) -> HypervisorError {
    HypervisorError::Api {
        status: 500,
        message: format!(
            "Configuration file 'nodes/{}/qemu-server/{}.conf' does not exist",
            vm.node, vm.vmid
        ),
    }
}

fn api_error(status: u16, message: impl Into<String>) -> HypervisorError {
    HypervisorError::Api {
        status,
        message: message.into(),
    }
}

fn suffix_of(volname: &str) -> &str {
    if volname.ends_with(".qcow2") {
        ".qcow2"
    } else {
        ""
    }
}

pub struct SimulatedHypervisor {
    state: Mutex<SimState>,
}

impl SimulatedHypervisor {
    pub fn new(nodes: Vec<NodeSnapshot>) -> Self {
        let mut state = SimState {
            nodes,
            task_polls: 1,
            ..SimState::default()
        };
        state.storages.insert(
            DEFAULT_STORAGE.to_string(),
            StorageInfo {
                storage: DEFAULT_STORAGE.to_string(),
                kind: "lvmthin".to_string(),
                shared: false,
            },
        );
        Self {
            state: Mutex::new(state),
        }
    }

    /// Three idle nodes and an Ubuntu source template (9000) on `pve1`.
    pub fn demo() -> Self {
        let gib = 1024 * 1024 * 1024;
        let sim = Self::new(vec![
            NodeSnapshot::idle("pve1", 32, 128 * gib),
            NodeSnapshot::idle("pve2", 32, 128 * gib),
            NodeSnapshot::idle("pve3", 16, 64 * gib),
        ]);
        sim.add_template(9000, "pve1", "ubuntu-22.04-template", 2048, 2);
        sim
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_storage(&self, info: StorageInfo) {
        self.state().storages.insert(info.storage.clone(), info);
    }

    /// Adds a template whose boot disk is `local-lvm:base-<vmid>-disk-0`.
    pub fn add_template(&self, vmid: u32, node: &str, name: &str, memory_mb: u64, cores: u32) {
        let volume = format!("{}:base-{}-disk-0,size=32G", DEFAULT_STORAGE, vmid);
        self.insert_vm(vmid, node, name, memory_mb, cores, true, &volume);
    }

    /// Adds a regular (non-template) VM with the given boot volume line.
    pub fn add_vm(&self, vmid: u32, node: &str, name: &str, volume: &str) {
        self.insert_vm(vmid, node, name, 2048, 1, false, volume);
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_vm(
        &self,
        vmid: u32,
        node: &str,
        name: &str,
        memory_mb: u64,
        cores: u32,
        template: bool,
        volume: &str,
    ) {
        let mut config = BTreeMap::new();
        config.insert("scsi0".to_string(), volume.to_string());
        config.insert("boot".to_string(), "order=scsi0".to_string());
        config.insert("net0".to_string(), "virtio,bridge=vmbr0".to_string());
        self.state().vms.insert(
            vmid,
            SimVm {
                node: node.to_string(),
                name: name.to_string(),
                template,
                running: false,
                memory_mb,
                cores,
                config,
                lock_polls_remaining: 0,
                snapshots: Vec::new(),
            },
        );
    }

    /// Number of status polls a task reports `running` before it stops.
    pub fn set_task_polls(&self, polls: u32) {
        self.state().task_polls = polls;
    }

    /// Number of config reads a freshly cloned VM reports a `clone` lock.
    pub fn set_lock_polls(&self, polls: u32) {
        self.state().lock_polls = polls;
    }

    /// The next `count` clone submissions fail with a lock timeout.
    pub fn lock_next_clones(&self, count: u32) {
        self.state().locked_clone_submits = count;
    }

    /// Every clone targeting `name` fails with `message`.
    pub fn fail_clone_named(&self, name: &str, message: &str) {
        self.state()
            .clone_faults
            .insert(name.to_string(), message.to_string());
    }

    /// Conversions of `name` are accepted but their task fails.
    pub fn fail_convert_named(&self, name: &str) {
        self.state().convert_faults.insert(name.to_string());
    }

    /// Every delete of the VM called `name` fails with `message`.
    pub fn fail_delete_named(&self, name: &str, message: &str) {
        self.state()
            .delete_faults
            .insert(name.to_string(), message.to_string());
    }

    pub fn set_node_online(&self, node: &str, online: bool) {
        if let Some(n) = self.state().nodes.iter_mut().find(|n| n.node == node) {
            n.online = online;
        }
    }

    /// Moves a VM to another node, as a live migration would.
    pub fn migrate(&self, vmid: u32, node: &str) {
        if let Some(vm) = self.state().vms.get_mut(&vmid) {
            vm.node = node.to_string();
        }
    }

    pub fn clone_log(&self) -> Vec<CloneSpec> {
        self.state().clone_log.clone()
    }

    /// Started VM ids with the time of the start request, oldest first.
    pub fn start_log(&self) -> Vec<(u32, Instant)> {
        self.state().start_log.clone()
    }

    pub fn exists(&self, vmid: u32) -> bool {
        self.state().vms.contains_key(&vmid)
    }

    pub fn vm(&self, vmid: u32) -> Option<ClusterVm> {
        self.state().vms.get(&vmid).map(|vm| ClusterVm {
            vmid,
            node: vm.node.clone(),
            name: Some(vm.name.clone()),
            template: vm.template,
            running: vm.running,
        })
    }

    pub fn find_by_name(&self, name: &str) -> Option<ClusterVm> {
        let vmid = self
            .state()
            .vms
            .iter()
            .find(|(_, vm)| vm.name == name)
            .map(|(vmid, _)| *vmid)?;
        self.vm(vmid)
    }

    pub fn vm_count(&self) -> usize {
        self.state().vms.len()
    }

    pub fn linked_base_of(&self, vmid: u32) -> Option<u32> {
        self.state().vms.get(&vmid).and_then(SimVm::linked_base)
    }

    pub fn snapshots_of(&self, vmid: u32) -> Vec<String> {
        self.state()
            .vms
            .get(&vmid)
            .map(|vm| vm.snapshots.clone())
            .unwrap_or_default()
    }

    pub fn config_value(&self, vmid: u32, key: &str) -> Option<String> {
        self.state()
            .vms
            .get(&vmid)
            .and_then(|vm| vm.config.get(key).cloned())
    }
}

#[async_trait]
impl HypervisorApi for SimulatedHypervisor {
    async fn list_nodes(&self) -> Result<Vec<NodeSnapshot>, HypervisorError> {
        Ok(self.state().nodes.clone())
    }

    async fn cluster_vms(&self) -> Result<Vec<ClusterVm>, HypervisorError> {
        Ok(self
            .state()
            .vms
            .iter()
            .map(|(vmid, vm)| ClusterVm {
                vmid: *vmid,
                node: vm.node.clone(),
                name: Some(vm.name.clone()),
                template: vm.template,
                running: vm.running,
            })
            .collect())
    }

    async fn next_vmid(&self) -> Result<u32, HypervisorError> {
        let state = self.state();
        let mut candidate = FIRST_VMID;
        while state.vms.contains_key(&candidate) {
            candidate += 1;
        }
        Ok(candidate)
    }

    async fn vm_config(&self, vm: &VmRef) -> Result<VmConfig, HypervisorError> {
        let mut state = self.state();
        let sim = state.vm_on_mut(vm)?;
        let mut config = sim.to_config();
        if sim.lock_polls_remaining > 0 {
            sim.lock_polls_remaining -= 1;
            config.lock = Some("clone".to_string());
        }
        Ok(config)
    }

    async fn clone_vm(&self, spec: &CloneSpec) -> Result<TaskHandle, HypervisorError> {
        let mut state = self.state();
        let source = state.vm_on(&spec.source)?.clone();

        if state.locked_clone_submits > 0 {
            state.locked_clone_submits -= 1;
            return Err(api_error(
                500,
                format!(
                    "can't lock file '/var/lock/qemu-server/lock-{}.conf' - got timeout",
                    spec.source.vmid
                ),
            ));
        }
        if let Some(message) = state.clone_faults.get(&spec.name) {
            return Err(api_error(400, message.clone()));
        }
        if !state.node_online(&spec.target_node) {
            return Err(api_error(
                400,
                format!("target node '{}' is not online", spec.target_node),
            ));
        }
        if state.vms.contains_key(&spec.newid) {
            return Err(api_error(500, format!("VM {} already exists", spec.newid)));
        }
        if !spec.full {
            if !source.template {
                return Err(api_error(
                    400,
                    "linked clone requires a template as source".to_string(),
                ));
            }
            if spec.target_node != spec.source.node {
                return Err(api_error(
                    400,
                    "linked clone to another node is not supported".to_string(),
                ));
            }
            if let Some(disk) = source.to_config().boot_disk() {
                if !state.storage_supports_linked(disk) {
                    return Err(api_error(
                        400,
                        format!("Linked clone feature is not supported for drive '{}'", disk.slot),
                    ));
                }
            }
        }

        let mut config = source.config.clone();
        let mut disk_index = 0;
        for (slot, line) in source.config.iter() {
            let disk = DiskEntry::parse(slot, line);
            if !source.to_config().disks.iter().any(|d| d.slot == *slot) || disk.is_cdrom() {
                continue;
            }
            let storage = spec
                .storage
                .clone()
                .or_else(|| disk.storage().map(str::to_string))
                .unwrap_or_else(|| DEFAULT_STORAGE.to_string());
            let suffix = suffix_of(disk.volname());
            let volname = if spec.full {
                format!("vm-{}-disk-{}{}", spec.newid, disk_index, suffix)
            } else {
                format!(
                    "{}/vm-{}-disk-{}{}",
                    disk.volname(),
                    spec.newid,
                    disk_index,
                    suffix
                )
            };
            let mut line = format!("{}:{}", storage, volname);
            for (key, value) in &disk.options {
                line.push_str(&format!(",{}={}", key, value));
            }
            config.insert(slot.clone(), line);
            disk_index += 1;
        }

        let lock_polls = state.lock_polls;
        state.vms.insert(
            spec.newid,
            SimVm {
                node: spec.target_node.clone(),
                name: spec.name.clone(),
                template: false,
                running: false,
                memory_mb: source.memory_mb,
                cores: source.cores,
                config,
                lock_polls_remaining: lock_polls,
                snapshots: Vec::new(),
            },
        );
        state.clone_log.push(spec.clone());
        let node = spec.source.node.clone();
        Ok(state.spawn_task(&node, "qmclone", spec.source.vmid))
    }

    async fn task_status(&self, task: &TaskHandle) -> Result<TaskState, HypervisorError> {
        let mut state = self.state();
        let sim = state
            .tasks
            .get_mut(&task.upid)
            .ok_or_else(|| HypervisorError::NotFound(format!("no such task '{}'", task.upid)))?;
        if sim.polls_remaining > 0 {
            sim.polls_remaining -= 1;
            return Ok(TaskState::Running);
        }
        Ok(TaskState::Stopped {
            exit_status: sim.exit_status.clone(),
        })
    }

    async fn convert_to_template(&self, vm: &VmRef) -> Result<Option<TaskHandle>, HypervisorError> {
        let mut state = self.state();
        let name = state.vm_on(vm)?.name.clone();
        if state.convert_faults.contains(&name) {
            // The conversion is accepted and fails inside its task.
            let task = state.spawn_task_with_exit(&vm.node, "qmtemplate", vm.vmid, "storage error");
            return Ok(Some(task));
        }
        let sim = state.vm_on_mut(vm)?;
        if sim.running {
            return Err(api_error(500, "you can't convert a running VM to a template"));
        }
        sim.template = true;
        let prefix = format!("vm-{}-disk", vm.vmid);
        let base = format!("base-{}-disk", vm.vmid);
        for line in sim.config.values_mut() {
            if line.contains(&prefix) && !line.contains('/') {
                *line = line.replace(&prefix, &base);
            }
        }
        Ok(Some(state.spawn_task(&vm.node, "qmtemplate", vm.vmid)))
    }

    async fn delete_vm(&self, vm: &VmRef) -> Result<TaskHandle, HypervisorError> {
        let mut state = self.state();
        let sim = state.vm_on(vm).map_err(|_| {
            HypervisorError::NotFound(format!("VM {} does not exist on {}", vm.vmid, vm.node))
        })?;
        if let Some(message) = state.delete_faults.get(&sim.name) {
            return Err(api_error(500, message.clone()));
        }
        if sim.running {
            return Err(api_error(500, format!("VM {} is running - destroy failed", vm.vmid)));
        }
        if sim.template {
            if let Some((child, _)) = state
                .vms
                .iter()
                .find(|(_, other)| other.linked_base() == Some(vm.vmid))
            {
                return Err(api_error(
                    500,
                    format!(
                        "base volume 'base-{}-disk-0' is still in use by linked cloned VM {}",
                        vm.vmid, child
                    ),
                ));
            }
        }
        state.vms.remove(&vm.vmid);
        Ok(state.spawn_task(&vm.node, "qmdestroy", vm.vmid))
    }

    async fn start_vm(&self, vm: &VmRef) -> Result<TaskHandle, HypervisorError> {
        let mut state = self.state();
        let sim = state.vm_on_mut(vm)?;
        if sim.template {
            return Err(api_error(500, "you can't start a VM if it's a template"));
        }
        sim.running = true;
        state.start_log.push((vm.vmid, Instant::now()));
        Ok(state.spawn_task(&vm.node, "qmstart", vm.vmid))
    }

    async fn stop_vm(&self, vm: &VmRef) -> Result<TaskHandle, HypervisorError> {
        let mut state = self.state();
        state.vm_on_mut(vm)?.running = false;
        Ok(state.spawn_task(&vm.node, "qmstop", vm.vmid))
    }

    async fn create_snapshot(&self, vm: &VmRef, name: &str) -> Result<TaskHandle, HypervisorError> {
        let mut state = self.state();
        let sim = state.vm_on_mut(vm)?;
        if sim.snapshots.iter().any(|s| s == name) {
            return Err(api_error(500, format!("snapshot name '{}' already used", name)));
        }
        sim.snapshots.push(name.to_string());
        Ok(state.spawn_task(&vm.node, "qmsnapshot", vm.vmid))
    }

    async fn rollback_snapshot(
        &self,
        vm: &VmRef,
        name: &str,
    ) -> Result<TaskHandle, HypervisorError> {
        let mut state = self.state();
        let sim = state.vm_on_mut(vm)?;
        if !sim.snapshots.iter().any(|s| s == name) {
            return Err(api_error(500, format!("snapshot '{}' does not exist", name)));
        }
        sim.running = false;
        Ok(state.spawn_task(&vm.node, "qmrollback", vm.vmid))
    }

    async fn storage_info(
        &self,
        node: &str,
        storage: &str,
    ) -> Result<StorageInfo, HypervisorError> {
        let state = self.state();
        if !state.nodes.iter().any(|n| n.node == node) {
            return Err(HypervisorError::NotFound(format!("no such node '{}'", node)));
        }
        state
            .storages
            .get(storage)
            .cloned()
            .ok_or_else(|| {
                HypervisorError::NotFound(format!("storage '{}' does not exist", storage))
            })
    }

    async fn volume_path(&self, node: &str, volume: &str) -> Result<String, HypervisorError> {
        let (storage, volname) = volume
            .split_once(':')
            .ok_or_else(|| HypervisorError::Decode(format!("volume without storage: {}", volume)))?;
        if !self.state().nodes.iter().any(|n| n.node == node) {
            return Err(HypervisorError::NotFound(format!("no such node '{}'", node)));
        }
        Ok(format!("/dev/{}/{}", storage, volname))
    }

    async fn create_vm_shell(
        &self,
        node: &str,
        spec: &VmShellSpec,
    ) -> Result<TaskHandle, HypervisorError> {
        let mut state = self.state();
        if !state.node_online(node) {
            return Err(api_error(400, format!("node '{}' is not online", node)));
        }
        if state.vms.contains_key(&spec.vmid) {
            return Err(api_error(500, format!("VM {} already exists", spec.vmid)));
        }
        let mut config = BTreeMap::new();
        config.insert("net0".to_string(), format!("virtio,bridge={}", spec.bridge));
        config.insert("scsihw".to_string(), "virtio-scsi-pci".to_string());
        state.vms.insert(
            spec.vmid,
            SimVm {
                node: node.to_string(),
                name: spec.name.clone(),
                template: false,
                running: false,
                memory_mb: spec.memory_mb,
                cores: spec.cores,
                config,
                lock_polls_remaining: 0,
                snapshots: Vec::new(),
            },
        );
        Ok(state.spawn_task(node, "qmcreate", spec.vmid))
    }

    async fn update_vm_config(
        &self,
        vm: &VmRef,
        params: &[(String, String)],
    ) -> Result<(), HypervisorError> {
        let mut state = self.state();
        let sim = state.vm_on_mut(vm)?;
        for (key, value) in params {
            if key == "delete" {
                for removed in value.split(',') {
                    sim.config.remove(removed.trim());
                }
            } else {
                sim.config.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }
}
