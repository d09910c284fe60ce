//! Hypervisor boundary.
//!
//! Everything the engine needs from the cluster API goes through [`HypervisorApi`].
//! Responses are decoded into typed records at this boundary.

pub mod proxmox;
pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::errors::HypervisorError;

pub use proxmox::ProxmoxClient;
pub use simulated::SimulatedHypervisor;

/// A VM id together with the node currently hosting it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmRef {
    pub vmid: u32,
    pub node: String,
}

impl VmRef {
    pub fn new(vmid: u32, node: impl Into<String>) -> Self {
        Self {
            vmid,
            node: node.into(),
        }
    }
}

impl fmt::Display for VmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.vmid, self.node)
    }
}

/// Resource snapshot of one cluster node. Missing telemetry stays `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node: String,
    pub online: bool,
    /// Memory in use, bytes.
    pub mem_used: Option<u64>,
    /// Total memory, bytes.
    pub mem_total: Option<u64>,
    /// CPU utilisation, 0-100.
    pub cpu_pct: Option<f64>,
    /// IO wait, 0-100.
    pub iowait_pct: Option<f64>,
    /// 1-minute load average.
    pub load_avg: Option<f64>,
    pub cores: Option<u32>,
}

impl NodeSnapshot {
    pub fn offline(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            online: false,
            mem_used: None,
            mem_total: None,
            cpu_pct: None,
            iowait_pct: None,
            load_avg: None,
            cores: None,
        }
    }

    /// An idle online node with the given capacity.
    pub fn idle(node: impl Into<String>, cores: u32, mem_total: u64) -> Self {
        Self {
            node: node.into(),
            online: true,
            mem_used: Some(0),
            mem_total: Some(mem_total),
            cpu_pct: Some(0.0),
            iowait_pct: Some(0.0),
            load_avg: Some(0.0),
            cores: Some(cores),
        }
    }
}

/// One VM entry from the cluster-wide resource list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterVm {
    pub vmid: u32,
    pub node: String,
    pub name: Option<String>,
    pub template: bool,
    pub running: bool,
}

impl ClusterVm {
    pub fn vm_ref(&self) -> VmRef {
        VmRef::new(self.vmid, self.node.clone())
    }
}

/// Handle of an asynchronous hypervisor task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub node: String,
    pub upid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Stopped { exit_status: String },
}

impl TaskState {
    pub fn succeeded(&self) -> bool {
        matches!(self, TaskState::Stopped { exit_status } if exit_status == "OK")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloneSpec {
    pub source: VmRef,
    pub newid: u32,
    pub name: String,
    pub target_node: String,
    pub full: bool,
    pub storage: Option<String>,
}

/// Parameters for a disk-less VM shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmShellSpec {
    pub vmid: u32,
    pub name: String,
    pub memory_mb: u64,
    pub cores: u32,
    pub bridge: String,
}

/// One disk line of a VM config, e.g. `scsi0: local-lvm:vm-101-disk-0,size=32G`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskEntry {
    pub slot: String,
    pub volume: String,
    pub options: Vec<(String, String)>,
}

const DISK_BUSES: &[&str] = &["scsi", "virtio", "sata", "ide"];

fn is_disk_slot(key: &str) -> bool {
    DISK_BUSES.iter().any(|bus| {
        key.strip_prefix(bus)
            .is_some_and(|index| !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()))
    })
}

fn bus_rank(slot: &str) -> usize {
    DISK_BUSES
        .iter()
        .position(|bus| slot.starts_with(bus))
        .unwrap_or(DISK_BUSES.len())
}

impl DiskEntry {
    pub fn parse(slot: &str, raw: &str) -> Self {
        let mut parts = raw.split(',');
        let volume = parts.next().unwrap_or_default().trim().to_string();
        let options = parts
            .filter_map(|part| {
                let (key, value) = part.split_once('=')?;
                Some((key.trim().to_string(), value.trim().to_string()))
            })
            .collect();
        Self {
            slot: slot.to_string(),
            volume,
            options,
        }
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_cdrom(&self) -> bool {
        self.option("media") == Some("cdrom") || self.volume == "none"
    }

    /// Storage id part of the volume (`local-lvm` in `local-lvm:vm-101-disk-0`).
    pub fn storage(&self) -> Option<&str> {
        self.volume.split_once(':').map(|(storage, _)| storage)
    }

    pub fn volname(&self) -> &str {
        self.volume
            .split_once(':')
            .map_or(self.volume.as_str(), |(_, name)| name)
    }

    /// Image format, when it can be told from the entry. Block-backed volumes
    /// carry no suffix and report `None`.
    pub fn format(&self) -> Option<&str> {
        if let Some(format) = self.option("format") {
            return Some(format);
        }
        let name = self.volname();
        ["qcow2", "raw", "vmdk"]
            .into_iter()
            .find(|ext| name.ends_with(&format!(".{ext}")))
    }

    /// Id of the template whose base volume backs this disk, for linked clones.
    pub fn linked_base(&self) -> Option<u32> {
        self.volname().split('/').find_map(|segment| {
            let rest = segment.strip_prefix("base-")?;
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()
        })
    }
}

/// Decoded VM configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VmConfig {
    pub name: Option<String>,
    pub memory_mb: Option<u64>,
    pub cores: Option<u32>,
    pub lock: Option<String>,
    pub template: bool,
    pub boot: Option<String>,
    pub disks: Vec<DiskEntry>,
}

fn lenient_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl VmConfig {
    pub fn from_api(data: &Value) -> Result<Self, HypervisorError> {
        let map = data
            .as_object()
            .ok_or_else(|| HypervisorError::Decode("VM config is not an object".to_string()))?;

        let mut disks: Vec<DiskEntry> = map
            .iter()
            .filter(|(key, _)| is_disk_slot(key))
            .filter_map(|(key, value)| value.as_str().map(|raw| DiskEntry::parse(key, raw)))
            .collect();
        disks.sort_by(|a, b| {
            bus_rank(&a.slot)
                .cmp(&bus_rank(&b.slot))
                .then_with(|| a.slot.cmp(&b.slot))
        });

        Ok(Self {
            name: map.get("name").and_then(Value::as_str).map(str::to_string),
            memory_mb: map.get("memory").and_then(lenient_u64),
            cores: map
                .get("cores")
                .and_then(lenient_u64)
                .and_then(|c| u32::try_from(c).ok()),
            lock: map
                .get("lock")
                .and_then(Value::as_str)
                .filter(|l| !l.is_empty())
                .map(str::to_string),
            template: map.get("template").and_then(lenient_u64) == Some(1),
            boot: map
                .get("boot")
                .or_else(|| map.get("bootdisk"))
                .and_then(Value::as_str)
                .map(str::to_string),
            disks,
        })
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// The disk the VM boots from: first disk in the boot order, else the first
    /// non-cdrom disk by bus preference.
    pub fn boot_disk(&self) -> Option<&DiskEntry> {
        let ordered = self.boot.as_deref().and_then(|boot| {
            let order = boot.strip_prefix("order=").unwrap_or(boot);
            order.split([';', ',']).find_map(|slot| {
                self.disks
                    .iter()
                    .find(|d| d.slot == slot.trim() && !d.is_cdrom())
            })
        });
        ordered.or_else(|| self.disks.iter().find(|d| !d.is_cdrom()))
    }

    pub fn linked_base(&self) -> Option<u32> {
        self.boot_disk().and_then(DiskEntry::linked_base)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub storage: String,
    /// Storage plugin type, e.g. `lvmthin`, `dir`, `nfs`.
    pub kind: String,
    pub shared: bool,
}

impl StorageInfo {
    /// Whether a linked clone can be backed by a volume of `format` on this storage.
    /// Snapshot-capable block backends always can; file backends only for qcow2.
    pub fn supports_linked_clone(&self, format: Option<&str>) -> bool {
        match self.kind.as_str() {
            "lvmthin" | "zfspool" | "zfs" | "rbd" => true,
            "dir" | "nfs" | "cifs" | "glusterfs" | "cephfs" | "btrfs" => format == Some("qcow2"),
            _ => false,
        }
    }
}

#[async_trait]
pub trait HypervisorApi: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<NodeSnapshot>, HypervisorError>;

    async fn cluster_vms(&self) -> Result<Vec<ClusterVm>, HypervisorError>;

    async fn next_vmid(&self) -> Result<u32, HypervisorError>;

    async fn vm_config(&self, vm: &VmRef) -> Result<VmConfig, HypervisorError>;

    async fn clone_vm(&self, spec: &CloneSpec) -> Result<TaskHandle, HypervisorError>;

    async fn task_status(&self, task: &TaskHandle) -> Result<TaskState, HypervisorError>;

    /// Some API versions convert synchronously and return no task.
    async fn convert_to_template(&self, vm: &VmRef) -> Result<Option<TaskHandle>, HypervisorError>;

    async fn delete_vm(&self, vm: &VmRef) -> Result<TaskHandle, HypervisorError>;

    async fn start_vm(&self, vm: &VmRef) -> Result<TaskHandle, HypervisorError>;

    async fn stop_vm(&self, vm: &VmRef) -> Result<TaskHandle, HypervisorError>;

    async fn create_snapshot(&self, vm: &VmRef, name: &str)
        -> Result<TaskHandle, HypervisorError>;

    async fn rollback_snapshot(
        &self,
        vm: &VmRef,
        name: &str,
    ) -> Result<TaskHandle, HypervisorError>;

    async fn storage_info(&self, node: &str, storage: &str)
        -> Result<StorageInfo, HypervisorError>;

    /// Filesystem path of a volume as seen from its node.
    async fn volume_path(&self, node: &str, volume: &str) -> Result<String, HypervisorError>;

    async fn create_vm_shell(
        &self,
        node: &str,
        spec: &VmShellSpec,
    ) -> Result<TaskHandle, HypervisorError>;

    async fn update_vm_config(
        &self,
        vm: &VmRef,
        params: &[(String, String)],
    ) -> Result<(), HypervisorError>;
}
