use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hypervisor::VmRef;

/// Role of a VM inside a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmRole {
    Teacher,
    ClassBase,
    Student,
}

impl fmt::Display for VmRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmRole::Teacher => write!(f, "teacher"),
            VmRole::ClassBase => write!(f, "class-base"),
            VmRole::Student => write!(f, "student"),
        }
    }
}

/// A VM the engine created for a class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetVm {
    pub vmid: u32,
    pub node: String,
    pub name: String,
    pub role: VmRole,
}

impl FleetVm {
    pub fn new(vmid: u32, node: impl Into<String>, name: impl Into<String>, role: VmRole) -> Self {
        Self {
            vmid,
            node: node.into(),
            name: name.into(),
            role,
        }
    }

    pub fn vm_ref(&self) -> VmRef {
        VmRef::new(self.vmid, self.node.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloneRequest {
    pub source: VmRef,
    pub target_vmid: u32,
    pub target_node: String,
    pub name: String,
    pub full: bool,
    pub storage: Option<String>,
    /// Snapshot to take once the clone is unlocked.
    pub baseline_snapshot: Option<String>,
    /// Follow the clone task and the config lock before returning.
    pub wait: bool,
}

impl CloneRequest {
    pub fn full(
        source: VmRef,
        target_vmid: u32,
        target_node: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            source,
            target_vmid,
            target_node: target_node.into(),
            name: name.into(),
            full: true,
            storage: None,
            baseline_snapshot: None,
            wait: true,
        }
    }

    /// Linked clones always land on the node of their template.
    pub fn linked(source: VmRef, target_vmid: u32, name: impl Into<String>) -> Self {
        let target_node = source.node.clone();
        Self {
            full: false,
            ..Self::full(source, target_vmid, target_node, name)
        }
    }

    pub fn with_storage(mut self, storage: Option<String>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_baseline(mut self, snapshot: Option<String>) -> Self {
        self.baseline_snapshot = snapshot;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloneOutcome {
    pub success: bool,
    pub message: String,
    pub vmid: Option<u32>,
    pub node: String,
    pub name: String,
    pub attempts: u32,
}

impl CloneOutcome {
    pub fn succeeded(
        vmid: u32,
        node: impl Into<String>,
        name: impl Into<String>,
        attempts: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: true,
            message: message.into(),
            vmid: Some(vmid),
            node: node.into(),
            name: name.into(),
            attempts,
        }
    }

    pub fn failed(
        node: impl Into<String>,
        name: impl Into<String>,
        attempts: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            message: message.into(),
            vmid: None,
            node: node.into(),
            name: name.into(),
            attempts,
        }
    }

    /// The created VM, if the clone succeeded.
    pub fn fleet_vm(&self, role: VmRole) -> Option<FleetVm> {
        self.vmid
            .filter(|_| self.success)
            .map(|vmid| FleetVm::new(vmid, self.node.clone(), self.name.clone(), role))
    }
}
