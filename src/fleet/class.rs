use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::{CloudInit, FleetVm, VmRole};
use crate::errors::{FleetError, FleetResult};
use crate::hypervisor::VmRef;
use crate::scheduler::PlacementEstimate;

const MAX_STUDENTS: usize = 500;

/// How student disks relate to the class base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskMode {
    /// Students are hypervisor linked clones of a per-node base template.
    #[default]
    LinkedClone,
    /// Students boot from qcow2 overlays of a base image on shared storage.
    Overlay,
}

fn default_true() -> bool {
    true
}

/// Request to provision a class fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassRequest {
    pub class_id: String,
    /// Template the class is derived from. Never modified.
    pub source: VmRef,
    pub student_count: usize,
    #[serde(default = "default_true")]
    pub create_teacher: bool,
    #[serde(default = "default_true")]
    pub create_base: bool,
    #[serde(default)]
    pub disk_mode: DiskMode,
    #[serde(default)]
    pub name_prefix: Option<String>,
    #[serde(default)]
    pub estimate: Option<PlacementEstimate>,
    #[serde(default)]
    pub storage: Option<String>,
    #[serde(default)]
    pub cloud_init: Option<CloudInit>,
    #[serde(default)]
    pub start_after_create: bool,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 48
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        && !name.starts_with('-')
}

impl ClassRequest {
    pub fn new(class_id: impl Into<String>, source: VmRef, student_count: usize) -> Self {
        Self {
            class_id: class_id.into(),
            source,
            student_count,
            create_teacher: true,
            create_base: true,
            disk_mode: DiskMode::default(),
            name_prefix: None,
            estimate: None,
            storage: None,
            cloud_init: None,
            start_after_create: false,
        }
    }

    pub fn prefix(&self) -> String {
        self.name_prefix
            .clone()
            .unwrap_or_else(|| format!("class-{}", self.class_id))
    }

    pub fn validate(&self) -> FleetResult<()> {
        if self.class_id.trim().is_empty() {
            return Err(FleetError::Validation("class id must not be empty".to_string()));
        }
        if self.student_count > MAX_STUDENTS {
            return Err(FleetError::Validation(format!(
                "student count {} exceeds the limit of {}",
                self.student_count, MAX_STUDENTS
            )));
        }
        let prefix = self.prefix();
        if !valid_name(&prefix) {
            return Err(FleetError::Validation(format!(
                "'{}' is not a valid VM name prefix",
                prefix
            )));
        }
        if self.source.node.trim().is_empty() {
            return Err(FleetError::Validation("source template node is required".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutation {
    Save,
    Push,
    Reimage,
    Revert,
}

/// Lifecycle of a class fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassState {
    NoVms,
    Provisioning,
    Ready,
    Mutating(Mutation),
    Deleting,
    Gone,
}

impl ClassState {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClassState::Provisioning | ClassState::Mutating(_) | ClassState::Deleting
        )
    }

    pub fn can_transition_to(&self, next: &ClassState) -> bool {
        use ClassState::*;
        matches!(
            (self, next),
            (NoVms | Gone, Provisioning)
                | (Provisioning, Ready | NoVms)
                | (Ready, Mutating(_))
                | (Mutating(_), Ready)
                | (NoVms | Ready, Deleting)
                | (Deleting, Gone | Ready)
        )
    }
}

impl fmt::Display for ClassState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassState::NoVms => write!(f, "no_vms"),
            ClassState::Provisioning => write!(f, "provisioning"),
            ClassState::Ready => write!(f, "ready"),
            ClassState::Mutating(m) => write!(f, "mutating({:?})", m),
            ClassState::Deleting => write!(f, "deleting"),
            ClassState::Gone => write!(f, "gone"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BaseTier {
    /// Base template plus full-clone replicas on other nodes.
    Template {
        primary: FleetVm,
        replicas: Vec<FleetVm>,
    },
    /// Standalone base image on shared storage.
    Image { path: String },
}

/// One generation of a class base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassBase {
    pub generation: u32,
    pub tier: BaseTier,
}

impl ClassBase {
    pub fn template(generation: u32, primary: FleetVm) -> Self {
        Self {
            generation,
            tier: BaseTier::Template {
                primary,
                replicas: Vec::new(),
            },
        }
    }

    pub fn image(generation: u32, path: impl Into<String>) -> Self {
        Self {
            generation,
            tier: BaseTier::Image { path: path.into() },
        }
    }

    pub fn primary(&self) -> Option<&FleetVm> {
        match &self.tier {
            BaseTier::Template { primary, .. } => Some(primary),
            BaseTier::Image { .. } => None,
        }
    }

    pub fn image_path(&self) -> Option<&str> {
        match &self.tier {
            BaseTier::Image { path } => Some(path),
            BaseTier::Template { .. } => None,
        }
    }

    /// Template usable for linked clones on `node`.
    pub fn template_on(&self, node: &str) -> Option<VmRef> {
        match &self.tier {
            BaseTier::Template { primary, replicas } => std::iter::once(primary)
                .chain(replicas.iter())
                .find(|vm| vm.node == node)
                .map(FleetVm::vm_ref),
            BaseTier::Image { .. } => None,
        }
    }

    /// Template VMs, replicas first so the primary is removed last.
    pub fn template_vms(&self) -> Vec<FleetVm> {
        match &self.tier {
            BaseTier::Template { primary, replicas } => replicas
                .iter()
                .chain(std::iter::once(primary))
                .cloned()
                .collect(),
            BaseTier::Image { .. } => Vec::new(),
        }
    }

    pub fn template_ids(&self) -> Vec<u32> {
        self.template_vms().iter().map(|vm| vm.vmid).collect()
    }

    pub fn add_replica(&mut self, replica: FleetVm) {
        if let BaseTier::Template { replicas, .. } = &mut self.tier {
            replicas.push(replica);
        }
    }
}

/// Everything the engine knows about one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassFleet {
    pub class_id: String,
    pub source: VmRef,
    pub disk_mode: DiskMode,
    pub name_prefix: String,
    pub estimate: PlacementEstimate,
    pub storage: Option<String>,
    pub cloud_init: Option<CloudInit>,
    pub start_after_create: bool,
    pub state: ClassState,
    pub teacher: Option<FleetVm>,
    pub base: Option<ClassBase>,
    pub students: Vec<FleetVm>,
    /// Older bases kept until no student is backed by them any more.
    pub retired: Vec<ClassBase>,
    /// Class VMs outside the three tiers, e.g. a base VM whose conversion failed.
    pub leftovers: Vec<FleetVm>,
    pub generation: u32,
    /// Job that put the class into its current transient state.
    #[serde(default)]
    pub active_job: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ClassFleet {
    pub fn from_request(request: &ClassRequest, estimate: PlacementEstimate) -> Self {
        Self {
            class_id: request.class_id.clone(),
            source: request.source.clone(),
            disk_mode: request.disk_mode,
            name_prefix: request.prefix(),
            estimate,
            storage: request.storage.clone(),
            cloud_init: request.cloud_init.clone(),
            start_after_create: request.start_after_create,
            state: ClassState::Provisioning,
            teacher: None,
            base: None,
            students: Vec::new(),
            retired: Vec::new(),
            leftovers: Vec::new(),
            generation: 0,
            active_job: None,
            updated_at: Utc::now(),
        }
    }

    /// Enters a transient state on behalf of `job_id`.
    pub fn claim(&mut self, state: ClassState, job_id: &str) {
        self.state = state;
        self.active_job = Some(job_id.to_string());
    }

    /// Back to `Ready`; the owning job gives up its claim.
    pub fn mark_ready(&mut self) {
        self.state = ClassState::Ready;
        self.active_job = None;
    }

    pub fn is_claimed_by(&self, job_id: &str) -> bool {
        self.active_job.as_deref() == Some(job_id)
    }

    pub fn teacher_name(&self) -> String {
        format!("{}-teacher", self.name_prefix)
    }

    pub fn base_name(&self, generation: u32) -> String {
        if generation <= 1 {
            format!("{}-base", self.name_prefix)
        } else {
            format!("{}-base-v{}", self.name_prefix, generation)
        }
    }

    pub fn student_name(&self, index: usize) -> String {
        format!("{}-student-{}", self.name_prefix, index)
    }

    /// Label of the base image file for a generation.
    pub fn image_label(&self, generation: u32) -> String {
        format!("{}-v{}", self.name_prefix, generation)
    }

    /// Teacher or student with this id.
    pub fn find(&self, vmid: u32) -> Option<&FleetVm> {
        self.teacher
            .iter()
            .chain(self.students.iter())
            .find(|vm| vm.vmid == vmid)
    }

    pub fn replace_vm(&mut self, old_vmid: u32, vm: FleetVm) {
        if self.teacher.as_ref().is_some_and(|t| t.vmid == old_vmid) {
            self.teacher = Some(vm);
        } else if let Some(slot) = self.students.iter_mut().find(|s| s.vmid == old_vmid) {
            *slot = vm;
        }
    }

    /// VMs that are not templates: teacher, students and leftovers.
    pub fn regular_vms(&self) -> Vec<FleetVm> {
        self.teacher
            .iter()
            .chain(self.students.iter())
            .chain(self.leftovers.iter())
            .cloned()
            .collect()
    }

    /// Template VMs in removal order: retired generations, then the current base.
    pub fn template_vms(&self) -> Vec<FleetVm> {
        self.retired
            .iter()
            .chain(self.base.iter())
            .flat_map(ClassBase::template_vms)
            .collect()
    }

    pub fn vm_count(&self) -> usize {
        self.regular_vms().len() + self.template_vms().len()
    }

    pub fn role_of(&self, vmid: u32) -> Option<VmRole> {
        self.find(vmid).map(|vm| vm.role)
    }
}
