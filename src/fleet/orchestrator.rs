use futures_util::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::class::{BaseTier, ClassBase, ClassFleet, ClassRequest, ClassState, Mutation};
use super::store::FleetStore;
use super::{maintain, provision, teardown};
use crate::cluster::VmidAllocator;
use crate::config::{FleetSettings, Settings};
use crate::core::{
    start_in_batches, CloneExecutor, CloneOutcome, ClonePolicy, CloneRequest, CloudInit,
    DiskImageTool, DiskLayout, FleetVm, OverlayDiskBuilder, OverlayRequest, VmRole,
};
use crate::errors::{FleetError, FleetResult, HypervisorError};
use crate::hypervisor::{HypervisorApi, NodeSnapshot, VmRef};
use crate::monitoring::{JobKind, JobProgress, ProgressTracker, ProgressUpdate};
use crate::scheduler::PlacementEstimate;

/// Shared by the orchestrator front and every job it spawns.
pub(crate) struct FleetContext {
    pub(crate) executor: CloneExecutor,
    /// Longer lock patience for replication and conversion.
    pub(crate) template_executor: CloneExecutor,
    pub(crate) overlays: OverlayDiskBuilder,
    pub(crate) progress: Arc<ProgressTracker>,
    pub(crate) store: Arc<dyn FleetStore>,
    pub(crate) settings: FleetSettings,
    pub(crate) default_estimate: PlacementEstimate,
    transitions: Mutex<()>,
}

// Cloud-init drives go to node-local storage.
const CLOUD_INIT_STORAGE: &str = "local-lvm";

/// Where a student disk comes from.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StudentSource {
    Linked(VmRef),
    Full(VmRef),
    Overlay(String),
}

/// Picks the student source for `node` from the class base: the node's
/// template replica, a full copy of the primary where no replica exists, or
/// the source template itself when the class has no base.
pub(crate) fn student_source(fleet: &ClassFleet, node: &str) -> StudentSource {
    match fleet.base.as_ref() {
        Some(base) => match (&base.tier, base.template_on(node)) {
            (BaseTier::Image { path }, _) => StudentSource::Overlay(path.clone()),
            (BaseTier::Template { .. }, Some(template)) => StudentSource::Linked(template),
            (BaseTier::Template { primary, .. }, None) => StudentSource::Full(primary.vm_ref()),
        },
        None if fleet.source.node == node => StudentSource::Linked(fleet.source.clone()),
        None => StudentSource::Full(fleet.source.clone()),
    }
}

/// Everything needed to create one student VM, owned so it can move into a
/// pool task.
#[derive(Debug, Clone)]
pub(crate) struct StudentSpec {
    pub vmid: u32,
    pub node: String,
    pub name: String,
    pub source: StudentSource,
    pub storage: Option<String>,
    pub cloud_init: Option<CloudInit>,
    pub estimate: PlacementEstimate,
}

impl StudentSpec {
    pub(crate) fn new(
        fleet: &ClassFleet,
        vmid: u32,
        node: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let node = node.into();
        Self {
            vmid,
            source: student_source(fleet, &node),
            node,
            name: name.into(),
            storage: fleet.storage.clone(),
            cloud_init: fleet.cloud_init.clone(),
            estimate: fleet.estimate,
        }
    }
}

/// Runs `jobs` with at most `limit` in flight and collects their results in
/// completion order. Jobs are collected up front so the stream holds no closures.
pub(crate) async fn run_pool<T, Fut>(limit: usize, jobs: Vec<Fut>) -> Vec<T>
where
    Fut: Future<Output = T>,
{
    stream::iter(jobs).buffer_unordered(limit.max(1)).collect().await
}

fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

/// Result of turning a fresh full clone into a base template.
pub(crate) enum BaseBuild {
    Ready(ClassBase),
    /// The clone exists but could not be converted.
    Unconverted { vm: FleetVm, error: String },
}

impl FleetContext {
    pub(crate) fn baseline(&self) -> Option<String> {
        self.settings
            .baseline_snapshots
            .then(|| self.settings.baseline_snapshot_name.clone())
    }

    /// Creates one student VM. Cloud-init and baseline snapshot problems are
    /// reported in the outcome message but do not fail it.
    pub(crate) async fn build_student(&self, spec: &StudentSpec) -> CloneOutcome {
        let request = match &spec.source {
            StudentSource::Overlay(base_image) => {
                let request = OverlayRequest {
                    vmid: spec.vmid,
                    node: spec.node.clone(),
                    name: spec.name.clone(),
                    base_image: base_image.clone(),
                    memory_mb: spec.estimate.memory_mb,
                    cores: spec.estimate.cores,
                    bridge: self.settings.default_bridge.clone(),
                    cloud_init: spec.cloud_init.clone(),
                    layout: DiskLayout::Overlay,
                };
                return self.overlays.build(&request).await;
            }
            StudentSource::Linked(template) => {
                CloneRequest::linked(template.clone(), spec.vmid, spec.name.as_str())
            }
            StudentSource::Full(source) => {
                let node = spec.node.as_str();
                CloneRequest::full(source.clone(), spec.vmid, node, spec.name.as_str())
                    .with_storage(spec.storage.clone())
            }
        };

        // With cloud-init the baseline is taken after the drive is attached.
        let request = match spec.cloud_init {
            Some(_) => request,
            None => request.with_baseline(self.baseline()),
        };
        let mut outcome = self.executor.clone_vm(&request).await;
        let Some(cloud_init) = spec.cloud_init.as_ref().filter(|_| outcome.success) else {
            return outcome;
        };

        let vm = VmRef::new(spec.vmid, outcome.node.clone());
        if let Err(e) = self
            .executor
            .update_config(&vm, &cloud_init.params(CLOUD_INIT_STORAGE))
            .await
        {
            warn!(vm = %vm, error = e.to_string(), "Cloud-init settings not applied");
            outcome.message.push_str(&format!(" (cloud-init not applied: {})", e));
        }
        if let Some(snapshot) = self.baseline() {
            if let Err(e) = self.executor.snapshot(&vm, &snapshot).await {
                warn!(vm = %vm, error = e.to_string(), "Baseline snapshot failed");
                outcome.message.push_str(&format!(" (baseline snapshot failed: {})", e));
            }
        }
        outcome
    }

    pub(crate) async fn list_nodes(&self) -> FleetResult<Vec<NodeSnapshot>> {
        Ok(self.executor.list_nodes().await?)
    }

    pub(crate) async fn allocator(&self) -> FleetResult<VmidAllocator> {
        Ok(self.executor.allocator().await?)
    }

    pub(crate) async fn load(&self, class_id: &str) -> FleetResult<ClassFleet> {
        self.store
            .load(class_id)
            .await?
            .ok_or_else(|| FleetError::ClassNotFound {
                class_id: class_id.to_string(),
            })
    }

    pub(crate) async fn save_class(&self, fleet: &mut ClassFleet) -> FleetResult<()> {
        fleet.updated_at = chrono::Utc::now();
        self.store.save(fleet).await?;
        Ok(())
    }

    /// Deletes a VM the class derived. The class source template is refused.
    pub(crate) async fn delete_derived(
        &self,
        fleet: &ClassFleet,
        vm: &VmRef,
    ) -> Result<(), HypervisorError> {
        if vm.vmid == fleet.source.vmid {
            error!(
                vm = %vm,
                class_id = fleet.class_id.as_str(),
                "Refusing to delete the source template"
            );
            return Err(HypervisorError::Api {
                status: 403,
                message: format!(
                    "VM {} is the source template of class {}",
                    vm.vmid, fleet.class_id
                ),
            });
        }
        self.executor.delete_vm(vm).await
    }

    /// Full clone of `from` on `node`, converted to a template.
    pub(crate) async fn build_base_template(
        &self,
        job_id: &str,
        fleet: &ClassFleet,
        from: &VmRef,
        node: &str,
        generation: u32,
        allocator: &mut VmidAllocator,
    ) -> FleetResult<BaseBuild> {
        let name = fleet.base_name(generation);
        let vmid = allocator.allocate();
        self.progress.update(
            job_id,
            ProgressUpdate::new()
                .current_item(name.as_str())
                .message(format!("Creating base template {}", name)),
        );

        let request = CloneRequest::full(from.clone(), vmid, node, name.as_str())
            .with_storage(fleet.storage.clone());
        let outcome = self.template_executor.clone_vm(&request).await;
        let Some(vm) = outcome.fleet_vm(VmRole::ClassBase) else {
            return Err(FleetError::CloneFailed {
                name,
                message: outcome.message,
            });
        };

        match self.template_executor.convert_to_template(&vm.vm_ref()).await {
            Ok(()) => Ok(BaseBuild::Ready(ClassBase::template(generation, vm))),
            Err(e) => Ok(BaseBuild::Unconverted {
                vm,
                error: e.to_string(),
            }),
        }
    }

    /// Copies the base template to every other online node. Failed replicas
    /// are cleaned up and reported; students are only placed where a replica exists.
    pub(crate) async fn replicate(
        &self,
        job_id: &str,
        fleet: &ClassFleet,
        base: &mut ClassBase,
        nodes: &[NodeSnapshot],
        allocator: &mut VmidAllocator,
    ) -> Vec<String> {
        let Some(primary) = base.primary().cloned() else {
            return Vec::new();
        };
        let targets: Vec<&NodeSnapshot> = nodes
            .iter()
            .filter(|n| n.online && n.node != primary.node)
            .collect();
        let settle = Duration::from_secs(self.settings.replication_settle_secs);
        let mut errors = Vec::new();

        for (index, node) in targets.iter().enumerate() {
            if index > 0 && !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }
            let name = format!("{}-{}", primary.name, node.node);
            self.progress.update(
                job_id,
                ProgressUpdate::new()
                    .current_item(name.as_str())
                    .message(format!("Replicating base template to {}", node.node)),
            );

            let vmid = allocator.allocate();
            let request = CloneRequest::full(primary.vm_ref(), vmid, &node.node, name.as_str())
                .with_storage(fleet.storage.clone());
            let outcome = self.template_executor.clone_vm(&request).await;
            let Some(replica) = outcome.fleet_vm(VmRole::ClassBase) else {
                warn!(
                    node = node.node.as_str(),
                    error = outcome.message.as_str(),
                    "Replica clone failed"
                );
                errors.push(format!("{}: {}", name, outcome.message));
                continue;
            };

            if let Err(e) = self.template_executor.convert_to_template(&replica.vm_ref()).await {
                warn!(
                    node = node.node.as_str(),
                    error = e.to_string(),
                    "Replica conversion failed"
                );
                errors.push(format!("{}: {}", name, e));
                if let Err(cleanup) = self.delete_derived(fleet, &replica.vm_ref()).await {
                    error!(
                        vmid = replica.vmid,
                        error = cleanup.to_string(),
                        "Failed to remove unconverted replica"
                    );
                }
                continue;
            }
            info!(vmid = replica.vmid, node = node.node.as_str(), "Base template replicated");
            base.add_replica(replica);
        }
        errors
    }

    /// Deletes every retired base generation. Callers make sure no student is
    /// backed by them any more. Bases that fail to go away stay retired.
    pub(crate) async fn release_retired(&self, fleet: &mut ClassFleet) {
        let retired = std::mem::take(&mut fleet.retired);
        for base in retired {
            let mut remaining = Vec::new();
            for vm in base.template_vms() {
                if let Err(e) = self.delete_derived(fleet, &vm.vm_ref()).await {
                    warn!(
                        vmid = vm.vmid,
                        error = e.to_string(),
                        "Retired base template not deleted"
                    );
                    remaining.push(vm);
                }
            }
            if let Some(path) = base.image_path() {
                if let Err(e) = self.overlays.disks().remove(path).await {
                    warn!(path, error = e.to_string(), "Retired base image not removed");
                    fleet.retired.push(base.clone());
                    continue;
                }
            }
            if !remaining.is_empty() {
                fleet.retired.push(base);
            } else {
                info!(
                    generation = base.generation,
                    class_id = fleet.class_id.as_str(),
                    "Retired base released"
                );
            }
        }
    }

    pub(crate) async fn start_vms(&self, vms: &[VmRef]) -> usize {
        let failures = start_in_batches(
            &self.executor,
            vms,
            self.settings.start_batch_size,
            Duration::from_secs(self.settings.start_batch_delay_secs),
        )
        .await;
        failures.len()
    }

    /// Brings a class out of the transient state `job_id` put it in, whatever
    /// way the job ended. A class claimed by another job is left alone.
    async fn settle_state(&self, class_id: &str, job_id: &str) {
        let _guard = self.transitions.lock().await;
        match self.store.load(class_id).await {
            Ok(Some(mut fleet)) if fleet.is_claimed_by(job_id) => {
                let result = if fleet.vm_count() == 0 {
                    self.store.remove(class_id).await.map(|_| ())
                } else {
                    fleet.mark_ready();
                    self.store.save(&fleet).await
                };
                if let Err(e) = result {
                    error!(class_id, error = e.to_string(), "Failed to settle class state");
                }
            }
            Ok(_) => {}
            Err(e) => error!(class_id, error = e.to_string(), "Failed to load class after job"),
        }
    }
}

/// Entry point for the surrounding application. Every operation validates the
/// class state, registers a job and returns its id right away; the work runs on
/// a background task and reports through [`ProgressTracker`].
#[derive(Clone)]
pub struct FleetOrchestrator {
    ctx: Arc<FleetContext>,
}

impl FleetOrchestrator {
    pub fn new(
        api: Arc<dyn HypervisorApi>,
        disks: Arc<dyn DiskImageTool>,
        store: Arc<dyn FleetStore>,
        progress: Arc<ProgressTracker>,
        settings: &Settings,
    ) -> Self {
        let executor = CloneExecutor::new(api, ClonePolicy::from(&settings.clone));
        let template_executor = executor.with_policy(ClonePolicy::from(&settings.template_clone));
        let overlays = OverlayDiskBuilder::new(executor.clone(), disks, settings.overlay.clone());

        Self {
            ctx: Arc::new(FleetContext {
                executor,
                template_executor,
                overlays,
                progress,
                store,
                settings: settings.fleet.clone(),
                default_estimate: PlacementEstimate::from(&settings.placement),
                transitions: Mutex::new(()),
            }),
        }
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.ctx.progress
    }

    /// Current node telemetry, unranked.
    pub async fn list_nodes(&self) -> FleetResult<Vec<NodeSnapshot>> {
        self.ctx.list_nodes().await
    }

    pub async fn class(&self, class_id: &str) -> FleetResult<Option<ClassFleet>> {
        Ok(self.ctx.store.load(class_id).await?)
    }

    pub async fn list_classes(&self) -> FleetResult<Vec<ClassFleet>> {
        Ok(self.ctx.store.list().await?)
    }

    pub fn get_job_progress(&self, job_id: &str) -> Option<JobProgress> {
        self.ctx.progress.get(job_id)
    }

    pub async fn start_fleet_job(&self, request: ClassRequest) -> FleetResult<String> {
        request.validate()?;
        let job_id = new_job_id();
        {
            let _guard = self.ctx.transitions.lock().await;
            if let Some(existing) = self.ctx.store.load(&request.class_id).await? {
                if !existing.state.can_transition_to(&ClassState::Provisioning) {
                    return Err(FleetError::InvalidState {
                        class_id: request.class_id.clone(),
                        state: existing.state.to_string(),
                        requested: "provision".to_string(),
                    });
                }
            }
            let mut fleet = ClassFleet::from_request(&request, self.ctx.default_estimate);
            fleet.claim(ClassState::Provisioning, &job_id);
            self.ctx.store.save(&fleet).await?;
        }

        self.register(&job_id, JobKind::Provision, &request.class_id);
        let class_id = request.class_id.clone();
        let job = provision::provision(Arc::clone(&self.ctx), job_id.clone(), request);
        self.spawn_job(&job_id, &class_id, job);
        Ok(job_id)
    }

    pub async fn save_teacher_edits_to_template(&self, class_id: &str) -> FleetResult<String> {
        let job_id = new_job_id();
        self.begin_mutation(&job_id, class_id, Mutation::Save, None).await?;
        self.register(&job_id, JobKind::Save, class_id);
        let job = maintain::save(Arc::clone(&self.ctx), job_id.clone(), class_id.to_string());
        self.spawn_job(&job_id, class_id, job);
        Ok(job_id)
    }

    pub async fn push_template_to_students(&self, class_id: &str) -> FleetResult<String> {
        let job_id = new_job_id();
        self.begin_mutation(&job_id, class_id, Mutation::Push, None).await?;
        self.register(&job_id, JobKind::Push, class_id);
        let job = maintain::push(Arc::clone(&self.ctx), job_id.clone(), class_id.to_string());
        self.spawn_job(&job_id, class_id, job);
        Ok(job_id)
    }

    pub async fn reimage_vm(&self, class_id: &str, vmid: u32) -> FleetResult<String> {
        let job_id = new_job_id();
        self.begin_mutation(&job_id, class_id, Mutation::Reimage, Some(vmid)).await?;
        self.register(&job_id, JobKind::Reimage, class_id);
        let ctx = Arc::clone(&self.ctx);
        let job = maintain::reimage(ctx, job_id.clone(), class_id.to_string(), vmid);
        self.spawn_job(&job_id, class_id, job);
        Ok(job_id)
    }

    pub async fn revert_vm_to_baseline(&self, class_id: &str, vmid: u32) -> FleetResult<String> {
        let job_id = new_job_id();
        self.begin_mutation(&job_id, class_id, Mutation::Revert, Some(vmid)).await?;
        self.register(&job_id, JobKind::Revert, class_id);
        let ctx = Arc::clone(&self.ctx);
        let job = maintain::revert(ctx, job_id.clone(), class_id.to_string(), vmid);
        self.spawn_job(&job_id, class_id, job);
        Ok(job_id)
    }

    /// Deletes every VM of a class. Unknown classes yield a job that deletes nothing.
    pub async fn delete_class_fleet(
        &self,
        class_id: &str,
        force_skip_hypervisor: bool,
    ) -> FleetResult<String> {
        let job_id = new_job_id();
        {
            let _guard = self.ctx.transitions.lock().await;
            if let Some(mut fleet) = self.ctx.store.load(class_id).await? {
                if !fleet.state.can_transition_to(&ClassState::Deleting) {
                    return Err(FleetError::InvalidState {
                        class_id: class_id.to_string(),
                        state: fleet.state.to_string(),
                        requested: "delete".to_string(),
                    });
                }
                fleet.claim(ClassState::Deleting, &job_id);
                self.ctx.store.save(&fleet).await?;
            }
        }

        self.register(&job_id, JobKind::Delete, class_id);
        let job = teardown::delete_class(
            Arc::clone(&self.ctx),
            job_id.clone(),
            class_id.to_string(),
            force_skip_hypervisor,
        );
        self.spawn_job(&job_id, class_id, job);
        Ok(job_id)
    }

    async fn begin_mutation(
        &self,
        job_id: &str,
        class_id: &str,
        mutation: Mutation,
        vmid: Option<u32>,
    ) -> FleetResult<()> {
        let _guard = self.ctx.transitions.lock().await;
        let mut fleet = self.ctx.load(class_id).await?;
        if let Some(vmid) = vmid {
            if fleet.find(vmid).is_none() {
                return Err(FleetError::VmNotInClass {
                    class_id: class_id.to_string(),
                    vmid,
                });
            }
        }
        let next = ClassState::Mutating(mutation);
        if !fleet.state.can_transition_to(&next) {
            return Err(FleetError::InvalidState {
                class_id: class_id.to_string(),
                state: fleet.state.to_string(),
                requested: format!("{:?}", mutation).to_lowercase(),
            });
        }
        fleet.claim(next, job_id);
        self.ctx.store.save(&fleet).await?;
        Ok(())
    }

    fn register(&self, job_id: &str, kind: JobKind, class_id: &str) {
        self.ctx.progress.enqueue(job_id, kind, class_id);
        info!(job_id, class_id, ?kind, "Job accepted");
    }

    fn spawn_job<Fut>(&self, job_id: &str, class_id: &str, job: Fut)
    where
        Fut: Future<Output = FleetResult<String>> + Send + 'static,
    {
        let ctx = Arc::clone(&self.ctx);
        let job_id = job_id.to_string();
        let class_id = class_id.to_string();

        tokio::spawn(async move {
            // The inner task turns a panic into a JoinError instead of a silent stop.
            let outcome = tokio::spawn(job).await;
            ctx.settle_state(&class_id, &job_id).await;

            match outcome {
                Ok(Ok(message)) => {
                    info!(
                        job_id = job_id.as_str(),
                        class_id = class_id.as_str(),
                        message = message.as_str(),
                        "Job completed"
                    );
                    ctx.progress.finish(&job_id, message);
                }
                Ok(Err(e)) => {
                    error!(
                        job_id = job_id.as_str(),
                        class_id = class_id.as_str(),
                        error = e.to_string(),
                        "Job failed"
                    );
                    ctx.progress.fail(&job_id, e.to_string());
                }
                Err(join_error) => {
                    error!(
                        job_id = job_id.as_str(),
                        class_id = class_id.as_str(),
                        error = join_error.to_string(),
                        "Job worker aborted"
                    );
                    ctx.progress.fail(&job_id, format!("worker aborted: {}", join_error));
                }
            }
        });
    }
}
