use std::sync::Arc;
use tracing::{info, warn};

use super::class::{BaseTier, ClassBase, ClassFleet, DiskMode};
use super::orchestrator::{run_pool, BaseBuild, FleetContext, StudentSource, StudentSpec};
use crate::core::{CloneRequest, DiskLayout, FleetVm, OverlayRequest, VmRole};
use crate::errors::{FleetError, FleetResult, HypervisorError};
use crate::hypervisor::VmRef;
use crate::monitoring::ProgressUpdate;

fn not_found(vm: &FleetVm) -> FleetError {
    HypervisorError::NotFound(format!("VM {} ({}) is not in the cluster", vm.vmid, vm.name)).into()
}

/// Captures the teacher as a new base generation. The previous base is retired
/// and stays until no student depends on it.
pub(crate) async fn save(
    ctx: Arc<FleetContext>,
    job_id: String,
    class_id: String,
) -> FleetResult<String> {
    let mut fleet = ctx.load(&class_id).await?;
    let teacher = fleet
        .teacher
        .clone()
        .ok_or_else(|| FleetError::Validation(format!("class {} has no teacher VM", class_id)))?;
    ctx.progress.start(&job_id, 1);

    let view = ctx.executor.cluster_view().await?;
    let teacher_ref = view.locate(teacher.vmid).ok_or_else(|| not_found(&teacher))?;
    let was_running = view.is_running(teacher.vmid);
    if was_running {
        ctx.progress.update(&job_id, ProgressUpdate::new().message("Stopping teacher VM"));
        ctx.executor.stop_vm(&teacher_ref).await?;
    }

    let generation = fleet.generation + 1;
    let captured = capture(&ctx, &job_id, &fleet, &teacher_ref, generation).await;
    if was_running {
        if let Err(e) = ctx.executor.start_vm(&teacher_ref).await {
            warn!(vm = %teacher_ref, error = e.to_string(), "Teacher VM did not restart");
        }
    }
    let base = captured?;

    let item = base
        .primary()
        .map(|vm| vm.name.clone())
        .or_else(|| base.image_path().map(str::to_string))
        .unwrap_or_default();
    if let Some(previous) = fleet.base.replace(base) {
        fleet.retired.push(previous);
    }
    fleet.generation = generation;
    fleet.teacher = Some(FleetVm {
        node: teacher_ref.node.clone(),
        ..teacher
    });
    if fleet.students.is_empty() {
        ctx.release_retired(&mut fleet).await;
    }
    fleet.mark_ready();
    ctx.save_class(&mut fleet).await?;

    ctx.progress.complete_step(&job_id, &item);
    info!(class_id = class_id.as_str(), generation, "Teacher saved to class base");
    Ok(format!("Teacher saved as base generation {}", generation))
}

async fn capture(
    ctx: &FleetContext,
    job_id: &str,
    fleet: &ClassFleet,
    teacher: &VmRef,
    generation: u32,
) -> FleetResult<ClassBase> {
    match fleet.disk_mode {
        DiskMode::LinkedClone => {
            let mut allocator = ctx.allocator().await?;
            let node = teacher.node.as_str();
            let build = ctx
                .build_base_template(job_id, fleet, teacher, node, generation, &mut allocator)
                .await?;
            match build {
                BaseBuild::Ready(mut base) => {
                    let nodes = ctx.list_nodes().await?;
                    let problems = ctx
                        .replicate(job_id, fleet, &mut base, &nodes, &mut allocator)
                        .await;
                    for problem in problems {
                        ctx.progress.update(job_id, ProgressUpdate::new().error(problem));
                    }
                    Ok(base)
                }
                BaseBuild::Unconverted { vm, error } => {
                    if let Err(e) = ctx.delete_derived(fleet, &vm.vm_ref()).await {
                        warn!(
                            vmid = vm.vmid,
                            error = e.to_string(),
                            "Unconverted base VM not removed"
                        );
                    }
                    Err(FleetError::CloneFailed {
                        name: vm.name,
                        message: format!("conversion to template failed: {}", error),
                    })
                }
            }
        }
        DiskMode::Overlay => {
            let path = ctx.overlays.base_image_path(&fleet.image_label(generation));
            ctx.progress.update(
                job_id,
                ProgressUpdate::new()
                    .current_item(path.as_str())
                    .message("Exporting teacher disk"),
            );
            // A leftover from an interrupted save would be reused as-is.
            ctx.overlays.disks().remove(&path).await?;
            ctx.overlays.ensure_base_image(teacher, &path).await?;
            Ok(ClassBase::image(generation, path))
        }
    }
}

/// Why a student rebuild stopped.
#[derive(Debug)]
enum RebuildError {
    /// The old VM could not be stopped or removed; it is still in place.
    Remove(String),
    Create(String),
}

impl RebuildError {
    fn into_message(self) -> String {
        match self {
            RebuildError::Remove(message) => format!("removing old VM failed: {}", message),
            RebuildError::Create(message) => message,
        }
    }
}

/// Rebuilds one student from the current base, keeping its id. Returns the
/// student as recorded afterwards.
async fn rebuild_student(
    ctx: &FleetContext,
    fleet: &ClassFleet,
    student: &FleetVm,
    located: Option<VmRef>,
    running: bool,
) -> Result<FleetVm, RebuildError> {
    let node = located
        .as_ref()
        .map_or_else(|| student.node.clone(), |vm| vm.node.clone());
    let spec = StudentSpec::new(fleet, student.vmid, node.as_str(), student.name.as_str());

    if let (StudentSource::Overlay(base_image), Some(vm)) = (&spec.source, &located) {
        ctx.overlays
            .replace_overlay(vm, base_image)
            .await
            .map_err(|e| RebuildError::Create(e.to_string()))?;
        return Ok(FleetVm { node, ..student.clone() });
    }

    if let Some(vm) = &located {
        if running {
            ctx.executor
                .stop_vm(vm)
                .await
                .map_err(|e| RebuildError::Remove(e.to_string()))?;
        }
        ctx.delete_derived(fleet, vm)
            .await
            .map_err(|e| RebuildError::Remove(e.to_string()))?;
    }
    let outcome = ctx.build_student(&spec).await;
    outcome
        .fleet_vm(VmRole::Student)
        .ok_or(RebuildError::Create(outcome.message))
}

/// Rebuilds every student from the current base. Retired bases are released
/// once all students moved over.
pub(crate) async fn push(
    ctx: Arc<FleetContext>,
    job_id: String,
    class_id: String,
) -> FleetResult<String> {
    let mut fleet = ctx.load(&class_id).await?;
    let generation = fleet
        .base
        .as_ref()
        .map(|base| base.generation)
        .ok_or_else(|| FleetError::Validation(format!("class {} has no base to push", class_id)))?;
    let total = fleet.students.len();
    ctx.progress.start(&job_id, total);

    let view = ctx.executor.cluster_view().await?;
    let snapshot = Arc::new(fleet.clone());
    let jobs: Vec<_> = fleet
        .students
        .iter()
        .cloned()
        .map(|student| {
            let ctx = Arc::clone(&ctx);
            let fleet = Arc::clone(&snapshot);
            let job_id = job_id.clone();
            let located = view.locate(student.vmid);
            let running = view.is_running(student.vmid);
            async move {
                ctx.progress.set_current(&job_id, student.name.as_str());
                match rebuild_student(&ctx, &fleet, &student, located, running).await {
                    Ok(rebuilt) => {
                        ctx.progress.complete_step(&job_id, &rebuilt.name);
                        Ok((student.vmid, rebuilt, running))
                    }
                    Err(e) => {
                        ctx.progress.fail_step(&job_id, &student.name, &e.into_message());
                        Err(student.vmid)
                    }
                }
            }
        })
        .collect();
    let results = run_pool(ctx.settings.concurrency, jobs).await;

    let mut updated = 0;
    let mut restart = Vec::new();
    for result in results {
        if let Ok((old_vmid, rebuilt, was_running)) = result {
            if was_running || fleet.start_after_create {
                restart.push(rebuilt.vm_ref());
            }
            fleet.replace_vm(old_vmid, rebuilt);
            updated += 1;
        }
    }

    if updated == total {
        ctx.release_retired(&mut fleet).await;
    } else if !fleet.retired.is_empty() {
        warn!(
            class_id = class_id.as_str(),
            failed = total - updated,
            "Students still on older bases, keeping retired bases"
        );
    }
    fleet.mark_ready();
    ctx.save_class(&mut fleet).await?;

    let mut message = format!(
        "{}/{} students updated to base generation {}",
        updated, total, generation
    );
    let failed_starts = ctx.start_vms(&restart).await;
    if failed_starts > 0 {
        message.push_str(&format!(", {} failed to start", failed_starts));
    }
    Ok(message)
}

/// Rebuilds a single teacher or student VM from the current base.
pub(crate) async fn reimage(
    ctx: Arc<FleetContext>,
    job_id: String,
    class_id: String,
    vmid: u32,
) -> FleetResult<String> {
    let mut fleet = ctx.load(&class_id).await?;
    let vm = fleet
        .find(vmid)
        .cloned()
        .ok_or_else(|| FleetError::VmNotInClass {
            class_id: class_id.clone(),
            vmid,
        })?;
    ctx.progress.start(&job_id, 1);
    ctx.progress.set_current(&job_id, vm.name.as_str());

    let view = ctx.executor.cluster_view().await?;
    let located = view.locate(vmid);
    let running = view.is_running(vmid);

    let result = match vm.role {
        VmRole::Teacher => reimage_teacher(&ctx, &fleet, &vm, located, running).await,
        _ => match rebuild_student(&ctx, &fleet, &vm, located, running).await {
            Ok(rebuilt) => Ok(rebuilt),
            Err(RebuildError::Create(message)) => {
                retry_with_new_id(&ctx, &fleet, &vm, message).await
            }
            Err(e) => Err(e.into_message()),
        },
    };

    match result {
        Ok(rebuilt) => {
            let rebuilt_ref = rebuilt.vm_ref();
            fleet.replace_vm(vmid, rebuilt.clone());
            fleet.mark_ready();
            ctx.save_class(&mut fleet).await?;
            if running || fleet.start_after_create {
                if let Err(e) = ctx.executor.start_vm(&rebuilt_ref).await {
                    warn!(vm = %rebuilt_ref, error = e.to_string(), "Reimaged VM did not start");
                }
            }
            ctx.progress.complete_step(&job_id, &rebuilt.name);
            Ok(format!("VM {} reimaged as {}", vm.name, rebuilt.vmid))
        }
        Err(message) => {
            ctx.progress.fail_step(&job_id, &vm.name, &message);
            Err(FleetError::CloneFailed {
                name: vm.name,
                message,
            })
        }
    }
}

/// The clone can fail because the old id is still held by a delete that has
/// not finished. The student then moves to a fresh id.
async fn retry_with_new_id(
    ctx: &FleetContext,
    fleet: &ClassFleet,
    student: &FleetVm,
    first_error: String,
) -> Result<FleetVm, String> {
    let view = ctx.executor.cluster_view().await.map_err(|e| e.to_string())?;
    if !view.contains(student.vmid) {
        return Err(first_error);
    }
    let mut allocator = ctx.allocator().await.map_err(|e| e.to_string())?;
    let vmid = allocator.allocate();
    warn!(
        old = student.vmid,
        new = vmid,
        error = first_error.as_str(),
        "VM id still taken, rebuilding under a new id"
    );

    let spec = StudentSpec::new(fleet, vmid, student.node.as_str(), student.name.as_str());
    let outcome = ctx.build_student(&spec).await;
    outcome.fleet_vm(VmRole::Student).ok_or(outcome.message)
}

async fn reimage_teacher(
    ctx: &FleetContext,
    fleet: &ClassFleet,
    teacher: &FleetVm,
    located: Option<VmRef>,
    running: bool,
) -> Result<FleetVm, String> {
    let node = located
        .as_ref()
        .map_or_else(|| teacher.node.clone(), |vm| vm.node.clone());
    if let Some(vm) = &located {
        if running {
            ctx.executor.stop_vm(vm).await.map_err(|e| e.to_string())?;
        }
        ctx.delete_derived(fleet, vm).await.map_err(|e| e.to_string())?;
    }

    let outcome = match fleet.base.as_ref().map(|base| &base.tier) {
        Some(BaseTier::Image { path }) => {
            let request = OverlayRequest {
                vmid: teacher.vmid,
                node: node.clone(),
                name: teacher.name.clone(),
                base_image: path.clone(),
                memory_mb: fleet.estimate.memory_mb,
                cores: fleet.estimate.cores,
                bridge: ctx.settings.default_bridge.clone(),
                cloud_init: fleet.cloud_init.clone(),
                layout: DiskLayout::Standalone,
            };
            ctx.overlays.build(&request).await
        }
        tier => {
            let source = match tier {
                Some(BaseTier::Template { primary, .. }) => primary.vm_ref(),
                _ => fleet.source.clone(),
            };
            let name = teacher.name.as_str();
            let request = CloneRequest::full(source, teacher.vmid, node.as_str(), name)
                .with_storage(fleet.storage.clone())
                .with_baseline(ctx.baseline());
            ctx.executor.clone_vm(&request).await
        }
    };
    outcome.fleet_vm(VmRole::Teacher).ok_or(outcome.message)
}

/// Rolls a VM back to its baseline. Overlay students get a fresh overlay
/// instead, which is the same state.
pub(crate) async fn revert(
    ctx: Arc<FleetContext>,
    job_id: String,
    class_id: String,
    vmid: u32,
) -> FleetResult<String> {
    let fleet = ctx.load(&class_id).await?;
    let vm = fleet
        .find(vmid)
        .cloned()
        .ok_or_else(|| FleetError::VmNotInClass {
            class_id: class_id.clone(),
            vmid,
        })?;
    ctx.progress.start(&job_id, 1);
    ctx.progress.set_current(&job_id, vm.name.as_str());

    let view = ctx.executor.cluster_view().await?;
    let located = view.locate(vmid).ok_or_else(|| not_found(&vm))?;
    let running = view.is_running(vmid);

    let overlay_base = fleet
        .base
        .as_ref()
        .and_then(ClassBase::image_path)
        .filter(|_| vm.role == VmRole::Student);
    let result: FleetResult<()> = match overlay_base {
        Some(base_image) => ctx.overlays.replace_overlay(&located, base_image).await,
        None => {
            let snapshot = ctx
                .baseline()
                .ok_or_else(|| FleetError::Config("baseline snapshots are disabled".to_string()))?;
            ctx.executor
                .rollback(&located, &snapshot)
                .await
                .map_err(FleetError::from)
        }
    };
    if let Err(e) = result {
        ctx.progress.fail_step(&job_id, &vm.name, &e.to_string());
        return Err(e);
    }

    if running {
        if let Err(e) = ctx.executor.start_vm(&located).await {
            warn!(vm = %located, error = e.to_string(), "Reverted VM did not restart");
        }
    }
    ctx.progress.complete_step(&job_id, &vm.name);
    Ok(format!("VM {} reverted to baseline", vm.name))
}
