use std::sync::Arc;
use tracing::{error, info, warn};

use super::class::{ClassBase, ClassFleet, ClassRequest, DiskMode};
use super::orchestrator::{run_pool, BaseBuild, FleetContext, StudentSpec};
use crate::cluster::VmidAllocator;
use crate::core::{CloneRequest, FleetVm, VmRole};
use crate::errors::{FleetError, FleetResult, PlacementError};
use crate::hypervisor::{NodeSnapshot, VmRef};
use crate::monitoring::ProgressUpdate;
use crate::scheduler::{place, PlacementEstimate};

/// Builds a class: teacher, base tier, then students in parallel.
/// Progress counts students only; teacher and base problems abort the job.
pub(crate) async fn provision(
    ctx: Arc<FleetContext>,
    job_id: String,
    request: ClassRequest,
) -> FleetResult<String> {
    let count = request.student_count;
    ctx.progress.start(&job_id, count);
    let mut fleet = ctx.load(&request.class_id).await?;

    let nodes = ctx.list_nodes().await?;
    let source_config = ctx.executor.vm_config(&request.source).await?;
    let estimate = request
        .estimate
        .unwrap_or_else(|| PlacementEstimate::from_config(&source_config, ctx.default_estimate));
    fleet.estimate = estimate;
    let mut allocator = ctx.allocator().await?;

    let anchor = place(&nodes, 1, &estimate)
        .into_iter()
        .next()
        .ok_or(PlacementError::NoNodesOnline)?;
    info!(
        class_id = fleet.class_id.as_str(),
        anchor = anchor.as_str(),
        students = count,
        memory_mb = estimate.memory_mb,
        cores = estimate.cores,
        "Provisioning class"
    );

    let built = build_tiers(&ctx, &job_id, &mut fleet, &request, &nodes, &anchor, &mut allocator);
    if let Err(e) = built.await {
        abort(&ctx, &fleet).await;
        return Err(e);
    }
    ctx.save_class(&mut fleet).await?;

    let eligible: Vec<NodeSnapshot> = nodes
        .iter()
        .filter(|n| n.online)
        .filter(|n| match fleet.base.as_ref() {
            Some(base) if base.primary().is_some() => base.template_on(&n.node).is_some(),
            _ => true,
        })
        .cloned()
        .collect();
    let targets = place(&eligible, count, &estimate);
    if targets.len() < count {
        return Err(PlacementError::NoNodesOnline.into());
    }
    let ids = allocator.reserve(count);

    let jobs: Vec<_> = targets
        .into_iter()
        .zip(ids)
        .enumerate()
        .map(|(index, (node, vmid))| {
            let ctx = Arc::clone(&ctx);
            let job_id = job_id.clone();
            let spec = StudentSpec::new(&fleet, vmid, node, fleet.student_name(index + 1));
            async move {
                ctx.progress.set_current(&job_id, spec.name.as_str());
                let outcome = ctx.build_student(&spec).await;
                match outcome.fleet_vm(VmRole::Student) {
                    Some(vm) => {
                        ctx.progress.complete_step(&job_id, &vm.name);
                        Some((index, vm))
                    }
                    None => {
                        ctx.progress.fail_step(&job_id, &spec.name, &outcome.message);
                        None
                    }
                }
            }
        })
        .collect();
    let mut built: Vec<(usize, FleetVm)> = run_pool(ctx.settings.concurrency, jobs)
        .await
        .into_iter()
        .flatten()
        .collect();
    built.sort_by_key(|(index, _)| *index);

    let created = built.len();
    fleet.students = built.into_iter().map(|(_, vm)| vm).collect();
    fleet.mark_ready();
    ctx.save_class(&mut fleet).await?;

    let mut message = format!("{}/{} students provisioned", created, count);
    if fleet.start_after_create {
        let vms: Vec<VmRef> = fleet
            .teacher
            .iter()
            .chain(fleet.students.iter())
            .map(FleetVm::vm_ref)
            .collect();
        let failed = ctx.start_vms(&vms).await;
        if failed > 0 {
            message.push_str(&format!(", {} failed to start", failed));
        }
    }
    Ok(message)
}

async fn build_tiers(
    ctx: &FleetContext,
    job_id: &str,
    fleet: &mut ClassFleet,
    request: &ClassRequest,
    nodes: &[NodeSnapshot],
    anchor: &str,
    allocator: &mut VmidAllocator,
) -> FleetResult<()> {
    if request.create_teacher {
        let name = fleet.teacher_name();
        ctx.progress.update(
            job_id,
            ProgressUpdate::new()
                .current_item(name.as_str())
                .message("Creating teacher VM"),
        );
        let vmid = allocator.allocate();
        let clone = CloneRequest::full(fleet.source.clone(), vmid, anchor, name.as_str())
            .with_storage(fleet.storage.clone())
            .with_baseline(ctx.baseline());
        let outcome = ctx.executor.clone_vm(&clone).await;
        let teacher = outcome
            .fleet_vm(VmRole::Teacher)
            .ok_or_else(|| FleetError::CloneFailed {
                name,
                message: outcome.message.clone(),
            })?;
        fleet.teacher = Some(teacher);
    }

    match fleet.disk_mode {
        DiskMode::LinkedClone if request.create_base => {
            fleet.generation = 1;
            let source = fleet.source.clone();
            match ctx.build_base_template(job_id, fleet, &source, anchor, 1, allocator).await? {
                BaseBuild::Ready(mut base) => {
                    let problems = ctx.replicate(job_id, fleet, &mut base, nodes, allocator).await;
                    for problem in problems {
                        ctx.progress.update(job_id, ProgressUpdate::new().error(problem));
                    }
                    fleet.base = Some(base);
                }
                BaseBuild::Unconverted { vm, error } => {
                    warn!(
                        vmid = vm.vmid,
                        error = error.as_str(),
                        "Base template conversion failed, students will clone the source template"
                    );
                    ctx.progress.update(
                        job_id,
                        ProgressUpdate::new()
                            .error(format!("{}: {}", vm.name, error))
                            .message("Base template unavailable, using the source template"),
                    );
                    fleet.leftovers.push(vm);
                }
            }
        }
        DiskMode::LinkedClone => {}
        DiskMode::Overlay => {
            fleet.generation = 1;
            let path = ctx.overlays.base_image_path(&fleet.image_label(1));
            ctx.progress.update(
                job_id,
                ProgressUpdate::new()
                    .current_item(path.as_str())
                    .message("Exporting base image"),
            );
            ctx.overlays.ensure_base_image(&fleet.source, &path).await?;
            fleet.base = Some(ClassBase::image(1, path));
        }
    }
    Ok(())
}

/// Best-effort removal of what a failed provision created before students.
async fn abort(ctx: &FleetContext, fleet: &ClassFleet) {
    warn!(class_id = fleet.class_id.as_str(), "Provisioning aborted, removing created VMs");
    for vm in fleet.regular_vms().into_iter().chain(fleet.template_vms()) {
        if let Err(e) = ctx.delete_derived(fleet, &vm.vm_ref()).await {
            error!(
                vmid = vm.vmid,
                error = e.to_string(),
                "Failed to remove VM after aborted provisioning"
            );
        }
    }
    if let Some(path) = fleet.base.as_ref().and_then(ClassBase::image_path) {
        if let Err(e) = ctx.overlays.disks().remove(path).await {
            error!(
                path,
                error = e.to_string(),
                "Failed to remove base image after aborted provisioning"
            );
        }
    }
    if let Err(e) = ctx.store.remove(&fleet.class_id).await {
        error!(
            class_id = fleet.class_id.as_str(),
            error = e.to_string(),
            "Failed to drop class record"
        );
    }
}
