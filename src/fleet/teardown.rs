use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use super::class::{BaseTier, ClassBase, ClassFleet};
use super::orchestrator::{run_pool, FleetContext};
use crate::core::FleetVm;
use crate::errors::FleetResult;
use crate::hypervisor::VmRef;
use crate::monitoring::ProgressUpdate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    Deleted,
    AlreadyGone,
    Failed,
}

async fn remove_vm(
    ctx: &FleetContext,
    job_id: &str,
    fleet: &ClassFleet,
    vm: &FleetVm,
    located: Option<VmRef>,
) -> Removal {
    let Some(target) = located else {
        ctx.progress.complete_step(job_id, &vm.name);
        return Removal::AlreadyGone;
    };
    ctx.progress.set_current(job_id, vm.name.as_str());
    match ctx.delete_derived(fleet, &target).await {
        Ok(()) => {
            ctx.progress.complete_step(job_id, &vm.name);
            Removal::Deleted
        }
        Err(e) => {
            ctx.progress.fail_step(job_id, &vm.name, &e.to_string());
            Removal::Failed
        }
    }
}

/// What is left of a base after a partial delete. A template base keeps its
/// surviving template VMs, with the first replica promoted when the primary is
/// gone. An image base survives while any student overlay may still use it.
fn surviving_base(base: ClassBase, kept: &HashSet<u32>, students_left: bool) -> Option<ClassBase> {
    match base.tier {
        BaseTier::Template { primary, replicas } => {
            let mut survivors: Vec<FleetVm> = replicas
                .into_iter()
                .filter(|vm| kept.contains(&vm.vmid))
                .collect();
            let primary = if kept.contains(&primary.vmid) {
                primary
            } else if survivors.is_empty() {
                return None;
            } else {
                survivors.remove(0)
            };
            Some(ClassBase {
                generation: base.generation,
                tier: BaseTier::Template {
                    primary,
                    replicas: survivors,
                },
            })
        }
        BaseTier::Image { path } => students_left.then(|| ClassBase::image(base.generation, path)),
    }
}

/// Removes every VM of a class: regular VMs first, in parallel, then templates
/// one by one with older generations and replicas ahead of their primary.
/// VMs that are already gone count as done. VMs that fail to delete stay
/// recorded so a second run can pick them up.
pub(crate) async fn delete_class(
    ctx: Arc<FleetContext>,
    job_id: String,
    class_id: String,
    force_skip_hypervisor: bool,
) -> FleetResult<String> {
    let Some(mut fleet) = ctx.store.load(&class_id).await? else {
        ctx.progress.start(&job_id, 0);
        return Ok("0 VMs deleted".to_string());
    };
    let total = fleet.vm_count();
    ctx.progress.start(&job_id, total);

    if force_skip_hypervisor {
        ctx.store.remove(&class_id).await?;
        warn!(
            class_id = class_id.as_str(),
            vms = total,
            "Class record dropped without touching the hypervisor"
        );
        return Ok(format!(
            "0 VMs deleted, record removed with {} VMs left on the hypervisor",
            total
        ));
    }

    let view = ctx.executor.cluster_view().await?;
    let snapshot = Arc::new(fleet.clone());

    let running: Vec<VmRef> = fleet
        .regular_vms()
        .iter()
        .filter(|vm| view.is_running(vm.vmid))
        .filter_map(|vm| view.locate(vm.vmid))
        .collect();
    let stops: Vec<_> = running
        .into_iter()
        .map(|vm| {
            let ctx = Arc::clone(&ctx);
            async move {
                if let Err(e) = ctx.executor.stop_vm(&vm).await {
                    warn!(vm = %vm, error = e.to_string(), "VM did not stop before deletion");
                }
            }
        })
        .collect();
    run_pool(ctx.settings.concurrency, stops).await;

    let deletions: Vec<_> = fleet
        .regular_vms()
        .into_iter()
        .map(|vm| {
            let ctx = Arc::clone(&ctx);
            let fleet = Arc::clone(&snapshot);
            let job_id = job_id.clone();
            let located = view.locate(vm.vmid);
            async move {
                let removal = remove_vm(&ctx, &job_id, &fleet, &vm, located).await;
                (vm.vmid, removal)
            }
        })
        .collect();
    let mut results = run_pool(ctx.settings.concurrency, deletions).await;

    // Linked children must be gone before their template.
    for vm in fleet.template_vms() {
        let removal = remove_vm(&ctx, &job_id, &snapshot, &vm, view.locate(vm.vmid)).await;
        results.push((vm.vmid, removal));
    }

    let deleted = results.iter().filter(|(_, r)| *r == Removal::Deleted).count();
    let kept: HashSet<u32> = results
        .iter()
        .filter(|(_, r)| *r == Removal::Failed)
        .map(|(vmid, _)| *vmid)
        .collect();

    // Surviving overlays still read from the base images.
    let students_left = fleet.students.iter().any(|vm| kept.contains(&vm.vmid));
    let images: Vec<&str> = fleet
        .retired
        .iter()
        .chain(fleet.base.iter())
        .filter_map(ClassBase::image_path)
        .collect();
    if students_left && !images.is_empty() {
        warn!(
            class_id = class_id.as_str(),
            images = images.len(),
            "Base images kept for surviving students"
        );
    } else if !students_left {
        for path in images {
            if let Err(e) = ctx.overlays.disks().remove(path).await {
                warn!(path, error = e.to_string(), "Base image not removed");
                ctx.progress
                    .update(&job_id, ProgressUpdate::new().error(format!("{}: {}", path, e)));
            }
        }
    }

    if kept.is_empty() {
        ctx.store.remove(&class_id).await?;
        info!(class_id = class_id.as_str(), deleted, "Class fleet deleted");
        return Ok(format!("{} VMs deleted", deleted));
    }

    fleet.teacher = fleet.teacher.filter(|vm| kept.contains(&vm.vmid));
    fleet.students.retain(|vm| kept.contains(&vm.vmid));
    fleet.leftovers.retain(|vm| kept.contains(&vm.vmid));
    fleet.base = fleet
        .base
        .take()
        .and_then(|base| surviving_base(base, &kept, students_left));
    fleet.retired = std::mem::take(&mut fleet.retired)
        .into_iter()
        .filter_map(|base| surviving_base(base, &kept, students_left))
        .collect();
    fleet.mark_ready();
    ctx.save_class(&mut fleet).await?;

    warn!(
        class_id = class_id.as_str(),
        deleted,
        remaining = kept.len(),
        "Class fleet partially deleted"
    );
    Ok(format!("{} VMs deleted, {} could not be deleted", deleted, kept.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::VmRole;

    #[test]
    fn surviving_replica_becomes_primary() {
        let primary = FleetVm::new(110, "pve1", "class-7-base-v2", VmRole::ClassBase);
        let mut base = ClassBase::template(2, primary);
        base.add_replica(FleetVm::new(111, "pve2", "class-7-base-v2-pve2", VmRole::ClassBase));

        let kept: HashSet<u32> = [111].into_iter().collect();
        let survivor = surviving_base(base.clone(), &kept, true).unwrap();
        assert_eq!(survivor.primary().map(|vm| vm.vmid), Some(111));
        assert!(survivor.template_on("pve1").is_none());

        assert!(surviving_base(base, &HashSet::new(), true).is_none());
    }

    #[test]
    fn image_base_outlives_its_students() {
        let base = ClassBase::image(1, "/mnt/pve/fleet-shared/images/fleet-base/class-7-v1.qcow2");
        let kept: HashSet<u32> = [103].into_iter().collect();
        assert_eq!(surviving_base(base.clone(), &kept, true), Some(base.clone()));
        assert!(surviving_base(base, &kept, false).is_none());
    }
}
