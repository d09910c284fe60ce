// End-to-end fleet jobs against the simulated cluster. Time is paused, so the
// polling helper below costs nothing.

use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;

use fleet_vm_manager::config::Settings;
use fleet_vm_manager::core::SimulatedDiskImages;
use fleet_vm_manager::core::DiskImageTool;
use fleet_vm_manager::fleet::{
    ClassFleet, ClassRequest, ClassState, DiskMode, FleetOrchestrator, InMemoryFleetStore,
    Mutation,
};
use fleet_vm_manager::hypervisor::{NodeSnapshot, SimulatedHypervisor, VmRef};
use fleet_vm_manager::{FleetError, JobProgress, JobStatus, ProgressTracker};

const GIB: u64 = 1024 * 1024 * 1024;

struct Lab {
    sim: Arc<SimulatedHypervisor>,
    disks: Arc<SimulatedDiskImages>,
    orchestrator: FleetOrchestrator,
}

fn single_node() -> SimulatedHypervisor {
    let sim = SimulatedHypervisor::new(vec![NodeSnapshot::idle("pve1", 16, 64 * GIB)]);
    sim.add_template(9000, "pve1", "ubuntu-template", 2048, 2);
    sim
}

fn lab(sim: SimulatedHypervisor) -> Lab {
    lab_with(sim, |_| {})
}

fn lab_with(sim: SimulatedHypervisor, tweak: impl FnOnce(&mut Settings)) -> Lab {
    sim.set_task_polls(0);
    let sim = Arc::new(sim);
    let disks = Arc::new(SimulatedDiskImages::new());

    let mut settings = Settings::default();
    settings.fleet.replication_settle_secs = 0;
    settings.fleet.start_batch_delay_secs = 0;
    tweak(&mut settings);

    let orchestrator = FleetOrchestrator::new(
        sim.clone(),
        disks.clone(),
        Arc::new(InMemoryFleetStore::new()),
        Arc::new(ProgressTracker::default()),
        &settings,
    );
    Lab { sim, disks, orchestrator }
}

async fn wait_for(orchestrator: &FleetOrchestrator, job_id: &str) -> JobProgress {
    loop {
        if let Some(progress) = orchestrator.get_job_progress(job_id) {
            if progress.status.is_terminal() {
                return progress;
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn provisioned(lab: &Lab, request: ClassRequest) -> Result<ClassFleet> {
    let class_id = request.class_id.clone();
    let job_id = lab.orchestrator.start_fleet_job(request).await?;
    let progress = wait_for(&lab.orchestrator, &job_id).await;
    if progress.status != JobStatus::Completed {
        bail!("provisioning failed: {} {:?}", progress.message, progress.errors);
    }
    match lab.orchestrator.class(&class_id).await? {
        Some(fleet) => Ok(fleet),
        None => bail!("class {} has no record", class_id),
    }
}

fn source() -> VmRef {
    VmRef::new(9000, "pve1")
}

#[tokio::test(start_paused = true)]
async fn test_single_node_class_links_students_to_the_base() -> Result<()> {
    let lab = lab(single_node());
    let fleet = provisioned(&lab, ClassRequest::new("a", source(), 3)).await?;

    assert_eq!(fleet.state, ClassState::Ready);
    assert_eq!(fleet.generation, 1);
    let teacher = fleet.teacher.clone().expect("teacher recorded");
    assert_eq!(teacher.name, "class-a-teacher");
    assert_eq!(lab.sim.linked_base_of(teacher.vmid), None);

    let base = fleet.base.as_ref().and_then(|b| b.primary()).cloned().expect("base template");
    assert_eq!(base.name, "class-a-base");
    assert!(lab.sim.vm(base.vmid).is_some_and(|vm| vm.template));

    assert_eq!(fleet.students.len(), 3);
    for (index, student) in fleet.students.iter().enumerate() {
        assert_eq!(student.name, format!("class-a-student-{}", index + 1));
        assert_eq!(lab.sim.linked_base_of(student.vmid), Some(base.vmid));
        assert_eq!(lab.sim.snapshots_of(student.vmid), vec!["baseline".to_string()]);
    }

    // Every linked clone went to the base template on its own node.
    for spec in lab.sim.clone_log().iter().filter(|spec| !spec.full) {
        assert_eq!(spec.source.vmid, base.vmid);
        assert_eq!(spec.target_node, "pve1");
    }
    assert_eq!(lab.sim.vm(9000).map(|vm| vm.template), Some(true));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_students_use_the_replica_on_their_node() -> Result<()> {
    let lab = lab(SimulatedHypervisor::demo());
    let fleet = provisioned(&lab, ClassRequest::new("multi", source(), 6)).await?;

    let base = fleet.base.clone().expect("base recorded");
    assert_eq!(base.template_vms().len(), 3);
    assert_eq!(fleet.students.len(), 6);
    for student in &fleet.students {
        let template = base.template_on(&student.node).expect("template on student node");
        assert_eq!(lab.sim.linked_base_of(student.vmid), Some(template.vmid));
        assert_eq!(lab.sim.vm(student.vmid).map(|vm| vm.node), Some(student.node.clone()));
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_student_does_not_fail_the_job() -> Result<()> {
    let lab = lab(single_node());
    lab.sim.fail_clone_named("class-b-student-2", "storage 'local-lvm' is full");

    let job_id = lab.orchestrator.start_fleet_job(ClassRequest::new("b", source(), 3)).await?;
    let progress = wait_for(&lab.orchestrator, &job_id).await;

    assert_eq!(progress.status, JobStatus::Completed);
    assert_eq!(progress.total, 3);
    assert_eq!(progress.completed, 2);
    assert_eq!(progress.failed, 1);
    assert!(progress.errors.iter().any(|e| e.starts_with("class-b-student-2:")));
    assert_eq!(progress.message, "2/3 students provisioned");

    let fleet = lab.orchestrator.class("b").await?.expect("record");
    let names: Vec<&str> = fleet.students.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["class-b-student-1", "class-b-student-3"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_save_then_push_moves_students_to_the_new_base() -> Result<()> {
    let lab = lab(single_node());
    let before = provisioned(&lab, ClassRequest::new("c", source(), 2)).await?;
    let old_base = before.base.as_ref().and_then(|b| b.primary()).cloned().expect("base");

    let job_id = lab.orchestrator.save_teacher_edits_to_template("c").await?;
    let progress = wait_for(&lab.orchestrator, &job_id).await;
    assert_eq!(progress.status, JobStatus::Completed, "{:?}", progress.errors);
    assert_eq!(progress.message, "Teacher saved as base generation 2");

    let saved = lab.orchestrator.class("c").await?.expect("record");
    let new_base = saved.base.as_ref().and_then(|b| b.primary()).cloned().expect("new base");
    assert_ne!(new_base.vmid, old_base.vmid);
    assert_eq!(new_base.name, "class-c-base-v2");
    // The class only resolves the new generation; the old one is retired.
    assert_eq!(saved.base.as_ref().map(|b| b.generation), Some(2));
    assert_eq!(
        saved.base.as_ref().and_then(|b| b.template_on("pve1")).map(|vm| vm.vmid),
        Some(new_base.vmid)
    );
    let retired: Vec<u32> = saved.retired.iter().flat_map(|b| b.template_ids()).collect();
    assert_eq!(retired, vec![old_base.vmid]);
    for student in &saved.students {
        assert_eq!(lab.sim.linked_base_of(student.vmid), Some(old_base.vmid));
    }

    let job_id = lab.orchestrator.push_template_to_students("c").await?;
    let progress = wait_for(&lab.orchestrator, &job_id).await;
    assert_eq!(progress.status, JobStatus::Completed, "{:?}", progress.errors);
    assert_eq!(progress.message, "2/2 students updated to base generation 2");

    let pushed = lab.orchestrator.class("c").await?.expect("record");
    assert!(pushed.retired.is_empty());
    assert!(!lab.sim.exists(old_base.vmid));
    let old_ids: Vec<u32> = before.students.iter().map(|s| s.vmid).collect();
    let new_ids: Vec<u32> = pushed.students.iter().map(|s| s.vmid).collect();
    assert_eq!(old_ids, new_ids);
    for student in &pushed.students {
        assert_eq!(lab.sim.linked_base_of(student.vmid), Some(new_base.vmid));
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_delete_twice_is_harmless() -> Result<()> {
    let lab = lab(single_node());
    provisioned(&lab, ClassRequest::new("d", source(), 2)).await?;
    assert_eq!(lab.sim.vm_count(), 5);

    let job_id = lab.orchestrator.delete_class_fleet("d", false).await?;
    let progress = wait_for(&lab.orchestrator, &job_id).await;
    assert_eq!(progress.status, JobStatus::Completed);
    assert_eq!(progress.message, "4 VMs deleted");
    assert_eq!(lab.sim.vm_count(), 1);
    assert!(lab.sim.exists(9000));
    assert!(lab.orchestrator.class("d").await?.is_none());

    let job_id = lab.orchestrator.delete_class_fleet("d", false).await?;
    let progress = wait_for(&lab.orchestrator, &job_id).await;
    assert_eq!(progress.status, JobStatus::Completed);
    assert_eq!(progress.message, "0 VMs deleted");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_forced_delete_only_drops_the_record() -> Result<()> {
    let lab = lab(single_node());
    provisioned(&lab, ClassRequest::new("f", source(), 1)).await?;
    let vms = lab.sim.vm_count();

    let job_id = lab.orchestrator.delete_class_fleet("f", true).await?;
    let progress = wait_for(&lab.orchestrator, &job_id).await;
    assert!(progress.message.starts_with("0 VMs deleted"));
    assert_eq!(lab.sim.vm_count(), vms);
    assert!(lab.orchestrator.class("f").await?.is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unconverted_base_falls_back_to_the_source() -> Result<()> {
    let lab = lab(single_node());
    lab.sim.fail_convert_named("class-x-base");

    let job_id = lab.orchestrator.start_fleet_job(ClassRequest::new("x", source(), 2)).await?;
    let progress = wait_for(&lab.orchestrator, &job_id).await;
    assert_eq!(progress.status, JobStatus::Completed);
    assert!(progress.errors.iter().any(|e| e.starts_with("class-x-base:")));

    let fleet = lab.orchestrator.class("x").await?.expect("record");
    assert!(fleet.base.is_none());
    assert_eq!(fleet.leftovers.len(), 1);
    for student in &fleet.students {
        assert_eq!(lab.sim.linked_base_of(student.vmid), Some(9000));
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_overlay_class_students_share_the_base_image() -> Result<()> {
    let lab = lab(single_node());
    let mut request = ClassRequest::new("o", source(), 2);
    request.disk_mode = DiskMode::Overlay;
    let fleet = provisioned(&lab, request).await?;

    let base_path = fleet
        .base
        .as_ref()
        .and_then(|b| b.image_path())
        .map(str::to_string)
        .expect("base image");
    assert_eq!(base_path, "/mnt/pve/fleet-shared/images/fleet-base/class-o-v1.qcow2");
    for student in &fleet.students {
        let disk = format!(
            "/mnt/pve/fleet-shared/images/{0}/vm-{0}-disk-0.qcow2",
            student.vmid
        );
        assert_eq!(lab.disks.backing_file(&disk).await?, Some(base_path.clone()));
    }

    let student = fleet.students[0].vmid;
    let job_id = lab.orchestrator.revert_vm_to_baseline("o", student).await?;
    let progress = wait_for(&lab.orchestrator, &job_id).await;
    assert_eq!(progress.status, JobStatus::Completed, "{:?}", progress.errors);

    let job_id = lab.orchestrator.delete_class_fleet("o", false).await?;
    wait_for(&lab.orchestrator, &job_id).await;
    assert!(!lab.disks.exists(&base_path).await?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_busy_class_rejects_new_jobs() -> Result<()> {
    let lab = lab(single_node());
    let job_id = lab.orchestrator.start_fleet_job(ClassRequest::new("busy", source(), 2)).await?;

    let again = lab.orchestrator.start_fleet_job(ClassRequest::new("busy", source(), 2)).await;
    assert!(matches!(again, Err(FleetError::InvalidState { .. })));
    let push = lab.orchestrator.push_template_to_students("busy").await;
    assert!(matches!(push, Err(FleetError::InvalidState { .. })));

    wait_for(&lab.orchestrator, &job_id).await;
    let fleet = lab.orchestrator.class("busy").await?.expect("record");
    assert_eq!(fleet.state, ClassState::Ready);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_rejected_requests() -> Result<()> {
    let lab = lab(single_node());

    let too_many = lab.orchestrator.start_fleet_job(ClassRequest::new("big", source(), 501)).await;
    assert!(matches!(too_many, Err(FleetError::Validation(_))));

    let unknown = lab.orchestrator.push_template_to_students("nobody").await;
    assert!(matches!(unknown, Err(FleetError::ClassNotFound { .. })));

    provisioned(&lab, ClassRequest::new("r", source(), 1)).await?;
    let stranger = lab.orchestrator.reimage_vm("r", 9000).await;
    assert!(matches!(stranger, Err(FleetError::VmNotInClass { vmid: 9000, .. })));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_reimage_and_revert_keep_vm_ids() -> Result<()> {
    let lab = lab(single_node());
    let fleet = provisioned(&lab, ClassRequest::new("e", source(), 2)).await?;
    let base = fleet.base.as_ref().and_then(|b| b.primary()).cloned().expect("base");
    let student = fleet.students[1].clone();
    let teacher = fleet.teacher.clone().expect("teacher");

    let job_id = lab.orchestrator.reimage_vm("e", student.vmid).await?;
    let progress = wait_for(&lab.orchestrator, &job_id).await;
    assert_eq!(progress.status, JobStatus::Completed, "{:?}", progress.errors);
    assert_eq!(lab.sim.linked_base_of(student.vmid), Some(base.vmid));

    let job_id = lab.orchestrator.reimage_vm("e", teacher.vmid).await?;
    let progress = wait_for(&lab.orchestrator, &job_id).await;
    assert_eq!(progress.status, JobStatus::Completed, "{:?}", progress.errors);
    assert!(lab.sim.exists(teacher.vmid));

    let job_id = lab.orchestrator.revert_vm_to_baseline("e", student.vmid).await?;
    let progress = wait_for(&lab.orchestrator, &job_id).await;
    assert_eq!(progress.status, JobStatus::Completed, "{:?}", progress.errors);

    let after = lab.orchestrator.class("e").await?.expect("record");
    assert_eq!(after.students, fleet.students);
    assert_eq!(after.teacher.map(|t| t.vmid), Some(teacher.vmid));
    assert_eq!(after.state, ClassState::Ready);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_teacher_clone_aborts_before_students() -> Result<()> {
    let lab = lab(single_node());
    lab.sim.fail_clone_named("class-t-teacher", "storage 'local-lvm' is full");

    let job_id = lab.orchestrator.start_fleet_job(ClassRequest::new("t", source(), 3)).await?;
    let progress = wait_for(&lab.orchestrator, &job_id).await;

    assert_eq!(progress.status, JobStatus::Failed);
    assert!(progress.message.contains("class-t-teacher"), "{}", progress.message);
    assert!(lab
        .sim
        .clone_log()
        .iter()
        .all(|spec| !spec.name.contains("student")));
    assert_eq!(lab.sim.vm_count(), 1);
    assert!(lab.orchestrator.class("t").await?.is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_started_fleet_boots_in_batches() -> Result<()> {
    let lab = lab_with(single_node(), |settings| {
        settings.fleet.start_batch_size = 2;
        settings.fleet.start_batch_delay_secs = 20;
    });
    let mut request = ClassRequest::new("s", source(), 3);
    request.start_after_create = true;
    let fleet = provisioned(&lab, request).await?;

    let teacher = fleet.teacher.as_ref().map(|vm| vm.vmid).expect("teacher");
    let mut expected = vec![teacher];
    expected.extend(fleet.students.iter().map(|vm| vm.vmid));

    let starts = lab.sim.start_log();
    let order: Vec<u32> = starts.iter().map(|(vmid, _)| *vmid).collect();
    assert_eq!(order, expected);
    assert_eq!(starts[1].1, starts[0].1);
    assert_eq!(starts[2].1 - starts[0].1, Duration::from_secs(20));
    assert_eq!(starts[3].1, starts[2].1);
    for vmid in expected {
        assert!(lab.sim.vm(vmid).is_some_and(|vm| vm.running));
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_finished_job_leaves_a_later_job_claim_alone() -> Result<()> {
    let lab = lab_with(single_node(), |settings| {
        settings.fleet.start_batch_size = 1;
        settings.fleet.start_batch_delay_secs = 10;
    });
    let mut request = ClassRequest::new("p", source(), 2);
    request.start_after_create = true;
    let provision = lab.orchestrator.start_fleet_job(request).await?;

    // The class turns Ready before the VMs are started.
    loop {
        let fleet = lab.orchestrator.class("p").await?.expect("record");
        if fleet.state == ClassState::Ready {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    lab.sim.lock_next_clones(6);
    let push = lab.orchestrator.push_template_to_students("p").await?;

    let progress = wait_for(&lab.orchestrator, &provision).await;
    assert_eq!(progress.status, JobStatus::Completed);

    // The push is still backing off on locked clones.
    let pushing = lab.orchestrator.get_job_progress(&push).expect("push progress");
    assert_eq!(pushing.status, JobStatus::Running);
    let fleet = lab.orchestrator.class("p").await?.expect("record");
    assert_eq!(fleet.state, ClassState::Mutating(Mutation::Push));
    let delete = lab.orchestrator.delete_class_fleet("p", false).await;
    assert!(matches!(delete, Err(FleetError::InvalidState { .. })));

    let progress = wait_for(&lab.orchestrator, &push).await;
    assert_eq!(progress.status, JobStatus::Completed, "{:?}", progress.errors);
    let fleet = lab.orchestrator.class("p").await?.expect("record");
    assert_eq!(fleet.state, ClassState::Ready);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_surviving_overlay_keeps_its_base_image() -> Result<()> {
    let lab = lab(single_node());
    let mut request = ClassRequest::new("k", source(), 2);
    request.disk_mode = DiskMode::Overlay;
    let fleet = provisioned(&lab, request).await?;
    let base_path = fleet
        .base
        .as_ref()
        .and_then(|b| b.image_path())
        .map(str::to_string)
        .expect("base image");
    let survivor = fleet.students[0].clone();
    lab.sim.fail_delete_named(&survivor.name, "storage 'fleet-shared' is offline");

    let job_id = lab.orchestrator.delete_class_fleet("k", false).await?;
    let progress = wait_for(&lab.orchestrator, &job_id).await;
    assert_eq!(progress.status, JobStatus::Completed);
    assert!(progress.message.ends_with("1 could not be deleted"), "{}", progress.message);

    let left = lab.orchestrator.class("k").await?.expect("record kept");
    assert_eq!(left.state, ClassState::Ready);
    assert_eq!(left.students, vec![survivor.clone()]);
    assert!(left.teacher.is_none());
    assert_eq!(
        left.base.as_ref().and_then(|b| b.image_path()),
        Some(base_path.as_str())
    );
    assert!(lab.disks.exists(&base_path).await?);
    let disk = format!(
        "/mnt/pve/fleet-shared/images/{0}/vm-{0}-disk-0.qcow2",
        survivor.vmid
    );
    assert_eq!(lab.disks.backing_file(&disk).await?, Some(base_path));
    Ok(())
}
