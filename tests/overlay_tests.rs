// Overlay builder tests: a VM shell plus a thin disk over a shared base image.

use anyhow::Result;
use std::sync::Arc;

use fleet_vm_manager::config::OverlaySettings;
use fleet_vm_manager::core::{
    CloneExecutor, ClonePolicy, CloudInit, DiskImageTool, DiskLayout, IpConfig, OverlayDiskBuilder,
    OverlayRequest, SimulatedDiskImages,
};
use fleet_vm_manager::hypervisor::{SimulatedHypervisor, VmRef};

struct Rig {
    sim: Arc<SimulatedHypervisor>,
    disks: Arc<SimulatedDiskImages>,
    builder: OverlayDiskBuilder,
}

fn rig() -> Rig {
    let sim = Arc::new(SimulatedHypervisor::demo());
    sim.set_task_polls(0);
    let disks = Arc::new(SimulatedDiskImages::new());
    let executor = CloneExecutor::new(sim.clone(), ClonePolicy::default());
    let builder = OverlayDiskBuilder::new(executor, disks.clone(), OverlaySettings::default());
    Rig { sim, disks, builder }
}

fn request(builder: &OverlayDiskBuilder, vmid: u32, layout: DiskLayout) -> OverlayRequest {
    OverlayRequest {
        vmid,
        node: "pve2".to_string(),
        name: format!("lab-{}", vmid),
        base_image: builder.base_image_path("lab-v1"),
        memory_mb: 2048,
        cores: 2,
        bridge: "vmbr0".to_string(),
        cloud_init: None,
        layout,
    }
}

#[tokio::test]
async fn test_base_image_is_exported_once() -> Result<()> {
    let rig = rig();
    let source = VmRef::new(9000, "pve1");
    let base = rig.builder.base_image_path("lab-v1");

    assert!(rig.builder.ensure_base_image(&source, &base).await?);
    assert!(!rig.builder.ensure_base_image(&source, &base).await?);
    assert_eq!(rig.disks.images(), vec![base]);
    Ok(())
}

#[tokio::test]
async fn test_overlay_vm_is_backed_by_the_base() -> Result<()> {
    let rig = rig();
    let base = rig.builder.base_image_path("lab-v1");
    rig.builder.ensure_base_image(&VmRef::new(9000, "pve1"), &base).await?;

    let mut req = request(&rig.builder, 200, DiskLayout::Overlay);
    req.cloud_init = Some(CloudInit {
        user: "student".to_string(),
        password: Some("changeme".to_string()),
        ssh_keys: Vec::new(),
        ip: IpConfig::Dhcp,
    });
    let outcome = rig.builder.build(&req).await;

    assert!(outcome.success, "{}", outcome.message);
    assert!(rig.sim.exists(200));
    let disk = rig.builder.disk_path(200);
    assert_eq!(rig.disks.backing_file(&disk).await?, Some(base));
    assert_eq!(rig.sim.config_value(200, "scsi0"), Some(rig.builder.disk_volume(200)));
    assert_eq!(rig.sim.config_value(200, "ciuser").as_deref(), Some("student"));
    Ok(())
}

#[tokio::test]
async fn test_standalone_disk_has_no_backing_file() -> Result<()> {
    let rig = rig();
    let base = rig.builder.base_image_path("lab-v1");
    rig.builder.ensure_base_image(&VmRef::new(9000, "pve1"), &base).await?;

    let outcome = rig.builder.build(&request(&rig.builder, 201, DiskLayout::Standalone)).await;
    assert!(outcome.success, "{}", outcome.message);
    assert_eq!(rig.disks.backing_file(&rig.builder.disk_path(201)).await?, None);
    Ok(())
}

#[tokio::test]
async fn test_failed_disk_write_removes_the_shell() -> Result<()> {
    let rig = rig();
    let base = rig.builder.base_image_path("lab-v1");
    rig.builder.ensure_base_image(&VmRef::new(9000, "pve1"), &base).await?;
    let disk = rig.builder.disk_path(202);
    rig.disks.fail_writes_to(&disk);

    let outcome = rig.builder.build(&request(&rig.builder, 202, DiskLayout::Overlay)).await;

    assert!(!outcome.success);
    assert!(outcome.message.contains("No space left"));
    assert!(!rig.sim.exists(202));
    assert!(!rig.disks.exists(&disk).await?);
    Ok(())
}

#[tokio::test]
async fn test_missing_base_fails_before_creating_anything() -> Result<()> {
    let rig = rig();
    let before = rig.sim.vm_count();

    let outcome = rig.builder.build(&request(&rig.builder, 203, DiskLayout::Overlay)).await;

    assert!(!outcome.success);
    assert_eq!(rig.sim.vm_count(), before);
    Ok(())
}

#[tokio::test]
async fn test_replace_overlay_switches_backing_file() -> Result<()> {
    let rig = rig();
    let source = VmRef::new(9000, "pve1");
    let v1 = rig.builder.base_image_path("lab-v1");
    let v2 = rig.builder.base_image_path("lab-v2");
    rig.builder.ensure_base_image(&source, &v1).await?;
    rig.builder.ensure_base_image(&source, &v2).await?;
    assert!(rig.builder.build(&request(&rig.builder, 204, DiskLayout::Overlay)).await.success);

    rig.builder.replace_overlay(&VmRef::new(204, "pve2"), &v2).await?;
    assert_eq!(rig.disks.backing_file(&rig.builder.disk_path(204)).await?, Some(v2));
    Ok(())
}
