use futures_util::future::join_all;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::clone::CloneExecutor;
use super::disk_image::DiskImageTool;
use super::vm::CloneOutcome;
use crate::config::OverlaySettings;
use crate::errors::{DiskImageError, FleetError, FleetResult, HypervisorError};
use crate::hypervisor::{VmRef, VmShellSpec};

const BOOT_SLOT: &str = "scsi0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IpConfig {
    Dhcp,
    Static { cidr: String, gateway: Option<String> },
}

impl IpConfig {
    fn render(&self) -> String {
        match self {
            IpConfig::Dhcp => "ip=dhcp".to_string(),
            IpConfig::Static { cidr, gateway: Some(gw) } => format!("ip={},gw={}", cidr, gw),
            IpConfig::Static { cidr, gateway: None } => format!("ip={}", cidr),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudInit {
    pub user: String,
    pub password: Option<String>,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    pub ip: IpConfig,
}

// RFC 3986 unreserved characters stay literal; spaces become `%20`.
const KEY_ESCAPES: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// The hypervisor expects the key list URL-encoded.
fn encode_keys(keys: &[String]) -> String {
    utf8_percent_encode(&keys.join("\n"), KEY_ESCAPES).to_string()
}

impl CloudInit {
    pub fn params(&self, storage: &str) -> Vec<(String, String)> {
        let mut params = vec![
            ("ide2".to_string(), format!("{}:cloudinit", storage)),
            ("ciuser".to_string(), self.user.clone()),
            ("ipconfig0".to_string(), self.ip.render()),
        ];
        if let Some(password) = &self.password {
            params.push(("cipassword".to_string(), password.clone()));
        }
        if !self.ssh_keys.is_empty() {
            params.push(("sshkeys".to_string(), encode_keys(&self.ssh_keys)));
        }
        params
    }
}

/// How the VM disk relates to the base image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskLayout {
    /// Thin qcow2 with the base image as backing file.
    Overlay,
    /// Flattened copy of the base image, no backing file.
    Standalone,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverlayRequest {
    pub vmid: u32,
    pub node: String,
    pub name: String,
    pub base_image: String,
    pub memory_mb: u64,
    pub cores: u32,
    pub bridge: String,
    pub cloud_init: Option<CloudInit>,
    pub layout: DiskLayout,
}

/// What a build created so far, for cleanup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BuildProgress {
    pub shell: bool,
    pub disk: bool,
}

/// Builds VMs around a disk file on shared directory storage instead of going
/// through the hypervisor's clone path.
#[derive(Clone)]
pub struct OverlayDiskBuilder {
    executor: CloneExecutor,
    disks: Arc<dyn DiskImageTool>,
    settings: OverlaySettings,
}

impl OverlayDiskBuilder {
    pub fn new(
        executor: CloneExecutor,
        disks: Arc<dyn DiskImageTool>,
        settings: OverlaySettings,
    ) -> Self {
        Self {
            executor,
            disks,
            settings,
        }
    }

    pub fn disks(&self) -> &Arc<dyn DiskImageTool> {
        &self.disks
    }

    fn images_dir(&self) -> String {
        format!("{}/images", self.settings.storage_path.trim_end_matches('/'))
    }

    /// Path of a shared base image, e.g.
    /// `/mnt/pve/fleet-shared/images/fleet-base/class-7-v2.qcow2`.
    pub fn base_image_path(&self, label: &str) -> String {
        format!("{}/fleet-base/{}.qcow2", self.images_dir(), label)
    }

    pub fn disk_path(&self, vmid: u32) -> String {
        format!("{}/{}/vm-{}-disk-0.qcow2", self.images_dir(), vmid, vmid)
    }

    pub fn disk_volume(&self, vmid: u32) -> String {
        format!("{}:{}/vm-{}-disk-0.qcow2", self.settings.storage, vmid, vmid)
    }

    /// Exports the boot disk of `source` to `base_path` unless the image already
    /// exists. Returns whether an export happened.
    pub async fn ensure_base_image(&self, source: &VmRef, base_path: &str) -> FleetResult<bool> {
        if self.disks.exists(base_path).await? {
            return Ok(false);
        }

        let config = self.executor.vm_config(source).await?;
        let disk = config.boot_disk().ok_or_else(|| {
            HypervisorError::Decode(format!("VM {} has no boot disk", source))
        })?;
        let volume_path = self.executor.volume_path(&source.node, &disk.volume).await?;

        info!(
            source = %source,
            volume = disk.volume.as_str(),
            base = base_path,
            "Exporting base image"
        );
        self.disks.convert(&volume_path, base_path).await?;
        Ok(true)
    }

    pub async fn build(&self, request: &OverlayRequest) -> CloneOutcome {
        let mut progress = BuildProgress::default();
        match self.try_build(request, &mut progress).await {
            Ok(()) => {
                info!(vmid = request.vmid, node = request.node.as_str(), "Overlay VM ready");
                CloneOutcome::succeeded(
                    request.vmid,
                    &request.node,
                    &request.name,
                    1,
                    "Overlay VM created",
                )
            }
            Err(e) => {
                warn!(
                    vmid = request.vmid,
                    error = e.to_string(),
                    "Overlay build failed, cleaning up"
                );
                if let Err(cleanup_error) = self.cleanup(request, progress).await {
                    error!(
                        vmid = request.vmid,
                        error = cleanup_error.to_string(),
                        "Cleanup after failed overlay build incomplete"
                    );
                }
                CloneOutcome::failed(&request.node, &request.name, 1, e.to_string())
            }
        }
    }

    async fn try_build(
        &self,
        request: &OverlayRequest,
        progress: &mut BuildProgress,
    ) -> FleetResult<()> {
        if !self.disks.exists(&request.base_image).await? {
            return Err(DiskImageError::NotFound(request.base_image.clone()).into());
        }

        let shell = VmShellSpec {
            vmid: request.vmid,
            name: request.name.clone(),
            memory_mb: request.memory_mb,
            cores: request.cores,
            bridge: request.bridge.clone(),
        };
        self.executor.create_shell(&request.node, &shell).await?;
        progress.shell = true;

        let path = self.disk_path(request.vmid);
        match request.layout {
            DiskLayout::Overlay => self.disks.create_overlay(&request.base_image, &path).await?,
            DiskLayout::Standalone => self.disks.convert(&request.base_image, &path).await?,
        }
        progress.disk = true;

        let vm = VmRef::new(request.vmid, request.node.clone());
        let attach = [
            (BOOT_SLOT.to_string(), self.disk_volume(request.vmid)),
            ("boot".to_string(), format!("order={}", BOOT_SLOT)),
        ];
        self.executor.update_config(&vm, &attach).await?;

        if let Some(cloud_init) = &request.cloud_init {
            self.executor
                .update_config(&vm, &cloud_init.params(&self.settings.storage))
                .await?;
        }
        Ok(())
    }

    /// Removes whatever a failed build left behind. Both steps are attempted;
    /// the first error is returned.
    pub async fn cleanup(
        &self,
        request: &OverlayRequest,
        progress: BuildProgress,
    ) -> FleetResult<()> {
        let mut first_error: Option<FleetError> = None;

        if progress.disk {
            if let Err(e) = self.disks.remove(&self.disk_path(request.vmid)).await {
                first_error.get_or_insert(e.into());
            }
        }
        if progress.shell {
            let vm = VmRef::new(request.vmid, request.node.clone());
            if let Err(e) = self.executor.delete_vm(&vm).await {
                first_error.get_or_insert(e.into());
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Points an existing overlay VM at `base_image` by recreating its disk file.
    /// The VM config keeps referencing the same volume.
    pub async fn replace_overlay(&self, vm: &VmRef, base_image: &str) -> FleetResult<()> {
        if !self.disks.exists(base_image).await? {
            return Err(DiskImageError::NotFound(base_image.to_string()).into());
        }
        self.executor.stop_vm(vm).await?;

        let path = self.disk_path(vm.vmid);
        self.disks.remove(&path).await?;
        self.disks.create_overlay(base_image, &path).await?;
        info!(vm = %vm, base = base_image, "Overlay rebased");
        Ok(())
    }

    /// Rebuilds a standalone disk from `base_image` in place.
    pub async fn replace_standalone(&self, vm: &VmRef, base_image: &str) -> FleetResult<()> {
        self.executor.stop_vm(vm).await?;
        let path = self.disk_path(vm.vmid);
        self.disks.remove(&path).await?;
        self.disks.convert(base_image, &path).await?;
        Ok(())
    }
}

/// Starts VMs `batch_size` at a time with `delay` between batches. Returns the
/// VMs that failed to start.
pub async fn start_in_batches(
    executor: &CloneExecutor,
    vms: &[VmRef],
    batch_size: usize,
    delay: Duration,
) -> Vec<(VmRef, HypervisorError)> {
    let mut failures = Vec::new();
    let batches: Vec<&[VmRef]> = vms.chunks(batch_size.max(1)).collect();

    for (index, batch) in batches.iter().enumerate() {
        let results = join_all(batch.iter().map(|vm| executor.start_vm(vm))).await;
        for (vm, result) in batch.iter().zip(results) {
            if let Err(e) = result {
                warn!(vm = %vm, error = e.to_string(), "VM failed to start");
                failures.push((vm.clone(), e));
            }
        }
        if index + 1 < batches.len() {
            tokio::time::sleep(delay).await;
        }
    }
    failures
}
