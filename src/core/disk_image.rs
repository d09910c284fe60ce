//! Disk-image primitives for overlay fleets: format conversion, backing-file
//! overlays and file cleanup, run through `qemu-img` locally or on a node over ssh.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Output;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::config::OverlaySettings;
use crate::errors::DiskImageError;

#[async_trait]
pub trait DiskImageTool: Send + Sync {
    /// Writes `source` into a standalone qcow2 image at `destination`.
    async fn convert(&self, source: &str, destination: &str) -> Result<(), DiskImageError>;

    /// Creates a qcow2 image at `destination` whose backing file is `base`.
    async fn create_overlay(&self, base: &str, destination: &str) -> Result<(), DiskImageError>;

    /// Removes an image. Removing a missing image is not an error.
    async fn remove(&self, path: &str) -> Result<(), DiskImageError>;

    async fn exists(&self, path: &str) -> Result<bool, DiskImageError>;

    async fn backing_file(&self, path: &str) -> Result<Option<String>, DiskImageError>;
}

#[derive(Deserialize)]
struct ImageInfo {
    #[serde(rename = "backing-filename")]
    backing_filename: Option<String>,
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

fn parent_dir(path: &str) -> Option<&str> {
    Path::new(path)
        .parent()
        .and_then(Path::to_str)
        .filter(|p| !p.is_empty())
}

/// `qemu-img` on the local host, or on `ssh_host` when one is configured.
pub struct QemuImg {
    binary: String,
    ssh_host: Option<String>,
    timeout: Duration,
}

impl QemuImg {
    pub fn new(settings: &OverlaySettings) -> Self {
        Self {
            binary: settings.qemu_img.clone(),
            ssh_host: settings.ssh_host.clone(),
            timeout: Duration::from_secs(settings.command_timeout_secs),
        }
    }

    async fn output(
        &self,
        program: &str,
        args: &[&str],
    ) -> Result<(String, Output), DiskImageError> {
        let rendered = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");

        let mut command = match &self.ssh_host {
            Some(host) => {
                let remote = std::iter::once(program)
                    .chain(args.iter().copied())
                    .map(shell_quote)
                    .collect::<Vec<_>>()
                    .join(" ");
                let mut cmd = Command::new("ssh");
                cmd.args(["-o", "BatchMode=yes", host.as_str(), remote.as_str()]);
                cmd
            }
            None => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };
        command.kill_on_drop(true);

        let host = self.ssh_host.as_deref().unwrap_or("local");
        debug!(command = rendered.as_str(), host, "Running disk command");
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| DiskImageError::Timeout {
                command: rendered.clone(),
                after: self.timeout,
            })??;
        Ok((rendered, output))
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String, DiskImageError> {
        let (rendered, output) = self.output(program, args).await?;
        if !output.status.success() {
            return Err(DiskImageError::Command {
                command: rendered,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn ensure_parent(&self, path: &str) -> Result<(), DiskImageError> {
        let Some(dir) = parent_dir(path) else {
            return Ok(());
        };
        if self.ssh_host.is_some() {
            self.run("mkdir", &["-p", dir]).await.map(|_| ())
        } else {
            tokio::fs::create_dir_all(dir).await.map_err(DiskImageError::from)
        }
    }
}

#[async_trait]
impl DiskImageTool for QemuImg {
    async fn convert(&self, source: &str, destination: &str) -> Result<(), DiskImageError> {
        self.ensure_parent(destination).await?;
        self.run(&self.binary, &["convert", "-O", "qcow2", source, destination])
            .await
            .map(|_| ())
    }

    async fn create_overlay(&self, base: &str, destination: &str) -> Result<(), DiskImageError> {
        if self.exists(destination).await? {
            return Err(DiskImageError::AlreadyExists(destination.to_string()));
        }
        self.ensure_parent(destination).await?;
        self.run(
            &self.binary,
            &["create", "-f", "qcow2", "-F", "qcow2", "-b", base, destination],
        )
        .await
        .map(|_| ())
    }

    async fn remove(&self, path: &str) -> Result<(), DiskImageError> {
        if self.ssh_host.is_some() {
            return self.run("rm", &["-f", path]).await.map(|_| ());
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, DiskImageError> {
        if self.ssh_host.is_some() {
            let (_, output) = self.output("test", &["-e", path]).await?;
            return Ok(output.status.success());
        }
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn backing_file(&self, path: &str) -> Result<Option<String>, DiskImageError> {
        if !self.exists(path).await? {
            return Err(DiskImageError::NotFound(path.to_string()));
        }
        let stdout = self.run(&self.binary, &["info", "--output=json", path]).await?;
        let info: ImageInfo = serde_json::from_str(&stdout).map_err(|e| DiskImageError::Command {
            command: format!("{} info {}", self.binary, path),
            status: Some(0),
            stderr: format!("unreadable image info: {}", e),
        })?;
        Ok(info.backing_filename)
    }
}

#[derive(Default)]
struct SimImages {
    // path -> backing file
    images: HashMap<String, Option<String>>,
    failing: HashSet<String>,
}

/// In-memory image store for dry runs and tests.
#[derive(Default)]
pub struct SimulatedDiskImages {
    state: Mutex<SimImages>,
}

impl SimulatedDiskImages {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimImages> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Any write to `path` fails.
    pub fn fail_writes_to(&self, path: &str) {
        self.state().failing.insert(path.to_string());
    }

    pub fn images(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.state().images.keys().cloned().collect();
        paths.sort();
        paths
    }

    fn write(&self, destination: &str, backing: Option<String>) -> Result<(), DiskImageError> {
        let mut state = self.state();
        if state.failing.contains(destination) {
            return Err(DiskImageError::Command {
                command: format!("qemu-img create {}", destination),
                status: Some(1),
                stderr: "No space left on device".to_string(),
            });
        }
        state.images.insert(destination.to_string(), backing);
        Ok(())
    }
}

#[async_trait]
impl DiskImageTool for SimulatedDiskImages {
    async fn convert(&self, _source: &str, destination: &str) -> Result<(), DiskImageError> {
        self.write(destination, None)
    }

    async fn create_overlay(&self, base: &str, destination: &str) -> Result<(), DiskImageError> {
        {
            let state = self.state();
            if !state.images.contains_key(base) {
                return Err(DiskImageError::NotFound(base.to_string()));
            }
            if state.images.contains_key(destination) {
                return Err(DiskImageError::AlreadyExists(destination.to_string()));
            }
        }
        self.write(destination, Some(base.to_string()))
    }

    async fn remove(&self, path: &str) -> Result<(), DiskImageError> {
        self.state().images.remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, DiskImageError> {
        Ok(self.state().images.contains_key(path))
    }

    async fn backing_file(&self, path: &str) -> Result<Option<String>, DiskImageError> {
        self.state()
            .images
            .get(path)
            .cloned()
            .ok_or_else(|| DiskImageError::NotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_for_remote_shell() {
        assert_eq!(shell_quote("/mnt/a b"), "'/mnt/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn overlay_needs_its_base() {
        let images = SimulatedDiskImages::new();
        assert!(matches!(
            images.create_overlay("/base.qcow2", "/vm.qcow2").await,
            Err(DiskImageError::NotFound(_))
        ));

        images.convert("/dev/pve/vm-9000-disk-0", "/base.qcow2").await.unwrap();
        images.create_overlay("/base.qcow2", "/vm.qcow2").await.unwrap();
        assert_eq!(
            images.backing_file("/vm.qcow2").await.unwrap().as_deref(),
            Some("/base.qcow2")
        );
    }

    #[tokio::test]
    async fn local_remove_of_missing_file_is_ok() {
        let tool = QemuImg::new(&OverlaySettings::default());
        tool.remove("/nonexistent/fleet/vm-1-disk-0.qcow2").await.unwrap();
        assert!(!tool.exists("/nonexistent/fleet/vm-1-disk-0.qcow2").await.unwrap());
    }
}
