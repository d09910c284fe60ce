use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use super::vm::{CloneOutcome, CloneRequest};
use crate::cluster::{ClusterView, VmidAllocator};
use crate::config::CloneSettings;
use crate::errors::{HypervisorError, LockRetry, RetryPolicy};
use crate::hypervisor::{
    CloneSpec, HypervisorApi, NodeSnapshot, TaskHandle, TaskState, VmConfig, VmRef, VmShellSpec,
};

/// Timing knobs for one executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ClonePolicy {
    pub retry: RetryPolicy,
    pub task_timeout: Duration,
    pub poll_interval: Duration,
    pub unlock_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for ClonePolicy {
    fn default() -> Self {
        Self::from(&CloneSettings::default())
    }
}

impl From<&CloneSettings> for ClonePolicy {
    fn from(settings: &CloneSettings) -> Self {
        Self {
            retry: settings.retry_policy(),
            task_timeout: Duration::from_secs(settings.task_timeout_secs),
            poll_interval: Duration::from_secs(settings.poll_interval_secs.max(1)),
            unlock_timeout: Duration::from_secs(settings.unlock_timeout_secs),
            call_timeout: Duration::from_secs(settings.call_timeout_secs.max(1)),
        }
    }
}

/// How a task poll ended. A timeout is not an error: the task most likely
/// keeps running on the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskWait {
    Completed,
    TimedOut,
}

/// Runs single hypervisor operations with lock-aware retry, task polling and
/// unlock polling.
#[derive(Clone)]
pub struct CloneExecutor {
    api: Arc<dyn HypervisorApi>,
    policy: ClonePolicy,
    retry: LockRetry,
}

impl CloneExecutor {
    pub fn new(api: Arc<dyn HypervisorApi>, policy: ClonePolicy) -> Self {
        let retry = LockRetry::new(policy.retry.clone());
        Self { api, policy, retry }
    }

    /// Same hypervisor connection, different timing.
    pub fn with_policy(&self, policy: ClonePolicy) -> Self {
        Self::new(self.api.clone(), policy)
    }

    pub fn policy(&self) -> &ClonePolicy {
        &self.policy
    }

    async fn call<T, Fut>(&self, operation: &str, request: Fut) -> Result<T, HypervisorError>
    where
        Fut: Future<Output = Result<T, HypervisorError>>,
    {
        timeout(self.policy.call_timeout, request)
            .await
            .map_err(|_| HypervisorError::Timeout {
                operation: operation.to_string(),
                after: self.policy.call_timeout,
            })?
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeSnapshot>, HypervisorError> {
        self.call("node list", self.api.list_nodes()).await
    }

    pub async fn vm_config(&self, vm: &VmRef) -> Result<VmConfig, HypervisorError> {
        self.call("vm config", self.api.vm_config(vm)).await
    }

    pub async fn volume_path(&self, node: &str, volume: &str) -> Result<String, HypervisorError> {
        self.call("volume path", self.api.volume_path(node, volume)).await
    }

    pub async fn cluster_view(&self) -> Result<ClusterView, HypervisorError> {
        self.call("cluster resources", self.api.cluster_vms())
            .await
            .map(ClusterView::from_vms)
    }

    /// Id allocator seeded from the cluster's next free id and every id in use.
    pub async fn allocator(&self) -> Result<VmidAllocator, HypervisorError> {
        let first = self.call("next vmid", self.api.next_vmid()).await?;
        let view = self.cluster_view().await?;
        Ok(VmidAllocator::new(first, view.ids()))
    }

    /// Polls a task until it stops. A non-OK exit status becomes
    /// [`HypervisorError::TaskFailed`] so lock exits can be retried by the caller.
    pub async fn wait_task(&self, task: &TaskHandle) -> Result<TaskWait, HypervisorError> {
        let deadline = Instant::now() + self.policy.task_timeout;
        loop {
            match self.call("task status", self.api.task_status(task)).await {
                Ok(TaskState::Stopped { exit_status }) if exit_status == "OK" => {
                    return Ok(TaskWait::Completed)
                }
                Ok(TaskState::Stopped { exit_status }) => {
                    return Err(HypervisorError::TaskFailed {
                        upid: task.upid.clone(),
                        exit_status,
                    })
                }
                Ok(TaskState::Running) => {}
                Err(e) => {
                    debug!(
                        upid = task.upid.as_str(),
                        error = e.to_string(),
                        "Task status poll failed"
                    );
                }
            }

            if Instant::now() >= deadline {
                warn!(
                    upid = task.upid.as_str(),
                    timeout_secs = self.policy.task_timeout.as_secs(),
                    "Task still running after timeout, continuing"
                );
                return Ok(TaskWait::TimedOut);
            }
            sleep(self.policy.poll_interval).await;
        }
    }

    /// Polls the VM config until its lock clears. Returns false on timeout.
    pub async fn wait_unlocked(&self, vm: &VmRef) -> bool {
        let deadline = Instant::now() + self.policy.unlock_timeout;
        loop {
            match self.call("vm config", self.api.vm_config(vm)).await {
                Ok(config) if !config.is_locked() => return true,
                Ok(config) => {
                    let lock = config.lock.as_deref().unwrap_or_default();
                    debug!(vm = %vm, lock, "VM still locked");
                }
                Err(e) => {
                    debug!(vm = %vm, error = e.to_string(), "Config poll failed");
                }
            }

            if Instant::now() >= deadline {
                warn!(vm = %vm, "VM still locked after timeout, continuing");
                return false;
            }
            sleep(self.policy.poll_interval).await;
        }
    }

    /// Submits a task-producing call under the lock retry and waits for the
    /// task. Returns the number of attempts used.
    async fn run_task<F, Fut>(&self, label: &str, submit: F) -> Result<u32, HypervisorError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<TaskHandle, HypervisorError>>,
    {
        let submit = &submit;
        self.retry
            .run(label, |_| async move {
                let task = self.call(label, submit()).await?;
                self.wait_task(&task).await?;
                Ok(())
            })
            .await
            .map(|((), attempts)| attempts)
            .map_err(|failure| failure.error)
    }

    /// Whether the source's boot disk sits on storage that can back a linked clone.
    /// Any lookup failure answers no, which turns the clone into a full one.
    pub async fn linked_clone_supported(&self, source: &VmRef) -> bool {
        let config = match self.call("vm config", self.api.vm_config(source)).await {
            Ok(config) => config,
            Err(e) => {
                warn!(source = %source, error = e.to_string(), "Cannot read source config");
                return false;
            }
        };
        let Some(disk) = config.boot_disk() else {
            return false;
        };
        let Some(storage) = disk.storage() else {
            return false;
        };

        match self
            .call("storage status", self.api.storage_info(&source.node, storage))
            .await
        {
            Ok(info) => info.supports_linked_clone(disk.format()),
            Err(e) => {
                warn!(
                    source = %source,
                    storage,
                    error = e.to_string(),
                    "Cannot read storage status"
                );
                false
            }
        }
    }

    pub async fn clone_vm(&self, request: &CloneRequest) -> CloneOutcome {
        let mut full = request.full;
        if !full && !self.linked_clone_supported(&request.source).await {
            info!(
                source = %request.source,
                name = request.name.as_str(),
                "Storage cannot hold linked clones, using a full clone"
            );
            full = true;
        }

        let spec = CloneSpec {
            source: request.source.clone(),
            newid: request.target_vmid,
            name: request.name.clone(),
            target_node: request.target_node.clone(),
            full,
            storage: request.storage.clone(),
        };
        info!(
            source = %spec.source,
            vmid = spec.newid,
            node = spec.target_node.as_str(),
            name = spec.name.as_str(),
            full,
            "Cloning VM"
        );

        let spec = &spec;
        let result = self
            .retry
            .run("clone", |_| async move {
                let task = self.call("clone", self.api.clone_vm(spec)).await?;
                if request.wait {
                    self.wait_task(&task).await?;
                }
                Ok(())
            })
            .await;

        let attempts = match result {
            Ok(((), attempts)) => attempts,
            Err(failure) => {
                warn!(
                    name = request.name.as_str(),
                    attempts = failure.attempts,
                    error = failure.error.to_string(),
                    "Clone failed"
                );
                return CloneOutcome::failed(
                    &request.target_node,
                    &request.name,
                    failure.attempts,
                    failure.error.to_string(),
                );
            }
        };

        let vm = VmRef::new(request.target_vmid, request.target_node.clone());
        if request.wait {
            self.wait_unlocked(&vm).await;
        }

        let mut message = if full {
            "Full clone created"
        } else {
            "Linked clone created"
        }
        .to_string();
        if let Some(snapshot) = &request.baseline_snapshot {
            if let Err(e) = self.snapshot(&vm, snapshot).await {
                warn!(
                    vm = %vm,
                    snapshot = snapshot.as_str(),
                    error = e.to_string(),
                    "Baseline snapshot failed"
                );
                message.push_str(&format!(" (baseline snapshot failed: {})", e));
            }
        }

        CloneOutcome::succeeded(
            request.target_vmid,
            &request.target_node,
            &request.name,
            attempts,
            message,
        )
    }

    pub async fn convert_to_template(&self, vm: &VmRef) -> Result<(), HypervisorError> {
        self.retry
            .run("convert", |_| async move {
                if let Some(task) = self.call("convert", self.api.convert_to_template(vm)).await? {
                    self.wait_task(&task).await?;
                }
                Ok(())
            })
            .await
            .map_err(|failure| failure.error)?;
        self.wait_unlocked(vm).await;
        info!(vm = %vm, "Converted to template");
        Ok(())
    }

    /// Destroys a VM. A VM that is already gone counts as deleted.
    pub async fn delete_vm(&self, vm: &VmRef) -> Result<(), HypervisorError> {
        match self.run_task("delete", || self.api.delete_vm(vm)).await {
            Ok(_) => {
                info!(vm = %vm, "VM deleted");
                Ok(())
            }
            Err(HypervisorError::NotFound(message)) => {
                debug!(vm = %vm, message, "VM already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn stop_vm(&self, vm: &VmRef) -> Result<(), HypervisorError> {
        self.run_task("stop", || self.api.stop_vm(vm)).await.map(|_| ())
    }

    pub async fn start_vm(&self, vm: &VmRef) -> Result<(), HypervisorError> {
        self.run_task("start", || self.api.start_vm(vm)).await.map(|_| ())
    }

    pub async fn snapshot(&self, vm: &VmRef, name: &str) -> Result<(), HypervisorError> {
        self.run_task("snapshot", || self.api.create_snapshot(vm, name))
            .await
            .map(|_| ())
    }

    pub async fn rollback(&self, vm: &VmRef, name: &str) -> Result<(), HypervisorError> {
        self.run_task("rollback", || self.api.rollback_snapshot(vm, name))
            .await
            .map(|_| ())
    }

    pub async fn create_shell(
        &self,
        node: &str,
        spec: &VmShellSpec,
    ) -> Result<(), HypervisorError> {
        self.run_task("create", || self.api.create_vm_shell(node, spec))
            .await
            .map(|_| ())
    }

    pub async fn update_config(
        &self,
        vm: &VmRef,
        params: &[(String, String)],
    ) -> Result<(), HypervisorError> {
        self.retry
            .run("update config", |_| async move {
                self.call("update config", self.api.update_vm_config(vm, params)).await
            })
            .await
            .map(|((), _)| ())
            .map_err(|failure| failure.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{NodeSnapshot, SimulatedHypervisor, StorageInfo};

    fn executor(sim: Arc<SimulatedHypervisor>) -> CloneExecutor {
        CloneExecutor::new(sim, ClonePolicy::default())
    }

    fn sim_with_nfs_source() -> Arc<SimulatedHypervisor> {
        let sim = SimulatedHypervisor::new(vec![NodeSnapshot::idle("pve1", 8, 1 << 34)]);
        sim.add_storage(StorageInfo {
            storage: "nfs-share".to_string(),
            kind: "nfs".to_string(),
            shared: true,
        });
        sim.add_vm(9000, "pve1", "raw-source", "nfs-share:9000/base-9000-disk-0.raw,size=20G");
        Arc::new(sim)
    }

    #[tokio::test(start_paused = true)]
    async fn raw_on_nfs_is_not_linkable() {
        let sim = sim_with_nfs_source();
        assert!(!executor(sim).linked_clone_supported(&VmRef::new(9000, "pve1")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_source_is_not_linkable() {
        let sim = sim_with_nfs_source();
        assert!(!executor(sim).linked_clone_supported(&VmRef::new(1, "pve1")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn task_timeout_is_reported_not_raised() {
        let sim = Arc::new(SimulatedHypervisor::demo());
        sim.set_task_polls(u32::MAX);
        let exec = CloneExecutor::new(
            sim.clone(),
            ClonePolicy {
                task_timeout: Duration::from_secs(30),
                ..ClonePolicy::default()
            },
        );
        let task = sim.start_vm(&VmRef::new(9000, "pve1")).await;
        // templates cannot be started
        assert!(task.is_err());

        sim.add_vm(500, "pve1", "plain", "local-lvm:vm-500-disk-0");
        let task = sim.start_vm(&VmRef::new(500, "pve1")).await.unwrap();
        assert_eq!(exec.wait_task(&task).await.unwrap(), TaskWait::TimedOut);
    }
}
