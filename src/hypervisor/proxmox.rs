use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    ClusterVm, CloneSpec, HypervisorApi, NodeSnapshot, StorageInfo, TaskHandle, TaskState,
    VmConfig, VmRef, VmShellSpec,
};
use crate::config::HypervisorSettings;
use crate::errors::HypervisorError;

/// REST client for a Proxmox VE cluster, authenticated with an API token.
pub struct ProxmoxClient {
    base_url: String,
    auth_header: String,
    client: Client,
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct NodeListEntry {
    node: String,
    status: String,
    #[serde(default)]
    cpu: Option<f64>,
    #[serde(default)]
    maxcpu: Option<u32>,
    #[serde(default)]
    mem: Option<u64>,
    #[serde(default)]
    maxmem: Option<u64>,
}

#[derive(Deserialize)]
struct NodeStatus {
    #[serde(default)]
    wait: Option<f64>,
    #[serde(default)]
    loadavg: Option<Vec<Value>>,
}

#[derive(Deserialize)]
struct ResourceEntry {
    #[serde(default)]
    vmid: Option<u32>,
    node: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    template: Option<u8>,
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct TaskStatusEntry {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

#[derive(Deserialize)]
struct StorageStatus {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    shared: Option<u8>,
}

#[derive(Deserialize)]
struct VolumeAttributes {
    path: String,
}

fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// The template endpoint answers with a UPID on current releases and `null` on older ones.
fn task_from_data(node: &str, data: Value) -> Option<TaskHandle> {
    match data {
        Value::String(upid) if upid.starts_with("UPID:") => Some(TaskHandle {
            node: node.to_string(),
            upid,
        }),
        _ => None,
    }
}

impl ProxmoxClient {
    pub fn new(settings: &HypervisorSettings) -> Result<Self, HypervisorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .danger_accept_invalid_certs(!settings.verify_tls)
            .build()
            .map_err(|e| HypervisorError::Transport(e.to_string()))?;

        Ok(Self {
            base_url: settings.api_url.trim_end_matches('/').to_string(),
            auth_header: format!(
                "PVEAPIToken={}={}",
                settings.token_id, settings.token_secret
            ),
            client,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("Authorization", &self.auth_header)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, HypervisorError> {
        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            // Proxmox puts the human readable reason in the status line and
            // sometimes a parameter error map in the body.
            let reason = status.canonical_reason().unwrap_or_default().to_string();
            let body = response.text().await.unwrap_or_default();
            let message = if body.trim().is_empty() {
                reason
            } else {
                format!("{} {}", reason, body.trim())
            };
            if status.as_u16() == 404 {
                return Err(HypervisorError::NotFound(message));
            }
            return Err(HypervisorError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: Envelope<T> = response.json().await?;
        Ok(envelope.data)
    }

    async fn upid(
        &self,
        node: &str,
        request: RequestBuilder,
    ) -> Result<TaskHandle, HypervisorError> {
        let upid: String = self.send(request).await?;
        Ok(TaskHandle {
            node: node.to_string(),
            upid,
        })
    }

    async fn node_status(&self, node: &str) -> Result<NodeStatus, HypervisorError> {
        self.send(self.request(Method::GET, &format!("/nodes/{}/status", node)))
            .await
    }
}

#[async_trait]
impl HypervisorApi for ProxmoxClient {
    async fn list_nodes(&self) -> Result<Vec<NodeSnapshot>, HypervisorError> {
        let entries: Vec<NodeListEntry> = self.send(self.request(Method::GET, "/nodes")).await?;

        let mut snapshots = Vec::with_capacity(entries.len());
        for entry in entries {
            let online = entry.status == "online";
            let mut snapshot = NodeSnapshot {
                node: entry.node.clone(),
                online,
                mem_used: entry.mem,
                mem_total: entry.maxmem,
                cpu_pct: entry.cpu.map(|fraction| fraction * 100.0),
                iowait_pct: None,
                load_avg: None,
                cores: entry.maxcpu,
            };

            if online {
                // A node whose status endpoint misbehaves keeps worst-case telemetry.
                match self.node_status(&entry.node).await {
                    Ok(status) => {
                        snapshot.iowait_pct = status.wait.map(|fraction| fraction * 100.0);
                        snapshot.load_avg = status
                            .loadavg
                            .as_ref()
                            .and_then(|values| values.first())
                            .and_then(parse_number);
                    }
                    Err(e) => {
                        warn!(
                            node = entry.node.as_str(),
                            error = e.to_string(),
                            "Node status unavailable"
                        );
                    }
                }
            }
            snapshots.push(snapshot);
        }
        Ok(snapshots)
    }

    async fn cluster_vms(&self) -> Result<Vec<ClusterVm>, HypervisorError> {
        let entries: Vec<ResourceEntry> = self
            .send(
                self.request(Method::GET, "/cluster/resources")
                    .query(&[("type", "vm")]),
            )
            .await?;

        Ok(entries
            .into_iter()
            .filter(|e| e.kind == "qemu")
            .filter_map(|e| {
                Some(ClusterVm {
                    vmid: e.vmid?,
                    node: e.node,
                    name: e.name,
                    template: e.template == Some(1),
                    running: e.status.as_deref() == Some("running"),
                })
            })
            .collect())
    }

    async fn next_vmid(&self) -> Result<u32, HypervisorError> {
        let raw: Value = self
            .send(self.request(Method::GET, "/cluster/nextid"))
            .await?;
        parse_number(&raw)
            .map(|id| id as u32)
            .ok_or_else(|| HypervisorError::Decode(format!("unexpected nextid payload: {}", raw)))
    }

    async fn vm_config(&self, vm: &VmRef) -> Result<VmConfig, HypervisorError> {
        let raw: Value = self
            .send(self.request(
                Method::GET,
                &format!("/nodes/{}/qemu/{}/config", vm.node, vm.vmid),
            ))
            .await?;
        VmConfig::from_api(&raw)
    }

    async fn clone_vm(&self, spec: &CloneSpec) -> Result<TaskHandle, HypervisorError> {
        let mut form = vec![
            ("newid", spec.newid.to_string()),
            ("name", spec.name.clone()),
            ("target", spec.target_node.clone()),
            ("full", if spec.full { "1" } else { "0" }.to_string()),
        ];
        if let Some(storage) = &spec.storage {
            form.push(("storage", storage.clone()));
        }
        debug!(source = %spec.source, newid = spec.newid, full = spec.full, "Submitting clone");

        self.upid(
            &spec.source.node,
            self.request(
                Method::POST,
                &format!("/nodes/{}/qemu/{}/clone", spec.source.node, spec.source.vmid),
            )
            .form(&form),
        )
        .await
    }

    async fn task_status(&self, task: &TaskHandle) -> Result<TaskState, HypervisorError> {
        let entry: TaskStatusEntry = self
            .send(self.request(
                Method::GET,
                &format!("/nodes/{}/tasks/{}/status", task.node, task.upid),
            ))
            .await?;

        Ok(match entry.status.as_str() {
            "running" => TaskState::Running,
            _ => TaskState::Stopped {
                exit_status: entry.exitstatus.unwrap_or_else(|| "unknown".to_string()),
            },
        })
    }

    async fn convert_to_template(&self, vm: &VmRef) -> Result<Option<TaskHandle>, HypervisorError> {
        let data: Value = self
            .send(self.request(
                Method::POST,
                &format!("/nodes/{}/qemu/{}/template", vm.node, vm.vmid),
            ))
            .await?;
        Ok(task_from_data(&vm.node, data))
    }

    async fn delete_vm(&self, vm: &VmRef) -> Result<TaskHandle, HypervisorError> {
        self.upid(
            &vm.node,
            self.request(
                Method::DELETE,
                &format!("/nodes/{}/qemu/{}", vm.node, vm.vmid),
            )
            .query(&[("purge", "1"), ("destroy-unreferenced-disks", "1")]),
        )
        .await
    }

    async fn start_vm(&self, vm: &VmRef) -> Result<TaskHandle, HypervisorError> {
        self.upid(
            &vm.node,
            self.request(
                Method::POST,
                &format!("/nodes/{}/qemu/{}/status/start", vm.node, vm.vmid),
            ),
        )
        .await
    }

    async fn stop_vm(&self, vm: &VmRef) -> Result<TaskHandle, HypervisorError> {
        self.upid(
            &vm.node,
            self.request(
                Method::POST,
                &format!("/nodes/{}/qemu/{}/status/stop", vm.node, vm.vmid),
            ),
        )
        .await
    }

    async fn create_snapshot(&self, vm: &VmRef, name: &str) -> Result<TaskHandle, HypervisorError> {
        self.upid(
            &vm.node,
            self.request(
                Method::POST,
                &format!("/nodes/{}/qemu/{}/snapshot", vm.node, vm.vmid),
            )
            .form(&[("snapname", name), ("description", "fleet baseline")]),
        )
        .await
    }

    async fn rollback_snapshot(
        &self,
        vm: &VmRef,
        name: &str,
    ) -> Result<TaskHandle, HypervisorError> {
        self.upid(
            &vm.node,
            self.request(
                Method::POST,
                &format!("/nodes/{}/qemu/{}/snapshot/{}/rollback", vm.node, vm.vmid, name),
            ),
        )
        .await
    }

    async fn storage_info(
        &self,
        node: &str,
        storage: &str,
    ) -> Result<StorageInfo, HypervisorError> {
        let status: StorageStatus = self
            .send(self.request(
                Method::GET,
                &format!("/nodes/{}/storage/{}/status", node, storage),
            ))
            .await?;
        Ok(StorageInfo {
            storage: storage.to_string(),
            kind: status.kind,
            shared: status.shared == Some(1),
        })
    }

    async fn volume_path(&self, node: &str, volume: &str) -> Result<String, HypervisorError> {
        let storage = volume
            .split_once(':')
            .map(|(storage, _)| storage)
            .ok_or_else(|| HypervisorError::Decode(format!("volume without storage: {}", volume)))?;
        let attrs: VolumeAttributes = self
            .send(self.request(
                Method::GET,
                &format!("/nodes/{}/storage/{}/content/{}", node, storage, volume),
            ))
            .await?;
        Ok(attrs.path)
    }

    async fn create_vm_shell(
        &self,
        node: &str,
        spec: &VmShellSpec,
    ) -> Result<TaskHandle, HypervisorError> {
        let form = [
            ("vmid", spec.vmid.to_string()),
            ("name", spec.name.clone()),
            ("memory", spec.memory_mb.to_string()),
            ("cores", spec.cores.to_string()),
            ("net0", format!("virtio,bridge={}", spec.bridge)),
            ("scsihw", "virtio-scsi-pci".to_string()),
            ("ostype", "l26".to_string()),
        ];
        self.upid(
            node,
            self.request(Method::POST, &format!("/nodes/{}/qemu", node))
                .form(&form),
        )
        .await
    }

    async fn update_vm_config(
        &self,
        vm: &VmRef,
        params: &[(String, String)],
    ) -> Result<(), HypervisorError> {
        let _: Value = self
            .send(
                self.request(
                    Method::POST,
                    &format!("/nodes/{}/qemu/{}/config", vm.node, vm.vmid),
                )
                .form(params),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn template_conversion_task_is_picked_up() {
        let upid = "UPID:pve1:0000A1B2:00C3D4E5:6650F00D:qmtemplate:101:root@pam:";
        let task = task_from_data("pve1", json!(upid)).unwrap();
        assert_eq!(task.upid, upid);
        assert_eq!(task.node, "pve1");
        assert!(task_from_data("pve1", Value::Null).is_none());
    }
}
