/*
* Fleet manager configuration
* ---------------------------
* Layers, lowest to highest priority:
*   1. hardcoded defaults (every section implements Default)
*   2. <CONFIG_PATH>/default.toml
*   3. <CONFIG_PATH>/local.toml
*   4. APP_* environment variables, `__` between section and key
*      (APP_HYPERVISOR__API_URL, APP_FLEET__CONCURRENCY)
*
* Both files are optional, so a bare binary runs on defaults alone.
*/

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::errors::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub hypervisor: HypervisorSettings,
    pub clone: CloneSettings,
    /// Retry profile for replication and template conversion.
    pub template_clone: CloneSettings,
    pub placement: PlacementSettings,
    pub fleet: FleetSettings,
    pub overlay: OverlaySettings,
    pub progress: ProgressSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            hypervisor: HypervisorSettings::default(),
            clone: CloneSettings::default(),
            template_clone: CloneSettings::template_heavy(),
            placement: PlacementSettings::default(),
            fleet: FleetSettings::default(),
            overlay: OverlaySettings::default(),
            progress: ProgressSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub api_prefix: String,
    /// In-flight request ceiling for the HTTP front.
    pub max_concurrent_requests: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            api_prefix: "/api/v1".to_string(),
            max_concurrent_requests: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorSettings {
    pub api_url: String,
    pub token_id: String,
    pub token_secret: String,
    pub verify_tls: bool,
    pub request_timeout_secs: u64,
    /// Run against the in-memory cluster instead of a real API.
    pub simulated: bool,
}

impl Default for HypervisorSettings {
    fn default() -> Self {
        Self {
            api_url: "https://127.0.0.1:8006/api2/json".to_string(),
            token_id: "root@pam!fleet".to_string(),
            token_secret: String::new(),
            verify_tls: false,
            request_timeout_secs: 30,
            simulated: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloneSettings {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub task_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub unlock_timeout_secs: u64,
    /// Upper bound for a single hypervisor request.
    pub call_timeout_secs: u64,
}

impl Default for CloneSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 4,
            max_delay_secs: 60,
            task_timeout_secs: 900,
            poll_interval_secs: 3,
            unlock_timeout_secs: 120,
            call_timeout_secs: 60,
        }
    }
}

impl CloneSettings {
    pub fn template_heavy() -> Self {
        Self {
            max_attempts: 15,
            base_delay_secs: 10,
            ..Self::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_secs(self.base_delay_secs),
            max_delay: Duration::from_secs(self.max_delay_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementSettings {
    pub default_memory_mb: u64,
    pub default_cores: u32,
}

impl Default for PlacementSettings {
    fn default() -> Self {
        Self {
            default_memory_mb: 2048,
            default_cores: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSettings {
    /// Student operations in flight at once.
    pub concurrency: usize,
    /// Wait after each template replica before the next one is started.
    pub replication_settle_secs: u64,
    pub start_batch_size: usize,
    pub start_batch_delay_secs: u64,
    pub baseline_snapshots: bool,
    pub baseline_snapshot_name: String,
    pub default_bridge: String,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            concurrency: 10,
            replication_settle_secs: 5,
            start_batch_size: 5,
            start_batch_delay_secs: 10,
            baseline_snapshots: true,
            baseline_snapshot_name: "baseline".to_string(),
            default_bridge: "vmbr0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlaySettings {
    /// Directory-backed storage id that holds base images and overlays.
    pub storage: String,
    /// Mount point of that storage on every node.
    pub storage_path: String,
    pub qemu_img: String,
    /// Run disk-image commands on this host over ssh instead of locally.
    pub ssh_host: Option<String>,
    pub command_timeout_secs: u64,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            storage: "fleet-shared".to_string(),
            storage_path: "/mnt/pve/fleet-shared".to_string(),
            qemu_img: "qemu-img".to_string(),
            ssh_host: None,
            command_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressSettings {
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            retention_secs: 3600,
            sweep_interval_secs: 300,
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
        Self::from_dir(&config_path)
    }

    /// Reads `default` and `local` from `config_path`, then `APP_*` overrides.
    pub fn from_dir(config_path: &str) -> Result<Self, ConfigError> {
        info!("Loading configuration from path: {}", config_path);

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 3000)?
            .set_default("server.api_prefix", "/api/v1")?
            .add_source(File::with_name(&format!("{}/default", config_path)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_path)).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

pub fn generate_default_config() -> Settings {
    Settings::default()
}
