//! `/etc/lobsterd/config.json`, the orchestrator configuration.
//!
//! Every section has serde defaults so a partial (or empty) config file is
//! valid; `lobsterd init` writes the fully-populated default.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LobsterError, LobsterResult};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LobsterdConfig {
    pub zfs: ZfsConfig,
    pub tenants: TenantsConfig,
    pub watchdog: WatchdogConfig,
    pub firecracker: FirecrackerConfig,
    pub jailer: JailerConfig,
    pub vsock: VsockConfig,
    pub caddy: CaddyConfig,
    pub openclaw: OpenclawConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ZfsConfig {
    pub pool: String,
    /// Parent dataset under which per-tenant datasets are created.
    pub parent_dataset: String,
    pub default_quota: String,
    pub compression: String,
    pub snapshot_retention: usize,
}

impl Default for ZfsConfig {
    fn default() -> Self {
        Self {
            pool: "tank".into(),
            parent_dataset: "tank/lobsterd".into(),
            default_quota: "10G".into(),
            compression: "zstd".into(),
            snapshot_retention: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TenantsConfig {
    pub uid_start: u32,
    pub gateway_port_start: u16,
    pub home_base: PathBuf,
}

impl Default for TenantsConfig {
    fn default() -> Self {
        Self {
            uid_start: 10_000,
            gateway_port_start: 9_000,
            home_base: PathBuf::from("/srv/lobsterd"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchdogConfig {
    /// Idle-loop cadence.
    pub interval_ms: u64,
    /// Traffic- and wake-loop cadence.
    pub traffic_poll_ms: u64,
    /// Sustained-idle duration before auto-suspend.
    pub idle_threshold_ms: u64,
    pub max_repair_attempts: u32,
    pub repair_cooldown_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            traffic_poll_ms: 3_000,
            idle_threshold_ms: 300_000,
            max_repair_attempts: 3,
            repair_cooldown_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FirecrackerConfig {
    pub binary_path: PathBuf,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("/usr/local/bin/firecracker"),
            kernel_path: PathBuf::from("/var/lib/lobsterd/kernels/vmlinux"),
            rootfs_path: PathBuf::from("/var/lib/lobsterd/kernels/rootfs.squashfs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JailerConfig {
    pub binary_path: PathBuf,
    pub chroot_base_dir: PathBuf,
}

impl Default for JailerConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("/usr/local/bin/jailer"),
            chroot_base_dir: PathBuf::from("/var/lib/lobsterd/jailer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VsockConfig {
    /// Guest port the in-guest agent listens on.
    pub agent_port: u32,
}

impl Default for VsockConfig {
    fn default() -> Self {
        Self {
            agent_port: vsock_rpc::DEFAULT_AGENT_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaddyConfig {
    pub admin_api: String,
    /// Tenant routes match `<name>.<domain>`.
    pub domain: String,
    /// Terminate TLS with the installed origin certs.
    pub tls: bool,
}

impl Default for CaddyConfig {
    fn default() -> Self {
        Self {
            admin_api: "http://127.0.0.1:2019".into(),
            domain: "localhost".into(),
            tls: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OpenclawConfig {
    pub install_path: PathBuf,
    /// Seed configuration injected into new guests verbatim.
    pub default_config: serde_json::Value,
    pub api_keys: HashMap<String, String>,
}

impl Default for OpenclawConfig {
    fn default() -> Self {
        Self {
            install_path: PathBuf::from("/opt/openclaw"),
            default_config: serde_json::json!({}),
            api_keys: HashMap::new(),
        }
    }
}

impl LobsterdConfig {
    /// Load the config file; missing file is a hard error (run `init` first).
    pub async fn load(path: &Path) -> LobsterResult<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            LobsterError::Config(format!(
                "read {}: {e} (run `lobsterd init` first)",
                path.display()
            ))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| LobsterError::Config(format!("parse {}: {e}", path.display())))
    }

    /// Validate paths a running orchestrator depends on.
    pub async fn validate(&self) -> LobsterResult<()> {
        for (path, label) in [
            (&self.firecracker.binary_path, "firecracker binary"),
            (&self.firecracker.kernel_path, "kernel image"),
            (&self.firecracker.rootfs_path, "rootfs image"),
            (&self.jailer.binary_path, "jailer binary"),
        ] {
            let exists = tokio::fs::try_exists(path)
                .await
                .map_err(|e| LobsterError::Config(format!("check {label}: {e}")))?;
            if !exists {
                return Err(LobsterError::Config(format!(
                    "{label} not found: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}
