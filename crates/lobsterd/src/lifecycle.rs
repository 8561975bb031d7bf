//! Tenant lifecycle engine: composes the drivers into `spawn`, `evict`,
//! `suspend`, `resume`, and `snap`.
//!
//! Ordering rules: the registry row is written first on create (allocations
//! survive a crash) and removed last on delete (orphan cleanup stays
//! possible). Per-tenant operations are serialized by the in-flight gate;
//! a second concurrent operation fails with `OperationInFlight`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};
use vsock_rpc::AgentClient;

use crate::config::LobsterdConfig;
use crate::error::{LobsterError, LobsterResult};
use crate::paths::{self, HostPaths};
use crate::proxy::{CaddyDriver, ProxyDriver};
use crate::registry::RegistryStore;
use crate::types::{SuspendInfo, Tenant, TenantStatus};
use crate::{jailer, net, sshkey, zfs};

/// Bounded poll for the in-guest agent after VM launch.
const AGENT_WAIT: Duration = Duration::from_secs(60);

/// How long a VM gets to exit after an acknowledged vsock shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// SIGTERM-to-SIGKILL escalation window.
const TERM_GRACE: Duration = Duration::from_secs(10);

/// Spawn progress, reported step by step so the CLI can narrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnStep {
    Reserve,
    Dataset,
    Network,
    SshKey,
    Chroot,
    Launch,
    AgentWait,
    Secrets,
    Route,
    Activate,
}

impl std::fmt::Display for SpawnStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Reserve => "reserving allocations",
            Self::Dataset => "creating zfs dataset",
            Self::Network => "creating tap and firewall rules",
            Self::SshKey => "generating ssh keypair",
            Self::Chroot => "preparing jailer chroot",
            Self::Launch => "launching firecracker",
            Self::AgentWait => "waiting for in-guest agent",
            Self::Secrets => "injecting secrets",
            Self::Route => "adding proxy route",
            Self::Activate => "marking active",
        };
        f.write_str(s)
    }
}

pub type Progress<'a> = &'a (dyn Fn(SpawnStep) + Send + Sync);

/// No-op progress sink.
pub fn quiet() -> impl Fn(SpawnStep) + Send + Sync {
    |_| {}
}

#[derive(Debug, Clone)]
pub struct SnapResult {
    pub tag: String,
    pub pruned: Vec<String>,
}

/// Releases the tenant's in-flight slot on drop.
pub struct OpGuard {
    name: String,
    set: Arc<Mutex<HashSet<String>>>,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.name);
        }
    }
}

pub struct Engine {
    cfg: LobsterdConfig,
    paths: HostPaths,
    store: RegistryStore,
    proxy: Box<dyn ProxyDriver>,
    inflight: Arc<Mutex<HashSet<String>>>,
}

impl Engine {
    pub fn new(cfg: LobsterdConfig, paths: HostPaths) -> LobsterResult<Self> {
        let proxy = Box::new(CaddyDriver::new(&cfg.caddy.admin_api, cfg.caddy.tls)?);
        Ok(Self::with_proxy(cfg, paths, proxy))
    }

    /// Construct with an explicit proxy backend (tests, nginx variant).
    pub fn with_proxy(cfg: LobsterdConfig, paths: HostPaths, proxy: Box<dyn ProxyDriver>) -> Self {
        let store = RegistryStore::new(
            paths.registry_file(),
            paths.registry_lock(),
            cfg.tenants.uid_start,
            cfg.tenants.gateway_port_start,
        );
        Self {
            cfg,
            paths,
            store,
            proxy,
            inflight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &LobsterdConfig {
        &self.cfg
    }

    pub fn host_paths(&self) -> &HostPaths {
        &self.paths
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    pub fn proxy(&self) -> &dyn ProxyDriver {
        self.proxy.as_ref()
    }

    /// Tenant dataset under the configured parent.
    pub fn dataset(&self, name: &str) -> String {
        format!("{}/{name}", self.cfg.zfs.parent_dataset)
    }

    /// Route host for a tenant: `<name>.<domain>`.
    pub fn route_host(&self, name: &str) -> String {
        format!("{name}.{}", self.cfg.caddy.domain)
    }

    pub fn agent_client(&self, tenant: &Tenant) -> AgentClient {
        AgentClient::new(
            paths::vsock_uds(&self.cfg.jailer.chroot_base_dir, &tenant.vm_id),
            self.cfg.vsock.agent_port,
            &tenant.agent_token,
        )
    }

    pub fn is_busy(&self, name: &str) -> bool {
        self.inflight
            .lock()
            .map(|set| set.contains(name))
            .unwrap_or(false)
    }

    /// Claim the tenant's in-flight slot.
    pub fn gate(&self, name: &str) -> LobsterResult<OpGuard> {
        let mut set = self
            .inflight
            .lock()
            .map_err(|_| LobsterError::OperationInFlight(name.to_owned()))?;
        if !set.insert(name.to_owned()) {
            return Err(LobsterError::OperationInFlight(name.to_owned()));
        }
        Ok(OpGuard {
            name: name.to_owned(),
            set: Arc::clone(&self.inflight),
        })
    }

    async fn load_tenant(&self, name: &str) -> LobsterResult<Tenant> {
        self.store
            .load()
            .await?
            .get(name)
            .cloned()
            .ok_or_else(|| LobsterError::TenantNotFound(name.to_owned()))
    }

    // -----------------------------------------------------------------------
    // spawn
    // -----------------------------------------------------------------------

    /// Create a tenant end-to-end. Any failure after the allocation rolls
    /// back with a best-effort evict and surfaces the original error.
    pub async fn spawn(&self, name: &str, progress: Progress<'_>) -> LobsterResult<Tenant> {
        let _guard = self.gate(name)?;

        progress(SpawnStep::Reserve);
        let uid_start = self.cfg.tenants.uid_start;
        let home_base = self.cfg.tenants.home_base.clone();
        let tenant = self
            .store
            .mutate(|r| r.allocate(name, uid_start, &home_base, None))
            .await?;

        match self.provision(tenant, progress).await {
            Ok(active) => {
                info!(tenant = name, uid = active.uid, "tenant spawned");
                Ok(active)
            }
            Err(e) => {
                warn!(tenant = name, error = %e, "spawn failed, rolling back");
                if let Err(rollback) = self.evict_inner(name, false).await {
                    warn!(tenant = name, error = %rollback, "rollback incomplete");
                }
                Err(e)
            }
        }
    }

    async fn provision(&self, mut tenant: Tenant, progress: Progress<'_>) -> LobsterResult<Tenant> {
        let cfg = &self.cfg;
        let name = tenant.name.clone();

        progress(SpawnStep::Dataset);
        zfs::create_dataset(
            &self.dataset(&name),
            &cfg.zfs.default_quota,
            &cfg.zfs.compression,
            &tenant.home_path,
        )
        .await?;

        progress(SpawnStep::Network);
        net::create_tap(&tenant.tap_dev, tenant.uid).await?;
        net::assign_address(&tenant.tap_dev, &tenant.ip_address).await?;
        net::add_tenant_drop(tenant.uid).await?;

        progress(SpawnStep::SshKey);
        tenant.ssh_public_key = sshkey::generate(&self.paths.ssh_dir(), &name).await?;

        progress(SpawnStep::Chroot);
        jailer::prepare_chroot(cfg, &self.paths, &tenant).await?;

        progress(SpawnStep::Launch);
        tenant.vm_pid = Some(jailer::launch(cfg, &tenant).await?);

        progress(SpawnStep::AgentWait);
        let client = self.agent_client(&tenant);
        client.wait_for_agent(AGENT_WAIT).await?;

        progress(SpawnStep::Secrets);
        client.inject_secrets(&self.secrets_payload(&tenant)).await?;
        client.launch_openclaw().await?;

        progress(SpawnStep::Route);
        self.proxy
            .add_route(&name, &self.route_host(&name), tenant.gateway_port)
            .await?;

        progress(SpawnStep::Activate);
        let vm_pid = tenant.vm_pid;
        let ssh_public_key = tenant.ssh_public_key.clone();
        self.store
            .mutate(move |r| {
                let row = r
                    .get_mut(&name)
                    .ok_or_else(|| LobsterError::TenantNotFound(name.clone()))?;
                row.vm_pid = vm_pid;
                row.ssh_public_key = ssh_public_key;
                row.status = TenantStatus::Active;
                Ok(row.clone())
            })
            .await
    }

    /// Seed material pushed into a freshly booted guest.
    pub(crate) fn secrets_payload(&self, tenant: &Tenant) -> Value {
        json!({
            "openclaw": self.cfg.openclaw.default_config,
            "apiKeys": self.cfg.openclaw.api_keys,
            "installPath": self.cfg.openclaw.install_path,
            "gatewayPort": tenant.gateway_port,
            "sshPublicKey": tenant.ssh_public_key,
        })
    }

    // -----------------------------------------------------------------------
    // evict
    // -----------------------------------------------------------------------

    /// Tear a tenant down in reverse creation order. Missing resources are
    /// not errors; genuine failures are collected, the row is still removed
    /// (orphans are the reconciler's problem), and the first failure is
    /// returned.
    pub async fn evict(&self, name: &str, final_snapshot: bool) -> LobsterResult<()> {
        let _guard = self.gate(name)?;
        self.evict_inner(name, final_snapshot).await
    }

    async fn evict_inner(&self, name: &str, final_snapshot: bool) -> LobsterResult<()> {
        let tenant = self.load_tenant(name).await?;
        self.store
            .mutate(|r| {
                if let Some(t) = r.get_mut(name) {
                    t.status = TenantStatus::Evicting;
                }
                Ok(())
            })
            .await?;

        let mut first_failure: Option<LobsterError> = None;
        let mut record = |step: &str, result: LobsterResult<()>| {
            if let Err(e) = result {
                warn!(tenant = name, step, error = %e, "evict step failed");
                first_failure.get_or_insert(e);
            }
        };

        record("proxy-route", self.proxy.remove_route(name).await);

        if let Some(pid) = tenant.vm_pid {
            if self.agent_client(&tenant).shutdown().await {
                jailer::wait_exit(pid, SHUTDOWN_GRACE).await;
            }
            record("vm-process", jailer::terminate(pid, TERM_GRACE).await);
        }

        record("firewall", net::remove_tenant_drop(tenant.uid).await);
        record("tap", net::delete_tap(&tenant.tap_dev).await);
        record(
            "chroot",
            jailer::cleanup_chroot(&self.cfg.jailer.chroot_base_dir, &tenant.vm_id).await,
        );

        let dataset = self.dataset(name);
        if final_snapshot {
            record("final-snapshot", zfs::snapshot(&dataset, &snapshot_tag("evict")).await);
        }
        record("dataset", zfs::destroy_dataset(&dataset).await);

        record("overlay", remove_if_present(&self.paths.overlay_image(name)).await);
        record("ssh-keys", sshkey::remove(&self.paths.ssh_dir(), name).await);

        self.store
            .mutate(|r| {
                r.remove(name);
                Ok(())
            })
            .await?;

        info!(tenant = name, "tenant evicted");
        match first_failure {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // suspend / resume
    // -----------------------------------------------------------------------

    /// Stop an idle tenant's VM while keeping its identity and routing
    /// intent. Memory footprint collapses to disk.
    pub async fn suspend(&self, name: &str) -> LobsterResult<Tenant> {
        let _guard = self.gate(name)?;
        let tenant = self.load_tenant(name).await?;
        if tenant.status == TenantStatus::Degraded {
            return Err(LobsterError::RepairExceeded(name.to_owned()));
        }
        if tenant.status != TenantStatus::Active {
            return Err(LobsterError::ValidationFailed(format!(
                "suspend requires an active tenant, {name} is {}",
                tenant.status
            )));
        }

        let last_rx_bytes = net::read_rx_bytes(&tenant.tap_dev).await.unwrap_or(0);

        if let Some(pid) = tenant.vm_pid {
            if self.agent_client(&tenant).shutdown().await {
                jailer::wait_exit(pid, SHUTDOWN_GRACE).await;
            }
            jailer::terminate(pid, TERM_GRACE).await?;
        }

        let next_wake_at_ms = next_wake_ms(tenant.wake_schedule.as_deref())?;
        self.proxy.remove_route(name).await?;

        let updated = self
            .store
            .mutate(|r| {
                let row = r
                    .get_mut(name)
                    .ok_or_else(|| LobsterError::TenantNotFound(name.to_owned()))?;
                row.status = TenantStatus::Suspended;
                row.vm_pid = None;
                row.suspend_info = Some(SuspendInfo {
                    last_rx_bytes,
                    next_wake_at_ms,
                    suspended_at_ms: Utc::now().timestamp_millis(),
                });
                Ok(row.clone())
            })
            .await?;

        info!(tenant = name, next_wake_at_ms, "tenant suspended");
        Ok(updated)
    }

    /// Relaunch a suspended tenant's VM and reinstate its route.
    pub async fn resume(&self, name: &str) -> LobsterResult<Tenant> {
        let _guard = self.gate(name)?;
        let mut tenant = self.load_tenant(name).await?;
        if tenant.status == TenantStatus::Degraded {
            return Err(LobsterError::RepairExceeded(name.to_owned()));
        }
        if tenant.status != TenantStatus::Suspended {
            return Err(LobsterError::ValidationFailed(format!(
                "resume requires a suspended tenant, {name} is {}",
                tenant.status
            )));
        }

        jailer::prepare_chroot(&self.cfg, &self.paths, &tenant).await?;
        let pid = jailer::launch(&self.cfg, &tenant).await?;
        tenant.vm_pid = Some(pid);

        let client = self.agent_client(&tenant);
        if let Err(e) = client.wait_for_agent(AGENT_WAIT).await {
            let _ = jailer::terminate(pid, TERM_GRACE).await;
            return Err(e.into());
        }
        client.inject_secrets(&self.secrets_payload(&tenant)).await?;
        client.launch_openclaw().await?;

        self.proxy
            .add_route(name, &self.route_host(name), tenant.gateway_port)
            .await?;

        let updated = self
            .store
            .mutate(|r| {
                let row = r
                    .get_mut(name)
                    .ok_or_else(|| LobsterError::TenantNotFound(name.to_owned()))?;
                row.status = TenantStatus::Active;
                row.vm_pid = Some(pid);
                row.suspend_info = None;
                Ok(row.clone())
            })
            .await?;

        info!(tenant = name, pid, "tenant resumed");
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // snap
    // -----------------------------------------------------------------------

    pub async fn snap(&self, name: &str, prune: bool) -> LobsterResult<SnapResult> {
        let _guard = self.gate(name)?;
        self.load_tenant(name).await?;

        let dataset = self.dataset(name);
        let tag = snapshot_tag("snap");
        zfs::snapshot(&dataset, &tag).await?;

        let pruned = if prune {
            zfs::prune_snapshots(&dataset, self.cfg.zfs.snapshot_retention).await?
        } else {
            Vec::new()
        };
        Ok(SnapResult { tag, pruned })
    }
}

/// ISO-stamped snapshot tag, e.g. `lobster-snap-2026-08-02T10:30:00Z`.
fn snapshot_tag(kind: &str) -> String {
    format!(
        "lobster-{kind}-{}",
        Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
    )
}

/// Next wake instant from a cron expression, in epoch milliseconds.
pub fn next_wake_ms(schedule: Option<&str>) -> LobsterResult<Option<i64>> {
    let Some(expr) = schedule else {
        return Ok(None);
    };
    let cron = croner::Cron::new(expr).parse().map_err(|e| {
        LobsterError::ValidationFailed(format!("wake schedule {expr:?}: {e}"))
    })?;
    let next = cron
        .find_next_occurrence(&Utc::now(), false)
        .map_err(|e| LobsterError::ValidationFailed(format!("wake schedule {expr:?}: {e}")))?;
    Ok(Some(next.timestamp_millis()))
}

async fn remove_if_present(path: &std::path::Path) -> LobsterResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
