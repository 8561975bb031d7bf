//! Molt: idempotent reconciliation of live resources against the registry.
//!
//! For every declared resource the smallest recreating action is taken;
//! nothing is allocated and no rows are deleted (half-built rows from a
//! crashed spawn are the one exception: their teardown is completed).
//! Repair failures are bounded per tenant; past the bound the tenant goes
//! `degraded` and is skipped until an operator targets it explicitly.

use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{LobsterError, LobsterResult};
use crate::lifecycle::Engine;
use crate::types::{Registry, Tenant, TenantStatus};
use crate::{jailer, net, sshkey, zfs};

const AGENT_WAIT: Duration = Duration::from_secs(60);
const TERM_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoltReport {
    pub name: String,
    pub healthy: bool,
    pub actions: Vec<String>,
    pub failures: Vec<String>,
}

impl MoltReport {
    fn skipped(name: &str, reason: &str) -> Self {
        Self {
            name: name.to_owned(),
            healthy: false,
            actions: Vec::new(),
            failures: vec![reason.to_owned()],
        }
    }
}

/// Reconcile one tenant (`target = Some`) or the whole registry plus
/// orphan collection (`target = None`).
pub async fn molt(engine: &Engine, target: Option<&str>) -> LobsterResult<Vec<MoltReport>> {
    let registry = engine.store().load().await?;
    let tenants: Vec<Tenant> = match target {
        Some(name) => vec![registry
            .get(name)
            .cloned()
            .ok_or_else(|| LobsterError::TenantNotFound(name.to_owned()))?],
        None => registry.tenants.clone(),
    };

    let now_ms = chrono::Utc::now().timestamp_millis();
    let cooldown_ms = engine.config().watchdog.repair_cooldown_ms as i64;

    let mut reports = Vec::with_capacity(tenants.len());
    for tenant in &tenants {
        // Degraded tenants are only touched when the operator names them.
        if tenant.status == TenantStatus::Degraded && target.is_none() {
            reports.push(MoltReport::skipped(&tenant.name, "degraded"));
            continue;
        }

        // Space out repeated repair attempts; an explicit target bypasses
        // the cooldown.
        let cooling = target.is_none()
            && tenant.repair_attempts > 0
            && tenant
                .last_repair_at_ms
                .is_some_and(|last| now_ms - last < cooldown_ms);
        if cooling {
            reports.push(MoltReport::skipped(&tenant.name, "cooldown"));
            continue;
        }

        // A row stuck in a transitional state is a crashed spawn/evict;
        // completing the teardown is the repair.
        if matches!(
            tenant.status,
            TenantStatus::Initializing | TenantStatus::Evicting
        ) {
            let mut report = MoltReport {
                name: tenant.name.clone(),
                healthy: false,
                actions: vec!["evict-incomplete".into()],
                failures: Vec::new(),
            };
            if let Err(e) = engine.evict(&tenant.name, false).await {
                warn!(tenant = %tenant.name, error = %e, "incomplete tenant teardown failed");
                report.failures.push("evict-incomplete".into());
            } else {
                report.healthy = true;
            }
            reports.push(report);
            continue;
        }

        let report = reconcile_tenant(engine, tenant).await;
        bound_repairs(engine, tenant, &report, target.is_some()).await;
        reports.push(report);
    }

    if target.is_none() {
        collect_orphans(engine, &registry).await;
    }

    Ok(reports)
}

/// Check and repair every declared resource of one tenant.
async fn reconcile_tenant(engine: &Engine, tenant: &Tenant) -> MoltReport {
    let name = tenant.name.clone();
    let _guard = match engine.gate(&name) {
        Ok(g) => g,
        Err(_) => return MoltReport::skipped(&name, "in-flight"),
    };

    let cfg = engine.config();
    let mut actions: Vec<String> = Vec::new();
    let mut failures: Vec<String> = Vec::new();

    // Effective shape for a degraded tenant being repaired explicitly.
    let status = match tenant.status {
        TenantStatus::Degraded if tenant.suspend_info.is_some() => TenantStatus::Suspended,
        TenantStatus::Degraded => TenantStatus::Active,
        other => other,
    };

    // Dataset
    let dataset = engine.dataset(&name);
    match zfs::dataset_exists(&dataset).await {
        Ok(true) => {}
        Ok(false) => {
            let created = zfs::create_dataset(
                &dataset,
                &cfg.zfs.default_quota,
                &cfg.zfs.compression,
                &tenant.home_path,
            )
            .await;
            note(&mut actions, &mut failures, "zfs-dataset", created);
        }
        Err(e) => {
            warn!(tenant = %name, error = %e, "dataset probe failed");
            failures.push("zfs-dataset".into());
        }
    }

    // Tap + address
    match net::tap_exists(&tenant.tap_dev).await {
        Ok(true) => match net::address_assigned(&tenant.tap_dev, &tenant.ip_address).await {
            Ok(true) => {}
            Ok(false) => {
                let assigned = net::assign_address(&tenant.tap_dev, &tenant.ip_address).await;
                note(&mut actions, &mut failures, "tap-address", assigned);
            }
            Err(_) => failures.push("tap-address".into()),
        },
        Ok(false) => {
            let created = async {
                net::create_tap(&tenant.tap_dev, tenant.uid).await?;
                net::assign_address(&tenant.tap_dev, &tenant.ip_address).await
            }
            .await;
            note(&mut actions, &mut failures, "tap", created);
        }
        Err(_) => failures.push("tap".into()),
    }

    // Firewall drop
    match net::tenant_drop_present(tenant.uid).await {
        Ok(true) => {}
        Ok(false) => {
            let added = net::add_tenant_drop(tenant.uid).await;
            note(&mut actions, &mut failures, "firewall", added);
        }
        Err(_) => failures.push("firewall".into()),
    }

    // SSH keypair
    match sshkey::generate(&engine.host_paths().ssh_dir(), &name).await {
        Ok(pubkey) if pubkey != tenant.ssh_public_key => {
            let name = name.clone();
            let persisted = engine
                .store()
                .mutate(move |r| {
                    if let Some(t) = r.get_mut(&name) {
                        t.ssh_public_key = pubkey;
                    }
                    Ok(())
                })
                .await;
            note(&mut actions, &mut failures, "ssh-key", persisted);
        }
        Ok(_) => {}
        Err(_) => failures.push("ssh-key".into()),
    }

    // Chroot (needed by running VMs and for the next resume alike)
    if !jailer::chroot_prepared(cfg, tenant).await {
        let prepared = jailer::prepare_chroot(cfg, engine.host_paths(), tenant).await;
        note(&mut actions, &mut failures, "chroot", prepared);
    }

    match status {
        TenantStatus::Active => {
            let alive = tenant.vm_pid.is_some_and(jailer::is_alive);
            if !alive {
                let relaunched = relaunch_vm(engine, tenant).await;
                note(&mut actions, &mut failures, "vm-process", relaunched);
            } else if engine
                .agent_client(tenant)
                .health_ping()
                .await
                .is_err()
            {
                // Process up but agent gone: restart the VM.
                let restarted = async {
                    if let Some(pid) = tenant.vm_pid {
                        jailer::terminate(pid, TERM_GRACE).await?;
                    }
                    relaunch_vm(engine, tenant).await
                }
                .await;
                note(&mut actions, &mut failures, "agent-restart", restarted);
            }

            match engine.proxy().has_route(&name).await {
                Ok(true) => {}
                Ok(false) => {
                    let added = engine
                        .proxy()
                        .add_route(&name, &engine.route_host(&name), tenant.gateway_port)
                        .await;
                    note(&mut actions, &mut failures, "proxy-route", added);
                }
                Err(_) => failures.push("proxy-route".into()),
            }
        }
        TenantStatus::Suspended => {
            // Suspended tenants must hold no route and no pid.
            if let Ok(true) = engine.proxy().has_route(&name).await {
                let removed = engine.proxy().remove_route(&name).await;
                note(&mut actions, &mut failures, "proxy-route-removed", removed);
            }
            if tenant.vm_pid.is_some() {
                let name = name.clone();
                let cleared = engine
                    .store()
                    .mutate(move |r| {
                        if let Some(t) = r.get_mut(&name) {
                            t.vm_pid = None;
                        }
                        Ok(())
                    })
                    .await;
                note(&mut actions, &mut failures, "suspend-pid-cleared", cleared);
            }
        }
        _ => {}
    }

    MoltReport {
        healthy: failures.is_empty(),
        name,
        actions,
        failures,
    }
}

fn note<T>(
    actions: &mut Vec<String>,
    failures: &mut Vec<String>,
    kind: &str,
    result: LobsterResult<T>,
) {
    match result {
        Ok(_) => actions.push(kind.to_owned()),
        Err(e) => {
            warn!(kind, error = %e, "repair failed");
            failures.push(kind.to_owned());
        }
    }
}

/// Bring a dead VM back for an active tenant and persist the new pid.
async fn relaunch_vm(engine: &Engine, tenant: &Tenant) -> LobsterResult<u32> {
    let cfg = engine.config();
    jailer::prepare_chroot(cfg, engine.host_paths(), tenant).await?;
    let pid = jailer::launch(cfg, tenant).await?;

    let client = engine.agent_client(tenant);
    if let Err(e) = client.wait_for_agent(AGENT_WAIT).await {
        let _ = jailer::terminate(pid, TERM_GRACE).await;
        return Err(e.into());
    }
    client
        .inject_secrets(&engine.secrets_payload(tenant))
        .await?;
    client.launch_openclaw().await?;

    let name = tenant.name.clone();
    engine
        .store()
        .mutate(move |r| {
            if let Some(t) = r.get_mut(&name) {
                t.vm_pid = Some(pid);
            }
            Ok(())
        })
        .await?;
    Ok(pid)
}

/// Advance or reset the tenant's repair counter; cross the bound and the
/// tenant goes degraded.
async fn bound_repairs(engine: &Engine, tenant: &Tenant, report: &MoltReport, targeted: bool) {
    let max = engine.config().watchdog.max_repair_attempts;
    let name = tenant.name.clone();
    let clean = report.failures.is_empty();
    let was_degraded = tenant.status == TenantStatus::Degraded;
    let suspended = tenant.suspend_info.is_some();

    let result = engine
        .store()
        .mutate(move |r| {
            let Some(t) = r.get_mut(&name) else {
                return Ok(());
            };
            if clean {
                t.repair_attempts = 0;
                t.last_repair_at_ms = None;
                if was_degraded && targeted {
                    t.status = if suspended {
                        TenantStatus::Suspended
                    } else {
                        TenantStatus::Active
                    };
                    info!(tenant = %t.name, status = %t.status, "degraded tenant cleared");
                }
            } else {
                t.repair_attempts += 1;
                t.last_repair_at_ms = Some(chrono::Utc::now().timestamp_millis());
                if t.repair_attempts > max && t.status != TenantStatus::Degraded {
                    t.status = TenantStatus::Degraded;
                    warn!(tenant = %t.name, attempts = t.repair_attempts, "tenant degraded");
                }
            }
            Ok(())
        })
        .await;
    if let Err(e) = result {
        warn!(tenant = %tenant.name, error = %e, "repair bookkeeping failed");
    }
}

/// Destroy live resources with no registry row: taps, proxy routes, child
/// datasets, jail directories, overlay images.
async fn collect_orphans(engine: &Engine, registry: &Registry) {
    let names: HashSet<&str> = registry.tenants.iter().map(|t| t.name.as_str()).collect();
    let taps: HashSet<&str> = registry.tenants.iter().map(|t| t.tap_dev.as_str()).collect();

    if let Ok(live_taps) = net::list_tenant_taps().await {
        for tap in live_taps {
            if !taps.contains(tap.as_str()) {
                info!(tap = %tap, "collecting orphan tap");
                if let Err(e) = net::delete_tap(&tap).await {
                    warn!(tap = %tap, error = %e, "orphan tap cleanup failed");
                }
            }
        }
    }

    if let Ok(routes) = engine.proxy().list_routes().await {
        for route in routes {
            if !names.contains(route.as_str()) {
                info!(tenant = %route, "collecting orphan proxy route");
                if let Err(e) = engine.proxy().remove_route(&route).await {
                    warn!(tenant = %route, error = %e, "orphan route cleanup failed");
                }
            }
        }
    }

    let parent = &engine.config().zfs.parent_dataset;
    if let Ok(children) = zfs::list_children(parent).await {
        for child in children {
            if !names.contains(child.as_str()) {
                let dataset = format!("{parent}/{child}");
                info!(dataset = %dataset, "collecting orphan dataset");
                if let Err(e) = zfs::destroy_dataset(&dataset).await {
                    warn!(dataset = %dataset, error = %e, "orphan dataset cleanup failed");
                }
            }
        }
    }

    let jail_base = engine.config().jailer.chroot_base_dir.join("firecracker");
    if let Ok(mut entries) = tokio::fs::read_dir(&jail_base).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let id = entry.file_name().to_string_lossy().into_owned();
            if !names.contains(id.as_str()) {
                info!(vm_id = %id, "collecting orphan jail");
                if let Err(e) =
                    jailer::cleanup_chroot(&engine.config().jailer.chroot_base_dir, &id).await
                {
                    warn!(vm_id = %id, error = %e, "orphan jail cleanup failed");
                }
            }
        }
    }

    if let Ok(mut entries) = tokio::fs::read_dir(engine.host_paths().overlays_dir()).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let file = entry.file_name().to_string_lossy().into_owned();
            let Some(owner) = file.strip_suffix(".ext4") else {
                continue;
            };
            if !names.contains(owner) {
                info!(overlay = %file, "collecting orphan overlay");
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    warn!(overlay = %file, error = %e, "orphan overlay cleanup failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_serializes_to_spec_shape() {
        let r = MoltReport {
            name: "alice".into(),
            healthy: true,
            actions: vec!["proxy-route".into()],
            failures: vec![],
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["name"], "alice");
        assert_eq!(v["healthy"], true);
        assert_eq!(v["actions"][0], "proxy-route");
        assert!(v["failures"].as_array().unwrap().is_empty());
    }

    #[test]
    fn skipped_report_is_unhealthy() {
        let r = MoltReport::skipped("bob", "degraded");
        assert!(!r.healthy);
        assert_eq!(r.failures, vec!["degraded".to_string()]);
        assert!(r.actions.is_empty());
    }

    #[test]
    fn note_splits_outcomes() {
        let mut actions = Vec::new();
        let mut failures = Vec::new();
        note(&mut actions, &mut failures, "tap", Ok::<_, LobsterError>(()));
        note(
            &mut actions,
            &mut failures,
            "firewall",
            Err::<(), _>(LobsterError::FirewallError("x".into())),
        );
        assert_eq!(actions, vec!["tap".to_string()]);
        assert_eq!(failures, vec!["firewall".to_string()]);
    }
}
