//! CLI command handlers. Each returns a process exit code; `main` prints a
//! single error line for failures.

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use crate::config::LobsterdConfig;
use crate::error::{LobsterError, LobsterResult};
use crate::exec::{self, ExecOpts};
use crate::lifecycle::Engine;
use crate::paths::HostPaths;
use crate::types::{Tenant, TenantStatus};
use crate::watchdog::Watchdog;
use crate::{init, jailer, molt, sshkey};

/// Hold lease covering an operator logs/exec session.
const SESSION_HOLD_TTL: Duration = Duration::from_secs(300);

const SSH_EXEC_TIMEOUT: Duration = Duration::from_secs(300);

async fn build_engine() -> LobsterResult<Engine> {
    let paths = HostPaths::default();
    let cfg = LobsterdConfig::load(&paths.config_file()).await?;
    Engine::new(cfg, paths)
}

pub async fn run_init() -> LobsterResult<ExitCode> {
    let paths = HostPaths::default();
    let report = init::run(&paths).await?;
    for check in &report.checks {
        let mark = if check.ok { "ok" } else { "!!" };
        println!("  [{mark}] {:<14} {}", check.name, check.detail);
    }
    if report.config_written {
        println!("wrote {}", paths.config_file().display());
    }
    if report.registry_written {
        println!("wrote {}", paths.registry_file().display());
    }
    if report.certs_installed {
        println!("installed origin certs");
    }
    println!("host ready");
    Ok(ExitCode::SUCCESS)
}

pub async fn run_spawn(name: &str) -> LobsterResult<ExitCode> {
    let engine = build_engine().await?;
    let tenant = engine
        .spawn(name, &|step| println!("  -> {step}"))
        .await?;
    println!(
        "spawned {} (uid {}, cid {}, port {}, {} -> {})",
        tenant.name,
        tenant.uid,
        tenant.cid,
        tenant.gateway_port,
        engine.route_host(&tenant.name),
        tenant.ip_address,
    );
    Ok(ExitCode::SUCCESS)
}

pub async fn run_evict(name: &str, yes: bool) -> LobsterResult<ExitCode> {
    if !yes && !confirm(&format!("evict tenant {name} and destroy its data?"))? {
        println!("aborted");
        return Ok(ExitCode::FAILURE);
    }
    let engine = build_engine().await?;
    engine.evict(name, false).await?;
    println!("evicted {name}");
    Ok(ExitCode::SUCCESS)
}

pub async fn run_molt(name: Option<&str>, json: bool) -> LobsterResult<ExitCode> {
    let inner = async {
        let engine = build_engine().await?;
        molt::molt(&engine, name).await
    };
    let reports = match inner.await {
        Ok(reports) => reports,
        Err(e) if json => {
            println!("{}", e.to_json());
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&reports).unwrap_or_default());
    } else {
        for r in &reports {
            let state = if r.healthy { "healthy" } else { "unhealthy" };
            print!("{}: {state}", r.name);
            if !r.actions.is_empty() {
                print!(" repaired=[{}]", r.actions.join(", "));
            }
            if !r.failures.is_empty() {
                print!(" failed=[{}]", r.failures.join(", "));
            }
            println!();
        }
        if reports.is_empty() {
            println!("no tenants");
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn run_list(json: bool) -> LobsterResult<ExitCode> {
    let inner = async {
        let engine = build_engine().await?;
        let registry = engine.store().load().await?;
        let mut rows = Vec::with_capacity(registry.tenants.len());
        for tenant in &registry.tenants {
            let probe = probe_tenant(&engine, tenant).await;
            rows.push((tenant.clone(), probe));
        }
        Ok::<_, LobsterError>(rows)
    };
    let rows = match inner.await {
        Ok(rows) => rows,
        Err(e) if json => {
            println!("{}", e.to_json());
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e),
    };

    if json {
        let items: Vec<serde_json::Value> = rows
            .iter()
            .map(|(t, probe)| {
                let mut v = serde_json::to_value(t).unwrap_or_else(|_| json!({}));
                v["probe"] = json!(probe);
                v
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items).unwrap_or_default());
    } else if rows.is_empty() {
        println!("no tenants");
    } else {
        println!(
            "{:<12} {:<7} {:<5} {:<6} {:<14} {:<12} {}",
            "NAME", "UID", "CID", "PORT", "ADDRESS", "STATUS", "PROBE"
        );
        for (t, probe) in &rows {
            println!(
                "{:<12} {:<7} {:<5} {:<6} {:<14} {:<12} {probe}",
                t.name, t.uid, t.cid, t.gateway_port, t.ip_address, t.status.to_string(),
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Liveness probe for `list`; never fails the command.
async fn probe_tenant(engine: &Engine, tenant: &Tenant) -> &'static str {
    match tenant.status {
        TenantStatus::Active => {
            let alive = tenant.vm_pid.is_some_and(jailer::is_alive);
            if !alive {
                return "dead";
            }
            match engine.agent_client(tenant).health_ping().await {
                Ok(()) => "alive",
                Err(_) => "unknown",
            }
        }
        _ => "-",
    }
}

pub async fn run_snap(name: &str, prune: bool) -> LobsterResult<ExitCode> {
    let engine = build_engine().await?;
    let result = engine.snap(name, prune).await?;
    println!("created {}@{}", engine.dataset(name), result.tag);
    for tag in &result.pruned {
        println!("pruned  {}@{tag}", engine.dataset(name));
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn run_watch(daemon: bool) -> LobsterResult<ExitCode> {
    let engine = Arc::new(build_engine().await?);
    let watchdog = Watchdog::start(engine);
    let mut events = watchdog.subscribe();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(|e| LobsterError::Config(format!("signal handler: {e}")))?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if !daemon {
                        if let Ok(line) = serde_json::to_string(&event) {
                            println!("{line}");
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    watchdog.stop().await;
    Ok(ExitCode::SUCCESS)
}

pub async fn run_tank() -> LobsterResult<ExitCode> {
    let engine = build_engine().await?;
    let registry = engine.store().load().await?;

    let count = |status: TenantStatus| {
        registry
            .tenants
            .iter()
            .filter(|t| t.status == status)
            .count()
    };
    println!(
        "{} tenants: {} active, {} suspended, {} degraded",
        registry.tenants.len(),
        count(TenantStatus::Active),
        count(TenantStatus::Suspended),
        count(TenantStatus::Degraded),
    );
    println!(
        "allocators: next uid {}, next port {}",
        registry.next_uid, registry.next_gateway_port
    );
    for t in &registry.tenants {
        let extra = match (&t.status, &t.suspend_info) {
            (TenantStatus::Suspended, Some(info)) => match info.next_wake_at_ms {
                Some(wake) => format!(" wake@{wake}"),
                None => String::new(),
            },
            (TenantStatus::Active, _) => t
                .vm_pid
                .map(|pid| format!(" pid {pid}"))
                .unwrap_or_default(),
            _ => String::new(),
        };
        println!("  {:<12} {}{extra}", t.name, t.status);
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn run_logs(name: &str, service: Option<&str>) -> LobsterResult<ExitCode> {
    let engine = build_engine().await?;
    let registry = engine.store().load().await?;
    let tenant = registry
        .get(name)
        .ok_or_else(|| LobsterError::TenantNotFound(name.to_owned()))?;

    let client = engine.agent_client(tenant);
    // Keep the tenant awake for the session; the hold capability is
    // optional, so a refusal is not an error.
    let hold_id = format!("logs-{}", std::process::id());
    let held = client.acquire_hold(&hold_id, SESSION_HOLD_TTL).await.is_ok();

    let result = client.fetch_logs(service).await;
    if held {
        let _ = client.release_hold(&hold_id).await;
    }
    print!("{}", result.map_err(LobsterError::from)?);
    Ok(ExitCode::SUCCESS)
}

pub async fn run_exec(name: &str, cmd: &[String]) -> LobsterResult<ExitCode> {
    if cmd.is_empty() {
        return Err(LobsterError::ValidationFailed(
            "exec needs a command: lobsterd exec <name> -- <cmd ...>".into(),
        ));
    }
    let engine = build_engine().await?;
    let registry = engine.store().load().await?;
    let tenant = registry
        .get(name)
        .ok_or_else(|| LobsterError::TenantNotFound(name.to_owned()))?;
    if tenant.status != TenantStatus::Active {
        return Err(LobsterError::ValidationFailed(format!(
            "tenant {name} is {}, exec needs it active",
            tenant.status
        )));
    }

    let client = engine.agent_client(tenant);
    let hold_id = format!("exec-{}", std::process::id());
    let held = client.acquire_hold(&hold_id, SESSION_HOLD_TTL).await.is_ok();

    let key = sshkey::private_key_path(&engine.host_paths().ssh_dir(), name);
    let key_str = key.display().to_string();
    let target = format!("root@{}", tenant.guest_ip()?);
    let mut argv: Vec<&str> = vec![
        "ssh",
        "-i",
        &key_str,
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "LogLevel=ERROR",
        &target,
    ];
    argv.extend(cmd.iter().map(String::as_str));

    let result = exec::run_unchecked(&argv, &ExecOpts::with_timeout(SSH_EXEC_TIMEOUT)).await;
    if held {
        let _ = client.release_hold(&hold_id).await;
    }
    let output = result?;

    print!("{}", output.stdout);
    eprint!("{}", output.stderr);
    Ok(if output.exit_code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(output.exit_code.clamp(1, 255) as u8)
    })
}

fn confirm(prompt: &str) -> LobsterResult<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    let answer = line.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}
