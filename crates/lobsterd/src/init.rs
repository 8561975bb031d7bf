//! Bootstrap: verify host prerequisites, lay out directories and default
//! files, and bring the network and reverse proxy to a usable baseline.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::LobsterdConfig;
use crate::error::{LobsterError, LobsterResult};
use crate::exec::{self, ExecOpts};
use crate::net;
use crate::paths::{HostPaths, BUNDLED_CERTS_DIR};
use crate::proxy::{CaddyDriver, ProxyDriver};
use crate::registry::RegistryStore;
use crate::types::Registry;

/// Commands the orchestrator shells out to at runtime.
const REQUIRED_COMMANDS: &[&str] = &["zfs", "ip", "iptables", "sysctl", "ssh-keygen", "mkfs.ext4"];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOutcome {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitReport {
    pub checks: Vec<CheckOutcome>,
    pub config_written: bool,
    pub registry_written: bool,
    pub certs_installed: bool,
}

impl InitReport {
    fn pass(&mut self, name: &'static str, detail: impl Into<String>) {
        self.checks.push(CheckOutcome {
            name,
            ok: true,
            detail: detail.into(),
        });
    }

    fn fail(&mut self, name: &'static str, detail: impl Into<String>) {
        self.checks.push(CheckOutcome {
            name,
            ok: false,
            detail: detail.into(),
        });
    }
}

/// Full bootstrap. Mandatory check failures are fatal; the first one is
/// returned after all checks have been evaluated.
pub async fn run(paths: &HostPaths) -> LobsterResult<InitReport> {
    let mut report = InitReport::default();

    // Existing config wins; a fresh host gets the defaults written below.
    let config_path = paths.config_file();
    let config_exists = tokio::fs::try_exists(&config_path).await.unwrap_or(false);
    let cfg = if config_exists {
        LobsterdConfig::load(&config_path).await?
    } else {
        LobsterdConfig::default()
    };

    if let Some(fatal) = mandatory_checks(&cfg, &mut report).await {
        return Err(fatal);
    }

    // vhost_vsock may be built in; loading is best-effort.
    let modprobe = exec::run_unchecked(
        &["modprobe", "vhost_vsock"],
        &ExecOpts::with_timeout(Duration::from_secs(10)),
    )
    .await;
    match modprobe {
        Ok(out) if out.exit_code == 0 => report.pass("vhost-vsock", "module loaded"),
        Ok(out) => report.pass("vhost-vsock", format!("modprobe skipped: {}", out.stderr.trim())),
        Err(e) => report.pass("vhost-vsock", format!("modprobe unavailable: {e}")),
    }

    create_directories(&cfg, paths, &mut report).await?;

    if !config_exists {
        write_config(&config_path, &cfg).await?;
        report.config_written = true;
        info!(path = %config_path.display(), "default config written");
    }

    let store = RegistryStore::new(
        paths.registry_file(),
        paths.registry_lock(),
        cfg.tenants.uid_start,
        cfg.tenants.gateway_port_start,
    );
    if !tokio::fs::try_exists(paths.registry_file()).await.unwrap_or(false) {
        store
            .save(&Registry::empty(
                cfg.tenants.uid_start,
                cfg.tenants.gateway_port_start,
            ))
            .await?;
        report.registry_written = true;
        info!(path = %paths.registry_file().display(), "empty registry written");
    }

    report.certs_installed = install_bundled_certs(paths).await?;

    net::enable_ip_forwarding().await?;
    report.pass("ip-forwarding", "enabled");
    net::ensure_chain().await?;
    report.pass("firewall-chain", net::CHAIN);
    install_proxy_bypass(&mut report).await;

    let proxy = CaddyDriver::new(&cfg.caddy.admin_api, cfg.caddy.tls)?;
    if !proxy.is_running().await {
        return Err(LobsterError::ProxyError(format!(
            "reverse proxy admin api not reachable at {}",
            cfg.caddy.admin_api
        )));
    }
    proxy.ensure_base_config().await?;
    report.pass("reverse-proxy", cfg.caddy.admin_api.clone());

    info!("bootstrap complete");
    Ok(report)
}

/// Run every mandatory check, recording outcomes; returns the first
/// failure (typed) if any.
async fn mandatory_checks(
    cfg: &LobsterdConfig,
    report: &mut InitReport,
) -> Option<LobsterError> {
    let mut fatal: Option<LobsterError> = None;
    {
        let mut record = |name: &'static str, detail: String, err: Option<LobsterError>| {
            match err {
                None => report.pass(name, detail),
                Some(e) => {
                    report.fail(name, e.to_string());
                    fatal.get_or_insert(e);
                }
            }
        };

        let linux = if cfg!(target_os = "linux") {
            None
        } else {
            Some(LobsterError::NotLinux)
        };
        record("linux", "ok".into(), linux);

        let root = if nix::unistd::getuid().is_root() {
            None
        } else {
            Some(LobsterError::NotRoot)
        };
        record("root", "uid 0".into(), root);

        let kvm = match std::fs::File::options()
            .read(true)
            .write(true)
            .open("/dev/kvm")
        {
            Ok(_) => None,
            Err(e) => Some(LobsterError::KvmNotAvailable(e.to_string())),
        };
        record("kvm", "/dev/kvm accessible".into(), kvm);

        let fc = &cfg.firecracker.binary_path;
        let fc_err = if is_executable(fc) {
            None
        } else {
            Some(LobsterError::FirecrackerNotFound(fc.clone()))
        };
        record("firecracker", fc.display().to_string(), fc_err);

        let jailer = &cfg.jailer.binary_path;
        let jailer_err = if is_executable(jailer) {
            None
        } else {
            Some(LobsterError::JailerNotFound(jailer.clone()))
        };
        record("jailer", jailer.display().to_string(), jailer_err);

        for (path, name) in [
            (&cfg.firecracker.kernel_path, "kernel"),
            (&cfg.firecracker.rootfs_path, "rootfs"),
        ] {
            let err = if path.exists() {
                None
            } else {
                Some(LobsterError::ValidationFailed(format!(
                    "{name} image not found: {}",
                    path.display()
                )))
            };
            record(name, path.display().to_string(), err);
        }

        let missing: Vec<&str> = REQUIRED_COMMANDS
            .iter()
            .copied()
            .filter(|c| which::which(c).is_err())
            .collect();
        let cmd_err = if missing.is_empty() {
            None
        } else {
            Some(LobsterError::ValidationFailed(format!(
                "required commands not found: {}",
                missing.join(", ")
            )))
        };
        record("commands", REQUIRED_COMMANDS.join(" "), cmd_err);
    }

    fatal
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

async fn make_dir(path: &Path, mode: u32) -> LobsterResult<()> {
    tokio::fs::create_dir_all(path).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

async fn create_directories(
    cfg: &LobsterdConfig,
    paths: &HostPaths,
    report: &mut InitReport,
) -> LobsterResult<()> {
    // Config dir is traversable but not listable.
    make_dir(paths.config_dir(), 0o711).await?;
    make_dir(&paths.certs_dir(), 0o755).await?;
    for dir in [
        paths.overlays_dir(),
        paths.sockets_dir(),
        paths.kernels_dir(),
        paths.ssh_dir(),
        cfg.jailer.chroot_base_dir.clone(),
    ] {
        make_dir(&dir, 0o755).await?;
    }
    report.pass("directories", "created");
    Ok(())
}

async fn write_config(path: &Path, cfg: &LobsterdConfig) -> LobsterResult<()> {
    let body = serde_json::to_string_pretty(cfg)
        .map_err(|e| LobsterError::Config(format!("serialize config: {e}")))?;
    tokio::fs::write(path, body.as_bytes()).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

/// Install packaged origin TLS material when present and non-empty.
async fn install_bundled_certs(paths: &HostPaths) -> LobsterResult<bool> {
    let bundled = Path::new(BUNDLED_CERTS_DIR);
    let mut installed = false;
    for (src, dst, mode) in [
        (bundled.join("origin.pem"), paths.origin_cert(), 0o644),
        (bundled.join("origin.key"), paths.origin_key(), 0o600),
    ] {
        let non_empty = tokio::fs::metadata(&src)
            .await
            .map(|m| m.len() > 0)
            .unwrap_or(false);
        if !non_empty {
            continue;
        }
        tokio::fs::copy(&src, &dst).await?;
        tokio::fs::set_permissions(&dst, std::fs::Permissions::from_mode(mode)).await?;
        installed = true;
    }
    if installed {
        info!("origin certs installed");
    }
    Ok(installed)
}

/// The reverse proxy's uid must bypass the tenant drop rules. Skipped
/// with a note when no caddy user exists (proxy running as root).
async fn install_proxy_bypass(report: &mut InitReport) {
    match nix::unistd::User::from_name("caddy") {
        Ok(Some(user)) => match net::add_uid_bypass(user.uid.as_raw()).await {
            Ok(()) => report.pass("proxy-bypass", format!("uid {}", user.uid)),
            Err(e) => {
                warn!(error = %e, "proxy bypass rule failed");
                report.fail("proxy-bypass", e.to_string());
            }
        },
        Ok(None) => report.pass("proxy-bypass", "no caddy user, skipped"),
        Err(e) => report.fail("proxy-bypass", e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_executable_rejects_plain_files_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain");
        std::fs::write(&plain, b"x").unwrap();
        assert!(!is_executable(&plain));
        assert!(!is_executable(&dir.path().join("missing")));
    }

    #[test]
    fn is_executable_accepts_mode_755() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(is_executable(&bin));
    }

    #[tokio::test]
    async fn make_dir_applies_mode() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cfg");
        make_dir(&target, 0o711).await.unwrap();
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o711);
    }

    #[tokio::test]
    async fn write_config_is_mode_600_and_parseable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        write_config(&path, &LobsterdConfig::default()).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let loaded = LobsterdConfig::load(&path).await.unwrap();
        assert_eq!(loaded, LobsterdConfig::default());
    }

    #[test]
    fn report_records_outcomes() {
        let mut r = InitReport::default();
        r.pass("kvm", "/dev/kvm accessible");
        r.fail("firecracker", "not found");
        assert_eq!(r.checks.len(), 2);
        assert!(r.checks[0].ok);
        assert!(!r.checks[1].ok);
    }

    #[tokio::test]
    async fn mandatory_checks_flag_missing_binaries() {
        // Default paths do not exist here, so firecracker/jailer must fail;
        // the first fatal error is whichever mandatory check failed first.
        let cfg = LobsterdConfig::default();
        let mut report = InitReport::default();
        let fatal = mandatory_checks(&cfg, &mut report).await;
        assert!(fatal.is_some());
        let fc_check = report
            .checks
            .iter()
            .find(|c| c.name == "firecracker")
            .unwrap();
        assert!(!fc_check.ok);
    }
}
