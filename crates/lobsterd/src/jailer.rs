//! Jailer/Firecracker driver: chroot preparation, VM configuration, launch
//! and teardown of the sandboxed VMM process.
//!
//! The jailer chroots to `<base>/firecracker/<vm_id>/root`, drops to the
//! tenant uid/gid, and execs Firecracker with `--config-file --no-api`.
//! Everything the VMM touches (kernel, rootfs, overlay, vsock UDS) must be
//! inside that root; kernel and rootfs are hard-linked in, the writable
//! overlay is hard-linked and chowned to the tenant.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::LobsterdConfig;
use crate::error::{LobsterError, LobsterResult};
use crate::exec;
use crate::paths::{self, HostPaths};
use crate::types::Tenant;

/// Sparse size of a fresh tenant overlay (2 GiB).
const OVERLAY_SIZE: u64 = 2 * 1024 * 1024 * 1024;

const VCPU_COUNT: u32 = 2;
const MEM_SIZE_MIB: u32 = 1024;

/// Poll cadence while waiting for a signalled process to exit.
const EXIT_POLL: Duration = Duration::from_millis(200);

fn setup_err(e: impl std::fmt::Display) -> LobsterError {
    LobsterError::JailerSetupFailed(e.to_string())
}

/// Create the tenant's writable overlay image if it does not exist yet:
/// sparse file + `mkfs.ext4`.
pub async fn ensure_overlay(paths: &HostPaths, name: &str) -> LobsterResult<()> {
    let overlay = paths.overlay_image(name);
    if tokio::fs::try_exists(&overlay).await.unwrap_or(false) {
        return Ok(());
    }
    tokio::fs::create_dir_all(paths.overlays_dir())
        .await
        .map_err(setup_err)?;
    tokio::fs::File::create(&overlay)
        .await
        .map_err(setup_err)?
        .set_len(OVERLAY_SIZE)
        .await
        .map_err(setup_err)?;

    let overlay_str = overlay.display().to_string();
    exec::run(
        &["mkfs.ext4", "-F", "-q", &overlay_str],
        &exec::ExecOpts::with_timeout(Duration::from_secs(60)),
    )
    .await
    .map_err(|e| setup_err(format!("mkfs overlay: {e}")))?;
    info!(tenant = name, overlay = %overlay.display(), "overlay created");
    Ok(())
}

/// Hard-link a file into the chroot, replacing any stale link.
async fn link_into(src: &Path, dst: &Path) -> LobsterResult<()> {
    match tokio::fs::remove_file(dst).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(setup_err(format!("unlink {}: {e}", dst.display()))),
    }
    tokio::fs::hard_link(src, dst)
        .await
        .map_err(|e| setup_err(format!("link {} -> {}: {e}", src.display(), dst.display())))
}

/// Populate the jailer chroot for a tenant. Safe to re-run; stale links
/// are replaced.
pub async fn prepare_chroot(
    cfg: &LobsterdConfig,
    paths: &HostPaths,
    tenant: &Tenant,
) -> LobsterResult<()> {
    ensure_overlay(paths, &tenant.name).await?;

    let root = paths::chroot_root(&cfg.jailer.chroot_base_dir, &tenant.vm_id);
    tokio::fs::create_dir_all(&root).await.map_err(setup_err)?;

    link_into(&cfg.firecracker.kernel_path, &root.join("vmlinux")).await?;
    link_into(&cfg.firecracker.rootfs_path, &root.join("rootfs.img")).await?;
    link_into(&paths.overlay_image(&tenant.name), &root.join("overlay.ext4")).await?;

    // The jailed VMM opens the overlay read-write as the tenant uid.
    let uid = nix::unistd::Uid::from_raw(tenant.uid);
    let gid = nix::unistd::Gid::from_raw(tenant.uid);
    nix::unistd::chown(&root.join("overlay.ext4"), Some(uid), Some(gid))
        .map_err(|e| setup_err(format!("chown overlay: {e}")))?;
    nix::unistd::chown(&root, Some(uid), Some(gid))
        .map_err(|e| setup_err(format!("chown chroot: {e}")))?;

    write_vm_config(&root, tenant).await?;
    debug!(tenant = %tenant.name, root = %root.display(), "chroot prepared");
    Ok(())
}

/// Whether the chroot holds everything a launch needs.
pub async fn chroot_prepared(cfg: &LobsterdConfig, tenant: &Tenant) -> bool {
    let root = paths::chroot_root(&cfg.jailer.chroot_base_dir, &tenant.vm_id);
    for file in ["vmlinux", "rootfs.img", "overlay.ext4", "config.json"] {
        if !tokio::fs::try_exists(root.join(file)).await.unwrap_or(false) {
            return false;
        }
    }
    true
}

/// Remove the tenant's jail directory. Missing is success.
pub async fn cleanup_chroot(chroot_base: &Path, vm_id: &str) -> LobsterResult<()> {
    let jail = paths::chroot_jail(chroot_base, vm_id);
    match tokio::fs::remove_dir_all(&jail).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(setup_err(format!("remove {}: {e}", jail.display()))),
    }
}

/// Firecracker `--config-file` body. Paths are chroot-relative.
fn vm_config(tenant: &Tenant) -> LobsterResult<serde_json::Value> {
    let guest_ip = tenant.guest_ip()?;
    let boot_args = format!(
        "console=ttyS0 reboot=k panic=1 pci=off random.trust_cpu=on quiet loglevel=0 \
         ip={guest_ip}::{host_ip}:255.255.255.252::eth0:off",
        host_ip = tenant.ip_address,
    );
    Ok(json!({
        "boot-source": {
            "kernel_image_path": "vmlinux",
            "boot_args": boot_args,
        },
        "drives": [
            {
                "drive_id": "rootfs",
                "path_on_host": "rootfs.img",
                "is_root_device": true,
                "is_read_only": true,
            },
            {
                "drive_id": "overlay",
                "path_on_host": "overlay.ext4",
                "is_root_device": false,
                "is_read_only": false,
            },
        ],
        "machine-config": {
            "vcpu_count": VCPU_COUNT,
            "mem_size_mib": MEM_SIZE_MIB,
        },
        "network-interfaces": [
            {
                "iface_id": "eth0",
                "host_dev_name": tenant.tap_dev,
            },
        ],
        "vsock": {
            "guest_cid": tenant.cid,
            "uds_path": "v.sock",
        },
    }))
}

async fn write_vm_config(root: &Path, tenant: &Tenant) -> LobsterResult<()> {
    let body = serde_json::to_string_pretty(&vm_config(tenant)?)
        .map_err(|e| setup_err(format!("serialize vm config: {e}")))?;
    tokio::fs::write(root.join("config.json"), body.as_bytes())
        .await
        .map_err(setup_err)
}

/// Jailer argv, without the leading binary path.
pub fn build_args(cfg: &LobsterdConfig, vm_id: &str, uid: u32) -> Vec<String> {
    vec![
        "--id".into(),
        vm_id.into(),
        "--uid".into(),
        uid.to_string(),
        "--gid".into(),
        uid.to_string(),
        "--exec-file".into(),
        cfg.firecracker.binary_path.display().to_string(),
        "--chroot-base-dir".into(),
        cfg.jailer.chroot_base_dir.display().to_string(),
        "--".into(),
        "--config-file".into(),
        "config.json".into(),
        "--no-api".into(),
    ]
}

/// Launch Firecracker under the jailer and return its pid.
///
/// The child outlives this process: console output is forwarded to tracing
/// while we run, and the handle is dropped without killing so one-shot CLI
/// invocations can exit.
pub async fn launch(cfg: &LobsterdConfig, tenant: &Tenant) -> LobsterResult<u32> {
    let args = build_args(cfg, &tenant.vm_id, tenant.uid);
    let mut child = tokio::process::Command::new(&cfg.jailer.binary_path)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| setup_err(format!("spawn jailer: {e}")))?;

    let pid = child
        .id()
        .ok_or_else(|| setup_err("jailer exited before pid capture"))?;

    forward_console(&tenant.name, &mut child);
    tokio::spawn(async move {
        // Reap when the VMM exits while this process is still around.
        let _ = child.wait().await;
    });

    info!(tenant = %tenant.name, pid, "firecracker launched");
    Ok(pid)
}

/// Forward VMM console output to tracing until the pipes close.
fn forward_console(name: &str, child: &mut tokio::process::Child) {
    if let Some(stdout) = child.stdout.take() {
        let name = name.to_owned();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    debug!(tenant = %name, "console: {line}");
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let name = name.to_owned();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    warn!(tenant = %name, "console: {line}");
                }
            }
        });
    }
}

pub fn is_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// SIGTERM, wait up to `grace`, then SIGKILL the whole tree.
pub async fn terminate(pid: u32, grace: Duration) -> LobsterResult<()> {
    if !is_alive(pid) {
        return Ok(());
    }
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !is_alive(pid) {
            return Ok(());
        }
        tokio::time::sleep(EXIT_POLL).await;
    }

    warn!(pid, "graceful stop timed out, killing process tree");
    exec::kill_tree(pid).await;
    Ok(())
}

/// Wait for a signalled/shutdown VM to exit on its own.
pub async fn wait_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !is_alive(pid) {
            return true;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }
    !is_alive(pid)
}
