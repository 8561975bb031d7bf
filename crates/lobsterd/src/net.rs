//! Network driver: tap devices, addresses, IP forwarding, and the
//! `LOBSTER` iptables chain.
//!
//! Rule layout inside the chain (order matters: the proxy bypass must
//! precede every tenant drop):
//!
//! ```text
//! LOBSTER  -m owner --uid-owner <proxy-uid>  -j RETURN   (bypass, inserted first)
//! LOBSTER  -m owner --uid-owner <tenant-uid> -j DROP     (one per tenant, appended)
//! ```

use std::time::Duration;

use tracing::{debug, info};

use crate::error::{LobsterError, LobsterResult};
use crate::exec::{self, ExecOpts};
use crate::types::TAP_PREFIX;

pub const CHAIN: &str = "LOBSTER";

const NET_TIMEOUT: Duration = Duration::from_secs(10);

fn opts() -> ExecOpts {
    ExecOpts::with_timeout(NET_TIMEOUT)
}

fn net_err(e: LobsterError) -> LobsterError {
    match e {
        LobsterError::ExecFailed { argv, stderr, .. } => {
            LobsterError::NetworkSetupFailed(format!("{argv}: {stderr}"))
        }
        other => other,
    }
}

fn fw_err(e: LobsterError) -> LobsterError {
    match e {
        LobsterError::ExecFailed { argv, stderr, .. } => {
            LobsterError::FirewallError(format!("{argv}: {stderr}"))
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Tap devices
// ---------------------------------------------------------------------------

/// Create a tap owned by the tenant uid and bring it up.
pub async fn create_tap(tap: &str, uid: u32) -> LobsterResult<()> {
    let uid_str = uid.to_string();
    exec::run(
        &["ip", "tuntap", "add", "dev", tap, "mode", "tap", "user", &uid_str],
        &opts(),
    )
    .await
    .map_err(net_err)?;
    exec::run(&["ip", "link", "set", tap, "up"], &opts())
        .await
        .map_err(net_err)?;
    info!(tap, uid, "tap created");
    Ok(())
}

pub async fn tap_exists(tap: &str) -> LobsterResult<bool> {
    let out = exec::run_unchecked(&["ip", "link", "show", tap], &opts()).await?;
    Ok(out.exit_code == 0)
}

/// Delete a tap. Deleting a missing tap is success.
pub async fn delete_tap(tap: &str) -> LobsterResult<()> {
    let out = exec::run_unchecked(&["ip", "link", "del", tap], &opts()).await?;
    if out.exit_code != 0 && !out.stderr.contains("Cannot find device") {
        return Err(LobsterError::NetworkSetupFailed(format!(
            "delete tap {tap}: {}",
            out.stderr.trim()
        )));
    }
    debug!(tap, "tap deleted");
    Ok(())
}

/// Assign the host-side /30 address. Re-assigning is success.
pub async fn assign_address(tap: &str, host_ip: &str) -> LobsterResult<()> {
    let cidr = format!("{host_ip}/30");
    let out = exec::run_unchecked(&["ip", "addr", "add", &cidr, "dev", tap], &opts()).await?;
    if out.exit_code != 0 && !out.stderr.contains("File exists") {
        return Err(LobsterError::NetworkSetupFailed(format!(
            "assign {cidr} to {tap}: {}",
            out.stderr.trim()
        )));
    }
    Ok(())
}

pub async fn address_assigned(tap: &str, host_ip: &str) -> LobsterResult<bool> {
    let out = exec::run_unchecked(&["ip", "-o", "addr", "show", "dev", tap], &opts()).await?;
    Ok(out.exit_code == 0 && out.stdout.contains(&format!("{host_ip}/30")))
}

/// All tap devices carrying the tenant prefix, for orphan collection.
pub async fn list_tenant_taps() -> LobsterResult<Vec<String>> {
    let out = exec::run(&["ip", "-o", "link", "show"], &opts())
        .await
        .map_err(net_err)?;
    Ok(out
        .stdout
        .lines()
        .filter_map(parse_link_name)
        .filter(|n| n.starts_with(TAP_PREFIX))
        .collect())
}

/// Parse the device name out of one `ip -o link show` line
/// (`3: tap-alice: <...>` or `3: tap-alice@if2: <...>`).
fn parse_link_name(line: &str) -> Option<String> {
    let mut parts = line.splitn(3, ':');
    parts.next()?;
    let name = parts.next()?.trim();
    let name = name.split('@').next()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_owned())
    }
}

/// Read the tap's rx byte counter from sysfs.
pub async fn read_rx_bytes(tap: &str) -> LobsterResult<u64> {
    let path = format!("/sys/class/net/{tap}/statistics/rx_bytes");
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| LobsterError::NetworkSetupFailed(format!("read {path}: {e}")))?;
    content
        .trim()
        .parse()
        .map_err(|e| LobsterError::NetworkSetupFailed(format!("parse {path}: {e}")))
}

// ---------------------------------------------------------------------------
// Forwarding & firewall
// ---------------------------------------------------------------------------

pub async fn enable_ip_forwarding() -> LobsterResult<()> {
    exec::run(&["sysctl", "-w", "net.ipv4.ip_forward=1"], &opts())
        .await
        .map_err(net_err)?;
    Ok(())
}

/// Create the `LOBSTER` chain and hook it from OUTPUT, exactly once.
pub async fn ensure_chain() -> LobsterResult<()> {
    let created = exec::run_unchecked(&["iptables", "-N", CHAIN], &opts()).await?;
    if created.exit_code != 0 && !created.stderr.contains("Chain already exists") {
        return Err(LobsterError::FirewallError(format!(
            "create chain {CHAIN}: {}",
            created.stderr.trim()
        )));
    }
    let hooked = exec::run_unchecked(&["iptables", "-C", "OUTPUT", "-j", CHAIN], &opts()).await?;
    if hooked.exit_code != 0 {
        exec::run(&["iptables", "-A", "OUTPUT", "-j", CHAIN], &opts())
            .await
            .map_err(fw_err)?;
    }
    Ok(())
}

fn uid_rule(uid: u32, target: &str) -> [String; 6] {
    [
        "-m".into(),
        "owner".into(),
        "--uid-owner".into(),
        uid.to_string(),
        "-j".into(),
        target.into(),
    ]
}

async fn rule_present(rule: &[String]) -> LobsterResult<bool> {
    let mut argv: Vec<&str> = vec!["iptables", "-C", CHAIN];
    argv.extend(rule.iter().map(String::as_str));
    let out = exec::run_unchecked(&argv, &opts()).await?;
    Ok(out.exit_code == 0)
}

/// Bypass for the reverse proxy's uid; inserted at position 1 so it always
/// precedes tenant drops.
pub async fn add_uid_bypass(uid: u32) -> LobsterResult<()> {
    let rule = uid_rule(uid, "RETURN");
    if rule_present(&rule).await? {
        return Ok(());
    }
    let mut argv: Vec<&str> = vec!["iptables", "-I", CHAIN, "1"];
    argv.extend(rule.iter().map(String::as_str));
    exec::run(&argv, &opts()).await.map_err(fw_err)?;
    info!(uid, "proxy uid bypass installed");
    Ok(())
}

/// Drop all host-initiated egress for the tenant uid.
pub async fn add_tenant_drop(uid: u32) -> LobsterResult<()> {
    let rule = uid_rule(uid, "DROP");
    if rule_present(&rule).await? {
        return Ok(());
    }
    let mut argv: Vec<&str> = vec!["iptables", "-A", CHAIN];
    argv.extend(rule.iter().map(String::as_str));
    exec::run(&argv, &opts()).await.map_err(fw_err)?;
    debug!(uid, "tenant drop installed");
    Ok(())
}

pub async fn tenant_drop_present(uid: u32) -> LobsterResult<bool> {
    rule_present(&uid_rule(uid, "DROP")).await
}

/// Remove the tenant drop. Removing an absent rule is success.
pub async fn remove_tenant_drop(uid: u32) -> LobsterResult<()> {
    let rule = uid_rule(uid, "DROP");
    let mut argv: Vec<&str> = vec!["iptables", "-D", CHAIN];
    argv.extend(rule.iter().map(String::as_str));
    let _ = exec::run_unchecked(&argv, &opts()).await?;
    Ok(())
}
