//! Tenant data model and the derivations that hang off an allocation.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{LobsterError, LobsterResult};

/// Host tap interface prefix.
pub const TAP_PREFIX: &str = "tap-";

/// Linux interface names are capped at 15 bytes, which caps tenant names
/// at 15 - len("tap-") = 11 bytes.
pub const MAX_NAME_LEN: usize = 11;

/// First two octets of the tenant /30 address space.
const ADDR_PREFIX: &str = "10.231";

/// Tenants addressable inside `10.231.0.0/16`: 256 octet3 values × 64
/// /30 subnets each.
const MAX_TENANTS: u32 = 256 * 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
    Degraded,
    Initializing,
    Evicting,
}

impl std::fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Suspended => f.write_str("suspended"),
            Self::Degraded => f.write_str("degraded"),
            Self::Initializing => f.write_str("initializing"),
            Self::Evicting => f.write_str("evicting"),
        }
    }
}

/// Recorded at suspend time; present iff `status = suspended`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspendInfo {
    /// Tap rx counter at the moment of suspension; the traffic loop
    /// compares against this to detect wake traffic.
    pub last_rx_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_wake_at_ms: Option<i64>,
    pub suspended_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub name: String,
    pub uid: u32,
    pub cid: u32,
    pub gateway_port: u16,
    /// Host-side address of the /30 tap pair.
    pub ip_address: String,
    pub tap_dev: String,
    /// Jailer chroot id; equals `name`.
    pub vm_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_pid: Option<u32>,
    pub agent_token: String,
    pub home_path: PathBuf,
    pub status: TenantStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspend_info: Option<SuspendInfo>,
    pub ssh_public_key: String,
    /// Cron expression for scheduled wakes, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wake_schedule: Option<String>,
    /// Consecutive failed repair passes; reset by a clean molt.
    #[serde(default)]
    pub repair_attempts: u32,
    /// When the last failed repair pass ran (epoch ms); spaces retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_repair_at_ms: Option<i64>,
    pub created_at: String,
}

impl Tenant {
    /// Guest-side address of this tenant's /30 pair.
    pub fn guest_ip(&self) -> LobsterResult<String> {
        let malformed = || {
            LobsterError::ValidationFailed(format!("malformed tenant address {}", self.ip_address))
        };
        let (net, last) = self.ip_address.rsplit_once('.').ok_or_else(malformed)?;
        let last: u32 = last.parse().map_err(|_| malformed())?;
        Ok(format!("{net}.{}", last + 1))
    }
}

/// Persistent root: the tenant catalog plus the monotone allocators.
///
/// Field order is the canonical registry key order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    pub tenants: Vec<Tenant>,
    pub next_uid: u32,
    pub next_gateway_port: u16,
}

impl Registry {
    pub fn empty(uid_start: u32, gateway_port_start: u16) -> Self {
        Self {
            tenants: Vec::new(),
            next_uid: uid_start,
            next_gateway_port: gateway_port_start,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tenant> {
        self.tenants.iter().find(|t| t.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tenant> {
        self.tenants.iter_mut().find(|t| t.name == name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Tenant> {
        let idx = self.tenants.iter().position(|t| t.name == name)?;
        Some(self.tenants.remove(idx))
    }

    /// Allocate a new tenant row in `initializing` state.
    ///
    /// Advances both allocators; they never move backwards, so UIDs and
    /// ports are never reused even after eviction.
    pub fn allocate(
        &mut self,
        name: &str,
        uid_start: u32,
        home_base: &Path,
        wake_schedule: Option<String>,
    ) -> LobsterResult<Tenant> {
        validate_name(name)?;
        if self.get(name).is_some() {
            return Err(LobsterError::TenantExists(name.to_owned()));
        }

        let uid = self.next_uid;
        let gateway_port = self.next_gateway_port;
        let (host_ip, _) = address_pair(uid, uid_start)?;

        let tenant = Tenant {
            name: name.to_owned(),
            uid,
            cid: vsock_cid(uid, uid_start),
            gateway_port,
            ip_address: host_ip,
            tap_dev: tap_device(name),
            vm_id: name.to_owned(),
            vm_pid: None,
            agent_token: uuid::Uuid::new_v4().simple().to_string(),
            home_path: home_base.join(name),
            status: TenantStatus::Initializing,
            suspend_info: None,
            ssh_public_key: String::new(),
            wake_schedule,
            repair_attempts: 0,
            last_repair_at_ms: None,
            created_at: Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        };

        self.next_uid += 1;
        self.next_gateway_port += 1;
        self.tenants.push(tenant.clone());
        Ok(tenant)
    }
}

/// Tenant names are DNS labels short enough for a tap interface name.
pub fn validate_name(name: &str) -> LobsterResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(LobsterError::ValidationFailed(format!(
            "tenant name {name:?} must be a DNS label of at most {MAX_NAME_LEN} chars"
        )))
    }
}

pub fn tap_device(name: &str) -> String {
    format!("{TAP_PREFIX}{name}")
}

/// Vsock context id. CIDs 0-2 are reserved (hypervisor, local, host).
pub fn vsock_cid(uid: u32, uid_start: u32) -> u32 {
    uid - uid_start + 3
}

/// The /30 host/guest address pair for an allocation.
///
/// Each tenant gets one /30 out of `10.231.0.0/16`:
///
/// ```text
///   idx    = uid - uid_start
///   octet3 = idx / 64
///   base   = (idx % 64) * 4
///   host   = 10.231.{octet3}.{base + 1}
///   guest  = 10.231.{octet3}.{base + 2}
/// ```
pub fn address_pair(uid: u32, uid_start: u32) -> LobsterResult<(String, String)> {
    let idx = uid.checked_sub(uid_start).ok_or_else(|| {
        LobsterError::ValidationFailed(format!("uid {uid} below uid_start {uid_start}"))
    })?;
    if idx >= MAX_TENANTS {
        return Err(LobsterError::ValidationFailed(format!(
            "tenant index {idx} exhausts the {ADDR_PREFIX}.0.0/16 address space"
        )));
    }
    let octet3 = idx / 64;
    let base = (idx % 64) * 4;
    Ok((
        format!("{ADDR_PREFIX}.{octet3}.{}", base + 1),
        format!("{ADDR_PREFIX}.{octet3}.{}", base + 2),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home() -> PathBuf {
        PathBuf::from("/home/lobster")
    }

    #[test]
    fn validate_name_accepts_dns_labels() {
        for n in ["alice", "bob-2", "a", "x0123456789"] {
            validate_name(n).unwrap();
        }
    }

    #[test]
    fn validate_name_rejects_bad_labels() {
        for n in ["", "-alice", "alice-", "Alice", "al_ice", "waytoolongname"] {
            assert!(validate_name(n).is_err(), "accepted {n:?}");
        }
    }

    #[test]
    fn address_pair_first_allocation() {
        let (host, guest) = address_pair(10_000, 10_000).unwrap();
        assert_eq!(host, "10.231.0.1");
        assert_eq!(guest, "10.231.0.2");
    }

    #[test]
    fn address_pair_crosses_octet3_boundary() {
        let (host, guest) = address_pair(10_064, 10_000).unwrap();
        assert_eq!(host, "10.231.1.1");
        assert_eq!(guest, "10.231.1.2");
    }

    #[test]
    fn address_pair_unique_across_range() {
        let mut seen = std::collections::HashSet::new();
        for uid in 10_000..10_000 + 2048 {
            let (host, guest) = address_pair(uid, 10_000).unwrap();
            assert!(seen.insert(host.clone()), "dup host {host}");
            assert!(seen.insert(guest.clone()), "dup guest {guest}");
        }
    }

    #[test]
    fn address_pair_slash30_alignment() {
        for uid in [10_000, 10_001, 10_063, 10_064, 10_255] {
            let (host, guest) = address_pair(uid, 10_000).unwrap();
            let h: u32 = host.rsplit('.').next().unwrap().parse().unwrap();
            let g: u32 = guest.rsplit('.').next().unwrap().parse().unwrap();
            assert_eq!(h % 4, 1, "host {host} not base+1");
            assert_eq!(g, h + 1);
        }
    }

    #[test]
    fn address_pair_exhaustion_is_error() {
        assert!(address_pair(10_000 + MAX_TENANTS, 10_000).is_err());
    }

    #[test]
    fn cid_derivation() {
        assert_eq!(vsock_cid(10_000, 10_000), 3);
        assert_eq!(vsock_cid(10_001, 10_000), 4);
    }

    #[test]
    fn allocate_assigns_monotone_ids() {
        let mut r = Registry::empty(10_000, 9_000);
        let a = r.allocate("alice", 10_000, &home(), None).unwrap();
        let b = r.allocate("bob", 10_000, &home(), None).unwrap();
        assert_eq!(a.uid, 10_000);
        assert_eq!(a.gateway_port, 9_000);
        assert_eq!(a.cid, 3);
        assert_eq!(a.tap_dev, "tap-alice");
        assert_eq!(b.uid, 10_001);
        assert_eq!(b.gateway_port, 9_001);
        assert_eq!(b.cid, 4);
        assert_eq!(r.next_uid, 10_002);
        assert_eq!(r.next_gateway_port, 9_002);
    }

    #[test]
    fn allocate_never_reuses_after_eviction() {
        let mut r = Registry::empty(10_000, 9_000);
        r.allocate("alice", 10_000, &home(), None).unwrap();
        r.remove("alice").unwrap();
        let carol = r.allocate("carol", 10_000, &home(), None).unwrap();
        assert_eq!(carol.uid, 10_001, "uid 10000 must not be reused");
        assert_eq!(carol.gateway_port, 9_001);
    }

    #[test]
    fn allocate_rejects_duplicate_name() {
        let mut r = Registry::empty(10_000, 9_000);
        r.allocate("alice", 10_000, &home(), None).unwrap();
        assert!(matches!(
            r.allocate("alice", 10_000, &home(), None),
            Err(LobsterError::TenantExists(_))
        ));
    }

    #[test]
    fn allocate_generates_distinct_tokens() {
        let mut r = Registry::empty(10_000, 9_000);
        let a = r.allocate("alice", 10_000, &home(), None).unwrap();
        let b = r.allocate("bob", 10_000, &home(), None).unwrap();
        assert_ne!(a.agent_token, b.agent_token);
        assert!(!a.agent_token.is_empty());
    }

    #[test]
    fn guest_ip_is_host_plus_one() {
        let mut r = Registry::empty(10_000, 9_000);
        let t = r.allocate("alice", 10_000, &home(), None).unwrap();
        assert_eq!(t.ip_address, "10.231.0.1");
        assert_eq!(t.guest_ip().unwrap(), "10.231.0.2");
    }

    #[test]
    fn registry_roundtrips_through_json() {
        let mut r = Registry::empty(10_000, 9_000);
        let name = {
            let t = r.get_mut("alice");
            assert!(t.is_none());
            r.allocate("alice", 10_000, &home(), Some("0 9 * * *".into()))
                .unwrap()
                .name
        };
        {
            let t = r.get_mut(&name).unwrap();
            t.status = TenantStatus::Suspended;
            t.suspend_info = Some(SuspendInfo {
                last_rx_bytes: 123,
                next_wake_at_ms: Some(1_700_000_000_000),
                suspended_at_ms: 1_699_999_000_000,
            });
        }
        let json = serde_json::to_string_pretty(&r).unwrap();
        let back: Registry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn suspended_serialization_uses_camel_case() {
        let info = SuspendInfo {
            last_rx_bytes: 1,
            next_wake_at_ms: None,
            suspended_at_ms: 2,
        };
        let v = serde_json::to_value(&info).unwrap();
        assert!(v.get("lastRxBytes").is_some());
        assert!(v.get("suspendedAtMs").is_some());
        assert!(v.get("nextWakeAtMs").is_none(), "None must be omitted");
    }
}
