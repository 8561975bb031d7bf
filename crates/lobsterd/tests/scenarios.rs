//! Cross-module scenarios that run without root, KVM, or a zpool: registry
//! durability, allocator arithmetic, and the per-tenant operation gate.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use lobsterd::config::LobsterdConfig;
use lobsterd::error::{LobsterError, LobsterResult};
use lobsterd::lifecycle::Engine;
use lobsterd::paths::HostPaths;
use lobsterd::proxy::ProxyDriver;
use lobsterd::registry::RegistryStore;
use lobsterd::types::{Registry, TenantStatus};

struct NullProxy;

#[async_trait]
impl ProxyDriver for NullProxy {
    async fn ensure_base_config(&self) -> LobsterResult<()> {
        Ok(())
    }
    async fn add_route(&self, _: &str, _: &str, _: u16) -> LobsterResult<()> {
        Ok(())
    }
    async fn remove_route(&self, _: &str) -> LobsterResult<()> {
        Ok(())
    }
    async fn has_route(&self, _: &str) -> LobsterResult<bool> {
        Ok(false)
    }
    async fn list_routes(&self) -> LobsterResult<Vec<String>> {
        Ok(Vec::new())
    }
    async fn is_running(&self) -> bool {
        true
    }
}

fn store(dir: &Path) -> RegistryStore {
    RegistryStore::new(
        dir.join("registry.json"),
        dir.join("registry.lock"),
        10_000,
        9_000,
    )
}

fn engine(dir: &Path) -> Engine {
    let paths = HostPaths::rooted(dir);
    std::fs::create_dir_all(paths.config_dir()).unwrap();
    Engine::with_proxy(LobsterdConfig::default(), paths, Box::new(NullProxy))
}

#[tokio::test]
async fn fresh_registry_matches_documented_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let s = store(dir.path());

    let r = s.load().await.unwrap();
    assert!(r.tenants.is_empty());
    assert_eq!(r.next_uid, 10_000);
    assert_eq!(r.next_gateway_port, 9_000);

    s.save(&r).await.unwrap();
    let mode = std::fs::metadata(dir.path().join("registry.json"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[tokio::test]
async fn first_two_spawned_tenants_get_documented_allocations() {
    let dir = tempfile::tempdir().unwrap();
    let s = store(dir.path());

    let alice = s
        .mutate(|r| r.allocate("alice", 10_000, Path::new("/srv"), None))
        .await
        .unwrap();
    assert_eq!(alice.uid, 10_000);
    assert_eq!(alice.gateway_port, 9_000);
    assert_eq!(alice.cid, 3);
    assert_eq!(alice.tap_dev, "tap-alice");
    assert_eq!(alice.status, TenantStatus::Initializing);

    let bob = s
        .mutate(|r| r.allocate("bob", 10_000, Path::new("/srv"), None))
        .await
        .unwrap();
    assert_eq!(bob.uid, 10_001);
    assert_eq!(bob.gateway_port, 9_001);
    assert_eq!(bob.cid, 4);
}

#[tokio::test]
async fn allocators_survive_eviction_across_reloads() {
    let dir = tempfile::tempdir().unwrap();

    {
        let s = store(dir.path());
        s.mutate(|r| r.allocate("alice", 10_000, Path::new("/srv"), None))
            .await
            .unwrap();
        s.mutate(|r| {
            r.remove("alice");
            Ok(())
        })
        .await
        .unwrap();
    }

    // A second process (fresh store over the same file) must not regress.
    let s = store(dir.path());
    let carol = s
        .mutate(|r| r.allocate("carol", 10_000, Path::new("/srv"), None))
        .await
        .unwrap();
    assert_eq!(carol.uid, 10_001, "evicted uid must never be reused");
    assert_eq!(carol.gateway_port, 9_001);
}

#[tokio::test]
async fn registry_serialization_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let s = store(dir.path());
    s.mutate(|r| {
        r.allocate("alice", 10_000, Path::new("/srv"), None)?;
        r.allocate("bob", 10_000, Path::new("/srv"), None)?;
        Ok(())
    })
    .await
    .unwrap();

    let loaded = s.load().await.unwrap();
    let first = serde_json::to_string(&loaded).unwrap();
    let reparsed: Registry = serde_json::from_str(&first).unwrap();
    let second = serde_json::to_string(&reparsed).unwrap();
    assert_eq!(first, second, "key order must be stable across round-trips");
}

#[tokio::test]
async fn concurrent_suspends_execute_at_most_once() {
    let dir = tempfile::tempdir().unwrap();
    let e = Arc::new(engine(dir.path()));

    e.store()
        .mutate(|r| {
            let t = r.allocate("alice", 10_000, Path::new("/srv"), None)?;
            // Active with no vm_pid: suspend is a pure registry+route op.
            r.get_mut(&t.name).unwrap().status = TenantStatus::Active;
            Ok(())
        })
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let e = Arc::clone(&e);
        tasks.push(tokio::spawn(async move { e.suspend("alice").await }));
    }

    let mut successes = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(t) => {
                successes += 1;
                assert_eq!(t.status, TenantStatus::Suspended);
                assert!(t.vm_pid.is_none());
                assert!(t.suspend_info.is_some());
            }
            Err(LobsterError::OperationInFlight(_))
            | Err(LobsterError::ValidationFailed(_))
            | Err(LobsterError::RegistryLocked) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(successes, 1, "suspend must execute exactly once");

    let r = e.store().load().await.unwrap();
    let alice = r.get("alice").unwrap();
    assert_eq!(alice.status, TenantStatus::Suspended);
    assert_eq!(alice.uid, 10_000, "identity preserved across suspend");
    assert_eq!(alice.cid, 3);
    assert_eq!(alice.gateway_port, 9_000);
}

#[tokio::test]
async fn evict_with_no_live_resources_removes_the_row() {
    let dir = tempfile::tempdir().unwrap();
    let e = engine(dir.path());

    e.store()
        .mutate(|r| {
            r.allocate("alice", 10_000, Path::new("/srv"), None)?;
            Ok(())
        })
        .await
        .unwrap();

    // Nothing was ever provisioned; every teardown step is a no-op, except
    // the dataset destroy which needs a zfs binary. Accept either outcome
    // but require the row to be gone.
    let _ = e.evict("alice", false).await;
    let r = e.store().load().await.unwrap();
    assert!(r.get("alice").is_none(), "row must be removed last");

    assert!(matches!(
        e.evict("alice", false).await.unwrap_err(),
        LobsterError::TenantNotFound(_)
    ));
}
