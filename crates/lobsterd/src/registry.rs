//! Persistent tenant catalog. The registry file is the sole source of
//! truth for tenant existence; everything live is reconciled against it.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::trace;

use crate::error::{LobsterError, LobsterResult};
use crate::lock;
use crate::types::Registry;

/// Store handle; cheap to clone (clones share the in-process lock).
#[derive(Debug, Clone)]
pub struct RegistryStore {
    file: PathBuf,
    lock_file: PathBuf,
    uid_start: u32,
    gateway_port_start: u16,
    /// Serializes this process's own mutations; the flock below only has
    /// to fend off other processes.
    process_lock: Arc<Mutex<()>>,
}

impl RegistryStore {
    pub fn new(
        file: PathBuf,
        lock_file: PathBuf,
        uid_start: u32,
        gateway_port_start: u16,
    ) -> Self {
        Self {
            file,
            lock_file,
            uid_start,
            gateway_port_start,
            process_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Read the registry; a missing file is the empty registry.
    pub async fn load(&self) -> LobsterResult<Registry> {
        let content = match tokio::fs::read_to_string(&self.file).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Registry::empty(self.uid_start, self.gateway_port_start));
            }
            Err(e) => {
                return Err(LobsterError::Config(format!(
                    "read {}: {e}",
                    self.file.display()
                )))
            }
        };
        serde_json::from_str(&content)
            .map_err(|e| LobsterError::RegistryCorrupt(format!("{}: {e}", self.file.display())))
    }

    /// Atomic write: temp file in the same directory, then rename.
    pub async fn save(&self, registry: &Registry) -> LobsterResult<()> {
        let json = serde_json::to_string_pretty(registry)
            .map_err(|e| LobsterError::Config(format!("serialize registry: {e}")))?;

        let tmp = self
            .file
            .with_extension(format!("tmp.{}", std::process::id()));
        tokio::fs::write(&tmp, json.as_bytes())
            .await
            .map_err(|e| LobsterError::Config(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| LobsterError::Config(format!("chmod {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.file)
            .await
            .map_err(|e| LobsterError::Config(format!("rename to {}: {e}", self.file.display())))?;
        trace!(path = %self.file.display(), tenants = registry.tenants.len(), "registry saved");
        Ok(())
    }

    /// Load, apply `f`, save, all under the exclusive registry lock.
    ///
    /// Mutations from this process queue on the in-process mutex; a lock
    /// held by another process fails fast with `RegistryLocked`.
    /// Allocators are only ever advanced inside this critical section.
    pub async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Registry) -> LobsterResult<T>,
    ) -> LobsterResult<T> {
        let _serial = self.process_lock.lock().await;
        let guard = lock::try_exclusive(self.lock_file.clone()).await?;
        let result = async {
            let mut registry = self.load().await?;
            let value = f(&mut registry)?;
            self.save(&registry).await?;
            Ok(value)
        }
        .await;
        drop(guard);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TenantStatus;
    use std::path::Path;

    fn store(dir: &Path) -> RegistryStore {
        RegistryStore::new(
            dir.join("registry.json"),
            dir.join("registry.lock"),
            10_000,
            9_000,
        )
    }

    #[tokio::test]
    async fn missing_file_is_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let r = store(dir.path()).load().await.unwrap();
        assert!(r.tenants.is_empty());
        assert_eq!(r.next_uid, 10_000);
        assert_eq!(r.next_gateway_port, 9_000);
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let mut r = Registry::empty(10_000, 9_000);
        r.allocate("alice", 10_000, Path::new("/srv"), None).unwrap();
        s.save(&r).await.unwrap();
        let back = s.load().await.unwrap();
        assert_eq!(back, r);
    }

    #[tokio::test]
    async fn save_sets_mode_0600() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.save(&Registry::empty(10_000, 9_000)).await.unwrap();
        let mode = std::fs::metadata(dir.path().join("registry.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.save(&Registry::empty(10_000, 9_000)).await.unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["registry.json"], "leftovers: {names:?}");
    }

    #[tokio::test]
    async fn corrupt_file_is_registry_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("registry.json"), "{broken")
            .await
            .unwrap();
        let err = store(dir.path()).load().await.unwrap_err();
        assert!(matches!(err, LobsterError::RegistryCorrupt(_)), "got {err}");
    }

    #[tokio::test]
    async fn mutate_applies_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let tenant = s
            .mutate(|r| r.allocate("alice", 10_000, Path::new("/srv"), None))
            .await
            .unwrap();
        assert_eq!(tenant.uid, 10_000);
        let r = s.load().await.unwrap();
        assert_eq!(r.tenants.len(), 1);
        assert_eq!(r.next_uid, 10_001);
    }

    #[tokio::test]
    async fn mutate_error_does_not_persist() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.mutate(|r| r.allocate("alice", 10_000, Path::new("/srv"), None))
            .await
            .unwrap();

        let err = s
            .mutate(|r| {
                r.get_mut("alice").unwrap().status = TenantStatus::Active;
                Err::<(), _>(LobsterError::ValidationFailed("abort".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LobsterError::ValidationFailed(_)));

        let r = s.load().await.unwrap();
        assert_eq!(r.get("alice").unwrap().status, TenantStatus::Initializing);
    }

    #[tokio::test]
    async fn mutate_contention_is_registry_locked() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let held = lock::try_exclusive(dir.path().join("registry.lock"))
            .await
            .unwrap();
        let err = s.mutate(|_| Ok(())).await.unwrap_err();
        assert!(matches!(err, LobsterError::RegistryLocked), "got {err}");
        drop(held);
        s.mutate(|_| Ok(())).await.unwrap();
    }

    #[tokio::test]
    async fn spawn_evict_spawn_never_reuses_ids() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.mutate(|r| r.allocate("alice", 10_000, Path::new("/srv"), None))
            .await
            .unwrap();
        s.mutate(|r| r.allocate("bob", 10_000, Path::new("/srv"), None))
            .await
            .unwrap();
        s.mutate(|r| {
            r.remove("alice");
            Ok(())
        })
        .await
        .unwrap();
        let carol = s
            .mutate(|r| r.allocate("carol", 10_000, Path::new("/srv"), None))
            .await
            .unwrap();
        assert_eq!(carol.uid, 10_002);
        assert_eq!(carol.gateway_port, 9_002);
        assert_eq!(carol.cid, 5);
    }
}
