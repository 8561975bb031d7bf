use std::path::PathBuf;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{LobsterError, LobsterResult};

/// Acquire a non-blocking exclusive flock on the given path.
///
/// The returned guard holds the lock until dropped. Contention maps to
/// `RegistryLocked` so callers fail fast instead of queueing.
pub async fn try_exclusive(path: PathBuf) -> LobsterResult<Flock<std::fs::File>> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| LobsterError::Config(format!("open lock {}: {e}", path.display())))?;
        Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_file, errno)| {
            if errno == Errno::EWOULDBLOCK {
                LobsterError::RegistryLocked
            } else {
                LobsterError::Config(format!("flock {}: {errno}", path.display()))
            }
        })
    })
    .await
    .map_err(|e| LobsterError::Config(format!("lock task: {e}")))?
}
