//! Per-tenant SSH keypairs, used by `lobsterd exec` to reach the guest.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LobsterError, LobsterResult};
use crate::exec::{self, ExecOpts};

const KEYGEN_TIMEOUT: Duration = Duration::from_secs(15);

pub fn private_key_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

fn public_key_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.pub"))
}

/// Generate an ed25519 keypair for the tenant; returns the public key.
///
/// Idempotent: an existing keypair is returned as-is.
pub async fn generate(dir: &Path, name: &str) -> LobsterResult<String> {
    let private = private_key_path(dir, name);
    let public = public_key_path(dir, name);

    if !tokio::fs::try_exists(&private).await.unwrap_or(false) {
        tokio::fs::create_dir_all(dir).await?;
        let key_str = private.display().to_string();
        let comment = format!("lobsterd:{name}");
        exec::run(
            &[
                "ssh-keygen", "-q", "-t", "ed25519", "-N", "", "-C", &comment, "-f", &key_str,
            ],
            &ExecOpts::with_timeout(KEYGEN_TIMEOUT),
        )
        .await?;
    }

    let pubkey = tokio::fs::read_to_string(&public).await.map_err(|e| {
        LobsterError::Config(format!("read {}: {e}", public.display()))
    })?;
    Ok(pubkey.trim().to_owned())
}

/// Remove the tenant keypair. Missing files are success.
pub async fn remove(dir: &Path, name: &str) -> LobsterResult<()> {
    for path in [private_key_path(dir, name), public_key_path(dir, name)] {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
