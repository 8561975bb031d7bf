//! ZFS driver: per-tenant datasets and snapshots as wrapped `zfs`
//! invocations.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{LobsterError, LobsterResult};
use crate::exec::{self, ExecOpts};

const ZFS_TIMEOUT: Duration = Duration::from_secs(30);
/// Destroys may wait on busy mounts.
const DESTROY_TIMEOUT: Duration = Duration::from_secs(120);

fn opts() -> ExecOpts {
    ExecOpts::with_timeout(ZFS_TIMEOUT)
}

fn zfs_err(e: LobsterError) -> LobsterError {
    match e {
        LobsterError::ExecFailed { argv, stderr, .. } => {
            LobsterError::ZfsError(format!("{argv}: {stderr}"))
        }
        other => other,
    }
}

pub async fn dataset_exists(dataset: &str) -> LobsterResult<bool> {
    let out = exec::run_unchecked(&["zfs", "list", "-H", "-o", "name", dataset], &opts()).await?;
    Ok(out.exit_code == 0)
}

/// Create a dataset with quota, compression, and an explicit mountpoint.
///
/// Fails if the dataset already exists (the reconciler checks first).
pub async fn create_dataset(
    dataset: &str,
    quota: &str,
    compression: &str,
    mountpoint: &Path,
) -> LobsterResult<()> {
    let quota_opt = format!("quota={quota}");
    let compression_opt = format!("compression={compression}");
    let mountpoint_opt = format!("mountpoint={}", mountpoint.display());
    exec::run(
        &[
            "zfs",
            "create",
            "-p",
            "-o",
            &quota_opt,
            "-o",
            &compression_opt,
            "-o",
            &mountpoint_opt,
            dataset,
        ],
        &opts(),
    )
    .await
    .map_err(zfs_err)?;
    info!(dataset, quota, "dataset created");
    Ok(())
}

/// Destroy a dataset recursively. Destroying a missing dataset is success.
pub async fn destroy_dataset(dataset: &str) -> LobsterResult<()> {
    let out = exec::run_unchecked(
        &["zfs", "destroy", "-r", dataset],
        &ExecOpts::with_timeout(DESTROY_TIMEOUT),
    )
    .await?;
    if out.exit_code != 0 && !out.stderr.contains("does not exist") {
        return Err(LobsterError::ZfsError(format!(
            "destroy {dataset}: {}",
            out.stderr.trim()
        )));
    }
    debug!(dataset, "dataset destroyed");
    Ok(())
}

pub async fn snapshot(dataset: &str, tag: &str) -> LobsterResult<()> {
    let full = format!("{dataset}@{tag}");
    exec::run(&["zfs", "snapshot", &full], &opts())
        .await
        .map_err(zfs_err)?;
    info!(snapshot = %full, "snapshot created");
    Ok(())
}

/// Snapshots of `dataset`, oldest first.
pub async fn list_snapshots(dataset: &str) -> LobsterResult<Vec<String>> {
    let out = exec::run(
        &[
            "zfs", "list", "-H", "-t", "snapshot", "-o", "name", "-s", "creation", "-d", "1",
            dataset,
        ],
        &opts(),
    )
    .await
    .map_err(zfs_err)?;
    Ok(out
        .stdout
        .lines()
        .filter_map(|l| l.trim().split_once('@').map(|(_, tag)| tag.to_owned()))
        .collect())
}

/// Destroy all but the newest `keep` snapshots, oldest first.
///
/// Returns the destroyed tags.
pub async fn prune_snapshots(dataset: &str, keep: usize) -> LobsterResult<Vec<String>> {
    let snapshots = list_snapshots(dataset).await?;
    if snapshots.len() <= keep {
        return Ok(Vec::new());
    }
    let doomed: Vec<String> = snapshots[..snapshots.len() - keep].to_vec();
    for tag in &doomed {
        let full = format!("{dataset}@{tag}");
        exec::run(&["zfs", "destroy", &full], &opts())
            .await
            .map_err(zfs_err)?;
        debug!(snapshot = %full, "snapshot pruned");
    }
    Ok(doomed)
}

/// Direct children of `parent`, bare names without the parent prefix.
///
/// Used by orphan collection: a child dataset with no registry row is an
/// orphan.
pub async fn list_children(parent: &str) -> LobsterResult<Vec<String>> {
    let out = exec::run_unchecked(
        &["zfs", "list", "-H", "-o", "name", "-r", "-d", "1", parent],
        &opts(),
    )
    .await?;
    if out.exit_code != 0 {
        // Parent itself missing: nothing to collect.
        return Ok(Vec::new());
    }
    let prefix = format!("{parent}/");
    Ok(out
        .stdout
        .lines()
        .filter_map(|l| l.trim().strip_prefix(&prefix).map(str::to_owned))
        .filter(|n| !n.is_empty())
        .collect())
}
