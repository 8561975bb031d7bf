//! Exec gateway: argv-vector child processes with timeouts and bounded
//! capture. Every external mechanism (zfs, ip, iptables, jailer, ssh)
//! funnels through here.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::trace;

use crate::error::{LobsterError, LobsterResult};

/// Per-stream capture cap.
pub const STREAM_CAP: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ExecOpts {
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl ExecOpts {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            env: Vec::new(),
            cwd: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

fn display(argv: &[&str]) -> String {
    argv.join(" ")
}

/// Run a command; non-zero exit (or timeout) is an error.
///
/// Returns trimmed-as-captured stdout/stderr; the caller trims if needed.
pub async fn run(argv: &[&str], opts: &ExecOpts) -> LobsterResult<ExecOutput> {
    let out = run_unchecked(argv, opts).await?;
    if out.exit_code != 0 {
        return Err(LobsterError::ExecFailed {
            argv: display(argv),
            exit_code: Some(out.exit_code),
            stderr: out.stderr.trim().to_owned(),
        });
    }
    Ok(out)
}

/// Run a command where a non-zero exit is itself meaningful (`test -x`,
/// `iptables -C`, ...). Spawn failures and timeouts still fail.
pub async fn run_unchecked(argv: &[&str], opts: &ExecOpts) -> LobsterResult<ExecOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| LobsterError::ValidationFailed("empty argv".into()))?;
    let cmd_display = display(argv);
    trace!(command = %cmd_display, "exec");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in &opts.env {
        cmd.env(k, v);
    }
    if let Some(cwd) = &opts.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.spawn().map_err(|e| LobsterError::ExecFailed {
        argv: cmd_display.clone(),
        exit_code: None,
        stderr: format!("spawn: {e}"),
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let waited = tokio::time::timeout(opts.timeout, async {
        let (stdout, stderr) = tokio::join!(read_capped(stdout), read_capped(stderr));
        let status = child.wait().await;
        (stdout, stderr, status)
    })
    .await;

    match waited {
        Ok((stdout, stderr, status)) => {
            let status = status.map_err(|e| LobsterError::ExecFailed {
                argv: cmd_display.clone(),
                exit_code: None,
                stderr: format!("wait: {e}"),
            })?;
            // Killed-by-signal maps to the shell convention 128+N.
            let exit_code = status.code().unwrap_or(137);
            Ok(ExecOutput {
                exit_code,
                stdout,
                stderr,
            })
        }
        Err(_) => {
            if let Some(pid) = child.id() {
                kill_tree(pid).await;
            }
            let _ = child.wait().await;
            Err(LobsterError::ExecFailed {
                argv: cmd_display,
                exit_code: None,
                stderr: format!("timed out after {}ms", opts.timeout.as_millis()),
            })
        }
    }
}

/// Read a stream to end, keeping at most [`STREAM_CAP`] bytes.
///
/// The stream is drained past the cap so the child never blocks on a full
/// pipe; overflow is discarded and marked.
async fn read_capped<R: tokio::io::AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if buf.len() < STREAM_CAP {
                    let take = n.min(STREAM_CAP - buf.len());
                    buf.extend_from_slice(&chunk[..take]);
                    truncated |= take < n;
                } else {
                    truncated = true;
                }
            }
        }
    }
    let mut s = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        s.push_str("\n[output truncated]");
    }
    s
}

/// Recursively kill a process and all its descendants (depth-first).
pub async fn kill_tree(pid: u32) {
    let pid_str = pid.to_string();
    let children = Command::new("pgrep")
        .args(["-P", &pid_str])
        .stdin(Stdio::null())
        .output()
        .await;
    if let Ok(out) = children {
        for line in String::from_utf8_lossy(&out.stdout).lines() {
            if let Ok(child) = line.trim().parse::<u32>() {
                Box::pin(kill_tree(child)).await;
            }
        }
    }
    let _ = Command::new("kill")
        .args(["-9", &pid_str])
        .stdin(Stdio::null())
        .output()
        .await;
}
