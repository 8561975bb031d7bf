//! Host-side vsock RPC client for the in-guest agent.
//!
//! Firecracker exposes each guest's vsock device as a Unix domain socket on
//! the host. A host-initiated connection performs the Firecracker handshake
//! (`CONNECT <port>\n` answered by `OK <assigned>\n`) and is then forwarded
//! to whatever listens on that port inside the guest.
//!
//! ## Message Contract
//!
//! One request per connection. The request is a single newline-terminated
//! JSON object carrying a `type`, a bearer `token`, and call-specific
//! fields. The response is a single newline-terminated `ACK` (plain text)
//! for simple successes, or a JSON object. An object with an `error` field
//! is an agent-side failure.
//!
//! | type                     | extra request fields | response |
//! |--------------------------|----------------------|----------|
//! | `health-ping`            | (none)               | `ACK`    |
//! | `inject-secrets`         | `secrets`            | `ACK`    |
//! | `launch-openclaw`        | (none)               | `ACK`    |
//! | `shutdown`               | (none)               | `ACK`    |
//! | `acquire-hold`           | `id`, `ttlMs`        | `ACK`    |
//! | `release-hold`           | `id`                 | `ACK`    |
//! | `get-active-connections` | (none)               | `{"connections", "holds"?}` |
//! | `fetch-logs`             | `service?`           | `{"logs"}` |

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{self, Instant};
use tracing::trace;

/// Guest port the agent listens on unless configured otherwise.
pub const DEFAULT_AGENT_PORT: u32 = 52;

/// Maximum accepted response line (the agent may return large log payloads).
const MAX_RESPONSE_BYTES: u64 = 4 * 1024 * 1024;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const HOLD_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const SECRETS_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECTIONS_TIMEOUT: Duration = Duration::from_secs(5);
const LOGS_TIMEOUT: Duration = Duration::from_secs(15);
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll cadence while waiting for the agent to come up after boot.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("vsock connect {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("vsock handshake failed: {0}")]
    Handshake(String),

    #[error("{call} timed out after {ms}ms")]
    Timeout { call: &'static str, ms: u128 },

    #[error("agent protocol error: {0}")]
    Protocol(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RpcError>;

/// Response to `get-active-connections`.
///
/// `holds` is an optional agent capability; agents that do not implement
/// the hold protocol omit the field.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ActiveConnections {
    pub connections: u64,
    #[serde(default)]
    pub holds: u64,
}

impl ActiveConnections {
    /// A tenant is idle only when nothing is connected and nothing holds it.
    pub fn is_idle(&self) -> bool {
        self.connections == 0 && self.holds == 0
    }
}

/// A decoded agent response line.
#[derive(Debug)]
enum Response {
    Ack,
    Object(Value),
}

/// Client for one tenant's in-guest agent.
///
/// Cheap to clone; every call opens its own connection, so a client can be
/// shared freely across tasks.
#[derive(Debug, Clone)]
pub struct AgentClient {
    uds_path: PathBuf,
    port: u32,
    token: String,
}

impl AgentClient {
    pub fn new(uds_path: impl Into<PathBuf>, port: u32, token: impl Into<String>) -> Self {
        Self {
            uds_path: uds_path.into(),
            port,
            token: token.into(),
        }
    }

    /// Poll `health-ping` until the agent answers or the deadline passes.
    ///
    /// Used right after VM launch: the UDS may not even exist yet, so
    /// connect errors are retried rather than surfaced.
    pub async fn wait_for_agent(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.health_ping().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if Instant::now() >= deadline {
                        trace!(error = %e, "agent wait exhausted");
                        return Err(RpcError::Timeout {
                            call: "wait-for-agent",
                            ms: timeout.as_millis(),
                        });
                    }
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            time::sleep(WAIT_POLL_INTERVAL.min(remaining)).await;
        }
    }

    pub async fn health_ping(&self) -> Result<()> {
        self.call_ack("health-ping", json!({}), HEALTH_TIMEOUT).await
    }

    pub async fn inject_secrets(&self, secrets: &Value) -> Result<()> {
        self.call_ack(
            "inject-secrets",
            json!({ "secrets": secrets }),
            SECRETS_TIMEOUT,
        )
        .await
    }

    pub async fn launch_openclaw(&self) -> Result<()> {
        self.call_ack("launch-openclaw", json!({}), LAUNCH_TIMEOUT)
            .await
    }

    /// Request graceful in-guest shutdown.
    ///
    /// Returns `true` if the agent acknowledged; `false` when the agent is
    /// unreachable or silent (callers escalate to signals either way).
    pub async fn shutdown(&self) -> bool {
        self.call_ack("shutdown", json!({}), SHUTDOWN_TIMEOUT)
            .await
            .is_ok()
    }

    pub async fn acquire_hold(&self, id: &str, ttl: Duration) -> Result<()> {
        self.call_ack(
            "acquire-hold",
            json!({ "id": id, "ttlMs": ttl.as_millis() as u64 }),
            HOLD_TIMEOUT,
        )
        .await
    }

    pub async fn release_hold(&self, id: &str) -> Result<()> {
        self.call_ack("release-hold", json!({ "id": id }), HOLD_TIMEOUT)
            .await
    }

    pub async fn active_connections(&self) -> Result<ActiveConnections> {
        let resp = self
            .call("get-active-connections", json!({}), CONNECTIONS_TIMEOUT)
            .await?;
        match resp {
            Response::Object(v) => serde_json::from_value(v)
                .map_err(|e| RpcError::Protocol(format!("get-active-connections: {e}"))),
            Response::Ack => Err(RpcError::Protocol(
                "get-active-connections returned ACK, expected object".into(),
            )),
        }
    }

    pub async fn fetch_logs(&self, service: Option<&str>) -> Result<String> {
        let mut body = json!({});
        if let Some(s) = service {
            body["service"] = Value::String(s.to_owned());
        }
        let resp = self.call("fetch-logs", body, LOGS_TIMEOUT).await?;
        match resp {
            Response::Object(v) => v
                .get("logs")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| RpcError::Protocol("fetch-logs response missing `logs`".into())),
            Response::Ack => Err(RpcError::Protocol(
                "fetch-logs returned ACK, expected object".into(),
            )),
        }
    }

    /// Issue a call whose only success shape is `ACK`.
    async fn call_ack(&self, kind: &'static str, extra: Value, timeout: Duration) -> Result<()> {
        match self.call(kind, extra, timeout).await? {
            Response::Ack => Ok(()),
            Response::Object(v) => Err(RpcError::Protocol(format!(
                "{kind} returned object, expected ACK: {v}"
            ))),
        }
    }

    /// Connect, handshake, send one envelope, read one response.
    async fn call(&self, kind: &'static str, extra: Value, timeout: Duration) -> Result<Response> {
        let deadline = Instant::now() + timeout;
        let fut = self.call_inner(kind, extra);
        match time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout {
                call: kind,
                ms: timeout.as_millis(),
            }),
        }
    }

    async fn call_inner(&self, kind: &str, extra: Value) -> Result<Response> {
        let stream = UnixStream::connect(&self.uds_path)
            .await
            .map_err(|source| RpcError::Connect {
                path: self.uds_path.clone(),
                source,
            })?;
        let mut stream = handshake(stream, self.port).await?;

        let mut envelope = extra;
        if !envelope.is_object() {
            return Err(RpcError::Protocol("request body must be an object".into()));
        }
        envelope["type"] = Value::String(kind.to_owned());
        envelope["token"] = Value::String(self.token.clone());

        trace!(kind, path = %self.uds_path.display(), "agent rpc");
        send_request(&mut stream, &envelope).await?;
        read_response(stream).await
    }
}

/// Firecracker host-initiated vsock handshake.
async fn handshake(stream: UnixStream, port: u32) -> Result<UnixStream> {
    let mut reader = BufReader::new(stream);
    reader
        .get_mut()
        .write_all(format!("CONNECT {port}\n").as_bytes())
        .await?;

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let line = line.trim_end();
    if !line.starts_with("OK ") {
        return Err(RpcError::Handshake(format!(
            "expected `OK <port>`, got {line:?}"
        )));
    }
    Ok(reader.into_inner())
}

async fn send_request(stream: &mut UnixStream, envelope: &Value) -> Result<()> {
    let mut wire = serde_json::to_vec(envelope)
        .map_err(|e| RpcError::Protocol(format!("encode request: {e}")))?;
    wire.push(b'\n');
    stream.write_all(&wire).await?;
    Ok(())
}

/// Read and decode the single response line.
async fn read_response(stream: UnixStream) -> Result<Response> {
    let mut line = String::new();
    let mut reader = BufReader::new(stream).take(MAX_RESPONSE_BYTES);
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(RpcError::Protocol("connection closed before response".into()));
    }
    let line = line.trim_end();

    if line == "ACK" {
        return Ok(Response::Ack);
    }
    let value: Value = serde_json::from_str(line)
        .map_err(|e| RpcError::Protocol(format!("invalid response {line:?}: {e}")))?;
    if let Some(err) = value.get("error").and_then(Value::as_str) {
        return Err(RpcError::Agent(err.to_owned()));
    }
    Ok(Response::Object(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tokio::net::UnixListener;

    /// Spawn a mock agent accepting connections on a UDS in a temp dir.
    ///
    /// For each accepted connection: handshake, read the request envelope,
    /// pass it to `respond` and write the returned line back.
    fn mock_agent(
        responder: impl Fn(Value) -> String + Send + Sync + 'static,
    ) -> (PathBuf, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.sock");
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let mut reader = BufReader::new(stream);

                let mut connect = String::new();
                reader.read_line(&mut connect).await.unwrap();
                assert!(connect.starts_with("CONNECT "), "got {connect:?}");
                reader.get_mut().write_all(b"OK 52\n").await.unwrap();

                let mut req = String::new();
                reader.read_line(&mut req).await.unwrap();
                let envelope: Value = serde_json::from_str(req.trim_end()).unwrap();

                let mut reply = responder(envelope);
                reply.push('\n');
                reader.get_mut().write_all(reply.as_bytes()).await.unwrap();
            }
        });

        (path, dir)
    }

    fn client(path: &Path) -> AgentClient {
        AgentClient::new(path, DEFAULT_AGENT_PORT, "sekrit")
    }

    #[tokio::test]
    async fn health_ping_ack() {
        let (path, _dir) = mock_agent(|env| {
            assert_eq!(env["type"], "health-ping");
            assert_eq!(env["token"], "sekrit");
            "ACK".into()
        });
        client(&path).health_ping().await.unwrap();
    }

    #[tokio::test]
    async fn inject_secrets_carries_payload() {
        let (path, _dir) = mock_agent(|env| {
            assert_eq!(env["type"], "inject-secrets");
            assert_eq!(env["secrets"]["API_KEY"], "k-123");
            "ACK".into()
        });
        client(&path)
            .inject_secrets(&json!({ "API_KEY": "k-123" }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn active_connections_with_holds() {
        let (path, _dir) = mock_agent(|env| {
            assert_eq!(env["type"], "get-active-connections");
            r#"{"connections": 3, "holds": 1}"#.into()
        });
        let ac = client(&path).active_connections().await.unwrap();
        assert_eq!(ac.connections, 3);
        assert_eq!(ac.holds, 1);
        assert!(!ac.is_idle());
    }

    #[tokio::test]
    async fn active_connections_holds_field_optional() {
        let (path, _dir) = mock_agent(|_| r#"{"connections": 0}"#.into());
        let ac = client(&path).active_connections().await.unwrap();
        assert_eq!(ac.holds, 0);
        assert!(ac.is_idle());
    }

    #[tokio::test]
    async fn fetch_logs_extracts_payload() {
        let (path, _dir) = mock_agent(|env| {
            assert_eq!(env["type"], "fetch-logs");
            assert_eq!(env["service"], "openclaw");
            r#"{"logs": "line1\nline2"}"#.into()
        });
        let logs = client(&path).fetch_logs(Some("openclaw")).await.unwrap();
        assert_eq!(logs, "line1\nline2");
    }

    #[tokio::test]
    async fn fetch_logs_without_service_omits_field() {
        let (path, _dir) = mock_agent(|env| {
            assert!(env.get("service").is_none());
            r#"{"logs": ""}"#.into()
        });
        client(&path).fetch_logs(None).await.unwrap();
    }

    #[tokio::test]
    async fn agent_error_object_surfaces() {
        let (path, _dir) = mock_agent(|_| r#"{"error": "bad token"}"#.into());
        let err = client(&path).health_ping().await.unwrap_err();
        assert!(matches!(err, RpcError::Agent(ref m) if m == "bad token"), "got {err}");
    }

    #[tokio::test]
    async fn acquire_hold_carries_ttl_millis() {
        let (path, _dir) = mock_agent(|env| {
            assert_eq!(env["type"], "acquire-hold");
            assert_eq!(env["id"], "logs-77");
            assert_eq!(env["ttlMs"], 30_000);
            "ACK".into()
        });
        client(&path)
            .acquire_hold("logs-77", Duration::from_secs(30))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_true_on_ack() {
        let (path, _dir) = mock_agent(|_| "ACK".into());
        assert!(client(&path).shutdown().await);
    }

    #[tokio::test]
    async fn shutdown_false_when_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let c = AgentClient::new(dir.path().join("missing.sock"), 52, "t");
        assert!(!c.shutdown().await);
    }

    #[tokio::test]
    async fn connect_error_on_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let c = AgentClient::new(dir.path().join("missing.sock"), 52, "t");
        let err = c.health_ping().await.unwrap_err();
        assert!(matches!(err, RpcError::Connect { .. }), "got {err}");
    }

    #[tokio::test]
    async fn rejected_handshake_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            reader.get_mut().write_all(b"FAIL\n").await.unwrap();
        });

        let err = client(&path).health_ping().await.unwrap_err();
        assert!(matches!(err, RpcError::Handshake(_)), "got {err}");
    }

    #[tokio::test]
    async fn silent_agent_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            // Accept and hold the connection open without answering.
            let (_stream, _) = listener.accept().await.unwrap();
            time::sleep(Duration::from_secs(60)).await;
        });

        let c = client(&path);
        let start = Instant::now();
        let err = time::timeout(Duration::from_secs(10), c.health_ping())
            .await
            .expect("call should time out on its own")
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout { call: "health-ping", .. }), "got {err}");
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test]
    async fn wait_for_agent_retries_until_listening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.sock");

        let bind_path = path.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(300)).await;
            let listener = UnixListener::bind(&bind_path).unwrap();
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            reader.get_mut().write_all(b"OK 52\n").await.unwrap();
            line.clear();
            reader.read_line(&mut line).await.unwrap();
            reader.get_mut().write_all(b"ACK\n").await.unwrap();
        });

        client(&path)
            .wait_for_agent(Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_for_agent_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let c = AgentClient::new(dir.path().join("never.sock"), 52, "t");
        let err = c.wait_for_agent(Duration::from_millis(700)).await.unwrap_err();
        assert!(
            matches!(err, RpcError::Timeout { call: "wait-for-agent", .. }),
            "got {err}"
        );
    }
}
