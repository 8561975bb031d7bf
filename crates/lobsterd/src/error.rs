use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum LobsterError {
    #[error("this host is not Linux")]
    NotLinux,

    #[error("lobsterd must run as root")]
    NotRoot,

    #[error("/dev/kvm not available: {0}")]
    KvmNotAvailable(String),

    #[error("firecracker binary not usable: {0}")]
    FirecrackerNotFound(PathBuf),

    #[error("jailer binary not usable: {0}")]
    JailerNotFound(PathBuf),

    #[error("jailer setup failed: {0}")]
    JailerSetupFailed(String),

    #[error("network setup failed: {0}")]
    NetworkSetupFailed(String),

    #[error("firewall error: {0}")]
    FirewallError(String),

    #[error("zfs error: {0}")]
    ZfsError(String),

    #[error("vsock connect failed: {0}")]
    VsockConnectFailed(String),

    #[error("agent timeout: {0}")]
    AgentTimeout(String),

    #[error("caddy admin api: {0}")]
    CaddyApiError(String),

    #[error("proxy error: {0}")]
    ProxyError(String),

    #[error("registry locked by a concurrent operation")]
    RegistryLocked,

    #[error("registry corrupt: {0}")]
    RegistryCorrupt(String),

    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    #[error("tenant already exists: {0}")]
    TenantExists(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("operation already in flight for tenant {0}")]
    OperationInFlight(String),

    #[error("command failed: {argv} (exit {code}): {stderr}", code = .exit_code.map_or_else(|| "killed".to_string(), |c| c.to_string()))]
    ExecFailed {
        argv: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("repair attempts exhausted for tenant {0}")]
    RepairExceeded(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type LobsterResult<T> = Result<T, LobsterError>;

impl LobsterError {
    /// Stable identifier used by `--json` error output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotLinux => "NotLinux",
            Self::NotRoot => "NotRoot",
            Self::KvmNotAvailable(_) => "KvmNotAvailable",
            Self::FirecrackerNotFound(_) => "FirecrackerNotFound",
            Self::JailerNotFound(_) => "JailerNotFound",
            Self::JailerSetupFailed(_) => "JailerSetupFailed",
            Self::NetworkSetupFailed(_) => "NetworkSetupFailed",
            Self::FirewallError(_) => "FirewallError",
            Self::ZfsError(_) => "ZfsError",
            Self::VsockConnectFailed(_) => "VsockConnectFailed",
            Self::AgentTimeout(_) => "AgentTimeout",
            Self::CaddyApiError(_) => "CaddyApiError",
            Self::ProxyError(_) => "ProxyError",
            Self::RegistryLocked => "RegistryLocked",
            Self::RegistryCorrupt(_) => "RegistryCorrupt",
            Self::TenantNotFound(_) => "TenantNotFound",
            Self::TenantExists(_) => "TenantExists",
            Self::ValidationFailed(_) => "ValidationFailed",
            Self::OperationInFlight(_) => "OperationInFlight",
            Self::ExecFailed { .. } => "ExecFailed",
            Self::RepairExceeded(_) => "RepairExceeded",
            Self::Config(_) => "Config",
            Self::Io(_) => "Io",
        }
    }

    /// `{"error": {"code", "message"}}` for `--json` command variants.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": { "code": self.code(), "message": self.to_string() }
        })
    }
}

impl From<vsock_rpc::RpcError> for LobsterError {
    fn from(e: vsock_rpc::RpcError) -> Self {
        match e {
            vsock_rpc::RpcError::Timeout { .. } => Self::AgentTimeout(e.to_string()),
            other => Self::VsockConnectFailed(other.to_string()),
        }
    }
}
