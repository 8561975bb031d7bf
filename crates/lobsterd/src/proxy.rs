//! Reverse-proxy driver. The shipped backend is the Caddy admin API; the
//! trait is the seam for an nginx config-file backend.
//!
//! All routes this process manages carry an `@id` of `lobster-route-<name>`
//! so they can be found, replaced, and garbage-collected individually.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{LobsterError, LobsterResult};

/// Caddy server block owned by this process.
const SERVER_NAME: &str = "lobsterd";

const ROUTE_ID_PREFIX: &str = "lobster-route-";

const API_TIMEOUT: Duration = Duration::from_secs(10);

pub fn route_id(name: &str) -> String {
    format!("{ROUTE_ID_PREFIX}{name}")
}

/// Tenant name encoded in a managed route id, if it is one of ours.
pub fn route_tenant(id: &str) -> Option<&str> {
    id.strip_prefix(ROUTE_ID_PREFIX)
}

#[async_trait]
pub trait ProxyDriver: Send + Sync {
    /// Install the base server config if the proxy does not carry it yet.
    /// Must not disturb existing tenant routes.
    async fn ensure_base_config(&self) -> LobsterResult<()>;

    /// Route `host` to `127.0.0.1:<upstream_port>`. Replaces an existing
    /// route for the same tenant.
    async fn add_route(&self, name: &str, host: &str, upstream_port: u16) -> LobsterResult<()>;

    /// Remove the tenant's route. Removing an absent route is success.
    async fn remove_route(&self, name: &str) -> LobsterResult<()>;

    async fn has_route(&self, name: &str) -> LobsterResult<bool>;

    /// Tenant names of all managed routes currently installed.
    async fn list_routes(&self) -> LobsterResult<Vec<String>>;

    async fn is_running(&self) -> bool;
}

pub struct CaddyDriver {
    client: reqwest::Client,
    admin: String,
    tls: bool,
}

impl CaddyDriver {
    pub fn new(admin_api: &str, tls: bool) -> LobsterResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .map_err(|e| LobsterError::ProxyError(format!("http client: {e}")))?;
        Ok(Self {
            client,
            admin: admin_api.trim_end_matches('/').to_owned(),
            tls,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.admin)
    }

    /// Base config: one HTTP server with an empty route table.
    fn base_config(&self) -> Value {
        let listen = if self.tls {
            json!([":443", ":80"])
        } else {
            json!([":80"])
        };
        json!({
            "apps": {
                "http": {
                    "servers": {
                        SERVER_NAME: {
                            "listen": listen,
                            "routes": [],
                        }
                    }
                }
            }
        })
    }

    fn route_body(name: &str, host: &str, upstream_port: u16) -> Value {
        json!({
            "@id": route_id(name),
            "match": [{ "host": [host] }],
            "handle": [{
                "handler": "reverse_proxy",
                "upstreams": [{ "dial": format!("127.0.0.1:{upstream_port}") }],
            }],
        })
    }

    async fn api_error(what: &str, resp: reqwest::Response) -> LobsterError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        LobsterError::CaddyApiError(format!("{what}: {status} {}", body.trim()))
    }

    async fn delete_route_by_id(&self, id: &str) -> LobsterResult<bool> {
        let resp = self
            .client
            .delete(self.url(&format!("/id/{id}")))
            .send()
            .await
            .map_err(|e| LobsterError::CaddyApiError(format!("delete route: {e}")))?;
        if resp.status().is_success() {
            return Ok(true);
        }
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Err(Self::api_error("delete route", resp).await)
    }

    async fn raw_routes(&self) -> LobsterResult<Vec<Value>> {
        let resp = self
            .client
            .get(self.url(&format!(
                "/config/apps/http/servers/{SERVER_NAME}/routes"
            )))
            .send()
            .await
            .map_err(|e| LobsterError::CaddyApiError(format!("list routes: {e}")))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(Self::api_error("list routes", resp).await);
        }
        let routes: Option<Vec<Value>> = resp
            .json()
            .await
            .map_err(|e| LobsterError::CaddyApiError(format!("decode routes: {e}")))?;
        Ok(routes.unwrap_or_default())
    }
}

#[async_trait]
impl ProxyDriver for CaddyDriver {
    async fn ensure_base_config(&self) -> LobsterResult<()> {
        // Probe for our server block; a 404/null means no base config yet.
        let resp = self
            .client
            .get(self.url(&format!("/config/apps/http/servers/{SERVER_NAME}")))
            .send()
            .await
            .map_err(|e| LobsterError::CaddyApiError(format!("probe config: {e}")))?;
        if resp.status().is_success() {
            let body: Value = resp
                .json()
                .await
                .map_err(|e| LobsterError::CaddyApiError(format!("decode config: {e}")))?;
            if !body.is_null() {
                return Ok(());
            }
        }

        let resp = self
            .client
            .post(self.url("/load"))
            .json(&self.base_config())
            .send()
            .await
            .map_err(|e| LobsterError::CaddyApiError(format!("load base config: {e}")))?;
        if !resp.status().is_success() {
            return Err(Self::api_error("load base config", resp).await);
        }
        info!("proxy base config loaded");
        Ok(())
    }

    async fn add_route(&self, name: &str, host: &str, upstream_port: u16) -> LobsterResult<()> {
        // Replace-by-delete keeps the call idempotent.
        self.delete_route_by_id(&route_id(name)).await?;

        let resp = self
            .client
            .post(self.url(&format!(
                "/config/apps/http/servers/{SERVER_NAME}/routes"
            )))
            .json(&Self::route_body(name, host, upstream_port))
            .send()
            .await
            .map_err(|e| LobsterError::CaddyApiError(format!("add route: {e}")))?;
        if !resp.status().is_success() {
            return Err(Self::api_error("add route", resp).await);
        }
        info!(tenant = name, host, upstream_port, "proxy route added");
        Ok(())
    }

    async fn remove_route(&self, name: &str) -> LobsterResult<()> {
        let removed = self.delete_route_by_id(&route_id(name)).await?;
        if removed {
            debug!(tenant = name, "proxy route removed");
        }
        Ok(())
    }

    async fn has_route(&self, name: &str) -> LobsterResult<bool> {
        Ok(self.list_routes().await?.iter().any(|n| n == name))
    }

    async fn list_routes(&self) -> LobsterResult<Vec<String>> {
        Ok(self
            .raw_routes()
            .await?
            .iter()
            .filter_map(|r| r.get("@id").and_then(Value::as_str))
            .filter_map(route_tenant)
            .map(str::to_owned)
            .collect())
    }

    async fn is_running(&self) -> bool {
        match self.client.get(self.url("/config/")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
