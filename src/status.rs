//! Status Aggregator: one reachability probe per configured upstream,
//! run concurrently and reduced to a health state.

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, Json};
use futures::future::join_all;
use serde::Serialize;
use tracing::debug;

use crate::config::UpstreamsConfig;
use crate::error::ApiError;
use crate::server::AppState;
use crate::session::AuthSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Online,
    Offline,
    Degraded,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub name: String,
    pub status: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A single lightweight GET against an upstream.
#[derive(Debug, Clone)]
pub struct Probe {
    pub name: &'static str,
    pub url: String,
    /// Optional `Authorization` header value.
    pub authorization: Option<String>,
    /// Use the client that accepts self-signed certificates.
    pub insecure: bool,
}

impl Probe {
    fn new(name: &'static str, base: &str, path: &str) -> Self {
        Self {
            name,
            url: format!("{}{}", base.trim_end_matches('/'), path),
            authorization: None,
            insecure: false,
        }
    }

    fn authorization(mut self, value: String) -> Self {
        self.authorization = Some(value);
        self
    }
}

pub struct StatusAggregator {
    probes: Vec<Probe>,
    http: reqwest::Client,
    insecure_http: reqwest::Client,
    timeout: Duration,
}

impl StatusAggregator {
    pub fn new(probes: Vec<Probe>, http: reqwest::Client, timeout: Duration) -> Self {
        Self {
            probes,
            insecure_http: http.clone(),
            http,
            timeout,
        }
    }

    /// Build the probe set from configuration; upstreams without an address
    /// are left out entirely.
    pub fn from_config(
        upstreams: &UpstreamsConfig,
        http: reqwest::Client,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let probes = probes_for(upstreams);
        let insecure_http = if upstreams.proxmox.accept_invalid_certs {
            reqwest::Client::builder()
                .danger_accept_invalid_certs(true)
                .build()?
        } else {
            http.clone()
        };
        Ok(Self { probes, http, insecure_http, timeout })
    }

    pub fn probes(&self) -> &[Probe] {
        &self.probes
    }

    /// Probe every upstream concurrently and wait for all of them.
    pub async fn poll(&self) -> Vec<HealthStatus> {
        join_all(self.probes.iter().map(|p| self.check(p))).await
    }

    async fn check(&self, probe: &Probe) -> HealthStatus {
        let client = if probe.insecure { &self.insecure_http } else { &self.http };
        let mut request = client.get(&probe.url).timeout(self.timeout);
        if let Some(auth) = &probe.authorization {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }

        // The outer timeout bounds connection setup as well as the response.
        let result = tokio::time::timeout(self.timeout, request.send()).await;

        let (status, detail) = match result {
            Ok(Ok(response)) if response.status().is_success() => (HealthState::Online, None),
            Ok(Ok(response)) => (
                HealthState::Degraded,
                Some(format!("HTTP {}", response.status().as_u16())),
            ),
            Ok(Err(e)) if e.is_builder() => {
                debug!("Status: cannot build probe for {}: {}", probe.name, e);
                (HealthState::Unknown, Some("Invalid URL".to_string()))
            }
            Ok(Err(e)) => {
                debug!("Status: {} unreachable: {}", probe.name, e);
                (HealthState::Offline, Some("Unreachable".to_string()))
            }
            Err(_) => {
                debug!("Status: {} timed out after {:?}", probe.name, self.timeout);
                (HealthState::Offline, Some("Unreachable".to_string()))
            }
        };

        HealthStatus { name: probe.name.to_string(), status, detail }
    }
}

/// Fixed probe endpoints for every upstream the portal knows.
pub fn probes_for(up: &UpstreamsConfig) -> Vec<Probe> {
    let mut probes = Vec::new();

    if let Some(url) = &up.home_assistant.url {
        let token = up.home_assistant.token.as_deref().unwrap_or_default();
        probes.push(Probe::new("Home Assistant", url, "/api/").authorization(format!("Bearer {}", token)));
    }

    if let Some(url) = &up.immich.url {
        probes.push(Probe::new("Immich", url, "/api/server/ping"));
    }

    if let (Some(url), Some(token_id)) = (&up.proxmox.url, &up.proxmox.token_id) {
        let secret = up.proxmox.token_secret.as_deref().unwrap_or_default();
        let mut probe = Probe::new("Proxmox VE", url, "/api2/json/version")
            .authorization(format!("PVEAPIToken={}={}", token_id, secret));
        probe.insecure = up.proxmox.accept_invalid_certs;
        probes.push(probe);
    }

    if let Some(url) = &up.pihole.url {
        probes.push(Probe::new("Pi-hole", url, "/admin/api.php?status"));
    }

    if let Some(url) = &up.pihole_secondary.url {
        probes.push(Probe::new("Pi-hole Secondary", url, "/admin/api.php?status"));
    }

    if let Some(url) = &up.nas.url {
        probes.push(Probe::new("NAS", url, ""));
    }

    if let Some(url) = &up.nginx_proxy_manager.url {
        probes.push(Probe::new("Nginx Proxy Manager", url, ""));
    }

    if let Some(url) = &up.portainer.url {
        probes.push(Probe::new("Portainer", url, "/api/status"));
    }

    probes
}

/// GET /api/monitoring/status
pub async fn api_status(
    State(state): State<Arc<AppState>>,
    _session: AuthSession,
) -> Json<Vec<HealthStatus>> {
    Json(state.status.poll().await)
}

// === iCloud Photos downloader ===

const ICLOUDPD_SERVICE: &str = "iCloudPD status API";
const ICLOUDPD_TIMEOUT: Duration = Duration::from_secs(8);

/// GET /api/icloudpd/status
///
/// Passthrough of the downloader's own status document. Any upstream
/// failure is a 502.
pub async fn api_icloudpd_status(
    State(state): State<Arc<AppState>>,
    _session: AuthSession,
) -> Result<Json<serde_json::Value>, ApiError> {
    let base = state
        .config
        .upstreams
        .icloudpd
        .url
        .as_deref()
        .ok_or(ApiError::NotConfigured(ICLOUDPD_SERVICE))?;

    let request = state
        .http
        .get(format!("{}/status", base.trim_end_matches('/')))
        .timeout(ICLOUDPD_TIMEOUT);

    match crate::proxy::fetch_json::<serde_json::Value>(ICLOUDPD_SERVICE, request).await {
        Ok(value) => Ok(Json(value)),
        Err(ApiError::Upstream { service, status, .. }) => {
            Err(ApiError::BadGateway { service, status })
        }
        Err(e) => Err(e),
    }
}
