//! HTTP server: shared state, router, and the response-wide middleware.
//!
//! Every route sits behind the Route Guard and the security header layer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tracing::info;

use crate::ca;
use crate::config::Config;
use crate::guard::{self, GuardPolicy};
use crate::oidc::{self, OidcClient};
use crate::pages::{self, Templates};
use crate::proxy::home_assistant::{self, HomeAssistant};
use crate::proxy::immich::{self, Immich};
use crate::proxy::CapabilityProxy;
use crate::session::SessionCodec;
use crate::status::{self, StatusAggregator};

/// State shared with every handler. Built once at startup, never mutated.
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: SessionCodec,
    pub guard: GuardPolicy,
    pub oidc: Option<OidcClient>,
    pub home_assistant: Option<CapabilityProxy<HomeAssistant>>,
    pub immich: Option<CapabilityProxy<Immich>>,
    pub status: StatusAggregator,
    pub pages: Templates,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("homelab-portal/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Self::with_client(config, http)
    }

    /// Build state around an existing HTTP client.
    pub fn with_client(config: Arc<Config>, http: reqwest::Client) -> anyhow::Result<Self> {
        let command_timeout = Duration::from_secs(config.proxy.timeout_secs);
        let probe_timeout = Duration::from_secs(config.proxy.probe_timeout_secs);
        let up = &config.upstreams;

        let home_assistant = HomeAssistant::from_config(&up.home_assistant)
            .map(|ha| CapabilityProxy::new(ha, http.clone(), command_timeout));
        let immich = Immich::from_config(&up.immich)
            .map(|im| CapabilityProxy::new(im, http.clone(), command_timeout));
        let status = StatusAggregator::from_config(up, http.clone(), probe_timeout)
            .context("failed to build status probes")?;
        let oidc = OidcClient::from_config(&config)?;

        Ok(Self {
            sessions: SessionCodec::from_config(&config.auth, &config.server.public_url),
            guard: GuardPolicy::from_config(&config.auth),
            oidc,
            home_assistant,
            immich,
            status,
            pages: Templates::load().context("failed to load page templates")?,
            http,
            config,
        })
    }
}

/// Build the full router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Pages
        .route("/", get(pages::home))
        .route("/links", get(pages::links))
        .route("/admin", get(pages::admin))
        .route("/login", get(pages::login))
        .route("/setup", get(pages::setup))
        .route("/unauthorized", get(pages::unauthorized))
        .route("/static/portal.css", get(pages::stylesheet))
        .route("/health", get(pages::health))
        // Sign-in
        .route("/api/auth/signin", get(oidc::signin))
        .route(oidc::CALLBACK_PATH, get(oidc::callback))
        .route("/api/auth/signout", get(oidc::signout).post(oidc::signout))
        .route("/api/auth/session", get(oidc::current_session))
        // Capability Proxy
        .route("/api/ha/services", post(home_assistant::api_call_service))
        .route("/api/immich/jobs/command", post(immich::api_job_command))
        // Read-only views
        .route("/api/ha/states", get(home_assistant::api_states))
        .route("/api/ha/energy", get(home_assistant::api_energy))
        .route("/api/immich/jobs", get(immich::api_library_summary))
        .route("/api/icloudpd/status", get(status::api_icloudpd_status))
        .route("/api/monitoring/status", get(status::api_status))
        .route("/api/ca/root", get(ca::api_root_cert))
        .layer(middleware::from_fn_with_state(state.clone(), guard::route_guard))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

/// Middleware that adds security headers to all responses.
async fn security_headers(request: axum::extract::Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static(
            "default-src 'self'; style-src 'self'; script-src 'self'; img-src 'self' data:; connect-src 'self'; frame-ancestors 'none'",
        ),
    );
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    response
}

/// Log what is wired up, without secrets.
fn log_configuration(state: &AppState) {
    let config = &state.config;
    info!(
        "Sign-in: {}",
        if state.oidc.is_some() { "Microsoft Entra ID" } else { "not configured" }
    );
    info!(
        "Guard: admin group {}, user group {}",
        if config.auth.admin_group.is_empty() { "unset" } else { "set" },
        if state.guard.requires_membership() { "enforced" } else { "not enforced" }
    );
    info!(
        "Capability Proxy: Home Assistant {}, Immich {}",
        if state.home_assistant.is_some() { "on" } else { "off" },
        if state.immich.is_some() { "on" } else { "off" }
    );
    for probe in state.status.probes() {
        info!("Status probe: {}", probe.name);
    }
}

/// Bind and serve until Ctrl+C.
pub async fn serve(config: Arc<Config>) -> anyhow::Result<()> {
    let ip: std::net::IpAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let addr = std::net::SocketAddr::new(ip, config.server.port);

    let state = Arc::new(AppState::new(config)?);
    log_configuration(&state);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Portal listening on http://{}/", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
            }
            info!("Shutting down...");
        })
        .await
        .context("server error")?;

    Ok(())
}
