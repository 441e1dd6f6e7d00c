//! Capability Proxy: validates browser commands against the rule registry,
//! attaches the upstream's credential, and forwards them.
//!
//! Each upstream implements [`Upstream`] to describe its own browser payload
//! and its native request shape; the validation, timeout, error translation,
//! and broadcast fan-out live here and are shared.

pub mod home_assistant;
pub mod immich;
pub mod rules;

use std::time::Duration;

use futures::future::join_all;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, warn};

use crate::error::ApiError;
use rules::{CapabilityRule, CapabilityTable};

/// Upstream error bodies are cut to this many bytes before reaching the browser.
const MAX_ERROR_BODY: usize = 4096;

/// A command in the proxy's own shape, independent of any upstream's API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub domain: String,
    pub operation: String,
    pub target: String,
    pub force: bool,
}

/// One upstream service reachable through the Capability Proxy.
pub trait Upstream: Send + Sync {
    /// Human-readable service name used in error messages.
    fn service(&self) -> &'static str;

    /// The rule table governing this upstream.
    fn rules(&self) -> &'static CapabilityTable;

    /// Parse the browser payload for this upstream.
    fn parse(&self, body: &[u8]) -> Result<Command, ApiError>;

    /// Build the upstream's native request for a validated command, with the
    /// upstream's credential attached.
    fn request(&self, http: &reqwest::Client, command: &Command) -> reqwest::RequestBuilder;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetResult {
    pub target: String,
    pub ok: bool,
}

/// Uniform acknowledgement returned to the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<TargetResult>>,
}

impl Ack {
    fn ok() -> Self {
        Self { ok: true, results: None }
    }
}

pub struct CapabilityProxy<U> {
    upstream: U,
    http: reqwest::Client,
    timeout: Duration,
}

impl<U: Upstream> CapabilityProxy<U> {
    pub fn new(upstream: U, http: reqwest::Client, timeout: Duration) -> Self {
        Self { upstream, http, timeout }
    }

    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Parse, validate, and forward a raw browser payload.
    pub async fn handle(&self, body: &[u8]) -> Result<Ack, ApiError> {
        let command = self.upstream.parse(body)?;
        self.execute(command).await
    }

    /// Validate a parsed command against the rule table and forward it.
    pub async fn execute(&self, command: Command) -> Result<Ack, ApiError> {
        let table = self.upstream.rules();

        if table.is_broadcast(&command.target) {
            let rule = table.operation(&command.domain, &command.operation)?;
            return self.broadcast(table, rule, &command).await;
        }

        table.authorize(&command.domain, &command.operation, &command.target)?;
        self.forward(&command).await?;

        info!(
            "{}: {}/{} on {}",
            self.upstream.service(),
            command.domain,
            command.operation,
            command.target
        );
        Ok(Ack::ok())
    }

    /// Send one validated command upstream and translate the outcome.
    async fn forward(&self, command: &Command) -> Result<(), ApiError> {
        let service = self.upstream.service();
        let response = self
            .upstream
            .request(&self.http, command)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                warn!("{}: request for {} failed: {}", service, command.target, e);
                ApiError::Unreachable(service)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(ApiError::Upstream { service, status, body });
        }
        Ok(())
    }

    /// Fan the command out to every known target the rule permits.
    ///
    /// Individual failures are reported per target and never fail the call.
    async fn broadcast(
        &self,
        table: &CapabilityTable,
        rule: &CapabilityRule,
        command: &Command,
    ) -> Result<Ack, ApiError> {
        let known = table.broadcast.as_ref().map(|b| b.targets).unwrap_or(&[]);
        let targets: Vec<&str> = known.iter().copied().filter(|t| rule.permits(t)).collect();

        if targets.is_empty() {
            return Err(ApiError::TargetNotAllowed {
                target: command.target.clone(),
                operation: rule.key(),
            });
        }

        let calls = targets.into_iter().map(|target| {
            let command = Command { target: target.to_string(), ..command.clone() };
            async move {
                let ok = self.forward(&command).await.is_ok();
                TargetResult { target: command.target, ok }
            }
        });
        let results = join_all(calls).await;

        let failed = results.iter().filter(|r| !r.ok).count();
        info!(
            "{}: broadcast {} to {} target(s), {} failed",
            self.upstream.service(),
            rule.key(),
            results.len(),
            failed
        );

        Ok(Ack { ok: true, results: Some(results) })
    }
}

/// Decode a JSON request body, mapping every failure to a 400.
pub(crate) fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        if e.is_data() {
            ApiError::BadRequest(format!("Invalid request body: {}", e))
        } else {
            ApiError::BadRequest("Invalid JSON".into())
        }
    })
}

/// Unwrap a required payload field; absent or blank values name the field.
pub(crate) fn required(value: Option<String>, field: &str) -> Result<String, ApiError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("Missing {}", field)))
}

/// Read a failed response's body, cut at a char boundary to at most
/// [`MAX_ERROR_BODY`] bytes.
async fn error_body(response: reqwest::Response) -> String {
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

/// Send a read-only upstream request and decode its JSON body.
pub(crate) async fn fetch_json<T: DeserializeOwned>(
    service: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<T, ApiError> {
    let response = request.send().await.map_err(|e| {
        warn!("{}: fetch failed: {}", service, e);
        ApiError::Unreachable(service)
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = error_body(response).await;
        return Err(ApiError::Upstream { service, status, body });
    }

    response.json::<T>().await.map_err(|e| {
        warn!("{}: unexpected response body: {}", service, e);
        ApiError::Unreachable(service)
    })
}
