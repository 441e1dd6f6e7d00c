//! Route Guard: the request-level gate in front of every page.
//!
//! Runs as a router-wide middleware, so new pages are covered without any
//! per-handler check. API routes are public here; their handlers demand a
//! session through [`crate::session::AuthSession`] and answer with 401/403
//! instead of redirects.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};

use crate::config::AuthConfig;
use crate::server::AppState;
use crate::session::Session;

pub const LOGIN_PATH: &str = "/login";
pub const UNAUTHORIZED_PATH: &str = "/unauthorized";
pub const ADMIN_PREFIX: &str = "/admin";

/// Paths reachable without a session. Matched as whole path segments.
const PUBLIC_PREFIXES: &[&str] = &["/login", "/setup", "/api", "/static", "/health"];
/// Paths reachable without a session, matched exactly.
const PUBLIC_EXACT: &[&str] = &[UNAUTHORIZED_PATH, "/favicon.ico"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Allow,
    /// Send the browser to the login page, returning to `callback` afterwards.
    RedirectToLogin { callback: String },
    RedirectToUnauthorized,
}

/// Guard rules. Read-only after startup.
#[derive(Debug, Clone)]
pub struct GuardPolicy {
    user_group_configured: bool,
}

impl GuardPolicy {
    pub fn new(user_group_configured: bool) -> Self {
        Self { user_group_configured }
    }

    pub fn from_config(auth: &AuthConfig) -> Self {
        Self::new(auth.user_group.is_some())
    }

    /// Whether a general-access group is configured at all.
    pub fn requires_membership(&self) -> bool {
        self.user_group_configured
    }

    pub fn is_public(&self, path: &str) -> bool {
        PUBLIC_EXACT.contains(&path)
            || PUBLIC_PREFIXES
                .iter()
                .any(|prefix| path == *prefix || path.starts_with(&format!("{}/", prefix)))
    }

    pub fn is_admin_path(&self, path: &str) -> bool {
        path.starts_with(ADMIN_PREFIX)
    }

    /// Decide what happens to a request for `path`, in rule order.
    pub fn decide(&self, path: &str, session: Option<&Session>) -> GuardDecision {
        if self.is_public(path) {
            return GuardDecision::Allow;
        }

        let Some(session) = session else {
            return GuardDecision::RedirectToLogin { callback: path.to_string() };
        };

        if self.is_admin_path(path) && !session.is_admin {
            return GuardDecision::RedirectToUnauthorized;
        }

        if self.user_group_configured && !session.is_admin && !session.is_authorized {
            return GuardDecision::RedirectToUnauthorized;
        }

        GuardDecision::Allow
    }
}

/// Login page URL carrying the callback path.
pub fn login_url(callback: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(callback.as_bytes()).collect();
    format!("{}?callbackUrl={}", LOGIN_PATH, encoded)
}

/// Keep only same-origin relative paths; anything else becomes `/`.
pub fn sanitize_callback(raw: Option<&str>) -> String {
    match raw {
        Some(path) if path.starts_with('/') && !path.starts_with("//") && !path.contains('\\') => {
            path.to_string()
        }
        _ => "/".to_string(),
    }
}

/// Middleware applying [`GuardPolicy::decide`] before any handler runs.
pub async fn route_guard(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let session = if state.guard.is_public(&path) {
        None
    } else {
        state.sessions.session_from_headers(request.headers())
    };

    match state.guard.decide(&path, session.as_ref()) {
        GuardDecision::Allow => next.run(request).await,
        GuardDecision::RedirectToLogin { callback } => {
            tracing::debug!("Guard: no session for {}, redirecting to login", path);
            Redirect::to(&login_url(&callback)).into_response()
        }
        GuardDecision::RedirectToUnauthorized => {
            tracing::info!(
                "Guard: denied {} for {}",
                path,
                session.as_ref().map(|s| s.email.as_str()).unwrap_or("?")
            );
            Redirect::to(UNAUTHORIZED_PATH).into_response()
        }
    }
}
