//! Server-rendered pages. Presentation is deliberately bare; the Route Guard
//! decides who reaches each one.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse},
};
use serde::{Deserialize, Serialize};
use tera::{Context, Tera};

use crate::error::ApiError;
use crate::guard::sanitize_callback;
use crate::server::AppState;
use crate::session::Session;

/// Page templates compiled into the binary. Every `.html` template is
/// autoescaped by tera.
pub struct Templates {
    engine: Tera,
}

impl Templates {
    pub fn load() -> anyhow::Result<Self> {
        let mut engine = Tera::default();
        engine.add_raw_templates(vec![
            ("layout.html", include_str!("../templates/layout.html")),
            ("home.html", include_str!("../templates/home.html")),
            ("links.html", include_str!("../templates/links.html")),
            ("admin.html", include_str!("../templates/admin.html")),
            ("login.html", include_str!("../templates/login.html")),
            ("unauthorized.html", include_str!("../templates/unauthorized.html")),
            ("setup.html", include_str!("../templates/setup.html")),
        ])?;
        Ok(Self { engine })
    }

    fn render(
        &self,
        name: &str,
        title: &str,
        session: Option<&Session>,
        mut context: Context,
    ) -> Result<Html<String>, ApiError> {
        context.insert("title", title);
        if let Some(session) = session {
            context.insert("session", session);
        }
        self.engine
            .render(name, &context)
            .map(Html)
            .map_err(|e| ApiError::Internal(format!("render {}: {}", name, e)))
    }
}

#[derive(Serialize)]
struct RuleRow {
    upstream: &'static str,
    key: String,
    enabled: bool,
}

fn rule_rows() -> Vec<RuleRow> {
    crate::proxy::rules::REGISTRY
        .iter()
        .flat_map(|table| {
            table.rules.iter().map(move |rule| RuleRow {
                upstream: table.upstream,
                key: rule.key(),
                enabled: !rule.targets.is_empty(),
            })
        })
        .collect()
}

/// GET /
pub async fn home(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Html<String>, ApiError> {
    let session = state.sessions.session_from_headers(&headers);
    state.pages.render("home.html", "Home", session.as_ref(), Context::new())
}

/// GET /links
pub async fn links(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Html<String>, ApiError> {
    let session = state.sessions.session_from_headers(&headers);
    state.pages.render("links.html", "Links", session.as_ref(), Context::new())
}

/// GET /admin
pub async fn admin(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Html<String>, ApiError> {
    let session = state.sessions.session_from_headers(&headers);
    let mut context = Context::new();
    context.insert("rules", &rule_rows());
    state.pages.render("admin.html", "Admin", session.as_ref(), context)
}

#[derive(Deserialize)]
pub struct LoginQuery {
    #[serde(rename = "callbackUrl")]
    callback_url: Option<String>,
    error: Option<String>,
}

fn render_login(pages: &Templates, query: &LoginQuery) -> Result<Html<String>, ApiError> {
    let mut context = Context::new();
    context.insert("callback", &sanitize_callback(query.callback_url.as_deref()));
    context.insert("error", &query.error.is_some());
    pages.render("login.html", "Sign in", None, context)
}

/// GET /login
pub async fn login(State(state): State<Arc<AppState>>, Query(query): Query<LoginQuery>) -> Result<Html<String>, ApiError> {
    render_login(&state.pages, &query)
}

/// GET /unauthorized
pub async fn unauthorized(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Html<String>, ApiError> {
    let session = state.sessions.session_from_headers(&headers);
    state.pages.render("unauthorized.html", "Not authorized", session.as_ref(), Context::new())
}

/// GET /setup
pub async fn setup(State(state): State<Arc<AppState>>) -> Result<Html<String>, ApiError> {
    state.pages.render("setup.html", "Setup", None, Context::new())
}

/// GET /static/portal.css
pub async fn stylesheet() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/css")],
        include_str!("portal.css"),
    )
}

/// Health check endpoint for container orchestration.
pub async fn health() -> &'static str {
    "ok"
}
