//! Sign-in against Microsoft Entra ID (OpenID Connect authorization code flow).
//!
//! The portal only needs the id_token's identity and group claims. It turns
//! them into a [`Session`] once, at callback time, and from then on trusts its
//! own signed cookie.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap},
    response::{AppendHeaders, IntoResponse, Redirect, Response},
    Json,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use rand::RngCore;
use serde::Deserialize;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::config::Config;
use crate::error::ApiError;
use crate::guard::{sanitize_callback, LOGIN_PATH};
use crate::server::AppState;
use crate::session::{cookie_value, derive_access, expire_cookie, Session};

pub const CALLBACK_PATH: &str = "/api/auth/callback/microsoft-entra-id";
const STATE_COOKIE: &str = "portal_oauth_state";
const STATE_COOKIE_PATH: &str = "/api/auth";
const STATE_TTL_SECS: u64 = 600;
const SCOPE: &str = "openid profile email User.Read";
const IDP: &str = "Identity provider";

/// Identity claims taken from a validated id_token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub name: String,
    pub email: String,
    pub groups: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    sub: String,
    name: Option<String>,
    email: Option<String>,
    preferred_username: Option<String>,
    #[serde(default)]
    groups: Vec<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    id_token: String,
}

pub struct OidcClient {
    authorize_url: url::Url,
    token_url: String,
    issuer: String,
    client_id: String,
    client_secret: Zeroizing<String>,
    redirect_uri: String,
}

impl OidcClient {
    pub fn new(
        authority: &str,
        tenant: &str,
        client_id: &str,
        client_secret: &str,
        public_url: &str,
    ) -> anyhow::Result<Self> {
        let base = format!("{}/{}", authority.trim_end_matches('/'), tenant);
        let authorize_url = url::Url::parse(&format!("{}/oauth2/v2.0/authorize", base))
            .map_err(|e| anyhow::anyhow!("invalid identity provider authority {:?}: {}", authority, e))?;

        Ok(Self {
            authorize_url,
            token_url: format!("{}/oauth2/v2.0/token", base),
            issuer: format!("{}/v2.0", base),
            client_id: client_id.to_string(),
            client_secret: Zeroizing::new(client_secret.to_string()),
            redirect_uri: format!("{}{}", public_url.trim_end_matches('/'), CALLBACK_PATH),
        })
    }

    /// `None` when any of tenant, client id, or client secret is missing.
    pub fn from_config(config: &Config) -> anyhow::Result<Option<Self>> {
        let Some((tenant, id, secret)) = config.auth.client() else {
            return Ok(None);
        };
        Self::new(&config.auth.authority, tenant, id, secret, &config.server.public_url).map(Some)
    }

    /// Authorize endpoint URL for a fresh sign-in.
    pub fn authorize_url(&self, state: &str) -> String {
        let mut url = self.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("response_mode", "query")
            .append_pair("scope", SCOPE)
            .append_pair("state", state);
        url.to_string()
    }

    /// Redeem an authorization code and validate the returned id_token.
    pub async fn exchange_code(&self, http: &reqwest::Client, code: &str) -> Result<Identity, ApiError> {
        let response = http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", SCOPE),
            ])
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| {
                warn!("Sign-in: token endpoint unreachable: {}", e);
                ApiError::Unreachable(IDP)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Sign-in: token endpoint returned {}: {}", status, body);
            return Err(ApiError::BadGateway { service: IDP, status });
        }

        let tokens: TokenResponse = response.json().await.map_err(|e| {
            warn!("Sign-in: unexpected token response: {}", e);
            ApiError::Unreachable(IDP)
        })?;

        self.identity(&tokens.id_token)
    }

    /// Read identity claims from an id_token.
    ///
    /// The token was received directly from the token endpoint over TLS, so
    /// only audience, issuer, and expiry are checked.
    pub fn identity(&self, id_token: &str) -> Result<Identity, ApiError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.insecure_disable_signature_validation();
        validation.set_audience(&[&self.client_id]);
        validation.set_issuer(&[&self.issuer]);

        let claims = decode::<IdTokenClaims>(id_token, &DecodingKey::from_secret(&[]), &validation)
            .map_err(|e| {
                warn!("Sign-in: rejected id_token: {}", e);
                ApiError::Forbidden("Invalid identity token".into())
            })?
            .claims;

        let email = claims
            .email
            .or(claims.preferred_username)
            .unwrap_or_default();
        Ok(Identity {
            subject: claims.sub,
            name: claims.name.unwrap_or_else(|| email.clone()),
            email,
            groups: claims.groups,
        })
    }
}

/// Random hex nonce for the `state` parameter.
fn new_state() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn state_cookie(state: &str, callback: &str, secure: bool) -> String {
    let value = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("s", state)
        .append_pair("cb", callback)
        .finish();
    let secure = if secure { " Secure;" } else { "" };
    format!(
        "{}={}; Path={}; HttpOnly;{} SameSite=Lax; Max-Age={}",
        STATE_COOKIE, value, STATE_COOKIE_PATH, secure, STATE_TTL_SECS
    )
}

fn clear_state_cookie(secure: bool) -> String {
    expire_cookie(STATE_COOKIE, STATE_COOKIE_PATH, secure)
}

/// Pull `(state, callback)` back out of the state cookie.
fn read_state_cookie(headers: &HeaderMap) -> Option<(String, String)> {
    let raw = cookie_value(headers, STATE_COOKIE)?;
    let mut state = None;
    let mut callback = None;
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        match key.as_ref() {
            "s" => state = Some(value.into_owned()),
            "cb" => callback = Some(value.into_owned()),
            _ => {}
        }
    }
    Some((state?, sanitize_callback(callback.as_deref())))
}

#[derive(Deserialize)]
pub struct SigninQuery {
    #[serde(rename = "callbackUrl")]
    callback_url: Option<String>,
}

/// GET /api/auth/signin
pub async fn signin(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SigninQuery>,
) -> Result<Response, ApiError> {
    let oidc = state.oidc.as_ref().ok_or(ApiError::NotConfigured("Sign-in"))?;

    let nonce = new_state();
    let callback = sanitize_callback(query.callback_url.as_deref());
    let cookie = state_cookie(&nonce, &callback, state.sessions.secure());

    Ok((
        [(header::SET_COOKIE, cookie)],
        Redirect::to(&oidc.authorize_url(&nonce)),
    )
        .into_response())
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// GET /api/auth/callback/microsoft-entra-id
pub async fn callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, ApiError> {
    let oidc = state.oidc.as_ref().ok_or(ApiError::NotConfigured("Sign-in"))?;

    if let Some(error) = query.error {
        warn!("Sign-in: identity provider returned error {}", error);
        return Ok(Redirect::to(&format!("{}?error=AccessDenied", LOGIN_PATH)).into_response());
    }

    let (expected, callback) = read_state_cookie(&headers)
        .ok_or_else(|| ApiError::BadRequest("Missing sign-in state".into()))?;
    if query.state.as_deref() != Some(expected.as_str()) {
        return Err(ApiError::BadRequest("Invalid sign-in state".into()));
    }
    let code = query
        .code
        .ok_or_else(|| ApiError::BadRequest("Missing code".into()))?;

    let identity = oidc.exchange_code(&state.http, &code).await?;
    let auth = &state.config.auth;
    let flags = derive_access(&identity.groups, &auth.admin_group, auth.user_group.as_deref());

    let session = Session {
        id: identity.subject,
        name: identity.name,
        email: identity.email,
        is_admin: flags.is_admin,
        is_authorized: flags.is_authorized,
    };
    let token = state
        .sessions
        .issue(&session)
        .map_err(|e| ApiError::Internal(format!("Failed to issue session: {}", e)))?;

    info!(
        "Signed in {} (admin: {}, authorized: {})",
        session.email, session.is_admin, session.is_authorized
    );

    Ok((
        AppendHeaders([
            (header::SET_COOKIE, state.sessions.set_cookie(&token)),
            (header::SET_COOKIE, clear_state_cookie(state.sessions.secure())),
        ]),
        Redirect::to(&callback),
    )
        .into_response())
}

/// GET|POST /api/auth/signout
pub async fn signout(State(state): State<Arc<AppState>>) -> Response {
    (
        [(header::SET_COOKIE, state.sessions.clear_cookie())],
        Redirect::to(LOGIN_PATH),
    )
        .into_response()
}

/// GET /api/auth/session
pub async fn current_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Session>, ApiError> {
    state
        .sessions
        .session_from_headers(&headers)
        .map(Json)
        .ok_or(ApiError::Unauthorized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(authority: &str) -> OidcClient {
        OidcClient::new(authority, "tenant-1", "client-1", "s3cret", "https://portal.home.lan").unwrap()
    }

    fn id_token(claims: serde_json::Value) -> String {
        encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(b"idp")).unwrap()
    }

    fn exp() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 3600
    }

    #[test]
    fn test_authorize_url() {
        let oidc = client("https://login.microsoftonline.com/");
        let url = url::Url::parse(&oidc.authorize_url("abc")).unwrap();
        assert_eq!(url.path(), "/tenant-1/oauth2/v2.0/authorize");
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "client-1");
        assert_eq!(params["state"], "abc");
        assert_eq!(params["scope"], SCOPE);
        assert_eq!(
            params["redirect_uri"],
            "https://portal.home.lan/api/auth/callback/microsoft-entra-id"
        );
    }

    #[test]
    fn test_identity_claims() {
        let oidc = client("https://idp.test");
        let token = id_token(json!({
            "sub": "user-1",
            "aud": "client-1",
            "iss": "https://idp.test/tenant-1/v2.0",
            "exp": exp(),
            "preferred_username": "bob@home.lan",
            "groups": ["family"],
        }));
        let identity = oidc.identity(&token).unwrap();
        assert_eq!(
            identity,
            Identity {
                subject: "user-1".into(),
                name: "bob@home.lan".into(),
                email: "bob@home.lan".into(),
                groups: vec!["family".into()],
            }
        );
    }

    #[test]
    fn test_identity_rejects_wrong_audience_or_issuer() {
        let oidc = client("https://idp.test");
        let wrong_aud = id_token(json!({
            "sub": "u", "aud": "other-app", "iss": "https://idp.test/tenant-1/v2.0", "exp": exp(),
        }));
        let wrong_iss = id_token(json!({
            "sub": "u", "aud": "client-1", "iss": "https://evil.test/tenant-1/v2.0", "exp": exp(),
        }));
        assert!(oidc.identity(&wrong_aud).is_err());
        assert!(oidc.identity(&wrong_iss).is_err());
    }

    #[tokio::test]
    async fn test_exchange_code() {
        let server = MockServer::start().await;
        let oidc = client(&server.uri());
        let token = id_token(json!({
            "sub": "user-2",
            "aud": "client-1",
            "iss": format!("{}/tenant-1/v2.0", server.uri()),
            "exp": exp(),
            "name": "Carol",
            "email": "carol@home.lan",
            "groups": ["admins", "family"],
        }));
        Mock::given(method("POST"))
            .and(path("/tenant-1/oauth2/v2.0/token"))
            .and(body_string_contains("code=the-code"))
            .and(body_string_contains("grant_type=authorization_code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id_token": token })))
            .expect(1)
            .mount(&server)
            .await;

        let identity = oidc.exchange_code(&reqwest::Client::new(), "the-code").await.unwrap();
        assert_eq!(identity.name, "Carol");
        assert_eq!(identity.groups, vec!["admins".to_string(), "family".to_string()]);
    }

    #[tokio::test]
    async fn test_exchange_code_failure_is_bad_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .exchange_code(&reqwest::Client::new(), "stale")
            .await
            .unwrap_err();
        assert_eq!(err.status().as_u16(), 502);
        assert_eq!(err.to_string(), "Identity provider returned 400 Bad Request");
    }

    fn cookie_path(set_cookie: &str) -> Option<&str> {
        set_cookie
            .split(';')
            .map(str::trim)
            .find_map(|attr| attr.strip_prefix("Path="))
    }

    #[test]
    fn test_state_cookie_cleared_on_its_own_path() {
        let set = state_cookie("n0nce", "/", true);
        let cleared = clear_state_cookie(true);
        assert_eq!(cookie_path(&set), Some("/api/auth"));
        assert_eq!(cookie_path(&set), cookie_path(&cleared));
        assert!(cleared.starts_with("portal_oauth_state=;"));
        assert!(cleared.contains("Max-Age=0"));
    }

    #[test]
    fn test_state_cookie_round_trip_sanitizes_callback() {
        let cookie = state_cookie("n0nce", "/admin?tab=1", false);
        let value = cookie.split(';').next().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(value).unwrap());
        assert_eq!(
            read_state_cookie(&headers),
            Some(("n0nce".to_string(), "/admin?tab=1".to_string()))
        );

        let forged = state_cookie("n0nce", "//evil.example", false);
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(forged.split(';').next().unwrap()).unwrap());
        assert_eq!(read_state_cookie(&headers).unwrap().1, "/");
    }
}
