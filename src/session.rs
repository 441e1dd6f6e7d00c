//! Session derivation, the signed session cookie, and the API session extractor.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::config::AuthConfig;
use crate::error::ApiError;
use crate::server::AppState;

/// Name of the cookie carrying the signed session.
pub const SESSION_COOKIE: &str = "portal_session";

/// A signed-in household member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub name: String,
    pub email: String,
    pub is_admin: bool,
    pub is_authorized: bool,
}

/// Access flags derived from identity-provider group membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessFlags {
    pub is_admin: bool,
    pub is_authorized: bool,
}

/// Map group-membership claims onto access flags.
///
/// Admins are always authorized. An empty group id never matches.
pub fn derive_access(groups: &[String], admin_group: &str, user_group: Option<&str>) -> AccessFlags {
    let member_of = |group: &str| !group.is_empty() && groups.iter().any(|g| g == group);

    let is_admin = member_of(admin_group);
    let is_authorized = is_admin || user_group.map(member_of).unwrap_or(false);

    AccessFlags { is_admin, is_authorized }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    sub: String,
    name: String,
    email: String,
    adm: bool,
    authz: bool,
    iat: u64,
    exp: u64,
}

/// Issues and verifies session cookies (HS256 JWTs).
pub struct SessionCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
    secure: bool,
}

impl SessionCodec {
    pub fn new(secret: &[u8], ttl: Duration, secure: bool) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
            secure,
        }
    }

    /// Build the codec from auth settings. Without a configured secret a random
    /// one is generated, so sessions do not survive a restart.
    pub fn from_config(auth: &AuthConfig, public_url: &str) -> Self {
        let secret = Zeroizing::new(match auth.session_secret.as_deref() {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                tracing::warn!("AUTH_SECRET not set; generated an ephemeral session secret");
                let mut bytes = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                bytes
            }
        });
        Self::new(
            &secret,
            Duration::from_secs(auth.session_ttl_secs),
            public_url.starts_with("https://"),
        )
    }

    /// Sign a session into a cookie token.
    pub fn issue(&self, session: &Session) -> Result<String, jsonwebtoken::errors::Error> {
        let now = unix_now();
        let claims = SessionClaims {
            sub: session.id.clone(),
            name: session.name.clone(),
            email: session.email.clone(),
            adm: session.is_admin,
            authz: session.is_authorized,
            iat: now,
            exp: now + self.ttl.as_secs(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }

    /// Verify a cookie token. Expired, tampered, or malformed tokens yield `None`.
    pub fn verify(&self, token: &str) -> Option<Session> {
        let validation = Validation::new(Algorithm::HS256);
        match decode::<SessionClaims>(token, &self.decoding, &validation) {
            Ok(data) => {
                let c = data.claims;
                Some(Session {
                    id: c.sub,
                    name: c.name,
                    email: c.email,
                    is_admin: c.adm,
                    is_authorized: c.authz,
                })
            }
            Err(e) => {
                tracing::debug!("Rejected session cookie: {}", e);
                None
            }
        }
    }

    /// Read and verify the session cookie from request headers.
    pub fn session_from_headers(&self, headers: &HeaderMap) -> Option<Session> {
        cookie_value(headers, SESSION_COOKIE).and_then(|token| self.verify(token))
    }

    /// `Set-Cookie` value carrying a freshly issued token.
    pub fn set_cookie(&self, token: &str) -> String {
        format!(
            "{}={}; Path=/; HttpOnly;{} SameSite=Lax; Max-Age={}",
            SESSION_COOKIE,
            token,
            self.secure_attr(),
            self.ttl.as_secs()
        )
    }

    /// `Set-Cookie` value that removes the session.
    pub fn clear_cookie(&self) -> String {
        expire_cookie(SESSION_COOKIE, "/", self.secure)
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    fn secure_attr(&self) -> &'static str {
        if self.secure { " Secure;" } else { "" }
    }
}

/// `Set-Cookie` value that expires `name` immediately. `path` must match the
/// path the cookie was set with or the browser keeps it.
pub fn expire_cookie(name: &str, path: &str, secure: bool) -> String {
    let secure = if secure { " Secure;" } else { "" };
    format!("{}=; Path={}; HttpOnly;{} SameSite=Lax; Max-Age=0", name, path, secure)
}

/// Find a cookie by name in the `Cookie` request header.
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .map(|kv| kv.trim())
        .find_map(|kv| kv.strip_prefix(name).and_then(|rest| rest.strip_prefix('=')))
        .filter(|v| !v.is_empty())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Extractor for API handlers: an authenticated, authorized session.
///
/// No session → 401. A configured general-access group the user is not in → 403.
pub struct AuthSession(pub Session);

impl FromRequestParts<Arc<AppState>> for AuthSession {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let session = state
            .sessions
            .session_from_headers(&parts.headers)
            .ok_or(ApiError::Unauthorized)?;

        if state.guard.requires_membership() && !session.is_admin && !session.is_authorized {
            return Err(ApiError::Forbidden("not a member of the portal user group".into()));
        }

        Ok(AuthSession(session))
    }
}
