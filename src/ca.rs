//! Root CA certificate download for household devices.

use std::sync::Arc;

use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::ApiError;
use crate::server::AppState;

const PEM_MARKER: &str = "BEGIN CERTIFICATE";

/// Decode the configured base64 PEM and check it looks like a certificate.
pub fn decode_root_cert(b64: Option<&str>) -> Result<String, ApiError> {
    let b64 = b64.ok_or(ApiError::NotConfigured("Root CA certificate"))?;

    let bytes = STANDARD.decode(b64.trim()).map_err(|e| {
        tracing::warn!("Root CA: invalid base64: {}", e);
        ApiError::Internal("Invalid CA certificate".into())
    })?;

    let pem = String::from_utf8(bytes)
        .map_err(|_| ApiError::Internal("Invalid CA certificate".into()))?;
    if !pem.contains(PEM_MARKER) {
        return Err(ApiError::Internal("Invalid CA certificate".into()));
    }
    Ok(pem)
}

/// GET /api/ca/root
///
/// Public, so devices can fetch it before anyone signs in.
pub async fn api_root_cert(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let pem = decode_root_cert(state.config.ca.root_cert_b64.as_deref())?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/x-pem-file"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"home-ca.crt\""),
            (header::CACHE_CONTROL, "public, max-age=3600"),
        ],
        pem,
    )
        .into_response())
}
