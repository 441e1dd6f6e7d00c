//! Home Assistant: service calls, entity states, and grid energy history.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{fetch_json, parse_body, required, Ack, Command, Upstream};
use crate::config::TokenUpstream;
use crate::error::ApiError;
use crate::proxy::rules::{self, CapabilityTable};
use crate::server::AppState;
use crate::session::AuthSession;

pub const SERVICE: &str = "Home Assistant";

/// Cumulative grid import meter, in Wh.
const ENERGY_ENTITY: &str = "sensor.grid_connection_import_energy";

pub struct HomeAssistant {
    base_url: String,
    token: String,
}

impl HomeAssistant {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    pub fn from_config(cfg: &TokenUpstream) -> Option<Self> {
        cfg.credentials().map(|(url, token)| Self::new(url, token))
    }

    fn get(&self, http: &reqwest::Client, path: &str) -> reqwest::RequestBuilder {
        http.get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
    }
}

/// Browser payload. Accepts both the generic and the Home Assistant field names.
#[derive(Deserialize)]
struct ServiceCallBody {
    domain: Option<String>,
    #[serde(alias = "service")]
    operation: Option<String>,
    #[serde(alias = "entity_id")]
    target: Option<String>,
}

impl Upstream for HomeAssistant {
    fn service(&self) -> &'static str {
        SERVICE
    }

    fn rules(&self) -> &'static CapabilityTable {
        &rules::HOME_ASSISTANT
    }

    fn parse(&self, body: &[u8]) -> Result<Command, ApiError> {
        let body: ServiceCallBody = parse_body(body)?;
        Ok(Command {
            domain: required(body.domain, "domain")?,
            operation: required(body.operation, "service")?,
            target: required(body.target, "entity_id")?,
            force: false,
        })
    }

    fn request(&self, http: &reqwest::Client, command: &Command) -> reqwest::RequestBuilder {
        http.post(format!(
            "{}/api/services/{}/{}",
            self.base_url, command.domain, command.operation
        ))
        .bearer_auth(&self.token)
        .json(&serde_json::json!({ "entity_id": command.target }))
    }
}

/// POST /api/ha/services
pub async fn api_call_service(
    State(state): State<Arc<AppState>>,
    AuthSession(session): AuthSession,
    body: Bytes,
) -> Result<Json<Ack>, ApiError> {
    let proxy = state
        .home_assistant
        .as_ref()
        .ok_or(ApiError::NotConfigured(SERVICE))?;
    tracing::debug!("Service call requested by {}", session.email);
    Ok(Json(proxy.handle(&body).await?))
}

#[derive(Deserialize)]
pub struct StatesQuery {
    /// Comma-separated entity ids to keep.
    entities: Option<String>,
}

/// GET /api/ha/states
pub async fn api_states(
    State(state): State<Arc<AppState>>,
    _session: AuthSession,
    Query(query): Query<StatesQuery>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    let proxy = state
        .home_assistant
        .as_ref()
        .ok_or(ApiError::NotConfigured(SERVICE))?;

    let request = proxy.upstream().get(proxy.http(), "/api/states").timeout(proxy.timeout());
    let states: Vec<serde_json::Value> = fetch_json(SERVICE, request).await?;

    Ok(Json(filter_states(states, query.entities.as_deref())))
}

fn filter_states(states: Vec<serde_json::Value>, entities: Option<&str>) -> Vec<serde_json::Value> {
    let Some(entities) = entities else {
        return states;
    };
    let wanted: Vec<&str> = entities.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    states
        .into_iter()
        .filter(|s| {
            s.get("entity_id")
                .and_then(|v| v.as_str())
                .is_some_and(|id| wanted.contains(&id))
        })
        .collect()
}

// === Energy ===

#[derive(Debug, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub state: String,
    pub last_changed: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct DailyKwh {
    pub date: String,
    pub kwh: f64,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnergySummary {
    pub daily_kwh: Vec<DailyKwh>,
    pub today_kwh: f64,
}

/// GET /api/ha/energy
pub async fn api_energy(
    State(state): State<Arc<AppState>>,
    _session: AuthSession,
) -> Result<Json<EnergySummary>, ApiError> {
    let proxy = state
        .home_assistant
        .as_ref()
        .ok_or(ApiError::NotConfigured(SERVICE))?;

    let now = Utc::now();
    let path = format!("/api/history/period/{}", history_start(now));
    let request = proxy
        .upstream()
        .get(proxy.http(), &path)
        .query(&[("filter_entity_id", ENERGY_ENTITY)])
        .timeout(proxy.timeout());

    let history: Vec<Vec<HistoryEntry>> = fetch_json(SERVICE, request).await?;
    let entries = history.into_iter().next().unwrap_or_default();

    Ok(Json(summarize_energy(&entries, &now.format("%Y-%m-%d").to_string())))
}

/// Midnight UTC seven days before `now`, in the format the history API takes.
fn history_start(now: DateTime<Utc>) -> String {
    let day = (now - Duration::days(7)).date_naive();
    format!("{}T00:00:00.000Z", day.format("%Y-%m-%d"))
}

/// Reduce cumulative meter readings (Wh) to daily consumption (kWh).
///
/// A day's consumption is its last reading minus the previous day's last
/// reading; `today` is measured from its own first reading.
pub fn summarize_energy(entries: &[HistoryEntry], today: &str) -> EnergySummary {
    let mut bounds: BTreeMap<&str, (f64, f64)> = BTreeMap::new();

    for entry in entries {
        let Some(changed) = entry.last_changed.as_deref() else {
            continue;
        };
        let Some(day) = changed.get(..10) else {
            continue;
        };
        let Ok(value) = entry.state.trim().parse::<f64>() else {
            continue;
        };
        if !value.is_finite() {
            continue;
        }

        bounds
            .entry(day)
            .and_modify(|(_, last)| *last = value)
            .or_insert((value, value));
    }

    let days: Vec<(&str, (f64, f64))> = bounds.iter().map(|(d, b)| (*d, *b)).collect();
    let daily_kwh = days
        .windows(2)
        .map(|pair| {
            let (_, (_, prev_last)) = pair[0];
            let (date, (_, last)) = pair[1];
            DailyKwh { date: date.to_string(), kwh: round_kwh(last - prev_last) }
        })
        .collect();

    let today_kwh = bounds
        .get(today)
        .map(|(first, last)| round_kwh(last - first))
        .unwrap_or(0.0);

    EnergySummary { daily_kwh, today_kwh }
}

fn round_kwh(wh: f64) -> f64 {
    (wh / 1000.0 * 100.0).round() / 100.0
}
