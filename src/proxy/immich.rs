//! Immich: job queue commands and the library summary.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{body::Bytes, extract::State, Json};
use serde::{Deserialize, Serialize};

use super::{fetch_json, parse_body, required, Ack, Command, Upstream};
use crate::config::TokenUpstream;
use crate::error::ApiError;
use crate::proxy::rules::{self, CapabilityTable};
use crate::server::AppState;
use crate::session::AuthSession;

pub const SERVICE: &str = "Immich";

/// Commands on Immich live under this single domain.
const JOBS_DOMAIN: &str = "jobs";

pub struct Immich {
    base_url: String,
    api_key: String,
}

impl Immich {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub fn from_config(cfg: &TokenUpstream) -> Option<Self> {
        cfg.credentials().map(|(url, key)| Self::new(url, key))
    }

    fn get(&self, http: &reqwest::Client, path: &str) -> reqwest::RequestBuilder {
        http.get(format!("{}{}", self.base_url, path))
            .header("x-api-key", &self.api_key)
    }
}

#[derive(Deserialize)]
struct JobCommandBody {
    domain: Option<String>,
    #[serde(alias = "command")]
    operation: Option<String>,
    #[serde(alias = "jobName")]
    target: Option<String>,
    force: Option<bool>,
}

impl Upstream for Immich {
    fn service(&self) -> &'static str {
        SERVICE
    }

    fn rules(&self) -> &'static CapabilityTable {
        &rules::IMMICH
    }

    fn parse(&self, body: &[u8]) -> Result<Command, ApiError> {
        let body: JobCommandBody = parse_body(body)?;
        Ok(Command {
            domain: body.domain.unwrap_or_else(|| JOBS_DOMAIN.to_string()),
            operation: required(body.operation, "command")?,
            target: required(body.target, "jobName")?,
            force: body.force.unwrap_or(false),
        })
    }

    fn request(&self, http: &reqwest::Client, command: &Command) -> reqwest::RequestBuilder {
        http.put(format!("{}/api/jobs/{}", self.base_url, command.target))
            .header("x-api-key", &self.api_key)
            .json(&serde_json::json!({
                "command": command.operation,
                "force": command.force,
            }))
    }
}

/// POST /api/immich/jobs/command
pub async fn api_job_command(
    State(state): State<Arc<AppState>>,
    AuthSession(session): AuthSession,
    body: Bytes,
) -> Result<Json<Ack>, ApiError> {
    let proxy = state.immich.as_ref().ok_or(ApiError::NotConfigured(SERVICE))?;
    tracing::debug!("Job command requested by {}", session.email);
    Ok(Json(proxy.handle(&body).await?))
}

// === Library summary ===

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEntry {
    pub queue_status: QueueStatus,
    pub job_counts: JobCounts,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub is_paused: bool,
    pub is_active: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct JobCounts {
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub waiting: u64,
    pub paused: u64,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    pub name: String,
    pub active: u64,
    pub waiting: u64,
    pub failed: u64,
    pub is_paused: bool,
    pub is_active: bool,
    pub pending: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ServerStatistics {
    photos: u64,
    videos: u64,
    usage_by_user: Vec<UserUsage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct UserUsage {
    user_name: String,
    photos: u64,
    videos: u64,
}

#[derive(Debug, Serialize)]
pub struct LibraryStats {
    pub photos: u64,
    pub videos: u64,
    pub users: Vec<UserStats>,
}

#[derive(Debug, Serialize)]
pub struct UserStats {
    pub name: String,
    pub photos: u64,
    pub videos: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Storage {
    pub disk_size: String,
    pub disk_use: String,
    pub disk_available: String,
    pub disk_usage_percentage: f64,
}

#[derive(Debug, Serialize)]
pub struct LibrarySummary {
    pub queues: Vec<QueueSummary>,
    pub stats: Option<LibraryStats>,
    pub storage: Option<Storage>,
}

/// GET /api/immich/jobs
///
/// The three fetches run concurrently. A part that fails upstream is left
/// empty; only an unreachable server fails the whole call.
pub async fn api_library_summary(
    State(state): State<Arc<AppState>>,
    _session: AuthSession,
) -> Result<Json<LibrarySummary>, ApiError> {
    let proxy = state.immich.as_ref().ok_or(ApiError::NotConfigured(SERVICE))?;
    let immich = proxy.upstream();
    let http = proxy.http();
    let timeout = proxy.timeout();

    let (jobs, stats, storage) = tokio::join!(
        fetch_json::<BTreeMap<String, JobEntry>>(SERVICE, immich.get(http, "/api/jobs").timeout(timeout)),
        fetch_json::<ServerStatistics>(SERVICE, immich.get(http, "/api/server/statistics").timeout(timeout)),
        fetch_json::<Storage>(SERVICE, immich.get(http, "/api/server/storage").timeout(timeout)),
    );

    if [jobs.as_ref().err(), stats.as_ref().err(), storage.as_ref().err()]
        .iter()
        .flatten()
        .any(|e| matches!(e, ApiError::Unreachable(_)))
    {
        return Err(ApiError::Unreachable(SERVICE));
    }

    Ok(Json(LibrarySummary {
        queues: jobs.map(top_queues).unwrap_or_default(),
        stats: stats.ok().map(|s| LibraryStats {
            photos: s.photos,
            videos: s.videos,
            users: s
                .usage_by_user
                .into_iter()
                .map(|u| UserStats { name: u.user_name, photos: u.photos, videos: u.videos })
                .collect(),
        }),
        storage: storage.ok(),
    }))
}

/// The three busiest queues by pending work, with friendly names.
pub fn top_queues(jobs: BTreeMap<String, JobEntry>) -> Vec<QueueSummary> {
    let mut queues: Vec<QueueSummary> = jobs
        .into_iter()
        .map(|(key, entry)| {
            let c = entry.job_counts;
            QueueSummary {
                name: job_label(&key).to_string(),
                active: c.active,
                waiting: c.waiting,
                failed: c.failed,
                is_paused: entry.queue_status.is_paused,
                is_active: entry.queue_status.is_active,
                pending: c.active + c.waiting,
            }
        })
        .collect();
    queues.sort_by(|a, b| b.pending.cmp(&a.pending));
    queues.truncate(3);
    queues
}

pub fn job_label(key: &str) -> &str {
    match key {
        "thumbnailGeneration" => "Thumbnails",
        "metadataExtraction" => "Metadata",
        "videoConversion" => "Video Encoding",
        "smartSearch" => "Smart Search",
        "faceDetection" => "Face Detection",
        "facialRecognition" => "Face Recognition",
        "duplicateDetection" => "Duplicates",
        "sidecar" => "Sidecar",
        "library" => "Library",
        "storageTemplateMigration" => "Storage Migration",
        "migration" => "Migration",
        "backgroundTask" => "Background",
        "search" => "Search",
        "notifications" => "Notifications",
        "backupDatabase" => "DB Backup",
        "ocr" => "OCR",
        "workflow" => "Workflow",
        "editor" => "Editor",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_native_payload() {
        let immich = Immich::new("http://immich", "k");
        let command = immich
            .parse(br#"{"jobName":"smartSearch","command":"start","force":true}"#)
            .unwrap();
        assert_eq!(
            command,
            Command {
                domain: "jobs".into(),
                operation: "start".into(),
                target: "smartSearch".into(),
                force: true,
            }
        );
    }

    #[test]
    fn test_parse_missing_job_name() {
        let immich = Immich::new("http://immich", "k");
        let err = immich.parse(br#"{"command":"start"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Missing jobName");
    }

    #[tokio::test]
    async fn test_request_shape() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/jobs/library"))
            .and(header("x-api-key", "immich-key"))
            .and(body_json(json!({ "command": "start", "force": false })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let immich = Immich::new(&server.uri(), "immich-key");
        let command = immich.parse(br#"{"jobName":"library","command":"start"}"#).unwrap();
        let response = immich.request(&reqwest::Client::new(), &command).send().await.unwrap();
        assert!(response.status().is_success());
    }

    #[test]
    fn test_top_queues() {
        let jobs: BTreeMap<String, JobEntry> = serde_json::from_value(json!({
            "smartSearch": {
                "queueStatus": { "isPaused": false, "isActive": true },
                "jobCounts": { "active": 2, "completed": 0, "failed": 1, "delayed": 0, "waiting": 40, "paused": 0 }
            },
            "thumbnailGeneration": {
                "queueStatus": { "isPaused": false, "isActive": true },
                "jobCounts": { "active": 4, "waiting": 100 }
            },
            "ocr": {
                "queueStatus": { "isPaused": true, "isActive": false },
                "jobCounts": { "active": 0, "waiting": 0 }
            },
            "customQueue": {
                "queueStatus": { "isPaused": false, "isActive": false },
                "jobCounts": { "active": 0, "waiting": 3 }
            }
        }))
        .unwrap();

        let queues = top_queues(jobs);
        let names: Vec<&str> = queues.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(names, vec!["Thumbnails", "Smart Search", "customQueue"]);
        assert_eq!(queues[0].pending, 104);
        assert_eq!(queues[1].failed, 1);
    }
}
