//! Review source adapters and the raw-to-normalized field resolver.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Months, Utc};
use revmon_core::RawReviewItem;
use revmon_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod normalize;

pub const CRATE_NAME: &str = "revmon-adapters";

/// Per-run collection context shared by every adapter call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub location_id: String,
    pub batch_id: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("api error {status_code}: {status_message}")]
    Api { status_code: i64, status_message: String },
    #[error("task {task_id} not ready after {attempts} polls")]
    PollExhausted { task_id: String, attempts: u32 },
    #[error("reading export {path}: {source}")]
    ExportIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed export {path}: {message}")]
    ExportFormat { path: PathBuf, message: String },
}

/// A place that produces raw review items for one business location.
#[async_trait]
pub trait ReviewSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_reviews(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawReviewItem>, AdapterError>;
}

/// How the SERP provider locates the business. Exactly one key is sent in the
/// task payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusinessTarget {
    PlaceId(String),
    Cid(String),
    Keyword(String),
}

impl BusinessTarget {
    fn apply(&self, payload: &mut serde_json::Map<String, JsonValue>) {
        match self {
            BusinessTarget::PlaceId(id) => payload.insert("place_id".into(), json!(id)),
            BusinessTarget::Cid(cid) => payload.insert("cid".into(), json!(cid)),
            BusinessTarget::Keyword(kw) => payload.insert("keyword".into(), json!(kw)),
        };
    }
}

#[derive(Debug, Clone)]
pub struct SerpApiConfig {
    pub base_url: String,
    pub language_code: String,
    pub sort_by: String,
    pub depth: u32,
    pub poll_attempts: u32,
    pub poll_base_delay: Duration,
}

impl Default for SerpApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.dataforseo.com/v3".to_string(),
            language_code: "pt".to_string(),
            sort_by: "newest".to_string(),
            depth: 100,
            poll_attempts: 20,
            poll_base_delay: Duration::from_secs(1),
        }
    }
}

/// Poll progress for a posted review-collection task.
#[derive(Debug)]
enum TaskPoll {
    Pending { attempt: u32 },
    Ready(Vec<RawReviewItem>),
    TimedOut { attempts: u32 },
}

/// Task-based SERP review source: POST a collection task, then poll the task
/// endpoint with bounded attempts until results appear.
pub struct SerpReviewSource {
    config: SerpApiConfig,
    target: BusinessTarget,
}

impl SerpReviewSource {
    pub fn new(config: SerpApiConfig, target: BusinessTarget) -> Self {
        Self { config, target }
    }

    fn task_payload(&self) -> JsonValue {
        let mut payload = serde_json::Map::new();
        self.target.apply(&mut payload);
        payload.insert("language_code".into(), json!(self.config.language_code));
        payload.insert("sort_by".into(), json!(self.config.sort_by));
        payload.insert("depth".into(), json!(self.config.depth));
        JsonValue::Array(vec![JsonValue::Object(payload)])
    }

    async fn post_task(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<String, AdapterError> {
        let url = format!("{}/business_data/google/reviews/task_post", self.config.base_url);
        let body = self.task_payload();
        let response = http
            .post_json(ctx.run_id, self.source_id(), &url, &body)
            .await?;
        let envelope: SerpEnvelope = parse_envelope(&response)?;
        let task = envelope.first_task()?;
        if !task.accepted() {
            return Err(AdapterError::Api {
                status_code: task.status_code,
                status_message: task.status_message.clone(),
            });
        }
        info!(task_id = %task.id, batch_id = %ctx.batch_id, "review collection task posted");
        Ok(task.id.clone())
    }

    async fn poll_once(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        task_id: &str,
    ) -> Result<Option<Vec<RawReviewItem>>, AdapterError> {
        let url = format!(
            "{}/business_data/google/reviews/task_get/{}",
            self.config.base_url, task_id
        );
        let response = http.get_json(ctx.run_id, self.source_id(), &url).await?;
        let envelope: SerpEnvelope = parse_envelope(&response)?;
        let task = envelope.first_task()?;
        // 40602 = task in queue, not an error.
        if task.in_queue() {
            return Ok(None);
        }
        if !task.accepted() {
            return Err(AdapterError::Api {
                status_code: task.status_code,
                status_message: task.status_message.clone(),
            });
        }
        match task.items() {
            Some(items) => Ok(Some(items)),
            None => Ok(None),
        }
    }

    fn poll_delay(&self, attempt: u32) -> Duration {
        // Linear ramp so late polls are more patient than early ones.
        self.config.poll_base_delay + Duration::from_millis(500) * attempt
    }
}

#[async_trait]
impl ReviewSource for SerpReviewSource {
    fn source_id(&self) -> &'static str {
        "serp_api"
    }

    async fn fetch_reviews(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawReviewItem>, AdapterError> {
        let task_id = self.post_task(http, ctx).await?;
        let mut state = TaskPoll::Pending { attempt: 0 };
        loop {
            state = match state {
                TaskPoll::Pending { attempt } if attempt >= self.config.poll_attempts => {
                    TaskPoll::TimedOut { attempts: attempt }
                }
                TaskPoll::Pending { attempt } => {
                    tokio::time::sleep(self.poll_delay(attempt)).await;
                    match self.poll_once(http, ctx, &task_id).await? {
                        Some(items) => TaskPoll::Ready(items),
                        None => {
                            debug!(task_id = %task_id, attempt, "task not ready");
                            TaskPoll::Pending { attempt: attempt + 1 }
                        }
                    }
                }
                TaskPoll::Ready(items) => {
                    info!(task_id = %task_id, count = items.len(), "review task completed");
                    return Ok(items);
                }
                TaskPoll::TimedOut { attempts } => {
                    return Err(AdapterError::PollExhausted { task_id, attempts });
                }
            };
        }
    }
}

#[derive(Debug, Deserialize)]
struct SerpEnvelope {
    status_code: i64,
    #[serde(default)]
    status_message: String,
    #[serde(default)]
    tasks: Vec<SerpTask>,
}

#[derive(Debug, Deserialize)]
struct SerpTask {
    id: String,
    status_code: i64,
    #[serde(default)]
    status_message: String,
    #[serde(default)]
    result: Option<Vec<SerpTaskResult>>,
}

#[derive(Debug, Deserialize)]
struct SerpTaskResult {
    #[serde(default)]
    items: Option<Vec<RawReviewItem>>,
}

impl SerpEnvelope {
    fn first_task(&self) -> Result<&SerpTask, AdapterError> {
        self.tasks
            .first()
            .ok_or_else(|| AdapterError::Message("response carried no tasks".to_string()))
    }
}

impl SerpTask {
    fn accepted(&self) -> bool {
        // 20000 = ok, 201xx = task created/queued.
        self.status_code == 20000 || (20100..20200).contains(&self.status_code)
    }

    fn in_queue(&self) -> bool {
        self.status_code == 40602
    }

    fn items(&self) -> Option<Vec<RawReviewItem>> {
        let results = self.result.as_ref()?;
        let items: Vec<RawReviewItem> = results
            .iter()
            .flat_map(|r| r.items.clone().unwrap_or_default())
            .collect();
        if items.is_empty() {
            None
        } else {
            Some(items)
        }
    }
}

fn parse_envelope(response: &JsonValue) -> Result<SerpEnvelope, AdapterError> {
    let envelope: SerpEnvelope = serde_json::from_value(response.clone())
        .map_err(|e| AdapterError::Message(format!("unexpected response shape: {e}")))?;
    if envelope.status_code != 20000 {
        return Err(AdapterError::Api {
            status_code: envelope.status_code,
            status_message: envelope.status_message,
        });
    }
    Ok(envelope)
}

/// File-drop review source: a browser-automation collector (outside this
/// process) writes JSON exports into a directory, and this adapter ingests
/// the newest one. Exports are either a bare array of review items or an
/// object with a `reviews` array.
pub struct ScrapeExportSource {
    export_dir: PathBuf,
}

impl ScrapeExportSource {
    pub fn new(export_dir: impl Into<PathBuf>) -> Self {
        Self { export_dir: export_dir.into() }
    }

    fn newest_export(&self) -> Result<Option<PathBuf>, AdapterError> {
        let entries = std::fs::read_dir(&self.export_dir).map_err(|source| AdapterError::ExportIo {
            path: self.export_dir.clone(),
            source,
        })?;
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in entries {
            let entry = entry.map_err(|source| AdapterError::ExportIo {
                path: self.export_dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .map_err(|source| AdapterError::ExportIo { path: path.clone(), source })?;
            if newest.as_ref().map_or(true, |(when, _)| modified > *when) {
                newest = Some((modified, path));
            }
        }
        Ok(newest.map(|(_, path)| path))
    }

    fn load_export(path: &Path) -> Result<Vec<RawReviewItem>, AdapterError> {
        let text = std::fs::read_to_string(path).map_err(|source| AdapterError::ExportIo {
            path: path.to_path_buf(),
            source,
        })?;
        let value: JsonValue =
            serde_json::from_str(&text).map_err(|e| AdapterError::ExportFormat {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        let items = match value {
            JsonValue::Array(items) => items,
            JsonValue::Object(mut map) => match map.remove("reviews") {
                Some(JsonValue::Array(items)) => items,
                _ => {
                    return Err(AdapterError::ExportFormat {
                        path: path.to_path_buf(),
                        message: "expected an array or a `reviews` array".to_string(),
                    })
                }
            },
            _ => {
                return Err(AdapterError::ExportFormat {
                    path: path.to_path_buf(),
                    message: "expected an array or a `reviews` array".to_string(),
                })
            }
        };
        items
            .into_iter()
            .map(|item| {
                serde_json::from_value(item).map_err(|e| AdapterError::ExportFormat {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl ReviewSource for ScrapeExportSource {
    fn source_id(&self) -> &'static str {
        "scrape_export"
    }

    async fn fetch_reviews(
        &self,
        _http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawReviewItem>, AdapterError> {
        let Some(path) = self.newest_export()? else {
            warn!(dir = %self.export_dir.display(), batch_id = %ctx.batch_id, "no export files found");
            return Ok(Vec::new());
        };
        let items = Self::load_export(&path)?;
        info!(path = %path.display(), count = items.len(), "loaded scrape export");
        Ok(items)
    }
}

/// Resolves a relative phrase like "3 dias atrás" or "2 weeks ago" against a
/// reference instant. Minutes through weeks subtract fixed durations; months
/// and years use calendar arithmetic so "1 mês atrás" from March 31 lands on
/// the last day of February, not a fixed 30 days back.
pub fn parse_relative_phrase(text: &str, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let lowered = text.trim().to_lowercase();
    if !lowered.ends_with("atrás") && !lowered.ends_with("atras") && !lowered.ends_with("ago") {
        return None;
    }
    let mut words = lowered.split_whitespace();
    let amount: u32 = match words.next()? {
        "um" | "uma" | "a" | "an" => 1,
        n => n.parse().ok()?,
    };
    let unit = words.next()?;
    let resolved = if unit.starts_with("minuto") || unit.starts_with("minute") {
        reference - chrono::Duration::minutes(i64::from(amount))
    } else if unit.starts_with("hora") || unit.starts_with("hour") {
        reference - chrono::Duration::hours(i64::from(amount))
    } else if unit.starts_with("dia") || unit.starts_with("day") {
        reference - chrono::Duration::days(i64::from(amount))
    } else if unit.starts_with("semana") || unit.starts_with("week") {
        reference - chrono::Duration::weeks(i64::from(amount))
    } else if unit.starts_with("mes") || unit.starts_with("mês") || unit.starts_with("month") {
        reference.checked_sub_months(Months::new(amount))?
    } else if unit.starts_with("ano") || unit.starts_with("year") {
        reference.checked_sub_months(Months::new(amount.checked_mul(12)?))?
    } else {
        return None;
    };
    // Guard against phrases that would resolve before any plausible review.
    if resolved.year() < 2000 {
        return None;
    }
    Some(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 15, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn relative_days_portuguese() {
        let resolved = parse_relative_phrase("3 dias atrás", reference()).unwrap();
        assert_eq!(resolved, reference() - chrono::Duration::days(3));
    }

    #[test]
    fn relative_units_english_and_portuguese() {
        let r = reference();
        assert_eq!(
            parse_relative_phrase("10 minutos atrás", r).unwrap(),
            r - chrono::Duration::minutes(10)
        );
        assert_eq!(
            parse_relative_phrase("2 hours ago", r).unwrap(),
            r - chrono::Duration::hours(2)
        );
        assert_eq!(
            parse_relative_phrase("2 semanas atrás", r).unwrap(),
            r - chrono::Duration::weeks(2)
        );
        assert_eq!(
            parse_relative_phrase("um dia atrás", r).unwrap(),
            r - chrono::Duration::days(1)
        );
    }

    #[test]
    fn relative_months_use_calendar_arithmetic() {
        let march_31 = Utc.with_ymd_and_hms(2025, 3, 31, 8, 0, 0).single().unwrap();
        let resolved = parse_relative_phrase("1 mês atrás", march_31).unwrap();
        assert_eq!(resolved, Utc.with_ymd_and_hms(2025, 2, 28, 8, 0, 0).single().unwrap());

        let resolved = parse_relative_phrase("2 anos atrás", reference()).unwrap();
        assert_eq!(resolved.year(), 2023);
    }

    #[test]
    fn relative_rejects_unrecognized_text() {
        assert!(parse_relative_phrase("ontem", reference()).is_none());
        assert!(parse_relative_phrase("3 dias", reference()).is_none());
        assert!(parse_relative_phrase("2025-08-01", reference()).is_none());
    }

    #[test]
    fn envelope_extracts_items() {
        let response = serde_json::json!({
            "status_code": 20000,
            "status_message": "Ok.",
            "tasks": [{
                "id": "task-1",
                "status_code": 20000,
                "status_message": "Ok.",
                "result": [{
                    "items": [
                        {"rating": {"value": 5}, "review_text": "Ótimo!", "profile_name": "Maria"}
                    ]
                }]
            }]
        });
        let envelope = parse_envelope(&response).unwrap();
        let items = envelope.first_task().unwrap().items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].profile_name.as_deref(), Some("Maria"));
    }

    #[test]
    fn envelope_queue_status_is_not_ready() {
        let response = serde_json::json!({
            "status_code": 20000,
            "tasks": [{"id": "task-1", "status_code": 40602, "status_message": "Task In Queue."}]
        });
        let envelope = parse_envelope(&response).unwrap();
        let task = envelope.first_task().unwrap();
        assert!(task.in_queue());
        assert!(task.items().is_none());
    }

    #[test]
    fn envelope_top_level_error_fails() {
        let response = serde_json::json!({
            "status_code": 40100,
            "status_message": "Authentication failed.",
            "tasks": []
        });
        match parse_envelope(&response) {
            Err(AdapterError::Api { status_code, .. }) => assert_eq!(status_code, 40100),
            other => panic!("expected api error, got {other:?}"),
        }
    }

    #[test]
    fn task_payload_carries_exactly_one_target_key() {
        let source = SerpReviewSource::new(
            SerpApiConfig::default(),
            BusinessTarget::PlaceId("ChIJabc".to_string()),
        );
        let payload = source.task_payload();
        let task = &payload.as_array().unwrap()[0];
        assert_eq!(task.get("place_id").and_then(|v| v.as_str()), Some("ChIJabc"));
        assert!(task.get("cid").is_none());
        assert!(task.get("keyword").is_none());
        assert_eq!(task.get("language_code").and_then(|v| v.as_str()), Some("pt"));
        assert_eq!(task.get("sort_by").and_then(|v| v.as_str()), Some("newest"));
    }

    #[tokio::test]
    async fn export_source_reads_newest_file() {
        let dir = tempfile::tempdir().unwrap();
        let older = dir.path().join("export-old.json");
        std::fs::write(&older, r#"[{"reviewer_name": "Velho"}]"#).unwrap();
        // Distinct mtime ordering.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let newer = dir.path().join("export-new.json");
        let mut f = std::fs::File::create(&newer).unwrap();
        f.write_all(br#"{"reviews": [{"reviewer_name": "Nova", "rating": 4}]}"#)
            .unwrap();

        let source = ScrapeExportSource::new(dir.path());
        let http = HttpFetcher::new(Default::default()).unwrap();
        let ctx = AdapterContext {
            run_id: Uuid::new_v4(),
            fetched_at: reference(),
            location_id: "loc-1".to_string(),
            batch_id: "scrape_export_123".to_string(),
        };
        let items = source.fetch_reviews(&http, &ctx).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].reviewer_name.as_deref(), Some("Nova"));
    }

    #[tokio::test]
    async fn export_source_empty_dir_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScrapeExportSource::new(dir.path());
        let http = HttpFetcher::new(Default::default()).unwrap();
        let ctx = AdapterContext {
            run_id: Uuid::new_v4(),
            fetched_at: reference(),
            location_id: "loc-1".to_string(),
            batch_id: "scrape_export_123".to_string(),
        };
        let items = source.fetch_reviews(&http, &ctx).await.unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn export_rejects_malformed_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"data": 1}"#).unwrap();
        match ScrapeExportSource::load_export(&path) {
            Err(AdapterError::ExportFormat { .. }) => {}
            other => panic!("expected format error, got {other:?}"),
        }
    }
}
