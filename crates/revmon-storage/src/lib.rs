//! Persistence (idempotent Postgres upserts) + HTTP fetch utilities for REVMON.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use revmon_core::{
    CollaboratorMention, CollaboratorProfile, NormalizedReview, ReviewCollaboratorLink,
    ReviewLabels,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{debug, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "revmon-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}

/// Aggregate table counts surfaced by the health endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StorageCounts {
    pub reviews: i64,
    pub collaborators: i64,
    pub links: i64,
}

/// Persistence contract of the pipeline. Every write is an idempotent upsert
/// keyed by the stable review id (or the (review, collaborator) pair for
/// links); re-running ingestion converges to the same stored state.
#[async_trait]
pub trait ReviewWriter: Send + Sync {
    /// Write-once raw payload, overwritten (never merged) on reprocessing.
    async fn upsert_raw(
        &self,
        review_id: &str,
        location_id: &str,
        payload: &JsonValue,
    ) -> Result<(), StorageError>;

    async fn upsert_review(&self, review: &NormalizedReview) -> Result<(), StorageError>;

    /// Resolve a matched name to a collaborator id, case-insensitively against
    /// full names and aliases. When absent and `auto_create` is set, a minimal
    /// profile is created under `default_department`.
    async fn resolve_collaborator(
        &self,
        name: &str,
        auto_create: bool,
        default_department: &str,
    ) -> Result<Option<i64>, StorageError>;

    async fn upsert_link(&self, link: &ReviewCollaboratorLink) -> Result<(), StorageError>;

    async fn upsert_labels(&self, labels: &ReviewLabels) -> Result<(), StorageError>;

    async fn active_roster(&self) -> Result<Vec<CollaboratorProfile>, StorageError>;

    async fn counts(&self) -> Result<StorageCounts, StorageError>;
}

/// Postgres-backed writer.
#[derive(Debug, Clone)]
pub struct PgReviewStore {
    pool: PgPool,
}

impl PgReviewStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to database")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .context("applying migrations")?;
        Ok(())
    }

    pub async fn test_connection(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    pub async fn list_collaborators(&self) -> Result<Vec<CollaboratorProfile>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, full_name, department, position, is_active, aliases
              FROM collaborators
             ORDER BY full_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_profile).collect()
    }

    pub async fn create_collaborator(
        &self,
        profile: &CollaboratorProfile,
    ) -> Result<i64, StorageError> {
        let row = sqlx::query(
            r#"
            INSERT INTO collaborators (full_name, department, position, is_active, aliases)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&profile.full_name)
        .bind(&profile.department)
        .bind(&profile.position)
        .bind(profile.is_active)
        .bind(&profile.aliases)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    pub async fn update_collaborator(
        &self,
        id: i64,
        profile: &CollaboratorProfile,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE collaborators
               SET full_name = $2,
                   department = $3,
                   position = $4,
                   is_active = $5,
                   aliases = $6
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&profile.full_name)
        .bind(&profile.department)
        .bind(&profile.position)
        .bind(profile.is_active)
        .bind(&profile.aliases)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_collaborator(&self, id: i64) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM collaborators WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_profile(row: &sqlx::postgres::PgRow) -> Result<CollaboratorProfile, StorageError> {
    Ok(CollaboratorProfile {
        id: Some(row.try_get("id")?),
        full_name: row.try_get("full_name")?,
        department: row.try_get("department")?,
        position: row.try_get("position")?,
        is_active: row.try_get("is_active")?,
        aliases: row.try_get::<Option<Vec<String>>, _>("aliases")?.unwrap_or_default(),
    })
}

#[async_trait]
impl ReviewWriter for PgReviewStore {
    async fn upsert_raw(
        &self,
        review_id: &str,
        location_id: &str,
        payload: &JsonValue,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO reviews_raw (review_id, location_id, payload, collected_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (review_id) DO UPDATE
               SET location_id = EXCLUDED.location_id,
                   payload = EXCLUDED.payload,
                   collected_at = EXCLUDED.collected_at
            "#,
        )
        .bind(review_id)
        .bind(location_id)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_review(&self, review: &NormalizedReview) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO reviews (review_id, location_id, rating, comment, reviewer_name,
                                 is_anonymous, create_time, update_time, reply_text, reply_time,
                                 collection_source, collection_batch_id, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (review_id) DO UPDATE
               SET rating = EXCLUDED.rating,
                   comment = EXCLUDED.comment,
                   reviewer_name = EXCLUDED.reviewer_name,
                   is_anonymous = EXCLUDED.is_anonymous,
                   create_time = EXCLUDED.create_time,
                   update_time = EXCLUDED.update_time,
                   reply_text = EXCLUDED.reply_text,
                   reply_time = EXCLUDED.reply_time,
                   collection_source = EXCLUDED.collection_source,
                   collection_batch_id = EXCLUDED.collection_batch_id,
                   processed_at = EXCLUDED.processed_at
            "#,
        )
        .bind(&review.review_id)
        .bind(&review.location_id)
        .bind(review.rating)
        .bind(&review.comment)
        .bind(&review.reviewer_name)
        .bind(review.is_anonymous)
        .bind(review.create_time)
        .bind(review.update_time)
        .bind(&review.reply_text)
        .bind(review.reply_time)
        .bind(&review.collection_source)
        .bind(&review.collection_batch_id)
        .bind(review.processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resolve_collaborator(
        &self,
        name: &str,
        auto_create: bool,
        default_department: &str,
    ) -> Result<Option<i64>, StorageError> {
        let existing = sqlx::query(
            r#"
            SELECT id
              FROM collaborators
             WHERE LOWER(full_name) = LOWER($1)
                OR EXISTS (
                    SELECT 1 FROM UNNEST(aliases) alias WHERE LOWER(alias) = LOWER($1)
                )
             LIMIT 1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = existing {
            return Ok(Some(row.try_get("id")?));
        }
        if !auto_create {
            return Ok(None);
        }

        let profile = CollaboratorProfile::minimal(name, default_department);
        let id = self.create_collaborator(&profile).await?;
        debug!(name, id, "auto-created collaborator from mention");
        Ok(Some(id))
    }

    async fn upsert_link(&self, link: &ReviewCollaboratorLink) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO review_collaborators (review_id, collaborator_id, mention_snippet, match_score)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (review_id, collaborator_id) DO UPDATE
               SET mention_snippet = EXCLUDED.mention_snippet,
                   match_score = EXCLUDED.match_score
            "#,
        )
        .bind(&link.review_id)
        .bind(link.collaborator_id)
        .bind(&link.mention_snippet)
        .bind(link.match_score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_labels(&self, labels: &ReviewLabels) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO review_labels (review_id, sentiment, is_service_related, classifier_version)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (review_id) DO UPDATE
               SET sentiment = EXCLUDED.sentiment,
                   is_service_related = EXCLUDED.is_service_related,
                   classifier_version = EXCLUDED.classifier_version
            "#,
        )
        .bind(&labels.review_id)
        .bind(labels.sentiment.as_str())
        .bind(labels.is_service_related)
        .bind(&labels.classifier_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn active_roster(&self) -> Result<Vec<CollaboratorProfile>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, full_name, department, position, is_active, aliases
              FROM collaborators
             WHERE is_active
             ORDER BY full_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_profile).collect()
    }

    async fn counts(&self) -> Result<StorageCounts, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM reviews) AS reviews,
                   (SELECT COUNT(*) FROM collaborators) AS collaborators,
                   (SELECT COUNT(*) FROM review_collaborators) AS links
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StorageCounts {
            reviews: row.try_get("reviews")?,
            collaborators: row.try_get("collaborators")?,
            links: row.try_get("links")?,
        })
    }
}

/// In-memory writer used by the CLI dry-run mode and pipeline tests. Mirrors
/// the upsert semantics of the Postgres store.
#[derive(Debug, Default)]
pub struct MemoryReviewWriter {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    raw: HashMap<String, JsonValue>,
    reviews: HashMap<String, NormalizedReview>,
    collaborators: Vec<CollaboratorProfile>,
    links: HashMap<(String, i64), ReviewCollaboratorLink>,
    labels: HashMap<String, ReviewLabels>,
    next_id: i64,
}

impl MemoryReviewWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_roster(roster: Vec<CollaboratorProfile>) -> Self {
        let writer = Self::new();
        {
            let mut state = writer.inner.lock().expect("memory writer poisoned");
            for mut profile in roster {
                state.next_id += 1;
                if profile.id.is_none() {
                    profile.id = Some(state.next_id);
                }
                state.collaborators.push(profile);
            }
        }
        writer
    }

    pub fn review_count(&self) -> usize {
        self.inner.lock().expect("memory writer poisoned").reviews.len()
    }

    pub fn link_count(&self) -> usize {
        self.inner.lock().expect("memory writer poisoned").links.len()
    }

    pub fn review(&self, review_id: &str) -> Option<NormalizedReview> {
        self.inner
            .lock()
            .expect("memory writer poisoned")
            .reviews
            .get(review_id)
            .cloned()
    }

    pub fn links_for(&self, review_id: &str) -> Vec<ReviewCollaboratorLink> {
        self.inner
            .lock()
            .expect("memory writer poisoned")
            .links
            .values()
            .filter(|l| l.review_id == review_id)
            .cloned()
            .collect()
    }

    pub fn collaborator_count(&self) -> usize {
        self.inner.lock().expect("memory writer poisoned").collaborators.len()
    }
}

#[async_trait]
impl ReviewWriter for MemoryReviewWriter {
    async fn upsert_raw(
        &self,
        review_id: &str,
        _location_id: &str,
        payload: &JsonValue,
    ) -> Result<(), StorageError> {
        let mut state = self.inner.lock().expect("memory writer poisoned");
        state.raw.insert(review_id.to_string(), payload.clone());
        Ok(())
    }

    async fn upsert_review(&self, review: &NormalizedReview) -> Result<(), StorageError> {
        let mut state = self.inner.lock().expect("memory writer poisoned");
        state.reviews.insert(review.review_id.clone(), review.clone());
        Ok(())
    }

    async fn resolve_collaborator(
        &self,
        name: &str,
        auto_create: bool,
        default_department: &str,
    ) -> Result<Option<i64>, StorageError> {
        let mut state = self.inner.lock().expect("memory writer poisoned");
        let lowered = name.to_lowercase();
        let found = state.collaborators.iter().find(|c| {
            c.full_name.to_lowercase() == lowered
                || c.aliases.iter().any(|a| a.to_lowercase() == lowered)
        });
        if let Some(profile) = found {
            return Ok(profile.id);
        }
        if !auto_create {
            return Ok(None);
        }
        state.next_id += 1;
        let id = state.next_id;
        let mut profile = CollaboratorProfile::minimal(name, default_department);
        profile.id = Some(id);
        state.collaborators.push(profile);
        Ok(Some(id))
    }

    async fn upsert_link(&self, link: &ReviewCollaboratorLink) -> Result<(), StorageError> {
        let mut state = self.inner.lock().expect("memory writer poisoned");
        state
            .links
            .insert((link.review_id.clone(), link.collaborator_id), link.clone());
        Ok(())
    }

    async fn upsert_labels(&self, labels: &ReviewLabels) -> Result<(), StorageError> {
        let mut state = self.inner.lock().expect("memory writer poisoned");
        state.labels.insert(labels.review_id.clone(), labels.clone());
        Ok(())
    }

    async fn active_roster(&self) -> Result<Vec<CollaboratorProfile>, StorageError> {
        let state = self.inner.lock().expect("memory writer poisoned");
        Ok(state
            .collaborators
            .iter()
            .filter(|c| c.is_active)
            .cloned()
            .collect())
    }

    async fn counts(&self) -> Result<StorageCounts, StorageError> {
        let state = self.inner.lock().expect("memory writer poisoned");
        Ok(StorageCounts {
            reviews: state.reviews.len() as i64,
            collaborators: state.collaborators.len() as i64,
            links: state.links.len() as i64,
        })
    }
}

/// Roster administration surface, separate from the pipeline's write path.
#[async_trait]
pub trait CollaboratorDirectory: Send + Sync {
    async fn list(&self) -> Result<Vec<CollaboratorProfile>, StorageError>;
    async fn create(&self, profile: &CollaboratorProfile) -> Result<i64, StorageError>;
    /// Returns false when no row carries the id.
    async fn update(&self, id: i64, profile: &CollaboratorProfile) -> Result<bool, StorageError>;
    async fn delete(&self, id: i64) -> Result<bool, StorageError>;
}

#[async_trait]
impl CollaboratorDirectory for PgReviewStore {
    async fn list(&self) -> Result<Vec<CollaboratorProfile>, StorageError> {
        self.list_collaborators().await
    }

    async fn create(&self, profile: &CollaboratorProfile) -> Result<i64, StorageError> {
        self.create_collaborator(profile).await
    }

    async fn update(&self, id: i64, profile: &CollaboratorProfile) -> Result<bool, StorageError> {
        self.update_collaborator(id, profile).await
    }

    async fn delete(&self, id: i64) -> Result<bool, StorageError> {
        self.delete_collaborator(id).await
    }
}

#[async_trait]
impl CollaboratorDirectory for MemoryReviewWriter {
    async fn list(&self) -> Result<Vec<CollaboratorProfile>, StorageError> {
        let state = self.inner.lock().expect("memory writer poisoned");
        Ok(state.collaborators.clone())
    }

    async fn create(&self, profile: &CollaboratorProfile) -> Result<i64, StorageError> {
        let mut state = self.inner.lock().expect("memory writer poisoned");
        state.next_id += 1;
        let id = state.next_id;
        let mut profile = profile.clone();
        profile.id = Some(id);
        state.collaborators.push(profile);
        Ok(id)
    }

    async fn update(&self, id: i64, profile: &CollaboratorProfile) -> Result<bool, StorageError> {
        let mut state = self.inner.lock().expect("memory writer poisoned");
        match state.collaborators.iter_mut().find(|c| c.id == Some(id)) {
            Some(existing) => {
                *existing = CollaboratorProfile {
                    id: Some(id),
                    ..profile.clone()
                };
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: i64) -> Result<bool, StorageError> {
        let mut state = self.inner.lock().expect("memory writer poisoned");
        let before = state.collaborators.len();
        state.collaborators.retain(|c| c.id != Some(id));
        Ok(state.collaborators.len() != before)
    }
}

/// Outcome of persisting one review. The raw write is best-effort: a
/// restrictive policy on the raw table must not stall normalized ingestion.
#[derive(Debug, Clone, Copy)]
pub struct PersistOutcome {
    pub raw_written: bool,
}

/// Persist the raw payload and the normalized record for one review. A raw
/// failure is logged and swallowed; a normalized failure is returned and the
/// caller skips that review.
pub async fn persist_review<W: ReviewWriter + ?Sized>(
    writer: &W,
    review: &NormalizedReview,
    payload: &JsonValue,
) -> Result<PersistOutcome, StorageError> {
    let raw_written = match writer
        .upsert_raw(&review.review_id, &review.location_id, payload)
        .await
    {
        Ok(()) => true,
        Err(err) => {
            warn!(review_id = %review.review_id, %err, "raw payload write failed; continuing with normalized record");
            false
        }
    };

    writer.upsert_review(review).await?;
    Ok(PersistOutcome { raw_written })
}

/// Resolve and upsert links for the mentions detected in one review.
/// Per-mention failures are logged and do not fail the parent review.
pub async fn persist_mentions<W: ReviewWriter + ?Sized>(
    writer: &W,
    review_id: &str,
    mentions: &[CollaboratorMention],
    auto_create: bool,
    auto_create_min_confidence: f64,
    default_department: &str,
) -> usize {
    let mut linked = 0usize;
    for mention in mentions {
        let allow_create = auto_create && mention.confidence >= auto_create_min_confidence;
        let collaborator_id = match writer
            .resolve_collaborator(&mention.name, allow_create, default_department)
            .await
        {
            Ok(Some(id)) => id,
            Ok(None) => {
                debug!(name = %mention.name, confidence = mention.confidence, "mention left unlinked");
                continue;
            }
            Err(err) => {
                warn!(review_id, name = %mention.name, %err, "collaborator resolution failed");
                continue;
            }
        };

        let link = ReviewCollaboratorLink {
            review_id: review_id.to_string(),
            collaborator_id,
            mention_snippet: Some(mention.snippet.clone()),
            match_score: mention.confidence,
        };
        match writer.upsert_link(&link).await {
            Ok(()) => linked += 1,
            Err(err) => warn!(review_id, collaborator_id, %err, "link upsert failed"),
        }
    }
    linked
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Pre-encoded `login:password` for Basic auth, when the API needs it.
    pub basic_auth_b64: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            basic_auth_b64: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON from {url}: {message}")]
    InvalidJson { url: String, message: String },
}

/// Thin JSON client with bounded retries: 5xx/429 and connect/timeout errors
/// back off exponentially (capped); everything else fails fast.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    auth_header: Option<String>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            auth_header: config.basic_auth_b64.map(|b64| format!("Basic {b64}")),
            backoff: config.backoff,
        })
    }

    pub async fn post_json(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        body: &JsonValue,
    ) -> Result<JsonValue, FetchError> {
        self.send_json(run_id, source_id, url, Some(body)).await
    }

    pub async fn get_json(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<JsonValue, FetchError> {
        self.send_json(run_id, source_id, url, None).await
    }

    async fn send_json(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        body: Option<&JsonValue>,
    ) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_json", %run_id, source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = match body {
                Some(json) => self.client.post(url).json(json),
                None => self.client.get(url),
            };
            if let Some(auth) = &self.auth_header {
                request = request.header(reqwest::header::AUTHORIZATION, auth);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return resp.json::<JsonValue>().await.map_err(|err| {
                            FetchError::InvalidJson {
                                url: final_url,
                                message: err.to_string(),
                            }
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use revmon_core::Sentiment;

    fn sample_review(review_id: &str, batch: &str) -> NormalizedReview {
        NormalizedReview {
            review_id: review_id.to_string(),
            location_id: "cartorio_paulista_main".to_string(),
            rating: Some(5),
            comment: Some("Ótimo atendimento".to_string()),
            reviewer_name: "Maria Silva".to_string(),
            is_anonymous: false,
            create_time: Utc.with_ymd_and_hms(2025, 8, 10, 9, 0, 0).single().unwrap(),
            update_time: None,
            reply_text: None,
            reply_time: None,
            collection_source: "dataforseo_auto".to_string(),
            collection_batch_id: batch.to_string(),
            processed_at: Utc::now(),
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn memory_writer_upserts_by_review_id() {
        let writer = MemoryReviewWriter::new();
        let first = sample_review("gbp_abc", "batch_1");
        let second = sample_review("gbp_abc", "batch_2");

        persist_review(&writer, &first, &serde_json::json!({"v": 1})).await.unwrap();
        persist_review(&writer, &second, &serde_json::json!({"v": 2})).await.unwrap();

        assert_eq!(writer.review_count(), 1);
        let stored = writer.review("gbp_abc").unwrap();
        assert_eq!(stored.collection_batch_id, "batch_2");
    }

    #[tokio::test]
    async fn mention_links_are_idempotent_per_pair() {
        let writer = MemoryReviewWriter::with_roster(vec![CollaboratorProfile {
            id: None,
            full_name: "Ana Sophia".to_string(),
            department: "E-notariado".to_string(),
            position: None,
            is_active: true,
            aliases: vec!["Ana Sofia".to_string()],
        }]);
        let mention = CollaboratorMention {
            name: "Ana Sophia".to_string(),
            snippet: "Ana Sophia foi excelente".to_string(),
            confidence: 0.9,
        };

        let linked = persist_mentions(&writer, "gbp_r1", &[mention.clone()], true, 0.8, "E-notariado").await;
        assert_eq!(linked, 1);
        let linked_again =
            persist_mentions(&writer, "gbp_r1", &[mention], true, 0.8, "E-notariado").await;
        assert_eq!(linked_again, 1);
        assert_eq!(writer.link_count(), 1);
    }

    #[tokio::test]
    async fn low_confidence_mentions_do_not_auto_create() {
        let writer = MemoryReviewWriter::new();
        let mention = CollaboratorMention {
            name: "Fulano Qualquer".to_string(),
            snippet: "Fulano Qualquer esteve lá".to_string(),
            confidence: 0.5,
        };
        let linked = persist_mentions(&writer, "gbp_r1", &[mention], true, 0.8, "E-notariado").await;
        assert_eq!(linked, 0);
        assert_eq!(writer.collaborator_count(), 0);
    }

    #[tokio::test]
    async fn alias_resolution_is_case_insensitive() {
        let writer = MemoryReviewWriter::with_roster(vec![CollaboratorProfile {
            id: None,
            full_name: "Kaio Gomes".to_string(),
            department: "Protesto".to_string(),
            position: None,
            is_active: true,
            aliases: vec!["Caio Gomes".to_string()],
        }]);
        let id = writer
            .resolve_collaborator("caio gomes", false, "Protesto")
            .await
            .unwrap();
        assert!(id.is_some());
    }

    #[tokio::test]
    async fn labels_upsert_replaces_previous_row() {
        let writer = MemoryReviewWriter::new();
        let labels = ReviewLabels {
            review_id: "gbp_r1".to_string(),
            sentiment: Sentiment::Pos,
            is_service_related: true,
            classifier_version: "v1-rules".to_string(),
        };
        writer.upsert_labels(&labels).await.unwrap();
        let updated = ReviewLabels {
            sentiment: Sentiment::Neu,
            ..labels
        };
        writer.upsert_labels(&updated).await.unwrap();
        let state = writer.inner.lock().unwrap();
        assert_eq!(state.labels.len(), 1);
        assert_eq!(state.labels["gbp_r1"].sentiment, Sentiment::Neu);
    }
}
