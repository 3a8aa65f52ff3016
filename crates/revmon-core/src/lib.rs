//! Core domain model and review identity for REVMON.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "revmon-core";

/// Reviewer-name sentinel used when a source item carries no author.
pub const ANONYMOUS_SENTINEL: &str = "Anônimo";

/// Rating as it appears on the wire: a bare number, a string, or `{value: n}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawRating {
    Number(f64),
    Text(String),
    Valued { value: f64 },
}

/// Timestamp as it appears on the wire: unix seconds, or a text form that may
/// be ISO-8601 or a relative phrase ("3 dias atrás").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Seconds(i64),
    Text(String),
}

/// Business-owner reply fragment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawReply {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub timestamp: Option<RawTimestamp>,
}

/// One review item as received from either source adapter, before
/// normalization. Field names vary by source, so every known spelling is a
/// separate optional slot and everything unrecognized lands in `extra` so the
/// raw-payload table keeps a faithful copy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawReviewItem {
    #[serde(default)]
    pub review_id: Option<String>,
    #[serde(default)]
    pub rating: Option<RawRating>,
    #[serde(default)]
    pub review_rating: Option<RawRating>,
    #[serde(default)]
    pub review_text: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub reviewer_name: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub profile_name: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub timestamp: Option<RawTimestamp>,
    #[serde(default)]
    pub time: Option<RawTimestamp>,
    #[serde(default)]
    pub time_parsed: Option<String>,
    #[serde(default)]
    pub updated_timestamp: Option<RawTimestamp>,
    #[serde(default)]
    pub reply: Option<RawReply>,
    #[serde(default)]
    pub owner_response: Option<RawReply>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl RawReviewItem {
    /// Full payload for the audit table, extra fields included.
    pub fn to_payload(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// Canonical persisted review representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedReview {
    pub review_id: String,
    pub location_id: String,
    pub rating: Option<i16>,
    pub comment: Option<String>,
    pub reviewer_name: String,
    pub is_anonymous: bool,
    pub create_time: DateTime<Utc>,
    pub update_time: Option<DateTime<Utc>>,
    pub reply_text: Option<String>,
    pub reply_time: Option<DateTime<Utc>>,
    pub collection_source: String,
    pub collection_batch_id: String,
    pub processed_at: DateTime<Utc>,
}

/// Staff member roster entry. Maintained by the CRUD surface; the matcher
/// only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorProfile {
    pub id: Option<i64>,
    pub full_name: String,
    pub department: String,
    #[serde(default)]
    pub position: Option<String>,
    pub is_active: bool,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl CollaboratorProfile {
    /// Minimal profile auto-created on first mention.
    pub fn minimal(full_name: impl Into<String>, department: impl Into<String>) -> Self {
        let full_name = full_name.into();
        Self {
            id: None,
            full_name: full_name.clone(),
            department: department.into(),
            position: None,
            is_active: true,
            aliases: vec![full_name],
        }
    }
}

/// One detected staff mention inside a review comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorMention {
    pub name: String,
    pub snippet: String,
    pub confidence: f64,
}

/// Persisted review ↔ collaborator association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewCollaboratorLink {
    pub review_id: String,
    pub collaborator_id: i64,
    pub mention_snippet: Option<String>,
    pub match_score: f64,
}

/// Rule-derived annotations attached to a normalized review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewLabels {
    pub review_id: String,
    pub sentiment: Sentiment,
    pub is_service_related: bool,
    pub classifier_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Pos,
    Neu,
    Neg,
    Unknown,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Pos => "pos",
            Sentiment::Neu => "neu",
            Sentiment::Neg => "neg",
            Sentiment::Unknown => "unknown",
        }
    }

    /// Trivial rating rule: 4-5 positive, 3 neutral, 1-2 negative.
    pub fn from_rating(rating: Option<i16>) -> Self {
        match rating {
            Some(r) if r >= 4 => Sentiment::Pos,
            Some(3) => Sentiment::Neu,
            Some(_) => Sentiment::Neg,
            None => Sentiment::Unknown,
        }
    }
}

/// Deterministic identifier for idempotent upserts. Source-provided review
/// ids are absent or unstable for some adapters, so identity is derived from
/// the reviewer name, the first 120 chars of the comment, and the resolved
/// create time. The same logical review always maps to the same id.
pub fn stable_review_id(
    reviewer_name: &str,
    comment: Option<&str>,
    create_time: DateTime<Utc>,
) -> String {
    let truncated: String = comment.unwrap_or_default().chars().take(120).collect();
    let basis = format!(
        "{}__{}__{}",
        reviewer_name,
        truncated,
        create_time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    );
    let encoded: String = BASE64
        .encode(basis.as_bytes())
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(40)
        .collect();
    format!("gbp_{encoded}")
}

/// Content fingerprint for within-run duplicate suppression. Independent of
/// the stable id: SHA-256 over the ordered field tuple, so a change to any
/// one field changes the hash.
pub fn content_fingerprint(
    reviewer_name: &str,
    comment: Option<&str>,
    rating: Option<i16>,
    create_time: DateTime<Utc>,
) -> String {
    let joined = format!(
        "{}|{}|{}|{}",
        reviewer_name,
        comment.unwrap_or_default(),
        rating.map(|r| r.to_string()).unwrap_or_default(),
        create_time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    );
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 15, 10, 30, 0).single().unwrap()
    }

    #[test]
    fn stable_id_is_deterministic() {
        let a = stable_review_id("Maria Silva", Some("Atendimento impecável"), ts());
        let b = stable_review_id("Maria Silva", Some("Atendimento impecável"), ts());
        assert_eq!(a, b);
        assert!(a.starts_with("gbp_"));
        assert!(a.len() <= 4 + 40);
        assert!(a[4..].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn stable_id_changes_with_any_input() {
        let base = stable_review_id("Maria Silva", Some("Atendimento impecável"), ts());
        assert_ne!(
            base,
            stable_review_id("Mario Silva", Some("Atendimento impecável"), ts())
        );
        assert_ne!(
            base,
            stable_review_id("Maria Silva", Some("Atendimento péssimo"), ts())
        );
        assert_ne!(
            base,
            stable_review_id(
                "Maria Silva",
                Some("Atendimento impecável"),
                ts() + chrono::Duration::seconds(1)
            )
        );
    }

    #[test]
    fn stable_id_truncates_long_comments() {
        let long: String = "x".repeat(500);
        let a = stable_review_id("Ana", Some(&long), ts());
        let longer = format!("{long}yyy");
        // Differences past the 120-char basis window do not change identity.
        let b = stable_review_id("Ana", Some(&longer), ts());
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_is_sensitive_to_each_field() {
        let base = content_fingerprint("Ana", Some("Bom"), Some(5), ts());
        assert_ne!(base, content_fingerprint("Bea", Some("Bom"), Some(5), ts()));
        assert_ne!(base, content_fingerprint("Ana", Some("Ruim"), Some(5), ts()));
        assert_ne!(base, content_fingerprint("Ana", Some("Bom"), Some(4), ts()));
        assert_ne!(
            base,
            content_fingerprint("Ana", Some("Bom"), Some(5), ts() + chrono::Duration::days(1))
        );
    }

    #[test]
    fn raw_item_parses_both_rating_shapes() {
        let bare: RawReviewItem = serde_json::from_str(r#"{"rating": 4}"#).unwrap();
        assert_eq!(bare.rating, Some(RawRating::Number(4.0)));

        let valued: RawReviewItem = serde_json::from_str(r#"{"rating": {"value": 5}}"#).unwrap();
        assert_eq!(valued.rating, Some(RawRating::Valued { value: 5.0 }));
    }

    #[test]
    fn raw_item_keeps_unknown_fields_for_audit() {
        let item: RawReviewItem =
            serde_json::from_str(r#"{"text": "ok", "review_url": "https://example"}"#).unwrap();
        assert_eq!(item.extra.get("review_url").and_then(|v| v.as_str()), Some("https://example"));
        let payload = item.to_payload();
        assert!(payload.get("review_url").is_some());
    }

    #[test]
    fn sentiment_rating_rule() {
        assert_eq!(Sentiment::from_rating(Some(5)), Sentiment::Pos);
        assert_eq!(Sentiment::from_rating(Some(4)), Sentiment::Pos);
        assert_eq!(Sentiment::from_rating(Some(3)), Sentiment::Neu);
        assert_eq!(Sentiment::from_rating(Some(1)), Sentiment::Neg);
        assert_eq!(Sentiment::from_rating(None), Sentiment::Unknown);
    }
}
