//! Raw review item to canonical review resolution.
//!
//! Sources disagree on field names and value shapes, so each canonical field
//! resolves through a fixed priority list. Resolution never fails: a field
//! that cannot be resolved takes its documented fallback, and items that are
//! still unusable are caught by validation downstream.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use revmon_core::{
    stable_review_id, NormalizedReview, RawRating, RawReply, RawReviewItem, RawTimestamp,
    ANONYMOUS_SENTINEL,
};

use crate::parse_relative_phrase;

/// Context applied to every item of one collection run.
#[derive(Debug, Clone)]
pub struct NormalizeContext {
    pub location_id: String,
    pub collection_source: String,
    pub collection_batch_id: String,
    /// Instant relative phrases resolve against; also the create-time
    /// fallback when no timestamp field is usable.
    pub ingested_at: DateTime<Utc>,
    /// Rating assumed when no rating field is present or parseable. `None`
    /// keeps the review unrated instead.
    pub fallback_rating: Option<i16>,
}

/// Resolve one raw item into the canonical shape. The stable review id is
/// derived here, after the reviewer name, comment, and create time settle.
pub fn normalize(item: &RawReviewItem, ctx: &NormalizeContext) -> NormalizedReview {
    let rating = resolve_rating(item).or(ctx.fallback_rating);
    let comment = resolve_comment(item);
    let (reviewer_name, is_anonymous) = resolve_reviewer(item);
    let create_time = resolve_create_time(item, ctx.ingested_at);
    let (reply_text, reply_time) = resolve_reply(item, ctx.ingested_at);

    NormalizedReview {
        review_id: stable_review_id(&reviewer_name, comment.as_deref(), create_time),
        location_id: ctx.location_id.clone(),
        rating,
        comment,
        reviewer_name,
        is_anonymous,
        create_time,
        update_time: item
            .updated_timestamp
            .as_ref()
            .and_then(|ts| resolve_timestamp(ts, ctx.ingested_at)),
        reply_text,
        reply_time,
        collection_source: ctx.collection_source.clone(),
        collection_batch_id: ctx.collection_batch_id.clone(),
        processed_at: ctx.ingested_at,
    }
}

/// Rating priority: `rating` then `review_rating`. A present numeric value is
/// passed through as-is, including out-of-range ones, so validation can
/// reject them explicitly instead of them being silently clamped or
/// defaulted.
pub fn resolve_rating(item: &RawReviewItem) -> Option<i16> {
    item.rating
        .as_ref()
        .or(item.review_rating.as_ref())
        .and_then(rating_value)
}

fn rating_value(raw: &RawRating) -> Option<i16> {
    let number = match raw {
        RawRating::Number(n) => Some(*n),
        RawRating::Valued { value } => Some(*value),
        RawRating::Text(text) => text.trim().parse::<f64>().ok(),
    }?;
    if !number.is_finite() {
        return None;
    }
    Some(number.round() as i16)
}

/// Comment priority: `review_text`, `text`, `comment`. Whitespace-only text
/// counts as absent.
pub fn resolve_comment(item: &RawReviewItem) -> Option<String> {
    [&item.review_text, &item.text, &item.comment]
        .into_iter()
        .flatten()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Reviewer priority: `reviewer_name`, `author`, `profile_name`, `user_name`.
/// An item with none of them gets the anonymous sentinel and the flag.
pub fn resolve_reviewer(item: &RawReviewItem) -> (String, bool) {
    let found = [
        &item.reviewer_name,
        &item.author,
        &item.profile_name,
        &item.user_name,
    ]
    .into_iter()
    .flatten()
    .map(|s| s.trim())
    .find(|s| !s.is_empty());
    match found {
        Some(name) => (name.to_string(), false),
        None => (ANONYMOUS_SENTINEL.to_string(), true),
    }
}

/// Create-time priority: `timestamp`, `time`, `time_parsed`, then the
/// ingestion instant.
fn resolve_create_time(item: &RawReviewItem, ingested_at: DateTime<Utc>) -> DateTime<Utc> {
    item.timestamp
        .as_ref()
        .or(item.time.as_ref())
        .and_then(|ts| resolve_timestamp(ts, ingested_at))
        .or_else(|| {
            item.time_parsed
                .as_deref()
                .and_then(|text| parse_timestamp_text(text, ingested_at))
        })
        .unwrap_or(ingested_at)
}

fn resolve_timestamp(raw: &RawTimestamp, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match raw {
        RawTimestamp::Seconds(secs) => Utc.timestamp_opt(*secs, 0).single(),
        RawTimestamp::Text(text) => parse_timestamp_text(text, reference),
    }
}

/// Text timestamps are either ISO-8601 (with or without an offset) or a
/// relative phrase.
fn parse_timestamp_text(text: &str, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    parse_relative_phrase(trimmed, reference)
}

fn resolve_reply(
    item: &RawReviewItem,
    reference: DateTime<Utc>,
) -> (Option<String>, Option<DateTime<Utc>>) {
    let reply: Option<&RawReply> = item.reply.as_ref().or(item.owner_response.as_ref());
    let Some(reply) = reply else {
        return (None, None);
    };
    let text = reply
        .text
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let time = reply
        .timestamp
        .as_ref()
        .and_then(|ts| resolve_timestamp(ts, reference));
    (text, time)
}
