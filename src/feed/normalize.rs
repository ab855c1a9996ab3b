use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use super::wire::{string_value, RawActivity, RawMedia};
use crate::markers;
use crate::models::{FetchedPost, MediaRef};

/// Why a raw item could not become a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MissingId,
    BadTimestamp(String),
}

pub fn normalize_activity(raw: RawActivity) -> Result<FetchedPost, Rejection> {
    if raw.id <= 0 {
        return Err(Rejection::MissingId);
    }
    let date = raw.date.clone().unwrap_or_default();
    let observed_at = parse_timestamp(&date).ok_or(Rejection::BadTimestamp(date))?;

    let text_content = plain_text(&raw);
    let media_refs: Vec<MediaRef> = raw.bp_media_ids.iter().map(media_ref).collect();
    let primary_image_url = media_refs
        .first()
        .and_then(|media| media.resolve_url())
        .map(str::to_string);

    Ok(FetchedPost {
        activity_id: raw.id,
        user_id: raw.user_id,
        user_name: raw
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("User_{}", raw.user_id)),
        declared_adventure_number: markers::adventure_number(&text_content),
        declared_level: markers::adventure_level(&text_content),
        media_refs,
        primary_image_url,
        text_content,
        observed_at,
    })
}

/// `content_stripped` when present, otherwise the rendered content with markup removed.
fn plain_text(raw: &RawActivity) -> String {
    if let Some(stripped) = string_value(raw.content_stripped.as_ref()) {
        return stripped.trim().to_string();
    }
    match raw.content.as_ref() {
        Some(Value::Object(fields)) => fields
            .get("rendered")
            .and_then(Value::as_str)
            .map(markers::strip_markup)
            .unwrap_or_default(),
        Some(Value::String(text)) => markers::strip_markup(text),
        _ => String::new(),
    }
}

fn media_ref(raw: &RawMedia) -> MediaRef {
    let attachment = raw.attachment_data.as_ref();
    MediaRef {
        theatre_popup: attachment
            .and_then(|data| string_value(data.media_theatre_popup.as_ref())),
        full: attachment.and_then(|data| string_value(data.full.as_ref())),
        url: string_value(raw.url.as_ref()),
    }
}

/// WordPress emits both RFC 3339 and zone-less local timestamps; the latter are read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}
