//! Activity payloads as the BuddyBoss REST API returns them. Fields are
//! loosely typed upstream (`false` where a list is expected, numbers where a
//! string is expected), so everything past the item id is read leniently.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct RawActivity {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub content_stripped: Option<Value>,
    #[serde(default, deserialize_with = "lenient_media")]
    pub bp_media_ids: Vec<RawMedia>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMedia {
    #[serde(default)]
    pub attachment_data: Option<RawAttachment>,
    #[serde(default)]
    pub url: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAttachment {
    #[serde(default)]
    pub full: Option<Value>,
    #[serde(default)]
    pub media_theatre_popup: Option<Value>,
}

fn lenient_media<'de, D>(deserializer: D) -> Result<Vec<RawMedia>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let Value::Array(items) = value else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<RawMedia>(item).ok())
        .collect())
}

/// A string field, or `None` for null/bool/number/missing.
pub(crate) fn string_value(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(text)) if !text.trim().is_empty() => Some(text.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_list_accepts_false_and_garbage_entries() {
        let raw: RawActivity =
            serde_json::from_str(r#"{"id": 1, "user_id": 2, "bp_media_ids": false}"#).unwrap();
        assert!(raw.bp_media_ids.is_empty());

        let raw: RawActivity = serde_json::from_str(
            r#"{"id": 1, "bp_media_ids": [
                {"attachment_data": {"full": "https://a/full.jpg", "media_theatre_popup": false}},
                "not-an-object",
                {"url": "https://a/plain.jpg"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(raw.bp_media_ids.len(), 2);
        let attachment = raw.bp_media_ids[0].attachment_data.as_ref().unwrap();
        assert_eq!(
            string_value(attachment.full.as_ref()).as_deref(),
            Some("https://a/full.jpg")
        );
        assert_eq!(string_value(attachment.media_theatre_popup.as_ref()), None);
    }
}
