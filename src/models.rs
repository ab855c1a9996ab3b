use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cut level a student declares in the post body.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdventureLevel {
    Basic,
    Advanced,
    Unknown,
}

impl AdventureLevel {
    pub(crate) fn as_db_str(self) -> &'static str {
        match self {
            AdventureLevel::Basic => "basic",
            AdventureLevel::Advanced => "advanced",
            AdventureLevel::Unknown => "unknown",
        }
    }

    pub(crate) fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "basic" => AdventureLevel::Basic,
            "advanced" => AdventureLevel::Advanced,
            _ => AdventureLevel::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Unprocessed,
    Processed,
}

impl PostStatus {
    pub(crate) fn as_db_str(self) -> &'static str {
        match self {
            PostStatus::Unprocessed => "unprocessed",
            PostStatus::Processed => "processed",
        }
    }

    pub(crate) fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "processed" => PostStatus::Processed,
            _ => PostStatus::Unprocessed,
        }
    }
}

/// Which reference collection the technical and historical stages search.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeCollection {
    Basic,
    Advanced,
}

impl KnowledgeCollection {
    pub fn label(self) -> &'static str {
        match self {
            KnowledgeCollection::Basic => "Basic Cut",
            KnowledgeCollection::Advanced => "Advanced Cut",
        }
    }

    /// Control messages name collections loosely; anything but "advanced" is basic.
    pub fn from_wire(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("advanced") {
            KnowledgeCollection::Advanced
        } else {
            KnowledgeCollection::Basic
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Technical,
    Historical,
    #[serde(alias = "meta")]
    Synthesis,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Technical => "technical",
            Stage::Historical => "historical",
            Stage::Synthesis => "synthesis",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attachment descriptor as delivered by the feed, reduced to the URL
/// candidates the pipeline cares about.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaRef {
    #[serde(default)]
    pub theatre_popup: Option<String>,
    /// Full-size rendition. Kept with the stored post for reference only;
    /// the pipeline sends the popup rendition.
    #[serde(default)]
    pub full: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl MediaRef {
    /// Popup rendition first, then the generic url. Both must carry an http(s)
    /// scheme; the returned url is trimmed.
    pub fn resolve_url(&self) -> Option<&str> {
        usable_url(self.theatre_popup.as_deref()).or_else(|| usable_url(self.url.as_deref()))
    }
}

fn usable_url(candidate: Option<&str>) -> Option<&str> {
    let candidate = candidate?.trim();
    let lower = candidate.to_ascii_lowercase();
    (lower.starts_with("http://") || lower.starts_with("https://")).then_some(candidate)
}

/// A normalized feed item that has not been stored yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchedPost {
    pub activity_id: i64,
    pub user_id: i64,
    pub user_name: String,
    pub media_refs: Vec<MediaRef>,
    pub primary_image_url: Option<String>,
    pub declared_adventure_number: Option<u32>,
    pub declared_level: AdventureLevel,
    pub text_content: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Post {
    pub id: i64,
    pub activity_id: i64,
    pub user_id: i64,
    pub user_name: String,
    pub media_refs: Vec<MediaRef>,
    pub primary_image_url: Option<String>,
    pub declared_adventure_number: Option<u32>,
    pub declared_level: AdventureLevel,
    pub text_content: String,
    pub observed_at: DateTime<Utc>,
    pub status: PostStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrichmentRecord {
    pub post_id: i64,
    pub user_id: i64,
    pub text_content: String,
    pub adventure_label: String,
    pub image_urls: Vec<String>,
    pub technical_analysis: String,
    pub historical_analysis: String,
    pub synthesis: String,
    pub rating: i64,
    pub completed_at: DateTime<Utc>,
}
