//! Pattern matching over free text: adventure numbers, cut levels and the
//! knowledge collection a post belongs to.

use std::sync::OnceLock;

use regex_lite::Regex;

use crate::models::{AdventureLevel, KnowledgeCollection};

fn adventure_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(?:abenteuer|adventure)\s*(?:nr\.?|no\.?|#)?\s*(\d{1,4})\b")
            .expect("adventure pattern is valid")
    })
}

fn level_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(basic|advanced)\s*cut\b").expect("level pattern is valid")
    })
}

fn markup_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<[^>]*>").expect("markup pattern is valid"))
}

/// First number following "Adventure"/"Abenteuer".
pub fn adventure_number(text: &str) -> Option<u32> {
    adventure_pattern()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub fn adventure_level(text: &str) -> AdventureLevel {
    match level_pattern()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
        .as_deref()
    {
        Some("basic") => AdventureLevel::Basic,
        Some("advanced") => AdventureLevel::Advanced,
        _ => AdventureLevel::Unknown,
    }
}

/// Advanced when either the text or the declared level mentions "advanced";
/// everything else, including an unknown level, searches the basic collection.
pub fn classify_collection(text: &str, declared: AdventureLevel) -> KnowledgeCollection {
    if declared == AdventureLevel::Advanced || text.to_lowercase().contains("advanced") {
        KnowledgeCollection::Advanced
    } else {
        KnowledgeCollection::Basic
    }
}

/// Best-effort plain text from rendered HTML.
pub fn strip_markup(html: &str) -> String {
    let without_tags = markup_pattern().replace_all(html, " ");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adventure_number_matches_both_languages() {
        assert_eq!(adventure_number("Abenteuer 3 Basic Cut"), Some(3));
        assert_eq!(adventure_number("Matches Adventure 7 - Advanced"), Some(7));
        assert_eq!(adventure_number("adventure #12 done"), Some(12));
        assert_eq!(adventure_number("no marker here 42"), None);
    }

    #[test]
    fn level_defaults_to_unknown() {
        assert_eq!(adventure_level("Abenteuer 3 Basic Cut"), AdventureLevel::Basic);
        assert_eq!(adventure_level("my ADVANCED cut"), AdventureLevel::Advanced);
        assert_eq!(adventure_level("just a haircut"), AdventureLevel::Unknown);
    }

    #[test]
    fn advanced_cut_in_any_case_selects_advanced_collection() {
        assert_eq!(
            classify_collection("Today: aDvAnCeD CuT number two", AdventureLevel::Unknown),
            KnowledgeCollection::Advanced
        );
        assert_eq!(
            classify_collection("plain text", AdventureLevel::Advanced),
            KnowledgeCollection::Advanced
        );
    }

    #[test]
    fn text_without_markers_selects_basic_collection() {
        assert_eq!(
            classify_collection("a fresh bob for my sister", AdventureLevel::Unknown),
            KnowledgeCollection::Basic
        );
        assert_eq!(
            classify_collection("Abenteuer 3 Basic Cut", AdventureLevel::Basic),
            KnowledgeCollection::Basic
        );
    }

    #[test]
    fn strip_markup_removes_tags_and_entities() {
        assert_eq!(
            strip_markup("<p>Abenteuer&nbsp;3</p>\n<p>Basic <b>Cut</b> &amp; more</p>"),
            "Abenteuer 3 Basic Cut & more"
        );
    }
}
