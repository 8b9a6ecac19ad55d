//! Entity, tag, and query-term extraction.
//!
//! The fabric first asks the utility model for a structured extraction;
//! when that fails (model down, malformed output) it falls back to the
//! heuristics here, which are deterministic and good enough to keep
//! saves flowing.

use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

/// Extracted entities and tags for one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Extraction {
    /// Entity names, lowercased.
    #[serde(default)]
    pub entities: Vec<String>,
    /// Tags, lowercased.
    #[serde(default)]
    pub tags: Vec<String>,
}

static CAPITALIZED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][A-Za-z0-9_-]{1,30}\b").expect("entity regex"));
static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d[\d.,:-]{1,15}\b").expect("number regex"));
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#([a-z0-9_-]{2,30})").expect("tag regex"));
static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9][a-z0-9_-]{1,30}").expect("word regex"));

/// Words too common to be useful search terms.
const STOPWORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "on", "in", "at", "to", "of",
    "for", "and", "or", "it", "this", "that", "what", "which", "who", "how", "my", "me", "you",
    "i", "we", "do", "does", "did", "with", "from", "remember",
];

/// Heuristic extraction: capitalized tokens and numbers become entities,
/// `#hashtags` become tags.
#[must_use]
pub fn extract_heuristic(content: &str) -> Extraction {
    let mut entities: Vec<String> = Vec::new();
    for caps in CAPITALIZED_RE.find_iter(content) {
        let entity = caps.as_str().to_lowercase();
        if !STOPWORDS.contains(&entity.as_str()) && !entities.contains(&entity) {
            entities.push(entity);
        }
    }
    for caps in NUMBER_RE.find_iter(content) {
        let entity = caps.as_str().trim_matches(|c: char| !c.is_ascii_digit()).to_string();
        if entity.len() >= 2 && !entities.contains(&entity) {
            entities.push(entity);
        }
    }
    entities.truncate(12);

    let mut tags: Vec<String> = Vec::new();
    for caps in TAG_RE.captures_iter(content) {
        let tag = caps[1].to_string();
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    Extraction { entities, tags }
}

/// Search terms for a query: lowercased words minus stopwords, plus any
/// number literals.
#[must_use]
pub fn query_terms(query: &str) -> Vec<String> {
    let lowered = query.to_lowercase();
    let mut terms: Vec<String> = Vec::new();
    for m in WORD_RE.find_iter(&lowered) {
        let word = m.as_str().to_string();
        if !STOPWORDS.contains(&word.as_str()) && !terms.contains(&word) {
            terms.push(word);
        }
    }
    terms.truncate(16);
    terms
}

/// Parse a utility-model extraction response. The model is asked for bare
/// JSON but may wrap it in prose or fences; scan for the first object.
#[must_use]
pub fn parse_model_extraction(response: &str) -> Option<Extraction> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end <= start {
        return None;
    }
    let candidate = &response[start..=end];
    let mut extraction: Extraction = serde_json::from_str(candidate).ok()?;
    for entity in &mut extraction.entities {
        *entity = entity.to_lowercase();
    }
    for tag in &mut extraction.tags {
        *tag = tag.to_lowercase();
    }
    Some(extraction)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_finds_names_numbers_and_tags() {
        let e = extract_heuristic("Remember: the VPS port is 48920 #infra #homelab");
        assert!(e.entities.contains(&"vps".to_string()));
        assert!(e.entities.contains(&"48920".to_string()));
        assert_eq!(e.tags, vec!["infra".to_string(), "homelab".to_string()]);
    }

    #[test]
    fn query_terms_drop_stopwords() {
        let terms = query_terms("What port is the VPS on?");
        assert_eq!(terms, vec!["port".to_string(), "vps".to_string()]);
    }

    #[test]
    fn model_extraction_survives_fences() {
        let response = "Sure! ```json\n{\"entities\": [\"VPS\"], \"tags\": [\"infra\"]}\n```";
        let e = parse_model_extraction(response).unwrap();
        assert_eq!(e.entities, vec!["vps".to_string()]);
    }

    #[test]
    fn model_extraction_rejects_garbage() {
        assert!(parse_model_extraction("no json here").is_none());
    }
}
