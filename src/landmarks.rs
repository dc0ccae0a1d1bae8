use std::fs;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};

const BUILTIN_LANDMARKS: &[(&str, &str)] = &[
    ("WACA", "WACA Ground Perth"),
    ("ELIZABETH QUAY", "Elizabeth Quay Perth"),
    ("SCARBOROUGH", "Scarborough Beach Perth"),
    ("SWAN RIVER", "Swan River Perth"),
    ("KINGS PARK", "Kings Park Perth"),
    ("YANCHEP", "Yanchep Perth"),
    ("KAMBALDA", "Kambalda Western Australia"),
    ("CLOVERDALE", "Cloverdale Perth"),
    ("HEATHRIDGE", "Heathridge Perth"),
    ("PINGELLY", "Pingelly Western Australia"),
    ("KWINANA", "Kwinana Perth"),
];

/// One row of a landmark table file.
#[derive(Debug, Clone, Deserialize)]
pub struct LandmarkEntry {
    pub pattern: String,
    pub query: String,
}

#[derive(Debug, Clone)]
pub struct LandmarkPattern {
    matcher: Regex,
    canonical_query: String,
}

impl LandmarkPattern {
    fn compile(pattern: &str, canonical_query: &str) -> AppResult<Self> {
        let matcher = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|err| AppError::Config(format!("invalid landmark pattern {pattern:?}: {err}")))?;
        Ok(Self {
            matcher,
            canonical_query: canonical_query.to_string(),
        })
    }

    pub fn canonical_query(&self) -> &str {
        &self.canonical_query
    }
}

/// Ordered regex -> canonical query table. Every matching row is returned, in table order.
#[derive(Debug, Clone)]
pub struct LandmarkMatcher {
    patterns: Vec<LandmarkPattern>,
}

impl LandmarkMatcher {
    pub fn builtin() -> Self {
        let patterns = BUILTIN_LANDMARKS
            .iter()
            .filter_map(|(pattern, query)| LandmarkPattern::compile(pattern, query).ok())
            .collect();
        Self { patterns }
    }

    pub fn from_entries(entries: &[LandmarkEntry]) -> AppResult<Self> {
        let patterns = entries
            .iter()
            .map(|entry| LandmarkPattern::compile(&entry.pattern, &entry.query))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn from_json_file(path: &Path) -> AppResult<Self> {
        let contents = fs::read_to_string(path)?;
        let entries: Vec<LandmarkEntry> = serde_json::from_str(&contents)?;
        debug!(path = %path.display(), count = entries.len(), "loaded landmark table");
        Self::from_entries(&entries)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn match_landmarks(&self, address: &str) -> Vec<String> {
        self.patterns
            .iter()
            .filter(|pattern| pattern.matcher.is_match(address))
            .map(|pattern| pattern.canonical_query.clone())
            .collect()
    }
}

impl Default for LandmarkMatcher {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_waca_case_insensitively() {
        let matcher = LandmarkMatcher::builtin();
        assert_eq!(matcher.len(), BUILTIN_LANDMARKS.len());
        assert_eq!(
            matcher.match_landmarks("WACA GROUNDNELSON CREAST PERTH WA 6004"),
            vec!["WACA Ground Perth".to_string()]
        );
        assert_eq!(
            matcher.match_landmarks("the waca, east perth"),
            vec!["WACA Ground Perth".to_string()]
        );
    }

    #[test]
    fn returns_every_match_in_table_order() {
        let matcher = LandmarkMatcher::builtin();
        let queries = matcher.match_landmarks("SWAN RIVER – ELIZABETH QUAY BARGE PERTH WA 6000");
        assert_eq!(
            queries,
            vec![
                "Elizabeth Quay Perth".to_string(),
                "Swan River Perth".to_string()
            ]
        );
        assert!(matcher.match_landmarks("SOMEWHERE ELSE").is_empty());
    }

    #[test]
    fn loads_table_from_file_and_rejects_bad_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("landmarks.json");
        fs::write(
            &path,
            r#"[{"pattern": "HILLARYS", "query": "Hillarys Boat Harbour Perth"}]"#,
        )
        .unwrap();
        let matcher = LandmarkMatcher::from_json_file(&path).unwrap();
        assert_eq!(
            matcher.match_landmarks("HILLARYS BOAT HARBOUR"),
            vec!["Hillarys Boat Harbour Perth".to_string()]
        );
        assert!(matcher.match_landmarks("WACA").is_empty());

        let invalid = LandmarkMatcher::from_entries(&[LandmarkEntry {
            pattern: "(".into(),
            query: "broken".into(),
        }]);
        assert!(matches!(invalid, Err(AppError::Config(_))));
    }
}
