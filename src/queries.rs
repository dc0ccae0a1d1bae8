//! Candidate geocoding queries proposed by the completion oracle.
//!
//! Oracle output is free-form text. It is read as a JSON array if one can be found, then as an
//! object carrying an array field, then line by line. When nothing usable comes back the
//! deterministic fallback built from the raw address is returned instead.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::AppError;
use crate::oracle::{CompletionOracle, Prompt};

const MAX_QUERY_LEN: usize = 200;

const QUERY_SYSTEM_PROMPT: &str = r#"You are a helpful assistant that analyzes addresses in Perth, Western Australia and generates optimal geocoding search queries.

Your task is to analyze the given address and event context, then generate 3-5 different geocoding query variations that will help find the correct location.

Consider:
- Perth landmarks and venues (WACA Ground, Elizabeth Quay, Kings Park, Scarborough Beach, etc.)
- Venue names from the event purpose
- Suburbs and street names
- Context clues (e.g., "beach" suggests beachfront, "river" suggests river location, "barge" suggests a barge on the river)
- Common abbreviations (PD = Parade, TCE = Terrace, DR = Drive, ST = Street)

Return ONLY a JSON array of query strings, nothing else. Each query should be optimized for geocoding services like Nominatim.

Example input:
Address: "SWAN RIVER – BARGERIVERSIDE DRPERTH WA 6000"
Purpose: "CITY OF PERTHFESTIVE LIGHTS"

Example output:
["Swan River barge Perth", "Riverside Drive Perth", "Swan River Perth fireworks", "Perth barge location", "Riverside Drive Swan River Perth"]"#;

static STATE_POSTCODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"WA \d{4}").expect("valid state postcode regex"));
static DOUBLE_QUOTED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([^"]+)""#).expect("valid double quote regex"));
static SINGLE_QUOTED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'([^']+)'").expect("valid single quote regex"));
static BULLET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[-•*]|\d+[.)])\s*").expect("valid bullet regex"));

/// Source of ranked candidate queries for one raw address.
#[async_trait]
pub trait QuerySuggester: Send + Sync {
    /// Never fails and never returns an empty list.
    async fn suggest(&self, address: &str, purpose: &str) -> Vec<String>;
}

pub struct QueryGenerator {
    oracle: Arc<dyn CompletionOracle>,
}

impl QueryGenerator {
    pub fn new(oracle: Arc<dyn CompletionOracle>) -> Self {
        Self { oracle }
    }

    pub async fn generate_queries(&self, address: &str, purpose: &str) -> Vec<String> {
        let prompt = Prompt {
            system: QUERY_SYSTEM_PROMPT.to_string(),
            user: format!(
                "Address: \"{address}\"\nPurpose: \"{}\"\n\nGenerate geocoding queries as a JSON array:",
                if purpose.trim().is_empty() {
                    "Fireworks event"
                } else {
                    purpose
                }
            ),
            max_tokens: 300,
        };

        let reply = match self.oracle.complete(&prompt).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(?err, kind = err.failure_kind().as_str(), "query generation failed; using fallback");
                return fallback_queries(address);
            }
        };

        match parse_query_list(&reply) {
            Some(queries) => {
                debug!(count = queries.len(), "oracle proposed queries");
                queries
            }
            None => {
                let err = AppError::Parse("oracle reply contained no queries".into());
                warn!(kind = err.failure_kind().as_str(), %err, "using fallback queries");
                fallback_queries(address)
            }
        }
    }
}

#[async_trait]
impl QuerySuggester for QueryGenerator {
    async fn suggest(&self, address: &str, purpose: &str) -> Vec<String> {
        self.generate_queries(address, purpose).await
    }
}

/// Deterministic candidates derived only from the raw address: the address itself, the
/// address without its `WA nnnn` suffix, and the part before the first dash.
pub fn fallback_queries(address: &str) -> Vec<String> {
    let trimmed = address.trim();
    let without_state = STATE_POSTCODE_RE.replace(trimmed, "").trim().to_string();
    let before_dash = trimmed
        .split(['–', '-'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();

    let queries = dedupe([trimmed.to_string(), without_state, before_dash]);
    if queries.is_empty() {
        // blank address still yields one entry
        return vec![trimmed.to_string()];
    }
    queries
}

/// Extracts query strings from untrusted oracle text. `None` when nothing usable was found.
pub fn parse_query_list(text: &str) -> Option<Vec<String>> {
    let text = text.trim();
    let parsed = parse_bracketed(text)
        .or_else(|| parse_object(text))
        .or_else(|| parse_lines(text))?;
    let queries = dedupe(parsed);
    (!queries.is_empty()).then_some(queries)
}

/// First balanced `[...]` in the reply, then the widest first-`[` to last-`]` slice.
fn parse_bracketed(text: &str) -> Option<Vec<String>> {
    let start = text.find('[')?;
    let first_array = balanced_array_end(text, start)
        .and_then(|end| string_array(&text[start..=end]));
    first_array.or_else(|| {
        let end = text.rfind(']')?;
        if end <= start {
            return None;
        }
        string_array(&text[start..=end])
    })
}

/// Byte index of the `]` closing the array opened at `start`; brackets inside JSON strings
/// do not count.
fn balanced_array_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0_usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn string_array(slice: &str) -> Option<Vec<String>> {
    let value: Value = serde_json::from_str(slice).ok()?;
    strings_in(&value)
}

fn parse_object(text: &str) -> Option<Vec<String>> {
    let value: Value = serde_json::from_str(text).ok()?;
    let object = value.as_object()?;
    if let Some(queries) = object.get("queries").and_then(strings_in) {
        return Some(queries);
    }
    object.values().find_map(strings_in)
}

fn parse_lines(text: &str) -> Option<Vec<String>> {
    let queries: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty()
                && !line.starts_with("```")
                && !line.starts_with('[')
                && !line.starts_with('{')
                && line.chars().any(|c| c.is_ascii_alphabetic())
        })
        .map(|line| {
            if let Some(caps) = DOUBLE_QUOTED_RE.captures(line) {
                return caps[1].to_string();
            }
            if let Some(caps) = SINGLE_QUOTED_RE.captures(line) {
                return caps[1].to_string();
            }
            BULLET_RE.replace(line, "").trim().to_string()
        })
        .collect();
    (!queries.is_empty()).then_some(queries)
}

fn strings_in(value: &Value) -> Option<Vec<String>> {
    let items = value.as_array()?;
    let strings: Vec<String> = items
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    (!strings.is_empty()).then_some(strings)
}

fn dedupe(queries: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    queries
        .into_iter()
        .map(|query| query.trim().to_string())
        .filter(|query| !query.is_empty() && query.chars().count() < MAX_QUERY_LEN)
        .filter(|query| seen.insert(query.clone()))
        .collect()
}
