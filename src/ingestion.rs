use std::fs::{self, File};
use std::path::Path;

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};
use crate::model::RawEvent;

const UNKNOWN_DURATION: &str = "Unknown";
const DEFAULT_PURPOSE: &str = "Fireworks display";

static DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2})/(\d{1,2})/(\d{4})").expect("valid date regex"));
static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,2}:\d{2}\s*(?:AM|PM))").expect("valid time regex"));
static DURATION_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"(\d+)\s*(?:minute|minutes|min)")
        .case_insensitive(true)
        .build()
        .expect("valid duration regex")
});

/// The four text cells of one schedule table row, as extracted by the scraper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapedRow {
    /// e.g. `11/12/2025Thursday`
    pub date: String,
    /// time and duration in one cell, e.g. `9:00 PM10 minutes`
    pub schedule: String,
    pub location: String,
    #[serde(default)]
    pub purpose: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputFormat {
    Json,
    Csv,
}

impl InputFormat {
    fn from_path(path: &Path) -> AppResult<Self> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match extension.as_deref() {
            Some("json") => Ok(InputFormat::Json),
            Some("csv") => Ok(InputFormat::Csv),
            _ => Err(AppError::Config(format!(
                "unsupported input file {}; expected .json or .csv",
                path.display()
            ))),
        }
    }
}

/// Builds a `RawEvent` from one row. Rows without a parsable date, a time or a location are
/// skipped.
pub fn parse_row(row: &ScrapedRow) -> Option<RawEvent> {
    let date = parse_date(row.date.trim())?;
    let time = TIME_RE
        .captures(&row.schedule)
        .map(|caps| caps[1].to_string())?;
    let location = row.location.trim();
    if location.is_empty() {
        return None;
    }

    let duration = DURATION_RE
        .captures(&row.schedule)
        .map(|caps| format!("{} minutes", &caps[1]))
        .unwrap_or_else(|| UNKNOWN_DURATION.to_string());
    let purpose = match row.purpose.trim() {
        "" => DEFAULT_PURPOSE.to_string(),
        purpose => purpose.to_string(),
    };

    Some(RawEvent {
        date,
        time,
        duration,
        location: location.to_string(),
        purpose,
    })
}

pub fn parse_rows(rows: &[ScrapedRow]) -> Vec<RawEvent> {
    let events: Vec<RawEvent> = rows.iter().filter_map(parse_row).collect();
    if events.len() < rows.len() {
        debug!(
            skipped = rows.len() - events.len(),
            "dropped schedule rows missing date, time or location"
        );
    }
    events
}

/// Reads events from `.json` (array of already parsed events) or `.csv`
/// (`date,schedule,location,purpose` rows straight from the schedule table).
pub fn load_raw_events(path: &Path) -> AppResult<Vec<RawEvent>> {
    let events = match InputFormat::from_path(path)? {
        InputFormat::Json => {
            let contents = fs::read_to_string(path)?;
            serde_json::from_str::<Vec<RawEvent>>(&contents)?
        }
        InputFormat::Csv => {
            let mut reader = csv::ReaderBuilder::new()
                .trim(csv::Trim::All)
                .flexible(true)
                .from_reader(File::open(path)?);
            let rows = reader
                .deserialize::<ScrapedRow>()
                .collect::<Result<Vec<_>, _>>()?;
            parse_rows(&rows)
        }
    };
    info!(path = %path.display(), count = events.len(), "loaded raw events");
    Ok(events)
}

fn parse_date(cell: &str) -> Option<String> {
    let caps = DATE_RE.captures(cell)?;
    let day: u32 = caps[1].parse().ok()?;
    let month: u32 = caps[2].parse().ok()?;
    let year: i32 = caps[3].parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(date.format("%Y-%m-%d").to_string())
}
