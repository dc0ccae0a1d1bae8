use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, warn};

use crate::model::{LatLng, RegionBounds};

const DEFAULT_TELEMETRY_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_TELEMETRY_BUFFER_MAX_FILES: usize = 5;
const MIN_GEOCODE_DELAY_MS: u64 = 100;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub database_file_name: String,
    pub openai_api_key: Option<SecretString>,
    pub openai_api_base: String,
    pub openai_model: String,
    pub geocoder_endpoint: String,
    pub geocoder_user_agent: String,
    pub region_suffix: String,
    pub bounds: RegionBounds,
    pub fallback_center: LatLng,
    pub geocode_delay_ms: u64,
    pub event_delay_ms: u64,
    pub text_fix_delay_ms: u64,
    pub text_fix_queue_capacity: usize,
    pub text_fix_enabled: bool,
    pub request_timeout_secs: u64,
    pub kv_rest_api_url: Option<String>,
    pub kv_rest_api_token: Option<SecretString>,
    pub landmark_table_path: Option<PathBuf>,
    pub telemetry_enabled_by_default: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_buffer_max_bytes: u64,
    pub telemetry_buffer_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub data_dir: String,
    pub database_file_name: String,
    pub openai_api_base: String,
    pub openai_model: String,
    pub geocoder_endpoint: String,
    pub region_suffix: String,
    pub bounds: RegionBounds,
    pub fallback_center: LatLng,
    pub geocode_delay_ms: u64,
    pub event_delay_ms: u64,
    pub text_fix_delay_ms: u64,
    pub text_fix_enabled: bool,
    pub request_timeout_secs: u64,
    pub landmark_table_path: Option<String>,
    pub telemetry_enabled_by_default: bool,
    pub has_openai_key: bool,
    pub has_kv_rest_store: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            database_file_name: "fireworks-geocoder.db".to_string(),
            openai_api_key: None,
            openai_api_base: "https://api.openai.com/v1".to_string(),
            openai_model: "gpt-4o-mini".to_string(),
            geocoder_endpoint: "https://nominatim.openstreetmap.org/search".to_string(),
            geocoder_user_agent: "perth-fireworks-geocoder/0.1".to_string(),
            region_suffix: ", Perth, Western Australia, Australia".to_string(),
            bounds: RegionBounds::PERTH_METRO,
            fallback_center: LatLng::PERTH_CBD,
            geocode_delay_ms: 500,
            event_delay_ms: 1_000,
            text_fix_delay_ms: 200,
            text_fix_queue_capacity: 64,
            text_fix_enabled: false,
            request_timeout_secs: 10,
            kv_rest_api_url: None,
            kv_rest_api_token: None,
            landmark_table_path: None,
            telemetry_enabled_by_default: true,
            telemetry_batch_size: 25,
            telemetry_buffer_max_bytes: DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
            telemetry_buffer_max_files: DEFAULT_TELEMETRY_BUFFER_MAX_FILES,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        let config = Self {
            data_dir: env::var("DATA_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            database_file_name: parse_string("DATABASE_FILE_NAME", defaults.database_file_name),
            openai_api_key: parse_secret("OPENAI_API_KEY"),
            openai_api_base: parse_string("OPENAI_API_BASE", defaults.openai_api_base),
            openai_model: parse_string("OPENAI_MODEL", defaults.openai_model),
            geocoder_endpoint: parse_string("GEOCODER_ENDPOINT", defaults.geocoder_endpoint),
            geocoder_user_agent: parse_string("GEOCODER_USER_AGENT", defaults.geocoder_user_agent),
            region_suffix: env::var("GEOCODER_REGION_SUFFIX").unwrap_or(defaults.region_suffix),
            bounds: RegionBounds {
                min_lat: parse_f64("BOUNDS_MIN_LAT", defaults.bounds.min_lat),
                max_lat: parse_f64("BOUNDS_MAX_LAT", defaults.bounds.max_lat),
                min_lng: parse_f64("BOUNDS_MIN_LNG", defaults.bounds.min_lng),
                max_lng: parse_f64("BOUNDS_MAX_LNG", defaults.bounds.max_lng),
            },
            fallback_center: LatLng {
                lat: parse_f64("FALLBACK_LAT", defaults.fallback_center.lat),
                lng: parse_f64("FALLBACK_LNG", defaults.fallback_center.lng),
            },
            geocode_delay_ms: parse_u64("GEOCODE_DELAY_MS", defaults.geocode_delay_ms),
            event_delay_ms: parse_u64("EVENT_DELAY_MS", defaults.event_delay_ms),
            text_fix_delay_ms: parse_u64("TEXT_FIX_DELAY_MS", defaults.text_fix_delay_ms),
            text_fix_queue_capacity: parse_usize(
                "TEXT_FIX_QUEUE_CAPACITY",
                defaults.text_fix_queue_capacity,
            )
            .max(1),
            text_fix_enabled: parse_bool("TEXT_FIX_ENABLED", defaults.text_fix_enabled),
            request_timeout_secs: parse_u64("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs)
                .max(1),
            kv_rest_api_url: env::var("KV_REST_API_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            kv_rest_api_token: parse_secret("KV_REST_API_TOKEN"),
            landmark_table_path: env::var("LANDMARK_TABLE_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            telemetry_enabled_by_default: parse_bool(
                "TELEMETRY_ENABLED",
                defaults.telemetry_enabled_by_default,
            ),
            telemetry_batch_size: parse_usize("TELEMETRY_BATCH_SIZE", defaults.telemetry_batch_size)
                .max(1),
            telemetry_buffer_max_bytes: parse_u64(
                "TELEMETRY_BUFFER_MAX_BYTES",
                defaults.telemetry_buffer_max_bytes,
            ),
            telemetry_buffer_max_files: parse_usize(
                "TELEMETRY_BUFFER_MAX_FILES",
                defaults.telemetry_buffer_max_files,
            )
            .max(1),
        };
        config.sanitized()
    }

    /// Replaces settings that would break the region and pacing guarantees: an empty or
    /// inverted box, a fallback center outside it (or on a zero axis), and pacing below
    /// `MIN_GEOCODE_DELAY_MS`.
    fn sanitized(mut self) -> Self {
        let bounds = self.bounds;
        if !(bounds.min_lat < bounds.max_lat && bounds.min_lng < bounds.max_lng) {
            warn!(?bounds, "region bounds are empty or inverted; using defaults");
            self.bounds = RegionBounds::PERTH_METRO;
        }

        let center = self.fallback_center;
        if !self.bounds.contains(center.lat, center.lng) {
            let replacement = if self.bounds.contains(LatLng::PERTH_CBD.lat, LatLng::PERTH_CBD.lng) {
                LatLng::PERTH_CBD
            } else {
                LatLng {
                    lat: (self.bounds.min_lat + self.bounds.max_lat) / 2.0,
                    lng: (self.bounds.min_lng + self.bounds.max_lng) / 2.0,
                }
            };
            warn!(?center, ?replacement, "fallback center is outside the region");
            self.fallback_center = replacement;
        }

        if self.geocode_delay_ms < MIN_GEOCODE_DELAY_MS {
            warn!(
                requested = self.geocode_delay_ms,
                minimum = MIN_GEOCODE_DELAY_MS,
                "geocode delay raised to the minimum"
            );
            self.geocode_delay_ms = MIN_GEOCODE_DELAY_MS;
        }
        self
    }

    pub fn geocode_delay(&self) -> Duration {
        Duration::from_millis(self.geocode_delay_ms)
    }

    pub fn event_delay(&self) -> Duration {
        Duration::from_millis(self.event_delay_ms)
    }

    pub fn text_fix_delay(&self) -> Duration {
        Duration::from_millis(self.text_fix_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file_name)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            data_dir: self.data_dir.to_string_lossy().to_string(),
            database_file_name: self.database_file_name.clone(),
            openai_api_base: self.openai_api_base.clone(),
            openai_model: self.openai_model.clone(),
            geocoder_endpoint: self.geocoder_endpoint.clone(),
            region_suffix: self.region_suffix.clone(),
            bounds: self.bounds,
            fallback_center: self.fallback_center,
            geocode_delay_ms: self.geocode_delay_ms,
            event_delay_ms: self.event_delay_ms,
            text_fix_delay_ms: self.text_fix_delay_ms,
            text_fix_enabled: self.text_fix_enabled,
            request_timeout_secs: self.request_timeout_secs,
            landmark_table_path: self
                .landmark_table_path
                .as_ref()
                .map(|path| path.to_string_lossy().to_string()),
            telemetry_enabled_by_default: self.telemetry_enabled_by_default,
            has_openai_key: self.openai_api_key.is_some(),
            has_kv_rest_store: self.kv_rest_api_url.is_some() && self.kv_rest_api_token.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_secret(key: &str) -> Option<SecretString> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

fn parse_string(key: &str, default: String) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(default)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}
