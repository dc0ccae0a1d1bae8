use async_trait::async_trait;
use reqwest::header::USER_AGENT;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::model::{GeocodeResult, RegionBounds};

const GEOCODER_SERVICE: &str = "geocoder";
const DEFAULT_CONFIDENCE: f64 = 0.5;

/// One lookup per query. `None` covers every failure; a `Some` is always in-region.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn try_geocode(&self, query: &str) -> Option<GeocodeResult>;
}

#[derive(Clone)]
pub struct GeocodeClient {
    http: Client,
    endpoint: String,
    user_agent: String,
    region_suffix: String,
    bounds: RegionBounds,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    lat: Option<Value>,
    lon: Option<Value>,
    importance: Option<Value>,
    display_name: Option<String>,
}

impl GeocodeClient {
    pub fn new(http: Client, config: &AppConfig) -> Self {
        Self {
            http,
            endpoint: config.geocoder_endpoint.clone(),
            user_agent: config.geocoder_user_agent.clone(),
            region_suffix: config.region_suffix.clone(),
            bounds: config.bounds,
        }
    }

    pub fn bounds(&self) -> &RegionBounds {
        &self.bounds
    }

    async fn fetch(&self, query: &str) -> AppResult<GeocodeResult> {
        let search = format!("{}{}", query.trim(), self.region_suffix);
        let response = self
            .http
            .get(&self.endpoint)
            .header(USER_AGENT, &self.user_agent)
            .query(&[
                ("q", search.as_str()),
                ("format", "json"),
                ("limit", "1"),
                ("addressdetails", "1"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Status {
                service: GEOCODER_SERVICE,
                status: status.as_u16(),
            });
        }

        let hits: Vec<SearchHit> = response.json().await?;
        let hit = hits
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Parse(format!("no geocoder results for {query:?}")))?;

        let lat = coerce_f64(hit.lat.as_ref())
            .ok_or_else(|| AppError::Parse("geocoder result has no numeric lat".into()))?;
        let lng = coerce_f64(hit.lon.as_ref())
            .ok_or_else(|| AppError::Parse("geocoder result has no numeric lon".into()))?;
        if !self.bounds.contains(lat, lng) {
            return Err(AppError::Validation(format!(
                "({lat}, {lng}) is outside the configured region"
            )));
        }

        let confidence = coerce_f64(hit.importance.as_ref())
            .filter(|value| value.is_finite())
            .unwrap_or(DEFAULT_CONFIDENCE);
        Ok(GeocodeResult {
            lat,
            lng,
            confidence,
            display_name: hit.display_name.unwrap_or_else(|| query.to_string()),
        })
    }
}

#[async_trait]
impl Geocoder for GeocodeClient {
    async fn try_geocode(&self, query: &str) -> Option<GeocodeResult> {
        match self.fetch(query).await {
            Ok(result) => Some(result),
            Err(err) => {
                debug!(query, kind = err.failure_kind().as_str(), %err, "geocode attempt rejected");
                None
            }
        }
    }
}

/// The search service sends coordinates as strings; accept numbers too.
fn coerce_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}
