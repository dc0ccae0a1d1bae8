use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const EVENT_ID_BYTES: usize = 12;

/// One schedule row as handed over by the scraper. Never mutated after ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub date: String,
    pub time: String,
    pub duration: String,
    pub location: String,
    pub purpose: String,
}

impl RawEvent {
    /// Stable id derived from date, location and time.
    pub fn event_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.date.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.location.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.time.as_bytes());
        let digest = hasher.finalize();
        URL_SAFE_NO_PAD.encode(&digest[..EVENT_ID_BYTES])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub const PERTH_CBD: LatLng = LatLng {
        lat: -31.9523,
        lng: 115.8613,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl RegionBounds {
    pub const PERTH_METRO: RegionBounds = RegionBounds {
        min_lat: -32.5,
        max_lat: -31.5,
        min_lng: 115.5,
        max_lng: 116.5,
    };

    /// Rejects NaN and zero on either axis as well as anything outside the box.
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        if lat.is_nan() || lng.is_nan() || lat == 0.0 || lng == 0.0 {
            return false;
        }
        lat >= self.min_lat && lat <= self.max_lat && lng >= self.min_lng && lng <= self.max_lng
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodeResult {
    pub lat: f64,
    pub lng: f64,
    pub confidence: f64,
    pub display_name: String,
}

/// Event ready for downstream consumers. Unresolved events carry the fallback center and
/// `resolved: false`, never `(0, 0)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedEvent {
    pub id: String,
    pub date: String,
    pub time: String,
    pub duration: String,
    pub location: String,
    pub purpose: String,
    pub lat: f64,
    pub lng: f64,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_query: Option<String>,
}

impl ResolvedEvent {
    pub fn resolved(
        raw: &RawEvent,
        location: String,
        purpose: String,
        result: &GeocodeResult,
        matched_query: Option<String>,
    ) -> Self {
        Self {
            id: raw.event_id(),
            date: raw.date.clone(),
            time: raw.time.clone(),
            duration: raw.duration.clone(),
            location,
            purpose,
            lat: result.lat,
            lng: result.lng,
            resolved: true,
            display_name: Some(result.display_name.clone()),
            confidence: Some(result.confidence),
            matched_query,
        }
    }

    pub fn unresolved(raw: &RawEvent, location: String, purpose: String, fallback: LatLng) -> Self {
        Self {
            id: raw.event_id(),
            date: raw.date.clone(),
            time: raw.time.clone(),
            duration: raw.duration.clone(),
            location,
            purpose,
            lat: fallback.lat,
            lng: fallback.lng,
            resolved: false,
            display_name: None,
            confidence: None,
            matched_query: None,
        }
    }

    pub fn is_mappable(&self, bounds: &RegionBounds) -> bool {
        self.resolved && bounds.contains(self.lat, self.lng)
    }
}

/// Events a map consumer should plot.
pub fn mappable_events<'a>(
    events: &'a [ResolvedEvent],
    bounds: &'a RegionBounds,
) -> impl Iterator<Item = &'a ResolvedEvent> + 'a {
    events.iter().filter(move |event| event.is_mappable(bounds))
}
