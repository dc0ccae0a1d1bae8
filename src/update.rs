//! Batch update job: resolve every scraped event, strictly one after another, then publish the
//! result list to the key-value store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::cache::ResultCache;
use crate::errors::{AppResult, FailureKind};
use crate::kv::KvStore;
use crate::model::{LatLng, RawEvent, RegionBounds, ResolvedEvent};
use crate::normalizer::TextKind;
use crate::oracle::TextFixer;
use crate::resolver::{Resolution, ResolutionOrchestrator};
use crate::telemetry::{PipelineEvent, TelemetryClient};

pub const EVENTS_KEY: &str = "fireworks-events";
pub const LAST_UPDATED_KEY: &str = "fireworks-last-updated";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReport {
    pub events: Vec<ResolvedEvent>,
    pub resolved: usize,
    pub unresolved: usize,
    pub cache_hits: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UpdateProgress {
    pub total: usize,
    pub processed: usize,
    pub resolved: usize,
}

pub type ProgressObserver = Arc<dyn Fn(UpdateProgress) + Send + Sync>;

/// What a downstream consumer reads back from the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsSnapshot {
    pub events: Vec<ResolvedEvent>,
    pub last_updated: Option<String>,
}

pub struct EventUpdater {
    orchestrator: Arc<ResolutionOrchestrator>,
    cache: ResultCache,
    address_fixer: Option<Arc<dyn TextFixer>>,
    purpose_fixer: Option<Arc<dyn TextFixer>>,
    telemetry: Option<TelemetryClient>,
    event_delay: Duration,
    fallback: LatLng,
    bounds: RegionBounds,
}

impl EventUpdater {
    pub fn new(
        orchestrator: Arc<ResolutionOrchestrator>,
        cache: ResultCache,
        event_delay: Duration,
        fallback: LatLng,
        bounds: RegionBounds,
    ) -> Self {
        Self {
            orchestrator,
            cache,
            address_fixer: None,
            purpose_fixer: None,
            telemetry: None,
            event_delay,
            fallback,
            bounds,
        }
    }

    pub fn with_text_fixers(
        mut self,
        address: Arc<dyn TextFixer>,
        purpose: Arc<dyn TextFixer>,
    ) -> Self {
        self.address_fixer = Some(address);
        self.purpose_fixer = Some(purpose);
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryClient) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Resolves every event in order. One event failing never stops the batch: it is emitted
    /// unresolved at the fallback center.
    pub async fn run(
        &self,
        events: &[RawEvent],
        observer: Option<ProgressObserver>,
    ) -> UpdateReport {
        let total = events.len();
        let mut resolved_events = Vec::with_capacity(total);
        let mut resolved = 0;
        let mut cache_hits = 0;

        for (index, raw) in events.iter().enumerate() {
            let location = self.clean(&self.address_fixer, TextKind::Address, &raw.location).await;
            let purpose = self.clean(&self.purpose_fixer, TextKind::Purpose, &raw.purpose).await;

            let (resolution, cached) = match self.cached_resolution(&raw.location).await {
                Some(hit) => {
                    cache_hits += 1;
                    (Some(hit), true)
                }
                None => {
                    let attempt = self.orchestrator.attempt(&raw.location, &raw.purpose).await;
                    if let Some(resolution) = &attempt {
                        self.cache.insert(&raw.location, resolution).await;
                    }
                    (attempt, false)
                }
            };

            let event = match resolution {
                Some(resolution) => {
                    resolved += 1;
                    self.emit(PipelineEvent::EventResolved {
                        event_id: raw.event_id(),
                        stage: resolution.stage,
                        query: resolution.query.clone(),
                        attempts: resolution.attempts,
                        cached,
                    });
                    ResolvedEvent::resolved(
                        raw,
                        location,
                        purpose,
                        &resolution.result,
                        Some(resolution.query),
                    )
                }
                None => {
                    warn!(location = %raw.location, "event left unresolved");
                    self.emit(PipelineEvent::EventUnresolved {
                        event_id: raw.event_id(),
                        location: raw.location.clone(),
                        failure: FailureKind::Exhausted,
                    });
                    ResolvedEvent::unresolved(raw, location, purpose, self.fallback)
                }
            };
            resolved_events.push(event);

            if let Some(callback) = &observer {
                callback(UpdateProgress {
                    total,
                    processed: index + 1,
                    resolved,
                });
            }

            if !cached && index + 1 < total {
                sleep(self.event_delay).await;
            }
        }

        let report = UpdateReport {
            resolved,
            unresolved: total - resolved,
            cache_hits,
            events: resolved_events,
            timestamp: Utc::now(),
        };
        self.emit(PipelineEvent::UpdateComplete {
            events: total,
            resolved: report.resolved,
            unresolved: report.unresolved,
            cache_hits,
        });
        if let Some(telemetry) = &self.telemetry {
            if let Err(err) = telemetry.flush() {
                warn!(?err, "unable to flush telemetry");
            }
        }
        info!(
            total,
            resolved = report.resolved,
            unresolved = report.unresolved,
            cache_hits,
            "update complete"
        );
        report
    }

    /// Cache entries outlive config changes, so a hit is re-validated against the current
    /// bounds and treated as a miss when it falls outside.
    async fn cached_resolution(&self, location: &str) -> Option<Resolution> {
        let hit = self.cache.get::<Resolution>(location).await?;
        if self.bounds.contains(hit.result.lat, hit.result.lng) {
            return Some(hit);
        }
        warn!(
            location,
            lat = hit.result.lat,
            lng = hit.result.lng,
            "cached resolution outside region; resolving again"
        );
        None
    }

    async fn clean(
        &self,
        fixer: &Option<Arc<dyn TextFixer>>,
        kind: TextKind,
        raw: &str,
    ) -> String {
        let Some(fixer) = fixer else {
            return kind.normalize(raw);
        };
        match fixer.fix(raw).await {
            Ok(fixed) => fixed,
            Err(err) => {
                warn!(?err, kind = kind.as_str(), "text fix failed; using normalized text");
                kind.normalize(raw)
            }
        }
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_quietly(event);
        }
    }
}

/// Stores the event list and the update timestamp. Failures are logged; resolution already
/// happened, so the caller keeps going either way.
pub async fn publish_report(store: &dyn KvStore, report: &UpdateReport) -> bool {
    match try_publish(store, report).await {
        Ok(()) => {
            info!(events = report.events.len(), "published events snapshot");
            true
        }
        Err(err) => {
            warn!(?err, "unable to publish events snapshot");
            false
        }
    }
}

async fn try_publish(store: &dyn KvStore, report: &UpdateReport) -> AppResult<()> {
    let encoded = serde_json::to_string(&report.events)?;
    store.set(EVENTS_KEY, &encoded).await?;
    store
        .set(LAST_UPDATED_KEY, &report.timestamp.to_rfc3339())
        .await?;
    Ok(())
}

/// Missing or corrupt data reads as an empty snapshot.
pub async fn load_snapshot(store: &dyn KvStore) -> EventsSnapshot {
    let events = match store.get(EVENTS_KEY).await {
        Ok(Some(encoded)) => serde_json::from_str(&encoded).unwrap_or_else(|err| {
            warn!(?err, "stored events are not decodable");
            Vec::new()
        }),
        Ok(None) => Vec::new(),
        Err(err) => {
            warn!(?err, "unable to read stored events");
            Vec::new()
        }
    };
    let last_updated = match store.get(LAST_UPDATED_KEY).await {
        Ok(value) => value,
        Err(err) => {
            warn!(?err, "unable to read last update timestamp");
            None
        }
    };
    EventsSnapshot {
        events,
        last_updated,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    use super::*;
    use crate::errors::AppError;
    use crate::geocode::Geocoder;
    use crate::kv::MemoryKvStore;
    use crate::landmarks::LandmarkMatcher;
    use crate::model::{GeocodeResult, RegionBounds};
    use crate::queries::QuerySuggester;
    use crate::resolver::Stage;

    struct EchoSuggester;

    #[async_trait]
    impl QuerySuggester for EchoSuggester {
        async fn suggest(&self, address: &str, _purpose: &str) -> Vec<String> {
            vec![address.to_string()]
        }
    }

    #[derive(Default)]
    struct KnownPlaces {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Geocoder for KnownPlaces {
        async fn try_geocode(&self, query: &str) -> Option<GeocodeResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (query == "WACA Ground Perth").then(|| GeocodeResult {
                lat: -31.9596,
                lng: 115.8796,
                confidence: 0.6,
                display_name: "WACA Ground, East Perth".into(),
            })
        }
    }

    struct FailingStore;

    #[async_trait]
    impl KvStore for FailingStore {
        async fn get(&self, _key: &str) -> AppResult<Option<String>> {
            Err(AppError::Status {
                service: "kv store",
                status: 503,
            })
        }

        async fn set(&self, _key: &str, _value: &str) -> AppResult<()> {
            Err(AppError::Status {
                service: "kv store",
                status: 503,
            })
        }
    }

    struct UppercaseFixer;

    #[async_trait]
    impl TextFixer for UppercaseFixer {
        async fn fix(&self, text: &str) -> AppResult<String> {
            if text.contains("BROKEN") {
                return Err(AppError::Parse("no fix".into()));
            }
            Ok(text.to_lowercase())
        }
    }

    fn raw(location: &str) -> RawEvent {
        RawEvent {
            date: "2025-12-11".into(),
            time: "9:00 PM".into(),
            duration: "10 minutes".into(),
            location: location.into(),
            purpose: "CITY OF PERTHFESTIVE LIGHTS".into(),
        }
    }

    fn updater(geocoder: Arc<KnownPlaces>, cache: ResultCache) -> EventUpdater {
        let orchestrator = ResolutionOrchestrator::new(
            Arc::new(EchoSuggester),
            geocoder,
            LandmarkMatcher::builtin(),
            Duration::from_millis(500),
        );
        EventUpdater::new(
            Arc::new(orchestrator),
            cache,
            Duration::from_millis(1_000),
            LatLng::PERTH_CBD,
            RegionBounds::PERTH_METRO,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_batch_without_aborting_on_failures() {
        let geocoder = Arc::new(KnownPlaces::default());
        let updater = updater(geocoder.clone(), ResultCache::in_memory("geocode"));
        let progress = Arc::new(Mutex::new(Vec::new()));
        let sink = progress.clone();
        let observer: ProgressObserver = Arc::new(move |update: UpdateProgress| {
            sink.lock().push((update.processed, update.resolved));
        });

        let report = updater
            .run(
                &[
                    raw("NOWHERE IN PARTICULAR"),
                    raw("WACA GROUNDNELSON CREAST PERTH WA 6004"),
                ],
                Some(observer),
            )
            .await;

        assert_eq!(report.resolved, 1);
        assert_eq!(report.unresolved, 1);
        assert_eq!(*progress.lock(), vec![(1, 0), (2, 1)]);

        let unresolved = &report.events[0];
        assert!(!unresolved.resolved);
        assert_eq!((unresolved.lat, unresolved.lng), (LatLng::PERTH_CBD.lat, LatLng::PERTH_CBD.lng));

        let waca = &report.events[1];
        assert!(waca.is_mappable(&RegionBounds::PERTH_METRO));
        assert_eq!(waca.location, "WACA GROUND NELSON CRESCENT PERTH WA 6004");
        assert_eq!(waca.purpose, "CITY OF PERTH FESTIVE LIGHTS");
        assert_eq!(waca.matched_query.as_deref(), Some("WACA Ground Perth"));
    }

    #[tokio::test(start_paused = true)]
    async fn cached_resolutions_skip_external_calls_and_delay() {
        let geocoder = Arc::new(KnownPlaces::default());
        let cache = ResultCache::in_memory("geocode");
        let events = [
            raw("WACA GROUNDNELSON CREAST PERTH WA 6004"),
            raw("WACA GROUNDNELSON CREAST PERTH WA 6004"),
        ];

        let first = updater(geocoder.clone(), cache.clone()).run(&events, None).await;
        assert_eq!(first.cache_hits, 1);
        let calls_after_first = geocoder.calls.load(Ordering::SeqCst);

        let started = Instant::now();
        let second = updater(geocoder.clone(), cache).run(&events, None).await;
        assert_eq!(second.cache_hits, 2);
        assert_eq!(second.resolved, 2);
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), calls_after_first);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_region_cache_entries_are_resolved_again() {
        let geocoder = Arc::new(KnownPlaces::default());
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let location = "WACA GROUNDNELSON CREAST PERTH WA 6004";
        let stale = Resolution {
            result: GeocodeResult {
                lat: -30.78,
                lng: 121.62,
                confidence: 0.4,
                display_name: "Kambalda".into(),
            },
            stage: Stage::Landmarks,
            query: "Kambalda Western Australia".into(),
            attempts: 1,
        };
        ResultCache::persistent(store.clone(), "geocode")
            .insert(location, &stale)
            .await;

        let cache = ResultCache::persistent(store, "geocode");
        let report = updater(geocoder.clone(), cache.clone())
            .run(&[raw(location)], None)
            .await;

        assert_eq!(report.cache_hits, 0);
        assert!(geocoder.calls.load(Ordering::SeqCst) > 0);
        let event = &report.events[0];
        assert!(event.resolved);
        assert!(event.is_mappable(&RegionBounds::PERTH_METRO));
        assert_eq!(event.matched_query.as_deref(), Some("WACA Ground Perth"));

        let refreshed = cache.get::<Resolution>(location).await.unwrap();
        assert_eq!(refreshed.query, "WACA Ground Perth");
    }

    #[tokio::test(start_paused = true)]
    async fn waits_between_events_that_called_out() {
        let geocoder = Arc::new(KnownPlaces::default());
        let updater = updater(geocoder, ResultCache::in_memory("geocode"));
        let started = Instant::now();
        updater.run(&[raw("FIRST PLACE"), raw("SECOND PLACE")], None).await;
        assert!(started.elapsed() >= Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn text_fix_failures_fall_back_to_normalized_text() {
        let geocoder = Arc::new(KnownPlaces::default());
        let updater = updater(geocoder, ResultCache::in_memory("geocode"))
            .with_text_fixers(Arc::new(UppercaseFixer), Arc::new(UppercaseFixer));
        let report = updater
            .run(&[raw("WACA GROUND"), raw("BROKEN GROUNDRIVERSIDE")], None)
            .await;
        assert_eq!(report.events[0].location, "waca ground");
        assert_eq!(report.events[0].purpose, "city of perthfestive lights");
        assert_eq!(report.events[1].location, "BROKEN GROUND RIVERSIDE");
    }

    #[tokio::test]
    async fn publishes_and_loads_snapshots() {
        let store = MemoryKvStore::new();
        assert_eq!(load_snapshot(&store).await, EventsSnapshot::default());

        let source = raw("WACA GROUND");
        let report = UpdateReport {
            events: vec![ResolvedEvent::unresolved(
                &source,
                "WACA GROUND".into(),
                "CRICKET".into(),
                LatLng::PERTH_CBD,
            )],
            resolved: 0,
            unresolved: 1,
            cache_hits: 0,
            timestamp: Utc::now(),
        };
        assert!(publish_report(&store, &report).await);

        let snapshot = load_snapshot(&store).await;
        assert_eq!(snapshot.events, report.events);
        assert_eq!(snapshot.last_updated, Some(report.timestamp.to_rfc3339()));

        store.set(EVENTS_KEY, "{not json").await.unwrap();
        assert!(load_snapshot(&store).await.events.is_empty());
    }

    #[tokio::test]
    async fn store_failures_are_not_fatal() {
        let report = UpdateReport {
            events: Vec::new(),
            resolved: 0,
            unresolved: 0,
            cache_hits: 0,
            timestamp: Utc::now(),
        };
        assert!(!publish_report(&FailingStore, &report).await);
        assert_eq!(load_snapshot(&FailingStore).await, EventsSnapshot::default());
    }
}
