use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::errors::FailureKind;
use crate::geocode::Geocoder;
use crate::landmarks::LandmarkMatcher;
use crate::model::GeocodeResult;
use crate::normalizer;
use crate::queries::QuerySuggester;

/// Enforces a minimum gap between the end of one geocode call and the start of the next,
/// including failed and timed-out calls. Calls through one pacer never overlap.
pub struct Pacer {
    interval: Duration,
    last_finished: AsyncMutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_finished: AsyncMutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn run<F: Future>(&self, call: F) -> F::Output {
        let mut last_finished = self.last_finished.lock().await;
        if let Some(prev) = *last_finished {
            let elapsed = prev.elapsed();
            if elapsed < self.interval {
                sleep(self.interval - elapsed).await;
            }
        }
        let output = call.await;
        *last_finished = Some(Instant::now());
        output
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    AiQueries,
    Landmarks,
    Failed,
}

impl Stage {
    pub fn next(self) -> Stage {
        match self {
            Stage::AiQueries => Stage::Landmarks,
            Stage::Landmarks | Stage::Failed => Stage::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::AiQueries => "ai_queries",
            Stage::Landmarks => "landmarks",
            Stage::Failed => "failed",
        }
    }
}

/// Successful outcome of one resolution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub result: GeocodeResult,
    pub stage: Stage,
    pub query: String,
    pub attempts: usize,
}

pub struct ResolutionOrchestrator {
    suggester: Arc<dyn QuerySuggester>,
    geocoder: Arc<dyn Geocoder>,
    landmarks: LandmarkMatcher,
    pacer: Pacer,
}

impl ResolutionOrchestrator {
    pub fn new(
        suggester: Arc<dyn QuerySuggester>,
        geocoder: Arc<dyn Geocoder>,
        landmarks: LandmarkMatcher,
        geocode_delay: Duration,
    ) -> Self {
        Self {
            suggester,
            geocoder,
            landmarks,
            pacer: Pacer::new(geocode_delay),
        }
    }

    pub async fn resolve(&self, raw_address: &str, purpose: &str) -> Option<GeocodeResult> {
        self.attempt(raw_address, purpose)
            .await
            .map(|resolution| resolution.result)
    }

    /// Walks AI queries, then landmarks, stopping at the first validated result. `None` is
    /// the exhausted outcome.
    pub async fn attempt(&self, raw_address: &str, purpose: &str) -> Option<Resolution> {
        let mut tried: HashSet<String> = HashSet::new();
        let mut attempts = 0;
        let mut stage = Stage::AiQueries;

        while stage != Stage::Failed {
            let candidates = self.candidates(stage, raw_address, purpose).await;
            debug!(stage = stage.as_str(), count = candidates.len(), "trying candidates");

            for query in candidates {
                let query = query.trim();
                if query.is_empty() || !tried.insert(query.to_string()) {
                    continue;
                }
                attempts += 1;
                debug!(stage = stage.as_str(), query, attempt = attempts, "geocode attempt");
                if let Some(result) = self.pacer.run(self.geocoder.try_geocode(query)).await {
                    info!(
                        stage = stage.as_str(),
                        query,
                        lat = result.lat,
                        lng = result.lng,
                        "resolved address"
                    );
                    return Some(Resolution {
                        result,
                        stage,
                        query: query.to_string(),
                        attempts,
                    });
                }
            }
            stage = stage.next();
        }

        info!(
            address = raw_address,
            attempts,
            kind = FailureKind::Exhausted.as_str(),
            "could not resolve address"
        );
        None
    }

    async fn candidates(&self, stage: Stage, raw_address: &str, purpose: &str) -> Vec<String> {
        match stage {
            Stage::AiQueries => {
                let mut queries = self.suggester.suggest(raw_address, purpose).await;
                queries.push(normalizer::normalize(raw_address));
                queries
            }
            Stage::Landmarks => self.landmarks.match_landmarks(raw_address),
            Stage::Failed => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;

    struct FixedSuggester(Vec<&'static str>);

    #[async_trait]
    impl QuerySuggester for FixedSuggester {
        async fn suggest(&self, _address: &str, _purpose: &str) -> Vec<String> {
            self.0.iter().map(|q| q.to_string()).collect()
        }
    }

    #[derive(Default)]
    struct RecordingGeocoder {
        succeeds_for: Vec<&'static str>,
        latency: Duration,
        // query, started, finished
        calls: Mutex<Vec<(String, Instant, Instant)>>,
    }

    impl RecordingGeocoder {
        fn succeeding_for(queries: &[&'static str]) -> Self {
            Self {
                succeeds_for: queries.to_vec(),
                ..Self::default()
            }
        }

        fn queries(&self) -> Vec<String> {
            self.calls.lock().iter().map(|(q, _, _)| q.clone()).collect()
        }
    }

    #[async_trait]
    impl Geocoder for RecordingGeocoder {
        async fn try_geocode(&self, query: &str) -> Option<GeocodeResult> {
            let started = Instant::now();
            if !self.latency.is_zero() {
                sleep(self.latency).await;
            }
            self.calls
                .lock()
                .push((query.to_string(), started, Instant::now()));
            self.succeeds_for.iter().any(|q| *q == query).then(|| GeocodeResult {
                lat: -31.95,
                lng: 115.86,
                confidence: 0.5,
                display_name: query.to_string(),
            })
        }
    }

    fn orchestrator(
        suggestions: Vec<&'static str>,
        geocoder: Arc<RecordingGeocoder>,
    ) -> ResolutionOrchestrator {
        ResolutionOrchestrator::new(
            Arc::new(FixedSuggester(suggestions)),
            geocoder,
            LandmarkMatcher::builtin(),
            Duration::from_millis(500),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_first_successful_query() {
        let geocoder = Arc::new(RecordingGeocoder::succeeding_for(&["q2"]));
        let resolver = orchestrator(vec!["q1", "q2", "q3"], geocoder.clone());

        let resolution = resolver.attempt("SOMEWHERE", "").await.unwrap();
        assert_eq!(geocoder.queries(), vec!["q1", "q2"]);
        assert_eq!(resolution.stage, Stage::AiQueries);
        assert_eq!(resolution.query, "q2");
        assert_eq!(resolution.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_landmarks() {
        let geocoder = Arc::new(RecordingGeocoder::succeeding_for(&["WACA Ground Perth"]));
        let resolver = orchestrator(vec!["bad one", "  ", "bad two"], geocoder.clone());
        let address = "WACA GROUNDNELSON CREAST PERTH WA 6004";

        let resolution = resolver.attempt(address, "").await.unwrap();
        assert_eq!(resolution.stage, Stage::Landmarks);
        assert_eq!(resolution.result.display_name, "WACA Ground Perth");
        assert_eq!(
            geocoder.queries(),
            vec![
                "bad one",
                "bad two",
                "WACA GROUND NELSON CRESCENT PERTH WA 6004",
                "WACA Ground Perth",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempt_returns_none() {
        let geocoder = Arc::new(RecordingGeocoder::default());
        let resolver = orchestrator(
            vec!["CAPRICORN BEACHRIVERSIDE ESPYANCHEP WA 6035"],
            geocoder.clone(),
        );

        let result = resolver
            .resolve("CAPRICORN BEACHRIVERSIDE ESPYANCHEP WA 6035", "")
            .await;
        assert!(result.is_none());
        // suggestion, normalized address, then the YANCHEP landmark
        assert_eq!(
            geocoder.queries(),
            vec![
                "CAPRICORN BEACHRIVERSIDE ESPYANCHEP WA 6035",
                "CAPRICORN BEACH RIVERSIDE ESP YANCHEP WA 6035",
                "Yanchep Perth",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn paces_every_geocode_call() {
        let geocoder = Arc::new(RecordingGeocoder::default());
        let resolver = orchestrator(vec!["a", "b", "c"], geocoder.clone());

        assert!(resolver.resolve("NO LANDMARK HERE", "").await.is_none());
        let calls = geocoder.calls.lock().clone();
        assert_eq!(calls.len(), 4);
        for pair in calls.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= Duration::from_millis(500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_failed_calls_still_wait_full_delay() {
        let geocoder = Arc::new(RecordingGeocoder {
            latency: Duration::from_millis(600),
            ..RecordingGeocoder::default()
        });
        let resolver = orchestrator(vec!["a", "b"], geocoder.clone());

        assert!(resolver.resolve("NO LANDMARK HERE", "").await.is_none());
        let calls = geocoder.calls.lock().clone();
        assert_eq!(calls.len(), 3);
        for pair in calls.windows(2) {
            let (_, _, previous_finished) = &pair[0];
            let (_, next_started, _) = &pair[1];
            assert!(*next_started - *previous_finished >= Duration::from_millis(500));
        }
    }

    #[test]
    fn stages_advance_to_failed() {
        assert_eq!(Stage::AiQueries.next(), Stage::Landmarks);
        assert_eq!(Stage::Landmarks.next(), Stage::Failed);
        assert_eq!(Stage::Failed.next(), Stage::Failed);
    }
}
