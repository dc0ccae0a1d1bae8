pub mod cache;
pub mod config;
pub mod errors;
pub mod geocode;
pub mod ingestion;
pub mod kv;
pub mod landmarks;
pub mod model;
pub mod normalizer;
pub mod oracle;
pub mod queries;
pub mod queue;
pub mod resolver;
pub mod telemetry;
pub mod update;

use std::sync::Arc;

use once_cell::sync::OnceCell;
use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cache::ResultCache;
use crate::config::{AppConfig, PublicAppConfig};
use crate::errors::AppResult;
use crate::geocode::GeocodeClient;
use crate::kv::KvStore;
use crate::landmarks::LandmarkMatcher;
use crate::normalizer::TextKind;
use crate::oracle::{CompletionOracle, OracleTextFixer};
use crate::queries::QueryGenerator;
use crate::queue::RequestQueue;
use crate::resolver::ResolutionOrchestrator;
use crate::telemetry::TelemetryClient;
use crate::update::EventUpdater;

pub use crate::errors::{AppError, FailureKind};
pub use crate::model::{mappable_events, GeocodeResult, LatLng, RawEvent, RegionBounds, ResolvedEvent};
pub use crate::normalizer::{needs_fixing, normalize, normalize_purpose};

const GEOCODE_CACHE_NAMESPACE: &str = "geocode";

/// Everything the pipeline needs, wired from one `AppConfig`.
pub struct AppState {
    config: AppConfig,
    oracle: Arc<dyn CompletionOracle>,
    orchestrator: Arc<ResolutionOrchestrator>,
    store: Arc<dyn KvStore>,
    telemetry: TelemetryClient,
    landmark_patterns: usize,
}

#[derive(Debug, Serialize)]
pub struct PipelineHealth {
    pub config: PublicAppConfig,
    pub landmark_patterns: usize,
    pub telemetry_buffer_path: String,
    pub telemetry_queue_depth: usize,
}

impl AppState {
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        let http = Client::builder().timeout(config.request_timeout()).build()?;
        let oracle = oracle::oracle_from_config(http.clone(), &config);
        let landmarks = match &config.landmark_table_path {
            Some(path) => LandmarkMatcher::from_json_file(path)?,
            None => LandmarkMatcher::builtin(),
        };
        let landmark_patterns = landmarks.len();
        let orchestrator = ResolutionOrchestrator::new(
            Arc::new(QueryGenerator::new(oracle.clone())),
            Arc::new(GeocodeClient::new(http.clone(), &config)),
            landmarks,
            config.geocode_delay(),
        );
        let store = kv::store_from_config(http, &config)?;
        let telemetry = TelemetryClient::new(&config.data_dir, &config)?;

        info!(
            landmark_patterns,
            has_openai_key = config.openai_api_key.is_some(),
            "pipeline initialized"
        );
        Ok(Self {
            config,
            oracle,
            orchestrator: Arc::new(orchestrator),
            store,
            telemetry,
            landmark_patterns,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> Arc<ResolutionOrchestrator> {
        Arc::clone(&self.orchestrator)
    }

    pub fn store(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.store)
    }

    /// Spawns a text-fix queue; must be called inside a tokio runtime.
    pub fn text_queue(&self, kind: TextKind) -> RequestQueue {
        RequestQueue::spawn(
            Arc::new(OracleTextFixer::new(self.oracle.clone(), kind)),
            kind,
            self.config.text_fix_queue_capacity,
            self.config.text_fix_delay(),
        )
    }

    /// Batch updater with the persistent geocode cache, and AI text fixing when enabled.
    pub fn updater(&self) -> EventUpdater {
        let updater = EventUpdater::new(
            self.orchestrator(),
            ResultCache::persistent(self.store(), GEOCODE_CACHE_NAMESPACE),
            self.config.event_delay(),
            self.config.fallback_center,
            self.config.bounds,
        )
        .with_telemetry(self.telemetry.clone());

        if !self.config.text_fix_enabled {
            return updater;
        }
        if self.config.openai_api_key.is_none() {
            warn!("TEXT_FIX_ENABLED is set without OPENAI_API_KEY; using deterministic repair");
            return updater;
        }
        updater.with_text_fixers(
            Arc::new(self.text_queue(TextKind::Address)),
            Arc::new(self.text_queue(TextKind::Purpose)),
        )
    }

    pub fn health(&self) -> PipelineHealth {
        PipelineHealth {
            config: self.config.public_profile(),
            landmark_patterns: self.landmark_patterns,
            telemetry_buffer_path: self.telemetry.buffer_path().to_string_lossy().to_string(),
            telemetry_queue_depth: self.telemetry.queue_depth(),
        }
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,fireworks_geocoder=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
