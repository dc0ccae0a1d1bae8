use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::config::AppConfig;
use crate::errors::{AppResult, FailureKind};
use crate::resolver::Stage;

const BUFFER_FILE: &str = "telemetry-buffer.jsonl";

/// Pipeline outcomes written to the local JSONL buffer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum PipelineEvent {
    EventResolved {
        event_id: String,
        stage: Stage,
        query: String,
        attempts: usize,
        cached: bool,
    },
    EventUnresolved {
        event_id: String,
        location: String,
        failure: FailureKind,
    },
    UpdateComplete {
        events: usize,
        resolved: usize,
        unresolved: usize,
        cache_hits: usize,
    },
}

#[derive(Debug, Serialize)]
struct BufferedEvent {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: PipelineEvent,
}

#[derive(Clone)]
pub struct TelemetryClient {
    enabled: Arc<AtomicBool>,
    pending: Arc<Mutex<Vec<BufferedEvent>>>,
    rotation_seq: Arc<AtomicU64>,
    buffer_path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
    max_file_count: usize,
}

impl TelemetryClient {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &AppConfig) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let buffer_path = data_dir.join(BUFFER_FILE);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&buffer_path)?;

        Ok(Self {
            enabled: Arc::new(AtomicBool::new(config.telemetry_enabled_by_default)),
            pending: Arc::new(Mutex::new(Vec::new())),
            rotation_seq: Arc::new(AtomicU64::new(0)),
            buffer_path,
            batch_size: config.telemetry_batch_size.max(1),
            max_file_bytes: config.telemetry_buffer_max_bytes,
            max_file_count: config.telemetry_buffer_max_files.max(1),
        })
    }

    pub fn record(&self, event: PipelineEvent) -> AppResult<()> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }

        let mut pending = self.pending.lock();
        pending.push(BufferedEvent {
            timestamp: Utc::now(),
            event,
        });
        if pending.len() >= self.batch_size {
            self.persist_locked(&mut pending)?;
        }
        Ok(())
    }

    /// Telemetry never fails the pipeline; errors are logged and the batch stays queued.
    pub fn record_quietly(&self, event: PipelineEvent) {
        if let Err(err) = self.record(event) {
            warn!(?err, "unable to write telemetry batch");
        }
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut pending = self.pending.lock();
        self.persist_locked(&mut pending)
    }

    pub fn queue_depth(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn buffer_path(&self) -> &Path {
        &self.buffer_path
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn persist_locked(&self, pending: &mut Vec<BufferedEvent>) -> AppResult<()> {
        if pending.is_empty() {
            return Ok(());
        }

        let mut lines = Vec::with_capacity(pending.len());
        let mut incoming = 0_u64;
        for event in pending.iter() {
            let line = serde_json::to_vec(event)?;
            incoming += line.len() as u64 + 1;
            lines.push(line);
        }

        self.rotate_if_needed(incoming)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.buffer_path)?;
        for line in &lines {
            file.write_all(line)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        pending.clear();
        Ok(())
    }

    fn rotate_if_needed(&self, incoming: u64) -> AppResult<()> {
        let current = fs::metadata(&self.buffer_path)
            .map(|meta| meta.len())
            .unwrap_or(0);
        if current == 0 || current + incoming <= self.max_file_bytes {
            return Ok(());
        }

        if self.max_file_count > 1 {
            let seq = self.rotation_seq.fetch_add(1, Ordering::SeqCst);
            let rotated = self.buffer_dir().join(format!(
                "{}{}-{seq:04}.jsonl",
                self.rotation_prefix(),
                Utc::now().format("%Y%m%d%H%M%S%3f")
            ));
            fs::rename(&self.buffer_path, rotated)?;
            self.prune_rotations()?;
        }

        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.buffer_path)?;
        Ok(())
    }

    /// Keeps at most `max_file_count - 1` rotated files next to the live buffer.
    fn prune_rotations(&self) -> AppResult<()> {
        let prefix = self.rotation_prefix();
        let mut rotated: Vec<PathBuf> = fs::read_dir(self.buffer_dir())?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy())
                    .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".jsonl"))
            })
            .collect();

        // names embed a sortable timestamp and sequence
        rotated.sort();
        let keep = self.max_file_count - 1;
        if rotated.len() > keep {
            let excess = rotated.len() - keep;
            for path in rotated.into_iter().take(excess) {
                if let Err(err) = fs::remove_file(&path) {
                    warn!(?err, path = %path.display(), "unable to prune telemetry rotation");
                }
            }
        }
        Ok(())
    }

    fn buffer_dir(&self) -> &Path {
        self.buffer_path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn rotation_prefix(&self) -> String {
        let stem = self
            .buffer_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "telemetry-buffer".into());
        format!("{stem}-")
    }
}
