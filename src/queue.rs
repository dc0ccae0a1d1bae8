//! Single-consumer text-fix queue.
//!
//! Producers send a request plus a oneshot reply handle over a bounded channel; one worker
//! task owns the receiving end, so at most one oracle call is in flight and requests are served
//! in FIFO order with a pause between dequeues.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::cache::ResultCache;
use crate::errors::{AppError, AppResult};
use crate::normalizer::TextKind;
use crate::oracle::TextFixer;

struct FixRequest {
    raw: String,
    reply: oneshot::Sender<AppResult<String>>,
}

#[derive(Clone)]
pub struct RequestQueue {
    kind: TextKind,
    cache: ResultCache,
    sender: mpsc::Sender<FixRequest>,
}

impl RequestQueue {
    /// Spawns the worker on the current tokio runtime with a process-lifetime cache.
    pub fn spawn(
        fixer: Arc<dyn TextFixer>,
        kind: TextKind,
        capacity: usize,
        delay: Duration,
    ) -> Self {
        Self::with_cache(fixer, kind, ResultCache::in_memory(kind.as_str()), capacity, delay)
    }

    pub fn with_cache(
        fixer: Arc<dyn TextFixer>,
        kind: TextKind,
        cache: ResultCache,
        capacity: usize,
        delay: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        tokio::spawn(drain(receiver, fixer, cache.clone(), kind, delay));
        Self {
            kind,
            cache,
            sender,
        }
    }

    pub fn kind(&self) -> TextKind {
        self.kind
    }

    /// Resolves to the fixed text. Clean text is normalized locally and never queued; cached
    /// text returns without waiting on the worker.
    pub async fn enqueue(&self, raw: &str) -> AppResult<String> {
        if !self.kind.needs_fixing(raw) {
            return Ok(self.kind.normalize(raw));
        }
        if let Some(fixed) = self.cache.get::<String>(raw).await {
            debug!(kind = self.kind.as_str(), "text fix cache hit");
            return Ok(fixed);
        }

        let (reply, response) = oneshot::channel();
        self.sender
            .send(FixRequest {
                raw: raw.to_string(),
                reply,
            })
            .await
            .map_err(|_| AppError::QueueClosed)?;
        response.await.map_err(|_| AppError::QueueClosed)?
    }
}

#[async_trait]
impl TextFixer for RequestQueue {
    async fn fix(&self, text: &str) -> AppResult<String> {
        self.enqueue(text).await
    }
}

async fn drain(
    mut receiver: mpsc::Receiver<FixRequest>,
    fixer: Arc<dyn TextFixer>,
    cache: ResultCache,
    kind: TextKind,
    delay: Duration,
) {
    while let Some(request) = receiver.recv().await {
        // duplicates queued before the first answer landed
        if let Some(fixed) = cache.get::<String>(&request.raw).await {
            let _ = request.reply.send(Ok(fixed));
            continue;
        }

        let result = fixer.fix(&request.raw).await;
        match &result {
            Ok(fixed) => cache.insert(&request.raw, fixed).await,
            Err(err) => warn!(?err, kind = kind.as_str(), "text fix failed"),
        }
        if request.reply.send(result).is_err() {
            debug!(kind = kind.as_str(), "text fix caller went away");
        }
        sleep(delay).await;
    }
    debug!(kind = kind.as_str(), "text fix queue drained");
}
