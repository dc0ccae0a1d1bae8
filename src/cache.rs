use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::kv::KvStore;

/// Raw input -> resolved output memo. Entries are never invalidated.
///
/// The memory layer lives for the process; with a backing store every insert is written
/// through and misses fall back to the store, so resolutions survive across runs.
#[derive(Clone)]
pub struct ResultCache {
    namespace: String,
    memory: Arc<Mutex<HashMap<String, String>>>,
    store: Option<Arc<dyn KvStore>>,
}

impl ResultCache {
    pub fn in_memory(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            memory: Arc::new(Mutex::new(HashMap::new())),
            store: None,
        }
    }

    pub fn persistent(store: Arc<dyn KvStore>, namespace: impl Into<String>) -> Self {
        Self {
            store: Some(store),
            ..Self::in_memory(namespace)
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, raw: &str) -> Option<T> {
        let cached = self.memory.lock().get(raw).cloned();
        let encoded = match cached {
            Some(encoded) => encoded,
            None => {
                let store = self.store.as_ref()?;
                match store.get(&self.store_key(raw)).await {
                    Ok(Some(encoded)) => {
                        self.memory.lock().insert(raw.to_string(), encoded.clone());
                        encoded
                    }
                    Ok(None) => return None,
                    Err(err) => {
                        warn!(?err, namespace = %self.namespace, "cache store read failed");
                        return None;
                    }
                }
            }
        };

        match serde_json::from_str(&encoded) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(?err, namespace = %self.namespace, "discarding undecodable cache entry");
                None
            }
        }
    }

    pub async fn insert<T: Serialize>(&self, raw: &str, value: &T) {
        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(?err, namespace = %self.namespace, "unable to encode cache entry");
                return;
            }
        };
        self.memory.lock().insert(raw.to_string(), encoded.clone());
        if let Some(store) = &self.store {
            if let Err(err) = store.set(&self.store_key(raw), &encoded).await {
                warn!(?err, namespace = %self.namespace, "cache store write failed");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.memory.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn store_key(&self, raw: &str) -> String {
        format!("{}:{}", self.namespace, raw)
    }
}
