use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, Url};
use rusqlite::{Connection, OptionalExtension};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const KV_SERVICE: &str = "kv store";

/// Opaque get/set string store.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> AppResult<()>;
}

/// REST key-value store when `KV_REST_API_URL` and `KV_REST_API_TOKEN` are set, otherwise a
/// SQLite file in the data directory.
pub fn store_from_config(http: Client, config: &AppConfig) -> AppResult<Arc<dyn KvStore>> {
    match (&config.kv_rest_api_url, &config.kv_rest_api_token) {
        (Some(url), Some(token)) => {
            info!(url = %url, "using REST key-value store");
            Ok(Arc::new(RestKvStore::new(http, url, token.clone())?))
        }
        _ => {
            let path = config.database_path();
            info!(path = %path.display(), "using SQLite key-value store");
            Ok(Arc::new(SqliteKvStore::open(path)?))
        }
    }
}

pub struct RestKvStore {
    http: Client,
    base: Url,
    token: SecretString,
}

#[derive(Deserialize)]
struct RestReply {
    result: Option<Value>,
}

impl RestKvStore {
    pub fn new(http: Client, base_url: &str, token: SecretString) -> AppResult<Self> {
        let base = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|err| AppError::Config(format!("invalid KV_REST_API_URL: {err}")))?;
        if base.cannot_be_a_base() {
            return Err(AppError::Config(format!(
                "KV_REST_API_URL cannot be used as a base: {base_url}"
            )));
        }
        Ok(Self { http, base, token })
    }

    fn command_url(&self, command: &str, key: &str) -> AppResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::Config("KV_REST_API_URL cannot be used as a base".into()))?
            .pop_if_empty()
            .push(command)
            .push(key);
        Ok(url)
    }
}

#[async_trait]
impl KvStore for RestKvStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let response = self
            .http
            .get(self.command_url("get", key)?)
            .bearer_auth(self.token.expose_secret())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Status {
                service: KV_SERVICE,
                status: status.as_u16(),
            });
        }
        let reply: RestReply = response.json().await?;
        Ok(match reply.result {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(text),
            Some(other) => Some(other.to_string()),
        })
    }

    async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let response = self
            .http
            .post(self.command_url("set", key)?)
            .bearer_auth(self.token.expose_secret())
            .body(value.to_string())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Status {
                service: KV_SERVICE,
                status: status.as_u16(),
            });
        }
        debug!(key, bytes = value.len(), "stored value in REST store");
        Ok(())
    }
}

/// SQLite-backed store. Statements run on the blocking pool, one at a time.
pub struct SqliteKvStore {
    connection: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteKvStore {
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let connection = Connection::open(&path)?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (DATETIME('now'))
            );
            "#,
        )?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_connection<T, F>(&self, op: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        let output = tokio::task::spawn_blocking(move || op(&connection.lock())).await?;
        Ok(output?)
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let key = key.to_string();
        self.with_connection(move |conn| {
            conn.query_row(
                "SELECT value FROM kv_entries WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO kv_entries (key, value, updated_at)
                VALUES (?1, ?2, DATETIME('now'))
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = DATETIME('now')",
                (key, value),
            )
        })
        .await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}
