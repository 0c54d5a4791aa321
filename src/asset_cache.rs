//! Versioned on-disk cache for the server's static assets.
//!
//! One SQLite table holds every cache generation, keyed by cache name.
//! Activation drops every generation except the current one.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::api::ApiClient;
use crate::error::ClientResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    NetworkOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssetRequest {
    pub path: String,
    /// A top-level page load rather than a subresource.
    pub navigate: bool,
}

impl AssetRequest {
    pub fn asset(path: impl Into<String>) -> Self {
        AssetRequest { path: path.into(), navigate: false }
    }
}

impl Strategy {
    /// Scripts and styles go to the network first so logic is never stale.
    pub fn for_request(request: &AssetRequest) -> Self {
        let path = request.path.split(&['?', '#'][..]).next().unwrap_or("");
        if path.ends_with(".js") || path.ends_with(".css") {
            Strategy::NetworkFirst
        } else if path.starts_with("/static/") || request.navigate {
            Strategy::CacheFirst
        } else {
            Strategy::NetworkOnly
        }
    }
}

pub trait AssetFetcher: Send + Sync {
    fn fetch<'a>(&'a self, path: &'a str) -> BoxFuture<'a, ClientResult<Vec<u8>>>;
}

impl AssetFetcher for ApiClient {
    fn fetch<'a>(&'a self, path: &'a str) -> BoxFuture<'a, ClientResult<Vec<u8>>> {
        Box::pin(self.asset(path))
    }
}

#[derive(Clone)]
pub struct AssetCache {
    name: String,
    db: Arc<Mutex<Connection>>,
}

impl AssetCache {
    pub fn open(path: &Path, name: &str) -> ClientResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?, name)
    }

    pub fn in_memory(name: &str) -> ClientResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, name)
    }

    fn with_connection(conn: Connection, name: &str) -> ClientResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS assets (
                cache_name TEXT NOT NULL,
                path TEXT NOT NULL,
                body BLOB NOT NULL,
                stored_at INTEGER NOT NULL,
                PRIMARY KEY (cache_name, path)
            )",
            [],
        )?;
        Ok(AssetCache { name: name.to_string(), db: Arc::new(Mutex::new(conn)) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, path: &str) -> ClientResult<Option<Vec<u8>>> {
        let db = self.db.lock().await;
        let body = db
            .query_row(
                "SELECT body FROM assets WHERE cache_name = ?1 AND path = ?2",
                params![self.name, path],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(body)
    }

    pub async fn put(&self, path: &str, body: &[u8]) -> ClientResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR REPLACE INTO assets (cache_name, path, body, stored_at) VALUES (?1, ?2, ?3, ?4)",
            params![self.name, path, body, now_secs()],
        )?;
        Ok(())
    }

    /// Fetch every asset and store them together. Nothing is stored if any
    /// fetch fails.
    pub async fn install<F: AssetFetcher + ?Sized>(
        &self,
        fetcher: &F,
        assets: &[String],
    ) -> ClientResult<usize> {
        let mut fetched = Vec::with_capacity(assets.len());
        for path in assets {
            fetched.push((path.as_str(), fetcher.fetch(path).await?));
        }

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let now = now_secs();
        for (path, body) in &fetched {
            tx.execute(
                "INSERT OR REPLACE INTO assets (cache_name, path, body, stored_at) VALUES (?1, ?2, ?3, ?4)",
                params![self.name, path, body, now],
            )?;
        }
        tx.commit()?;

        tracing::info!(cache = %self.name, count = fetched.len(), "precached assets");
        Ok(fetched.len())
    }

    /// Drop every cache generation other than this one.
    pub async fn activate(&self) -> ClientResult<usize> {
        let db = self.db.lock().await;
        let evicted = db.execute("DELETE FROM assets WHERE cache_name != ?1", params![self.name])?;
        if evicted > 0 {
            tracing::info!(cache = %self.name, evicted, "evicted old cache entries");
        }
        Ok(evicted)
    }

    pub async fn fetch<F: AssetFetcher + ?Sized>(
        &self,
        fetcher: &F,
        request: &AssetRequest,
    ) -> ClientResult<Vec<u8>> {
        match Strategy::for_request(request) {
            Strategy::NetworkOnly => fetcher.fetch(&request.path).await,
            Strategy::CacheFirst => {
                if let Some(body) = self.get(&request.path).await? {
                    return Ok(body);
                }
                let body = fetcher.fetch(&request.path).await?;
                self.put(&request.path, &body).await?;
                Ok(body)
            }
            Strategy::NetworkFirst => match fetcher.fetch(&request.path).await {
                Ok(body) => {
                    self.put(&request.path, &body).await?;
                    Ok(body)
                }
                Err(err) => {
                    tracing::debug!(path = %request.path, error = %err, "network failed, trying cache");
                    match self.get(&request.path).await? {
                        Some(body) => Ok(body),
                        None => Err(err),
                    }
                }
            },
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
