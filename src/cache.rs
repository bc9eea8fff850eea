//! SQLite-backed cache for provider responses (`--cache`).
//!
//! Keys are blake3 hashes of (provider, model, prompt), plus the sample
//! ordinal for repeated samples of one model; only successful responses are
//! stored.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::gateway::TokenUsage;

#[derive(Debug, Clone)]
pub struct ResponseCacheKey {
    pub provider: String,
    pub model: String,
    pub prompt_hash: String,
    pub key_hash: String,
}

impl ResponseCacheKey {
    pub fn new(provider: &str, model: &str, prompt: &str) -> Self {
        let prompt_hash = hash_text(prompt);
        let key_hash = hash_fields(&[provider, model, &prompt_hash]);
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            prompt_hash,
            key_hash,
        }
    }

    /// Key for the `sample`-th response of the same model to the same prompt
    /// (1-based). Sample 1 keeps the plain key.
    pub fn with_sample(mut self, sample: usize) -> Self {
        if sample > 1 {
            let ordinal = sample.to_string();
            self.key_hash = hash_fields(&[&self.key_hash, "sample", &ordinal]);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub content: String,
    pub response_time_ms: u64,
    pub token_usage: Option<TokenUsage>,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &ResponseCacheKey) -> Result<Option<CachedResponse>, CacheError>;
    async fn put(&self, key: &ResponseCacheKey, value: &CachedResponse) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct SqliteResponseCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteResponseCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS response_cache (\
               key_hash TEXT PRIMARY KEY,\
               provider TEXT NOT NULL,\
               model TEXT NOT NULL,\
               prompt_hash TEXT NOT NULL,\
               content TEXT NOT NULL,\
               response_time_ms INTEGER NOT NULL,\
               input_tokens INTEGER,\
               output_tokens INTEGER,\
               total_tokens INTEGER,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL,\
               hit_count INTEGER NOT NULL DEFAULT 0\
             );",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("EVAL_RESPONSE_CACHE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".eval-cache/responses.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_exclusive(&self) -> Result<CacheLock, CacheError> {
        CacheLock::new(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }
}

#[async_trait]
impl ResponseCache for SqliteResponseCache {
    async fn get(&self, key: &ResponseCacheKey) -> Result<Option<CachedResponse>, CacheError> {
        let key_hash = key.key_hash.clone();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT content, response_time_ms, input_tokens, output_tokens, total_tokens \
                     FROM response_cache WHERE key_hash = ?1",
                )?;
                let mut rows = stmt.query(params![key_hash])?;
                let Some(row) = rows.next()? else {
                    return Ok(None);
                };
                let input = row.get::<_, Option<i64>>(2)?.map(|v| v as u32);
                let output = row.get::<_, Option<i64>>(3)?.map(|v| v as u32);
                let total = row.get::<_, Option<i64>>(4)?.map(|v| v as u32);
                let entry = CachedResponse {
                    content: row.get(0)?,
                    response_time_ms: row.get::<_, i64>(1)?.max(0) as u64,
                    token_usage: total.map(|total_tokens| TokenUsage {
                        input_tokens: input,
                        output_tokens: output,
                        total_tokens,
                    }),
                };
                conn.execute(
                    "UPDATE response_cache \
                     SET hit_count = hit_count + 1, updated_at = ?1 \
                     WHERE key_hash = ?2",
                    params![now_epoch(), key_hash],
                )?;
                Ok(Some(entry))
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    async fn put(&self, key: &ResponseCacheKey, value: &CachedResponse) -> Result<(), CacheError> {
        let key = key.clone();
        let value = value.clone();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let now = now_epoch();
                let usage = value.token_usage;
                conn.execute(
                    "INSERT INTO response_cache ( \
                        key_hash, provider, model, prompt_hash, content, response_time_ms, \
                        input_tokens, output_tokens, total_tokens, created_at, updated_at \
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                     ON CONFLICT(key_hash) DO UPDATE SET \
                        content = excluded.content, \
                        response_time_ms = excluded.response_time_ms, \
                        input_tokens = excluded.input_tokens, \
                        output_tokens = excluded.output_tokens, \
                        total_tokens = excluded.total_tokens, \
                        updated_at = excluded.updated_at",
                    params![
                        key.key_hash,
                        key.provider,
                        key.model,
                        key.prompt_hash,
                        value.content,
                        value.response_time_ms as i64,
                        usage.and_then(|u| u.input_tokens).map(i64::from),
                        usage.and_then(|u| u.output_tokens).map(i64::from),
                        usage.map(|u| i64::from(u.total_tokens)),
                        now,
                        now,
                    ],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

#[derive(Debug)]
pub struct CacheLock {
    _file: std::fs::File,
}

impl CacheLock {
    fn new(db_path: &Path) -> Result<Self, CacheError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

#[derive(Debug, Serialize)]
pub struct CacheExportRow {
    pub key_hash: String,
    pub provider: String,
    pub model: String,
    pub prompt_hash: String,
    pub content: String,
    pub response_time_ms: i64,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    pub created_at: i64,
    pub updated_at: i64,
    pub hit_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachePruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

impl SqliteResponseCache {
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, CacheError> {
        let path = path.as_ref().to_path_buf();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT key_hash, provider, model, prompt_hash, content, response_time_ms,\
                            input_tokens, output_tokens, total_tokens,\
                            created_at, updated_at, hit_count \
                     FROM response_cache ORDER BY updated_at DESC",
                )?;
                let mut rows = stmt.query([])?;
                let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
                let mut written = 0;
                while let Some(row) = rows.next()? {
                    let record = CacheExportRow {
                        key_hash: row.get(0)?,
                        provider: row.get(1)?,
                        model: row.get(2)?,
                        prompt_hash: row.get(3)?,
                        content: row.get(4)?,
                        response_time_ms: row.get(5)?,
                        input_tokens: row.get::<_, Option<i64>>(6)?.map(|v| v as u32),
                        output_tokens: row.get::<_, Option<i64>>(7)?.map(|v| v as u32),
                        total_tokens: row.get::<_, Option<i64>>(8)?.map(|v| v as u32),
                        created_at: row.get(9)?,
                        updated_at: row.get(10)?,
                        hit_count: row.get(11)?,
                    };
                    let line = serde_json::to_string(&record)
                        .map_err(|e| CacheError::Serde(e.to_string()))?;
                    use std::io::Write;
                    writeln!(file, "{line}")?;
                    written += 1;
                }
                use std::io::Write;
                file.flush()?;
                Ok(written)
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    pub async fn prune(
        &self,
        max_age_days: Option<u64>,
        max_rows: Option<usize>,
    ) -> Result<CachePruneStats, CacheError> {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut deleted: usize = 0;
                if let Some(days) = max_age_days {
                    let cutoff = now_epoch().saturating_sub((days as i64).saturating_mul(86_400));
                    let removed = conn.execute(
                        "DELETE FROM response_cache WHERE updated_at < ?1",
                        params![cutoff],
                    )?;
                    deleted = deleted.saturating_add(removed);
                }

                if let Some(max_rows) = max_rows {
                    let removed = conn.execute(
                        "DELETE FROM response_cache WHERE key_hash IN (\
                            SELECT key_hash FROM response_cache \
                            ORDER BY updated_at DESC LIMIT -1 OFFSET ?1\
                         )",
                        params![max_rows as i64],
                    )?;
                    deleted = deleted.saturating_add(removed);
                }

                let remaining: i64 =
                    conn.query_row("SELECT COUNT(*) FROM response_cache", [], |row| row.get(0))?;
                Ok(CachePruneStats {
                    deleted,
                    remaining: remaining.max(0) as usize,
                })
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_depends_on_every_field() {
        let a = ResponseCacheKey::new("openai", "gpt-4o", "hi");
        let b = ResponseCacheKey::new("openai", "gpt-4o", "hi ");
        let c = ResponseCacheKey::new("openai", "gpt-4o-mini", "hi");
        let d = ResponseCacheKey::new("openai", "gpt-4o", "hi");
        assert_ne!(a.key_hash, b.key_hash);
        assert_ne!(a.key_hash, c.key_hash);
        assert_eq!(a.key_hash, d.key_hash);
    }

    #[test]
    fn repeated_samples_get_their_own_keys() {
        let first = ResponseCacheKey::new("openai", "gpt-4o", "hi");
        let again = ResponseCacheKey::new("openai", "gpt-4o", "hi").with_sample(1);
        let second = ResponseCacheKey::new("openai", "gpt-4o", "hi").with_sample(2);
        let third = ResponseCacheKey::new("openai", "gpt-4o", "hi").with_sample(3);
        assert_eq!(first.key_hash, again.key_hash);
        assert_ne!(first.key_hash, second.key_hash);
        assert_ne!(second.key_hash, third.key_hash);
    }
}
