//! Persistent store backends for the memo mirror.
//!
//! The [`MemoStore`] trait is the orchestrator's only view of persistence:
//! a batched point lookup of previously synced edit times, and an
//! idempotent upsert keyed on the memo id. Backends:
//!
//! - **[`SqliteStore`]** — local SQLite file via sqlx (default).
//! - **[`RestStore`]** — PostgREST-style HTTP endpoint (e.g. Supabase),
//!   embedding stored as a pgvector literal.
//! - **[`MemoryStore`]** — in-memory, for tests.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::OnceCell;

use crate::config::StoreConfig;
use crate::embedding::vec_to_blob;
use crate::models::MemoRecord;

/// Max ids per point-lookup call.
const LOOKUP_BATCH_SIZE: usize = 500;

/// Abstract persistence for synced memos.
#[async_trait]
pub trait MemoStore: Send + Sync {
    /// Fetch previously persisted `last_edited_time` values for the given
    /// ids. Ids without a persisted record (or without a stored edit time)
    /// are simply absent from the map. Implementations batch internally.
    async fn fetch_edited_times(&self, ids: &[String]) -> Result<HashMap<String, String>>;

    /// Insert or update one memo, keyed on `record.id`. Idempotent under
    /// repeated application with identical input.
    async fn upsert_memo(&self, record: &MemoRecord) -> Result<()>;
}

/// Instantiate the store backend named by the configuration.
pub async fn create_store(config: &StoreConfig) -> Result<Arc<dyn MemoStore>> {
    match config.provider.as_str() {
        "sqlite" => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("store.path required for sqlite provider"))?;
            let store = SqliteStore::connect(path).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        "rest" => Ok(Arc::new(RestStore::new(config)?)),
        other => bail!("Unknown store provider: {}", other),
    }
}

// ============ SQLite ============

/// SQLite-backed store. The schema is created on demand and upserts use
/// `ON CONFLICT(id) DO UPDATE`, so re-running a sync is always safe.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(db_path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Private in-memory database; a single connection keeps it alive.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Create the schema. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memos (
                id TEXT PRIMARY KEY,
                memo_url TEXT NOT NULL,
                book_id TEXT,
                book_title TEXT,
                book_url TEXT,
                tags_json TEXT NOT NULL,
                note TEXT NOT NULL,
                content_text TEXT NOT NULL,
                embedding BLOB,
                created_time TEXT NOT NULL,
                last_edited_time TEXT NOT NULL,
                dedup_hash TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_memos_edited ON memos(last_edited_time)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl MemoStore for SqliteStore {
    async fn fetch_edited_times(&self, ids: &[String]) -> Result<HashMap<String, String>> {
        let mut edited_by_id = HashMap::new();

        for batch in ids.chunks(LOOKUP_BATCH_SIZE) {
            if batch.is_empty() {
                continue;
            }
            let placeholders = vec!["?"; batch.len()].join(",");
            let sql = format!(
                "SELECT id, last_edited_time FROM memos WHERE id IN ({})",
                placeholders
            );

            let mut query = sqlx::query_as::<_, (String, Option<String>)>(&sql);
            for id in batch {
                query = query.bind(id);
            }

            for (id, edited) in query.fetch_all(&self.pool).await? {
                if let Some(edited) = edited {
                    edited_by_id.insert(id, edited);
                }
            }
        }

        Ok(edited_by_id)
    }

    async fn upsert_memo(&self, record: &MemoRecord) -> Result<()> {
        let dedup_hash = dedup_hash(record);
        let tags_json = serde_json::to_string(&record.tags)?;
        // Empty embedding (provider disabled) stores as NULL, not a zero-length blob.
        let embedding_blob = if record.embedding.is_empty() {
            None
        } else {
            Some(vec_to_blob(&record.embedding))
        };

        sqlx::query(
            r#"
            INSERT INTO memos (id, memo_url, book_id, book_title, book_url, tags_json, note, content_text, embedding, created_time, last_edited_time, dedup_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                memo_url = excluded.memo_url,
                book_id = excluded.book_id,
                book_title = excluded.book_title,
                book_url = excluded.book_url,
                tags_json = excluded.tags_json,
                note = excluded.note,
                content_text = excluded.content_text,
                embedding = excluded.embedding,
                created_time = excluded.created_time,
                last_edited_time = excluded.last_edited_time,
                dedup_hash = excluded.dedup_hash
            "#,
        )
        .bind(&record.id)
        .bind(&record.memo_url)
        .bind(&record.book_id)
        .bind(&record.book_title)
        .bind(&record.book_url)
        .bind(&tags_json)
        .bind(&record.note)
        .bind(&record.content_text)
        .bind(&embedding_blob)
        .bind(&record.created_time)
        .bind(&record.last_edited_time)
        .bind(&dedup_hash)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn dedup_hash(record: &MemoRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.id.as_bytes());
    hasher.update(record.last_edited_time.as_bytes());
    hasher.update(record.content_text.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============ REST (PostgREST-style) ============

/// The `in` filter syntax accepted by the deployed endpoint. Older
/// PostgREST releases take `id=in.a,b`; current ones require
/// `id=in.(a,b)`. Detected once at first use, then cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterShape {
    Parenthesized,
    Legacy,
}

#[derive(Debug, Deserialize)]
struct RestRow {
    id: String,
    #[serde(default)]
    last_edited_time: Option<String>,
}

enum RestQueryError {
    /// 4xx from the endpoint — the request shape was rejected.
    Rejected(String),
    Other(anyhow::Error),
}

/// Store backend over a PostgREST-style HTTP API (e.g. Supabase).
///
/// The service key is read from the `SUPABASE_SERVICE_ROLE_KEY`
/// environment variable. Embeddings are written as pgvector literals.
pub struct RestStore {
    http: reqwest::Client,
    base_url: String,
    table: String,
    service_key: String,
    shape: OnceCell<FilterShape>,
}

impl RestStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("store.base_url required for rest provider"))?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .map_err(|_| anyhow::anyhow!("SUPABASE_SERVICE_ROLE_KEY environment variable not set"))?;

        Ok(Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            table: config.table.clone(),
            service_key,
            shape: OnceCell::new(),
        })
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn query_with(
        &self,
        shape: FilterShape,
        batch: &[String],
    ) -> Result<Vec<RestRow>, RestQueryError> {
        let joined = batch.join(",");
        let filter = match shape {
            FilterShape::Parenthesized => format!("in.({})", joined),
            FilterShape::Legacy => format!("in.{}", joined),
        };

        let response = self
            .authorized(self.http.get(self.table_url()))
            .query(&[("select", "id,last_edited_time"), ("id", filter.as_str())])
            .send()
            .await
            .map_err(|e| RestQueryError::Other(e.into()))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(RestQueryError::Rejected(format!(
                "store query rejected ({}): {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RestQueryError::Other(anyhow::anyhow!(
                "store query failed ({}): {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| RestQueryError::Other(e.into()))
    }

    /// Query one batch, detecting the accepted filter shape on first use.
    async fn fetch_batch(&self, batch: &[String]) -> Result<Vec<RestRow>> {
        if let Some(shape) = self.shape.get() {
            return match self.query_with(*shape, batch).await {
                Ok(rows) => Ok(rows),
                Err(RestQueryError::Rejected(msg)) => bail!(msg),
                Err(RestQueryError::Other(err)) => Err(err),
            };
        }

        match self.query_with(FilterShape::Parenthesized, batch).await {
            Ok(rows) => {
                let _ = self.shape.set(FilterShape::Parenthesized);
                Ok(rows)
            }
            Err(RestQueryError::Other(err)) => Err(err),
            Err(RestQueryError::Rejected(first_rejection)) => {
                match self.query_with(FilterShape::Legacy, batch).await {
                    Ok(rows) => {
                        tracing::debug!("store accepts legacy in-filter syntax");
                        let _ = self.shape.set(FilterShape::Legacy);
                        Ok(rows)
                    }
                    Err(_) => bail!(first_rejection),
                }
            }
        }
    }
}

#[async_trait]
impl MemoStore for RestStore {
    async fn fetch_edited_times(&self, ids: &[String]) -> Result<HashMap<String, String>> {
        let mut edited_by_id = HashMap::new();

        for batch in ids.chunks(LOOKUP_BATCH_SIZE) {
            if batch.is_empty() {
                continue;
            }
            for row in self.fetch_batch(batch).await? {
                if let Some(edited) = row.last_edited_time {
                    edited_by_id.insert(row.id, edited);
                }
            }
        }

        Ok(edited_by_id)
    }

    async fn upsert_memo(&self, record: &MemoRecord) -> Result<()> {
        let embedding = if record.embedding.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::Value::String(to_vector_literal(&record.embedding))
        };
        let body = serde_json::json!([{
            "id": record.id,
            "memo_url": record.memo_url,
            "book_id": record.book_id,
            "book_title": record.book_title,
            "book_url": record.book_url,
            "tags": record.tags,
            "note": record.note,
            "content_text": record.content_text,
            "embedding": embedding,
            "created_time": record.created_time,
            "last_edited_time": record.last_edited_time,
        }]);

        let response = self
            .authorized(self.http.post(self.table_url()))
            .query(&[("on_conflict", "id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!(
                "store upsert failed ({}): {}",
                status,
                text.chars().take(200).collect::<String>()
            );
        }

        Ok(())
    }
}

/// Render an embedding as a pgvector literal: `[0.1,0.2,...]`.
fn to_vector_literal(embedding: &[f32]) -> String {
    let joined = embedding
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("[{}]", joined)
}

// ============ In-memory ============

/// In-memory store for tests. Plain `HashMap` behind an `RwLock`.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, MemoRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything upserted so far.
    pub fn records(&self) -> Vec<MemoRecord> {
        self.records
            .read()
            .expect("memory store poisoned")
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MemoStore for MemoryStore {
    async fn fetch_edited_times(&self, ids: &[String]) -> Result<HashMap<String, String>> {
        let records = self.records.read().expect("memory store poisoned");
        Ok(ids
            .iter()
            .filter_map(|id| {
                records
                    .get(id)
                    .map(|r| (id.clone(), r.last_edited_time.clone()))
            })
            .collect())
    }

    async fn upsert_memo(&self, record: &MemoRecord) -> Result<()> {
        self.records
            .write()
            .expect("memory store poisoned")
            .insert(record.id.clone(), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, edited: &str) -> MemoRecord {
        MemoRecord {
            id: id.to_string(),
            memo_url: format!("https://notion.so/{}", id),
            book_id: None,
            book_title: Some("A Book".to_string()),
            book_url: None,
            tags: vec!["tag1".to_string()],
            note: "p.1".to_string(),
            content_text: "some flattened content".to_string(),
            embedding: vec![0.5, -0.5],
            created_time: "2024-01-01T00:00:00Z".to_string(),
            last_edited_time: edited.to_string(),
        }
    }

    #[test]
    fn test_vector_literal_format() {
        assert_eq!(to_vector_literal(&[0.5, -1.0]), "[0.5,-1]");
        assert_eq!(to_vector_literal(&[]), "[]");
    }

    #[test]
    fn test_dedup_hash_tracks_content() {
        let a = record("m1", "2024-06-01T00:00:00Z");
        let mut b = a.clone();
        assert_eq!(dedup_hash(&a), dedup_hash(&b));
        b.content_text.push_str(" changed");
        assert_ne!(dedup_hash(&a), dedup_hash(&b));
    }

    #[tokio::test]
    async fn test_sqlite_upsert_is_idempotent() {
        let store = SqliteStore::connect_in_memory().await.unwrap();
        store.migrate().await.unwrap();

        let rec = record("m1", "2024-06-01T00:00:00Z");
        store.upsert_memo(&rec).await.unwrap();
        store.upsert_memo(&rec).await.unwrap();

        let times = store
            .fetch_edited_times(&["m1".to_string(), "m2".to_string()])
            .await
            .unwrap();
        assert_eq!(times.len(), 1);
        assert_eq!(times["m1"], "2024-06-01T00:00:00Z");
    }

    #[tokio::test]
    async fn test_sqlite_upsert_replaces_on_conflict() {
        let store = SqliteStore::connect_in_memory().await.unwrap();
        store.migrate().await.unwrap();

        store
            .upsert_memo(&record("m1", "2024-06-01T00:00:00Z"))
            .await
            .unwrap();
        store
            .upsert_memo(&record("m1", "2024-06-02T00:00:00Z"))
            .await
            .unwrap();

        let times = store.fetch_edited_times(&["m1".to_string()]).await.unwrap();
        assert_eq!(times["m1"], "2024-06-02T00:00:00Z");
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        store
            .upsert_memo(&record("m1", "2024-06-01T00:00:00Z"))
            .await
            .unwrap();

        let times = store
            .fetch_edited_times(&["m1".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(times.len(), 1);
        assert_eq!(store.records().len(), 1);
    }
}
