//! Gallery stores: where known identities live between runs.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryLoadError {
    #[error("gallery store unavailable: {0}")]
    Unavailable(String),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("gallery load task failed: {0}")]
    Task(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("identity must carry an embedding or raw features: {0}")]
    MissingFeatures(String),
    #[error("store task failed: {0}")]
    Task(String),
}

/// One record as persisted by a store, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub person_id: String,
    pub display_name: String,
    pub embedding: Option<Vec<f32>>,
    /// Legacy feature map written by older enrollment clients.
    pub raw_features: Option<Vec<f32>>,
    pub model_version: Option<String>,
}

/// Listing row for gallery management.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentitySummary {
    pub person_id: String,
    pub display_name: String,
    pub dimension: Option<usize>,
    pub model_version: Option<String>,
    pub created_at: String,
}

/// Keyed collection the gallery loads from. Only called from `Gallery::refresh`.
#[async_trait]
pub trait GalleryStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<StoredIdentity>, GalleryLoadError>;
}

/// Store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryGalleryStore {
    records: RwLock<Vec<StoredIdentity>>,
}

impl MemoryGalleryStore {
    pub fn new(records: Vec<StoredIdentity>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    /// Replace the contents; visible on the next refresh.
    pub fn replace(&self, records: Vec<StoredIdentity>) {
        let mut guard = self.records.write().unwrap_or_else(|e| e.into_inner());
        *guard = records;
    }
}

#[async_trait]
impl GalleryStore for MemoryGalleryStore {
    async fn load_all(&self) -> Result<Vec<StoredIdentity>, GalleryLoadError> {
        let guard = self
            .records
            .read()
            .map_err(|_| GalleryLoadError::Unavailable("memory store lock poisoned".into()))?;
        Ok(guard.clone())
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    person_id     TEXT PRIMARY KEY,
    display_name  TEXT NOT NULL,
    embedding     BLOB,
    raw_features  BLOB,
    model_version TEXT,
    created_at    TEXT NOT NULL
);
";

/// SQLite-backed store. Vectors are stored as little-endian f32 BLOBs.
///
/// A connection is opened per operation, on the blocking pool for async callers.
#[derive(Debug, Clone)]
pub struct SqliteGalleryStore {
    path: PathBuf,
}

impl SqliteGalleryStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Task(format!("create {}: {e}", parent.display()))
                })?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %path.display(), "gallery database ready");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        Connection::open(&self.path)
    }

    /// Insert or replace an identity.
    pub fn enroll(&self, identity: &StoredIdentity) -> Result<(), StoreError> {
        if identity.embedding.is_none() && identity.raw_features.is_none() {
            return Err(StoreError::MissingFeatures(identity.person_id.clone()));
        }
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO identities (person_id, display_name, embedding, raw_features, model_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(person_id) DO UPDATE SET
                display_name = excluded.display_name,
                embedding = excluded.embedding,
                raw_features = excluded.raw_features,
                model_version = excluded.model_version",
            params![
                identity.person_id,
                identity.display_name,
                identity.embedding.as_deref().map(encode_vector),
                identity.raw_features.as_deref().map(encode_vector),
                identity.model_version,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        tracing::info!(person_id = %identity.person_id, "identity enrolled");
        Ok(())
    }

    /// Remove an identity. Returns whether a row was deleted.
    pub fn remove(&self, person_id: &str) -> Result<bool, StoreError> {
        let conn = self.connect()?;
        let n = conn.execute("DELETE FROM identities WHERE person_id = ?1", params![person_id])?;
        Ok(n > 0)
    }

    pub fn get(&self, person_id: &str) -> Result<Option<StoredIdentity>, StoreError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT person_id, display_name, embedding, raw_features, model_version
                 FROM identities WHERE person_id = ?1",
                params![person_id],
                row_to_identity,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT person_id, display_name, embedding, raw_features, model_version, created_at
             FROM identities ORDER BY person_id",
        )?;
        let rows = stmt.query_map([], |row| {
            let embedding: Option<Vec<u8>> = row.get(2)?;
            let raw: Option<Vec<u8>> = row.get(3)?;
            Ok(IdentitySummary {
                person_id: row.get(0)?,
                display_name: row.get(1)?,
                dimension: embedding.or(raw).map(|b| b.len() / 4),
                model_version: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn load_all_blocking(&self) -> Result<Vec<StoredIdentity>, GalleryLoadError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT person_id, display_name, embedding, raw_features, model_version
             FROM identities ORDER BY rowid",
        )?;
        let rows = stmt.query_map([], row_to_identity)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[async_trait]
impl GalleryStore for SqliteGalleryStore {
    async fn load_all(&self) -> Result<Vec<StoredIdentity>, GalleryLoadError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.load_all_blocking())
            .await
            .map_err(|e| GalleryLoadError::Task(e.to_string()))?
    }
}

fn row_to_identity(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredIdentity> {
    let person_id: String = row.get(0)?;
    let embedding: Option<Vec<u8>> = row.get(2)?;
    let raw: Option<Vec<u8>> = row.get(3)?;
    Ok(StoredIdentity {
        embedding: embedding.and_then(|b| decode_vector(&person_id, &b)),
        raw_features: raw.and_then(|b| decode_vector(&person_id, &b)),
        display_name: row.get(1)?,
        model_version: row.get(4)?,
        person_id,
    })
}

fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode a little-endian f32 BLOB; a truncated blob is dropped with a warning.
fn decode_vector(person_id: &str, bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        tracing::warn!(person_id, len = bytes.len(), "vector blob is not a multiple of 4 bytes; ignoring");
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}
