//! Schema-analysis cache with hash-based invalidation.
//!
//! One cached semantic analysis per data-source identity, keyed by a
//! SHA-256 digest of the canonicalized raw schema. The canonical form
//! sorts tables, columns, and foreign keys so the hash is independent of
//! introspection iteration order; any column type change produces a new
//! hash and forces regeneration.

use crate::error::{PipelineError, Result};
use crate::model::{RawSchema, SchemaAnalysis, SchemaColumn, SchemaTable};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// Stable textual form of a raw schema, independent of the order tables
/// and columns were introspected in.
pub fn canonicalize(schema: &RawSchema) -> String {
    let mut lines = vec![format!("database={}", schema.database)];

    let mut tables: Vec<&SchemaTable> = schema.tables.iter().collect();
    tables.sort_by(|a, b| a.name.cmp(&b.name));

    for table in tables {
        lines.push(format!("table={}", table.name));

        let mut columns: Vec<&SchemaColumn> = table.columns.iter().collect();
        columns.sort_by(|a, b| a.name.cmp(&b.name));
        for col in columns {
            lines.push(format!(
                "column={}|{}|nullable={}|pk={}",
                col.name, col.data_type, col.nullable, col.primary_key
            ));
        }

        let mut fks: Vec<String> = table
            .foreign_keys
            .iter()
            .map(|fk| {
                format!(
                    "fk=({})->{}({})",
                    fk.columns.join(","),
                    fk.referred_table,
                    fk.referred_columns.join(",")
                )
            })
            .collect();
        fks.sort();
        lines.extend(fks);
    }

    lines.join("\n")
}

/// Hex SHA-256 digest of the canonicalized schema.
pub fn schema_hash(schema: &RawSchema) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonicalize(schema).as_bytes());
    hex::encode(hasher.finalize())
}

/// A cache entry: the hash the analysis was computed from, plus the
/// analysis itself.
#[derive(Debug, Clone)]
pub struct CachedAnalysis {
    pub schema_hash: String,
    pub analysis: SchemaAnalysis,
}

/// Persistence seam for cached analyses. One entry per data-source
/// identity; writes are full replacements, so last-writer-wins is safe
/// for concurrent runs.
#[async_trait]
pub trait AnalysisStore: Send + Sync {
    async fn load_analysis(&self, data_source_id: &str) -> Result<Option<CachedAnalysis>>;

    async fn save_analysis(
        &self,
        data_source_id: &str,
        schema_hash: &str,
        analysis: &SchemaAnalysis,
    ) -> Result<()>;
}

/// In-memory store for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryAnalysisStore {
    entries: DashMap<String, CachedAnalysis>,
}

impl MemoryAnalysisStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnalysisStore for MemoryAnalysisStore {
    async fn load_analysis(&self, data_source_id: &str) -> Result<Option<CachedAnalysis>> {
        Ok(self.entries.get(data_source_id).map(|entry| entry.value().clone()))
    }

    async fn save_analysis(
        &self,
        data_source_id: &str,
        schema_hash: &str,
        analysis: &SchemaAnalysis,
    ) -> Result<()> {
        self.entries.insert(
            data_source_id.to_string(),
            CachedAnalysis {
                schema_hash: schema_hash.to_string(),
                analysis: analysis.clone(),
            },
        );
        Ok(())
    }
}

/// SQLite-backed store.
pub struct SqliteAnalysisStore {
    conn: Mutex<Connection>,
}

impl SqliteAnalysisStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| PipelineError::Cache(format!("failed to open cache database: {}", e)))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PipelineError::Cache(format!("failed to open cache database: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS schema_analyses (
                id TEXT NOT NULL,
                data_source_id TEXT PRIMARY KEY,
                schema_hash TEXT NOT NULL,
                analysis TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .map_err(|e| PipelineError::Cache(format!("failed to init cache schema: {}", e)))?;

        Ok(Self { conn: Mutex::new(conn) })
    }
}

#[async_trait]
impl AnalysisStore for SqliteAnalysisStore {
    async fn load_analysis(&self, data_source_id: &str) -> Result<Option<CachedAnalysis>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT schema_hash, analysis FROM schema_analyses WHERE data_source_id = ?1",
                params![data_source_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| PipelineError::Cache(format!("cache read failed: {}", e)))?;

        match row {
            Some((schema_hash, raw)) => match serde_json::from_str(&raw) {
                Ok(analysis) => Ok(Some(CachedAnalysis { schema_hash, analysis })),
                Err(e) => {
                    // A corrupt row is a miss, not a failure; the analyzer
                    // will regenerate and overwrite it.
                    warn!("discarding unreadable cache entry for {}: {}", data_source_id, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn save_analysis(
        &self,
        data_source_id: &str,
        schema_hash: &str,
        analysis: &SchemaAnalysis,
    ) -> Result<()> {
        let payload = serde_json::to_string(analysis)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO schema_analyses (id, data_source_id, schema_hash, analysis, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(data_source_id) DO UPDATE SET
                schema_hash = excluded.schema_hash,
                analysis = excluded.analysis,
                updated_at = excluded.updated_at
            "#,
            params![
                Uuid::new_v4().to_string(),
                data_source_id,
                schema_hash,
                payload,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| PipelineError::Cache(format!("cache write failed: {}", e)))?;
        Ok(())
    }
}
