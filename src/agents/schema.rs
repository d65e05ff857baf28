//! Schema analyzer.
//!
//! Performs a one-time semantic analysis of the raw database schema
//! (table purposes, relationships, suggested metrics) and caches it per
//! data-source identity. Subsequent runs return the cached analysis
//! until the schema content hash changes.

use crate::error::{PipelineError, Result};
use crate::llm::{ChatMessage, CompletionClient};
use crate::model::{RawSchema, SchemaAnalysis};
use crate::prompts::SCHEMA_ANALYZER_PROMPT;
use crate::schema_cache::{schema_hash, AnalysisStore};
use itertools::Itertools;
use std::sync::Arc;
use tracing::{info, warn};

pub struct SchemaAnalyzer {
    llm: Arc<dyn CompletionClient>,
    temperature: f32,
}

impl SchemaAnalyzer {
    pub fn new(llm: Arc<dyn CompletionClient>, temperature: f32) -> Self {
        Self { llm, temperature }
    }

    /// Return a cached or freshly generated analysis.
    ///
    /// The cache is consulted only when a store and a data-source id are
    /// available; a stale hash regenerates and overwrites the single
    /// entry for that identity. A completion failure propagates without
    /// touching whatever entry already exists.
    pub async fn run(
        &self,
        schema: &RawSchema,
        data_source_id: &str,
        store: Option<&dyn AnalysisStore>,
    ) -> Result<SchemaAnalysis> {
        let current_hash = schema_hash(schema);

        if let Some(store) = store.filter(|_| !data_source_id.is_empty()) {
            match store.load_analysis(data_source_id).await {
                Ok(Some(cached)) if cached.schema_hash == current_hash => {
                    info!("returning cached schema analysis for {}", data_source_id);
                    return Ok(cached.analysis);
                }
                Ok(_) => {}
                Err(e) => warn!("cache read failed for {}: {}", data_source_id, e),
            }
        }

        let messages = vec![
            ChatMessage::system(SCHEMA_ANALYZER_PROMPT),
            ChatMessage::user(format_schema(schema)),
        ];
        let value = self.llm.complete(&messages, self.temperature).await?;
        let analysis: SchemaAnalysis = serde_json::from_value(value)
            .map_err(|e| PipelineError::Completion(format!("malformed schema analysis: {}", e)))?;

        if let Some(store) = store.filter(|_| !data_source_id.is_empty()) {
            if let Err(e) = store
                .save_analysis(data_source_id, &current_hash, &analysis)
                .await
            {
                warn!("cache write failed for {}: {}", data_source_id, e);
            }
        }

        Ok(analysis)
    }
}

/// Render the raw schema as indented text for the analysis prompt.
pub fn format_schema(schema: &RawSchema) -> String {
    let mut lines = vec![format!("Database: {}", schema.database)];
    for table in &schema.tables {
        lines.push(format!("\nTable: {}", table.name));
        for col in &table.columns {
            let pk = if col.primary_key { " [PK]" } else { "" };
            let nullable = if col.nullable { " NULL" } else { "" };
            lines.push(format!("  - {} {}{}{}", col.name, col.data_type, pk, nullable));
        }
        for fk in &table.foreign_keys {
            lines.push(format!(
                "  FK: ({}) -> {}({})",
                fk.columns.iter().join(", "),
                fk.referred_table,
                fk.referred_columns.iter().join(", ")
            ));
        }
    }
    lines.join("\n")
}
