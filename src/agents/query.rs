//! Query builder.
//!
//! Generates (or modifies) conditional SQL query templates from the
//! user's request, the semantic schema analysis, and the current widget
//! state.

use crate::agents::{str_field, GenerationContext, GENERATOR_HISTORY};
use crate::error::Result;
use crate::llm::{ChatMessage, CompletionClient};
use crate::model::{OutputColumn, QueryResult};
use crate::prompts::QUERY_BUILDER_PROMPT;
use serde_json::Value;
use std::sync::Arc;

pub struct QueryGenerator {
    llm: Arc<dyn CompletionClient>,
    temperature: f32,
}

impl QueryGenerator {
    pub fn new(llm: Arc<dyn CompletionClient>, temperature: f32) -> Self {
        Self { llm, temperature }
    }

    /// Generate or update a query template.
    pub async fn run(&self, ctx: &GenerationContext<'_>) -> Result<QueryResult> {
        let mut messages = vec![ChatMessage::system(QUERY_BUILDER_PROMPT)];

        if let Some(analysis) = ctx.schema_analysis {
            messages.push(ChatMessage::system(format!(
                "Database schema analysis:\n{}",
                serde_json::to_string_pretty(analysis)?
            )));
        }

        if let Some(current) = ctx
            .widget
            .and_then(|w| w.query_template.as_deref())
            .filter(|q| !q.is_empty())
        {
            messages.push(ChatMessage::system(format!(
                "Current query template:\n{}",
                current
            )));
        }

        messages.extend(ctx.recent_history(GENERATOR_HISTORY).iter().cloned());
        messages.push(ChatMessage::user(ctx.user_text()));

        let value = self.llm.complete(&messages, self.temperature).await?;
        Ok(decode_query_result(&value))
    }
}

fn decode_query_result(value: &Value) -> QueryResult {
    let output_columns = value
        .get("output_columns")
        .cloned()
        .and_then(|v| serde_json::from_value::<Vec<OutputColumn>>(v).ok())
        .unwrap_or_default();

    QueryResult {
        query_template: str_field(value, "query_template"),
        explanation: str_field(value, "explanation"),
        output_columns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_with_all_fields() {
        let result = decode_query_result(&json!({
            "query_template": "SELECT 1",
            "explanation": "trivial",
            "output_columns": [{"name": "one", "type": "number"}]
        }));
        assert_eq!(result.query_template, "SELECT 1");
        assert_eq!(result.output_columns.len(), 1);
        assert_eq!(result.output_columns[0].name, "one");
    }

    #[test]
    fn decode_defaults_missing_fields() {
        let result = decode_query_result(&json!({"explanation": "partial"}));
        assert_eq!(result.query_template, "");
        assert!(result.output_columns.is_empty());
    }

    #[test]
    fn decode_survives_malformed_columns() {
        let result = decode_query_result(&json!({
            "query_template": "SELECT 1",
            "output_columns": "not-a-list"
        }));
        assert!(result.output_columns.is_empty());
    }
}
