//! Chart builder.
//!
//! Chooses a chart type and produces a renderer-ready configuration from
//! the query's output columns and the current widget state.

use crate::agents::{str_field, GenerationContext, GENERATOR_HISTORY};
use crate::error::Result;
use crate::llm::{ChatMessage, CompletionClient};
use crate::model::{ChartResult, OutputColumn};
use crate::prompts::CHART_BUILDER_PROMPT;
use serde_json::Value;
use std::sync::Arc;

pub struct ChartGenerator {
    llm: Arc<dyn CompletionClient>,
    temperature: f32,
}

impl ChartGenerator {
    pub fn new(llm: Arc<dyn CompletionClient>, temperature: f32) -> Self {
        Self { llm, temperature }
    }

    /// Generate or update the chart configuration.
    pub async fn run(
        &self,
        ctx: &GenerationContext<'_>,
        output_columns: &[OutputColumn],
    ) -> Result<ChartResult> {
        let mut messages = vec![ChatMessage::system(CHART_BUILDER_PROMPT)];

        if !output_columns.is_empty() {
            messages.push(ChatMessage::system(format!(
                "Query output columns:\n{}",
                serde_json::to_string(output_columns)?
            )));
        }

        if let Some(widget) = ctx.widget {
            let mut current = serde_json::Map::new();
            if let Some(ct) = widget.chart_type.as_deref().filter(|s| !s.is_empty()) {
                current.insert("chart_type".to_string(), Value::from(ct));
            }
            if let Some(cc) = &widget.chart_config {
                current.insert("chart_config".to_string(), cc.clone());
            }
            if !current.is_empty() {
                messages.push(ChatMessage::system(format!(
                    "Current chart configuration:\n{}",
                    serde_json::to_string_pretty(&Value::Object(current))?
                )));
            }
        }

        messages.extend(ctx.recent_history(GENERATOR_HISTORY).iter().cloned());
        messages.push(ChatMessage::user(ctx.user_text()));

        let value = self.llm.complete(&messages, self.temperature).await?;
        Ok(decode_chart_result(&value))
    }
}

fn decode_chart_result(value: &Value) -> ChartResult {
    let chart_type = match str_field(value, "chart_type") {
        s if s.is_empty() => "bar".to_string(),
        s => s,
    };
    let chart_config = value
        .get("chart_config")
        .filter(|v| v.is_object())
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));

    ChartResult {
        chart_type,
        chart_config,
        explanation: str_field(value, "explanation"),
    }
}
