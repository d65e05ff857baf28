//! Filter builder.
//!
//! Designs interactive filter definitions for a widget's query template,
//! then validates them against the template's placeholders and the known
//! schema. Validation never fails a run: offending filters are dropped
//! or sanitised and a human-readable warning is accumulated for the
//! final message.

use crate::agents::{str_field, string_list_field, GenerationContext, GENERATOR_HISTORY};
use crate::error::Result;
use crate::llm::{ChatMessage, CompletionClient};
use crate::model::{FilterDef, FilterResult, FilterType, SchemaAnalysis};
use crate::prompts::FILTER_BUILDER_PROMPT;
use crate::template::extract_placeholders;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub struct FilterGenerator {
    llm: Arc<dyn CompletionClient>,
    temperature: f32,
}

impl FilterGenerator {
    pub fn new(llm: Arc<dyn CompletionClient>, temperature: f32) -> Self {
        Self { llm, temperature }
    }

    /// Build filters for the given query template.
    pub async fn run(
        &self,
        ctx: &GenerationContext<'_>,
        query_template: &str,
    ) -> Result<FilterResult> {
        let mut messages = vec![ChatMessage::system(FILTER_BUILDER_PROMPT)];

        if !query_template.is_empty() {
            messages.push(ChatMessage::system(format!(
                "Query template:\n{}",
                query_template
            )));
        }

        if let Some(analysis) = ctx.schema_analysis {
            messages.push(ChatMessage::system(format!(
                "Schema analysis:\n{}",
                serde_json::to_string_pretty(analysis)?
            )));
        }

        if let Some(widget) = ctx.widget.filter(|w| !w.filters.is_empty()) {
            messages.push(ChatMessage::system(format!(
                "Current filters:\n{}",
                serde_json::to_string(&widget.filters)?
            )));
        }

        messages.extend(ctx.recent_history(GENERATOR_HISTORY).iter().cloned());
        messages.push(ChatMessage::user(ctx.user_text()));

        let value = self.llm.complete(&messages, self.temperature).await?;
        let (filters, mut warnings) = decode_filters(&value);
        warnings.extend(string_list_field(&value, "warnings"));

        let (filters, extra) = if query_template.is_empty() {
            (filters, Vec::new())
        } else {
            validate_filters(filters, query_template, ctx.schema_analysis)
        };
        warnings.extend(extra);

        Ok(FilterResult {
            filters,
            explanation: str_field(&value, "explanation"),
            warnings,
        })
    }
}

/// Decode the filter list item by item so one malformed entry does not
/// sink the rest.
fn decode_filters(value: &Value) -> (Vec<FilterDef>, Vec<String>) {
    let mut filters = Vec::new();
    let mut warnings = Vec::new();

    let Some(items) = value.get("filters").and_then(Value::as_array) else {
        return (filters, warnings);
    };

    for item in items {
        match serde_json::from_value::<FilterDef>(item.clone()) {
            Ok(filter) => filters.push(filter),
            Err(e) => {
                debug!("skipping malformed filter definition: {}", e);
                warnings.push("Ignored a malformed filter definition.".to_string());
            }
        }
    }

    (filters, warnings)
}

/// Validate and sanitise generated filters against the raw template text
/// and the known schema.
///
/// 1. Drop filters whose parameter has no matching placeholder anywhere
///    in the template (including inside conditional blocks); date_range
///    filters need at least one of `:param_start` / `:param_end`.
/// 2. Clear source_table / source_column when the table is not part of
///    the schema analysis.
///
/// Surviving filters are re-numbered in order.
pub fn validate_filters(
    filters: Vec<FilterDef>,
    query_template: &str,
    analysis: Option<&SchemaAnalysis>,
) -> (Vec<FilterDef>, Vec<String>) {
    let placeholders = extract_placeholders(query_template);
    let known_tables: Vec<&str> = analysis.map(|a| a.table_names()).unwrap_or_default();

    let mut valid = Vec::new();
    let mut warnings = Vec::new();

    for mut filter in filters {
        let param = filter.param_name.clone();

        if param.is_empty() {
            warnings.push("Removed a filter with no parameter name.".to_string());
            continue;
        }

        if filter.filter_type == FilterType::DateRange {
            let start_ok = placeholders.contains(&format!("{}_start", param));
            let end_ok = placeholders.contains(&format!("{}_end", param));
            if !start_ok && !end_ok {
                warnings.push(format!(
                    "Filter '{}' (date_range) has no matching :{}_start / :{}_end in the query - removed.",
                    param, param, param
                ));
                continue;
            }
        } else if !placeholders.contains(&param) {
            warnings.push(format!(
                "Filter '{}' has no matching :{} in the query - removed.",
                param, param
            ));
            continue;
        }

        if let Some(table) = filter.source_table.clone().filter(|t| !t.is_empty()) {
            if !known_tables.iter().any(|known| **known == table) {
                let mut warning = format!(
                    "Filter '{}': source_table '{}' not found - cleared.",
                    param, table
                );
                if let Some(suggestion) = closest_table(&table, &known_tables) {
                    warning.push_str(&format!(" Did you mean '{}'?", suggestion));
                }
                warnings.push(warning);
                filter.source_table = None;
                filter.source_column = None;
            }
        }

        filter.sort_order = valid.len() as i64;
        valid.push(filter);
    }

    (valid, warnings)
}

/// Closest known table name, when it is close enough to be a plausible
/// misspelling.
fn closest_table<'a>(candidate: &str, known: &[&'a str]) -> Option<&'a str> {
    known
        .iter()
        .map(|&name| (name, strsim::jaro_winkler(candidate, name)))
        .filter(|(_, score)| *score > 0.85)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(name, _)| name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AnalyzedTable;
    use serde_json::json;

    const TEMPLATE: &str = "SELECT * FROM orders o WHERE 1=1 \
        {% if status %} AND o.status = :status {% endif %} \
        {% if order_date_start %} AND o.orderDate >= :order_date_start {% endif %} \
        {% if order_date_end %} AND o.orderDate <= :order_date_end {% endif %}";

    fn filter(param: &str, filter_type: FilterType) -> FilterDef {
        serde_json::from_value(json!({
            "param_name": param,
            "label": param,
            "filter_type": serde_json::to_value(filter_type).unwrap(),
        }))
        .unwrap()
    }

    fn analysis_with_tables(names: &[&str]) -> SchemaAnalysis {
        SchemaAnalysis {
            tables: names
                .iter()
                .map(|name| AnalyzedTable {
                    name: name.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn keeps_filters_with_matching_placeholders() {
        let (valid, warnings) =
            validate_filters(vec![filter("status", FilterType::Select)], TEMPLATE, None);
        assert_eq!(valid.len(), 1);
        assert!(warnings.is_empty());
    }

    #[test]
    fn drops_filter_without_placeholder() {
        let (valid, warnings) =
            validate_filters(vec![filter("country", FilterType::Select)], TEMPLATE, None);
        assert!(valid.is_empty());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("country"));
    }

    #[test]
    fn date_range_checks_start_end_placeholders() {
        let (valid, _) = validate_filters(
            vec![filter("order_date", FilterType::DateRange)],
            TEMPLATE,
            None,
        );
        assert_eq!(valid.len(), 1);

        let (valid, warnings) = validate_filters(
            vec![filter("ship_date", FilterType::DateRange)],
            TEMPLATE,
            None,
        );
        assert!(valid.is_empty());
        assert!(warnings[0].contains("ship_date"));
    }

    #[test]
    fn unknown_source_table_is_cleared_with_suggestion() {
        let mut f = filter("status", FilterType::Select);
        f.source_table = Some("ordes".to_string());
        f.source_column = Some("status".to_string());

        let analysis = analysis_with_tables(&["orders", "customers"]);
        let (valid, warnings) = validate_filters(vec![f], TEMPLATE, Some(&analysis));

        assert_eq!(valid.len(), 1);
        assert!(valid[0].source_table.is_none());
        assert!(valid[0].source_column.is_none());
        assert!(warnings[0].contains("'ordes' not found"));
        assert!(warnings[0].contains("Did you mean 'orders'?"));
    }

    #[test]
    fn known_source_table_survives() {
        let mut f = filter("status", FilterType::Select);
        f.source_table = Some("orders".to_string());
        f.source_column = Some("status".to_string());

        let analysis = analysis_with_tables(&["orders"]);
        let (valid, warnings) = validate_filters(vec![f], TEMPLATE, Some(&analysis));
        assert_eq!(valid[0].source_table.as_deref(), Some("orders"));
        assert!(warnings.is_empty());
    }

    #[test]
    fn survivors_are_renumbered() {
        let (valid, _) = validate_filters(
            vec![
                filter("country", FilterType::Select),
                filter("status", FilterType::Select),
                filter("order_date", FilterType::DateRange),
            ],
            TEMPLATE,
            None,
        );
        assert_eq!(valid.len(), 2);
        assert_eq!(valid[0].sort_order, 0);
        assert_eq!(valid[1].sort_order, 1);
    }

    #[test]
    fn decode_skips_malformed_entries() {
        let value = json!({
            "filters": [
                {"param_name": "status", "filter_type": "select"},
                {"param_name": "bad", "filter_type": "no_such_type"},
            ]
        });
        let (filters, warnings) = decode_filters(&value);
        assert_eq!(filters.len(), 1);
        assert_eq!(warnings.len(), 1);
    }
}
