//! Shared data model for the widget-generation pipeline.
//!
//! Raw schema shapes mirror what a schema introspector produces; the
//! routing / generator result types mirror the JSON the agents ask the
//! model to return, with defaults everywhere so a sparse response still
//! decodes.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Raw schema (from the SchemaProvider collaborator)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSchema {
    pub database: String,
    #[serde(default)]
    pub tables: Vec<SchemaTable>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaTable {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<SchemaColumn>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub referred_table: String,
    #[serde(default)]
    pub referred_columns: Vec<String>,
}

// ---------------------------------------------------------------------------
// Semantic schema analysis (produced by the schema analyzer, cached)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaAnalysis {
    #[serde(default)]
    pub tables: Vec<AnalyzedTable>,
    #[serde(default)]
    pub join_paths: Vec<JoinPath>,
    #[serde(default)]
    pub suggested_metrics: Vec<String>,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzedTable {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub key_columns: Vec<String>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(default)]
    pub to: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub join: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinPath {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sql: String,
}

impl SchemaAnalysis {
    /// Known table names, for validating filter sources.
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }
}

// ---------------------------------------------------------------------------
// Widget state
// ---------------------------------------------------------------------------

/// Interactive filter attached to a widget's query template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterDef {
    pub param_name: String,
    #[serde(default)]
    pub label: String,
    pub filter_type: FilterType,
    #[serde(default)]
    pub source_table: Option<String>,
    #[serde(default)]
    pub source_column: Option<String>,
    #[serde(default)]
    pub options_query: Option<String>,
    #[serde(default)]
    pub default_value: Option<Value>,
    /// Type-specific settings, e.g. `{min, max, step}` for sliders.
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
    /// Static options, used when no dynamic source is configured.
    #[serde(default)]
    pub options: Vec<OptionItem>,
    #[serde(default)]
    pub sort_order: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    Select,
    Text,
    Number,
    Date,
    DateRange,
    Slider,
}

/// One selectable option for a select-type filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionItem {
    pub value: String,
    pub label: String,
}

/// Read-only projection of the widget being configured.
///
/// Supplied by the storage collaborator; never mutated by the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WidgetSnapshot {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub chart_type: Option<String>,
    #[serde(default)]
    pub query_template: Option<String>,
    #[serde(default)]
    pub chart_config: Option<Value>,
    #[serde(default)]
    pub filters: Vec<FilterDef>,
    /// Summary of earlier conversation turns, carried across sessions.
    #[serde(default)]
    pub chat_summary: Option<String>,
}

impl WidgetSnapshot {
    /// Compact multi-line description fed to the router so it knows what
    /// already exists.
    pub fn summary_text(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(ct) = self.chart_type.as_deref().filter(|s| !s.is_empty()) {
            parts.push(format!("chart_type: {}", ct));
        }
        if let Some(qt) = self.query_template.as_deref().filter(|s| !s.is_empty()) {
            parts.push(format!("query_template: {}", qt));
        }
        if let Some(cc) = &self.chart_config {
            parts.push(format!("chart_config: {}", cc));
        }
        if !self.filters.is_empty() {
            let labels = self
                .filters
                .iter()
                .map(|f| {
                    if f.label.is_empty() {
                        f.param_name.as_str()
                    } else {
                        f.label.as_str()
                    }
                })
                .join(", ");
            parts.push(format!("filters: {}", labels));
        }
        if parts.is_empty() {
            "Empty widget".to_string()
        } else {
            parts.join("\n")
        }
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    CreateChart,
    ModifyQuery,
    ModifyChart,
    ModifyFilters,
    ModifyAll,
    Question,
    Greeting,
}

impl Intent {
    /// Lenient parse; anything unrecognized is treated as `create_chart`,
    /// the most conservative interpretation (it routes through the
    /// readiness gate).
    pub fn parse(raw: &str) -> Self {
        match raw {
            "create_chart" => Intent::CreateChart,
            "modify_query" => Intent::ModifyQuery,
            "modify_chart" => Intent::ModifyChart,
            "modify_filters" => Intent::ModifyFilters,
            "modify_all" => Intent::ModifyAll,
            "question" => Intent::Question,
            "greeting" => Intent::Greeting,
            _ => Intent::CreateChart,
        }
    }
}

/// Readiness checklist for a brand-new chart. The first three fields are
/// required before generation may proceed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Checklist {
    pub has_data_source: bool,
    pub has_metric: bool,
    pub has_dimension: bool,
    pub has_chart_type: bool,
    pub has_filters: bool,
    pub has_time_range: bool,
}

impl Checklist {
    pub fn all(value: bool) -> Self {
        Self {
            has_data_source: value,
            has_metric: value,
            has_dimension: value,
            has_chart_type: value,
            has_filters: value,
            has_time_range: value,
        }
    }

    /// The required fields that gate `create_chart`.
    pub fn required_ok(&self) -> bool {
        self.has_data_source && self.has_metric && self.has_dimension
    }
}

/// Output of the request router: which specialists run, and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub intent: Intent,
    pub needs_schema_analysis: bool,
    pub needs_query: bool,
    pub needs_filters: bool,
    pub needs_chart: bool,
    pub needs_clarification: bool,
    pub checklist: Checklist,
    /// Direct reply, set when no generation is needed (greeting, question,
    /// clarification).
    pub message: String,
    /// One-line restatement of what the user wants.
    pub summary: String,
}

impl RoutingDecision {
    /// Safe decision used when the completion failed or was malformed:
    /// nothing runs, and the orchestrator answers conversationally.
    pub fn fallback() -> Self {
        Self {
            intent: Intent::Question,
            needs_schema_analysis: false,
            needs_query: false,
            needs_filters: false,
            needs_chart: false,
            needs_clarification: false,
            checklist: Checklist::all(true),
            message: String::new(),
            summary: String::new(),
        }
    }

    /// True when at least one generation step is enabled.
    pub fn needs_generation(&self) -> bool {
        self.needs_query || self.needs_filters || self.needs_chart
    }
}

// ---------------------------------------------------------------------------
// Generator results
// ---------------------------------------------------------------------------

/// Column produced by the generated query, used for chart axis mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputColumn {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub data_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub query_template: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub output_columns: Vec<OutputColumn>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterResult {
    #[serde(default)]
    pub filters: Vec<FilterDef>,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartResult {
    pub chart_type: String,
    pub chart_config: Value,
    pub explanation: String,
}

// ---------------------------------------------------------------------------
// Merged response
// ---------------------------------------------------------------------------

/// Field-level widget changes produced by one orchestration run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WidgetUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_config: Option<Value>,
}

impl WidgetUpdate {
    pub fn is_empty(&self) -> bool {
        self.chart_type.is_none() && self.query_template.is_none() && self.chart_config.is_none()
    }
}

/// Final merged result of one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: String,
    pub widget_update: Option<WidgetUpdate>,
    pub filters: Vec<FilterDef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_widget_summary() {
        let widget = WidgetSnapshot::default();
        assert_eq!(widget.summary_text(), "Empty widget");
    }

    #[test]
    fn widget_summary_lists_filter_labels() {
        let widget = WidgetSnapshot {
            chart_type: Some("bar".to_string()),
            filters: vec![
                FilterDef {
                    param_name: "status".to_string(),
                    label: "Order status".to_string(),
                    filter_type: FilterType::Select,
                    source_table: None,
                    source_column: None,
                    options_query: None,
                    default_value: None,
                    config: Default::default(),
                    options: Vec::new(),
                    sort_order: 0,
                },
                FilterDef {
                    param_name: "limit".to_string(),
                    label: String::new(),
                    filter_type: FilterType::Number,
                    source_table: None,
                    source_column: None,
                    options_query: None,
                    default_value: None,
                    config: Default::default(),
                    options: Vec::new(),
                    sort_order: 1,
                },
            ],
            ..Default::default()
        };
        let text = widget.summary_text();
        assert!(text.contains("chart_type: bar"));
        assert!(text.contains("filters: Order status, limit"));
    }

    #[test]
    fn intent_parse_defaults_to_create() {
        assert_eq!(Intent::parse("modify_chart"), Intent::ModifyChart);
        assert_eq!(Intent::parse("something_else"), Intent::CreateChart);
    }

    #[test]
    fn filter_type_round_trips_snake_case() {
        let json = serde_json::to_string(&FilterType::DateRange).unwrap();
        assert_eq!(json, "\"date_range\"");
        let back: FilterType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, FilterType::DateRange);
    }
}
