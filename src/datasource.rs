//! Interfaces to the target data source and widget persistence.
//!
//! The pipeline never talks to a database directly: schema introspection
//! and query execution are behind narrow traits, and this module only
//! builds the SQL those collaborators run. Filter-option lookups support
//! a custom options query (wrapped in a subquery for safe search/limit),
//! a simple `SELECT DISTINCT`, and static option lists.

use crate::error::{PipelineError, Result};
use crate::model::{FilterDef, FilterType, OptionItem, RawSchema, WidgetSnapshot};
use crate::safety::{validate_identifier, validate_statement};
use crate::template::render_query;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Schema introspection for a configured data source.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn get_schema(&self, data_source_id: &str) -> Result<RawSchema>;
}

/// Read-only query execution against a configured data source.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(
        &self,
        data_source_id: &str,
        sql: &str,
        params: &HashMap<String, Value>,
    ) -> Result<Vec<HashMap<String, Value>>>;
}

/// Durable storage for a widget's conversation summary.
#[async_trait]
pub trait SummaryStore: Send + Sync {
    async fn save_summary(&self, widget_id: &str, summary: &str) -> Result<()>;
}

/// Parameter names a widget's declared filters allow. Query-string
/// params outside this set are ignored so callers cannot inject
/// arbitrary bind names.
pub fn allowed_params(filters: &[FilterDef]) -> HashSet<String> {
    let mut allowed = HashSet::new();
    for filter in filters {
        if filter.filter_type == FilterType::DateRange {
            allowed.insert(format!("{}_start", filter.param_name));
            allowed.insert(format!("{}_end", filter.param_name));
        } else {
            allowed.insert(filter.param_name.clone());
        }
    }
    allowed
}

/// Keep only the raw params the widget's filters declare.
pub fn restrict_params(
    raw: &HashMap<String, Value>,
    filters: &[FilterDef],
) -> HashMap<String, Value> {
    let allowed = allowed_params(filters);
    raw.iter()
        .filter(|(name, _)| allowed.contains(*name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Render a widget's template against caller params and execute it.
///
/// Params are projected onto the declared filters, the template is
/// rendered, and the rendered SQL must pass the statement-safety
/// validator before it reaches the executor.
pub async fn execute_widget_query(
    executor: &dyn QueryExecutor,
    data_source_id: &str,
    widget: &WidgetSnapshot,
    raw_params: &HashMap<String, Value>,
) -> Result<Vec<HashMap<String, Value>>> {
    let template = widget
        .query_template
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| PipelineError::Execution("widget has no query template".to_string()))?;

    let params = restrict_params(raw_params, &widget.filters);
    let (sql, bound) = render_query(template, &params)?;
    validate_statement(&sql)?;
    executor.execute(data_source_id, &sql, &bound).await
}

/// Fetch options for a select-type filter, with optional server-side
/// search. `cap` is the configured hard ceiling and wins over the
/// caller's limit.
pub async fn fetch_filter_options(
    executor: &dyn QueryExecutor,
    data_source_id: &str,
    filter: &FilterDef,
    search: Option<&str>,
    limit: usize,
    cap: usize,
) -> Result<Vec<OptionItem>> {
    let limit = limit.min(cap);

    if let Some(options_query) = filter.options_query.as_deref().filter(|q| !q.is_empty()) {
        return run_options_query(executor, data_source_id, options_query, search, limit).await;
    }

    if let (Some(table), Some(column)) = (
        filter.source_table.as_deref().filter(|t| !t.is_empty()),
        filter.source_column.as_deref().filter(|c| !c.is_empty()),
    ) {
        return run_simple_distinct(executor, data_source_id, table, column, search, limit).await;
    }

    // Static options stored on the filter itself.
    let mut options: Vec<OptionItem> = filter.options.clone();
    if let Some(term) = search.filter(|t| !t.is_empty()) {
        let term = term.to_lowercase();
        options.retain(|o| o.label.to_lowercase().contains(&term));
    }
    options.truncate(limit);
    Ok(options)
}

/// Wrap a custom options query so search and limit apply safely:
///
/// ```sql
/// SELECT _opts.value, _opts.label FROM (<inner>) AS _opts
/// [WHERE _opts.label LIKE :search] ORDER BY _opts.label LIMIT :limit
/// ```
async fn run_options_query(
    executor: &dyn QueryExecutor,
    data_source_id: &str,
    options_query: &str,
    search: Option<&str>,
    limit: usize,
) -> Result<Vec<OptionItem>> {
    validate_statement(options_query)?;
    let inner = options_query.trim().trim_end_matches(';').trim_end();

    let mut params: HashMap<String, Value> = HashMap::new();
    params.insert("limit".to_string(), Value::from(limit as i64));

    let mut where_clause = String::new();
    if let Some(term) = search.filter(|t| !t.is_empty()) {
        where_clause = "WHERE _opts.label LIKE :search ".to_string();
        params.insert("search".to_string(), Value::from(format!("%{}%", term)));
    }

    let sql = format!(
        "SELECT _opts.value, _opts.label FROM ({}) AS _opts {}ORDER BY _opts.label LIMIT :limit",
        inner, where_clause
    );

    let rows = executor.execute(data_source_id, &sql, &params).await?;
    Ok(rows
        .iter()
        .map(|row| OptionItem {
            value: scalar_to_string(row.get("value")),
            label: scalar_to_string(row.get("label")),
        })
        .collect())
}

/// `SELECT DISTINCT` from a single validated table/column pair.
async fn run_simple_distinct(
    executor: &dyn QueryExecutor,
    data_source_id: &str,
    table: &str,
    column: &str,
    search: Option<&str>,
    limit: usize,
) -> Result<Vec<OptionItem>> {
    validate_identifier(table)?;
    validate_identifier(column)?;

    let mut params: HashMap<String, Value> = HashMap::new();
    params.insert("limit".to_string(), Value::from(limit as i64));

    let mut where_clause = String::new();
    if let Some(term) = search.filter(|t| !t.is_empty()) {
        where_clause = format!("WHERE `{}`.`{}` LIKE :search ", table, column);
        params.insert("search".to_string(), Value::from(format!("%{}%", term)));
    }

    let sql = format!(
        "SELECT DISTINCT `{table}`.`{column}` FROM `{table}` {where_clause}ORDER BY `{table}`.`{column}` LIMIT :limit",
        table = table,
        column = column,
        where_clause = where_clause,
    );

    let rows = executor.execute(data_source_id, &sql, &params).await?;
    Ok(rows
        .iter()
        .map(|row| {
            let text = scalar_to_string(row.get(column));
            OptionItem { value: text.clone(), label: text }
        })
        .collect())
}

fn scalar_to_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}
