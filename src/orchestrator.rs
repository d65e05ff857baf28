//! Pipeline orchestrator.
//!
//! Coordinates the multi-agent pipeline:
//!
//! 1. Context summarizer (only when history exceeds the token budget)
//! 2. Request router (always)
//! 3. Schema analyzer (cached)
//! 4. Query builder
//! 5. Filter builder
//! 6. Chart builder
//!
//! The routing decision is turned into an explicit step-plan once, then
//! iterated; skipped steps are never entered. Two invocation modes share
//! the same code path: a blocking call returning the merged result, and
//! an incremental call that additionally pushes typed progress events
//! over a channel. Dropping the event receiver cancels the run between
//! steps; partial results are discarded, never merged.

use crate::agents::{
    recent, ChartGenerator, ContextSummarizer, FilterGenerator, GenerationContext, QueryGenerator,
    RequestRouter, SchemaAnalyzer,
};
use crate::agents::summarizer::estimate_tokens;
use crate::config::Settings;
use crate::error::{PipelineError, Result};
use crate::llm::{ChatMessage, CompletionClient};
use crate::model::{
    ChartResult, ChatResponse, FilterResult, OutputColumn, QueryResult, RawSchema,
    RoutingDecision, WidgetSnapshot, WidgetUpdate,
};
use crate::datasource::{SchemaProvider, SummaryStore};
use crate::schema_cache::AnalysisStore;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Messages kept verbatim after a summarization pass.
const SUMMARY_TAIL: usize = 4;

/// Reply when routing could not determine anything actionable.
const FALLBACK_MESSAGE: &str =
    "I could not work out what to change. Could you rephrase your request?";

/// One orchestration request. The history is caller-owned context and is
/// never mutated; summarization only affects the projection fed to the
/// agents.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub user_message: String,
    pub chat_history: Vec<ChatMessage>,
    pub schema: Option<RawSchema>,
    pub widget: Option<WidgetSnapshot>,
    pub data_source_id: Option<String>,
}

/// Progress notification emitted by the incremental mode.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    StepStarted {
        agent: &'static str,
        label: &'static str,
        step: u32,
    },
    StepFinished {
        agent: &'static str,
        step: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    Result {
        #[serde(flatten)]
        response: ChatResponse,
    },
    Error {
        message: String,
    },
}

/// Top-level pipeline state machine.
///
/// Agents are stateless singletons constructed once and shared across
/// concurrent runs; the only shared mutable state lives behind the
/// analysis/summary stores, which are keyed by identity and upsert-safe.
pub struct Orchestrator {
    settings: Settings,
    router: RequestRouter,
    schema_analyzer: SchemaAnalyzer,
    query_generator: QueryGenerator,
    filter_generator: FilterGenerator,
    chart_generator: ChartGenerator,
    summarizer: ContextSummarizer,
    analysis_store: Option<Arc<dyn AnalysisStore>>,
    summary_store: Option<Arc<dyn SummaryStore>>,
    schema_provider: Option<Arc<dyn SchemaProvider>>,
}

impl Orchestrator {
    pub fn new(llm: Arc<dyn CompletionClient>, settings: Settings) -> Self {
        Self {
            router: RequestRouter::new(Arc::clone(&llm), settings.router_temperature),
            schema_analyzer: SchemaAnalyzer::new(Arc::clone(&llm), settings.schema_temperature),
            query_generator: QueryGenerator::new(Arc::clone(&llm), settings.query_temperature),
            filter_generator: FilterGenerator::new(Arc::clone(&llm), settings.filter_temperature),
            chart_generator: ChartGenerator::new(Arc::clone(&llm), settings.chart_temperature),
            summarizer: ContextSummarizer::new(Arc::clone(&llm), settings.summarizer_temperature),
            settings,
            analysis_store: None,
            summary_store: None,
            schema_provider: None,
        }
    }

    /// Attach a schema-analysis cache.
    pub fn with_analysis_store(mut self, store: Arc<dyn AnalysisStore>) -> Self {
        self.analysis_store = Some(store);
        self
    }

    /// Attach durable storage for conversation summaries.
    pub fn with_summary_store(mut self, store: Arc<dyn SummaryStore>) -> Self {
        self.summary_store = Some(store);
        self
    }

    /// Attach a schema introspector, used to fetch the raw schema when a
    /// request names a data source but carries no schema of its own.
    pub fn with_schema_provider(mut self, provider: Arc<dyn SchemaProvider>) -> Self {
        self.schema_provider = Some(provider);
        self
    }

    /// Run the full pipeline and return the merged result.
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        self.run(request, None).await
    }

    /// Incremental variant: emits progress events while running, ending
    /// with a `Result` event whose payload equals the blocking return
    /// value. A dropped receiver cancels the run at the next step
    /// boundary.
    pub async fn chat_stream(
        &self,
        request: ChatRequest,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<ChatResponse> {
        match self.run(request, Some(&events)).await {
            Ok(response) => Ok(response),
            Err(e) => {
                if !matches!(e, PipelineError::Cancelled) {
                    let _ = events
                        .send(AgentEvent::Error { message: e.to_string() })
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        request: ChatRequest,
        events: Option<&mpsc::Sender<AgentEvent>>,
    ) -> Result<ChatResponse> {
        let run_id = Uuid::new_v4();
        let mut request = request;

        // A request may name a data source without carrying its schema;
        // introspect through the provider when one is attached. Failure
        // just means running without schema context.
        if request.schema.is_none() {
            if let (Some(id), Some(provider)) =
                (request.data_source_id.as_deref(), &self.schema_provider)
            {
                match provider.get_schema(id).await {
                    Ok(schema) => request.schema = Some(schema),
                    Err(e) => warn!(%run_id, "schema introspection failed for {}: {}", id, e),
                }
            }
        }

        let has_connection = request.data_source_id.is_some() && request.schema.is_some();
        let mut step: u32 = 0;

        // ---- 0. Summarize when the context is too long ----------------
        let history = self.maybe_summarize(&request, events, &mut step).await?;

        // ---- 1. Request router ----------------------------------------
        step += 1;
        emit(events, AgentEvent::StepStarted {
            agent: "request_router",
            label: "Analyzing request...",
            step,
        })
        .await?;
        let routing = self
            .router
            .run(&request.user_message, &history, request.widget.as_ref(), has_connection)
            .await;
        info!(
            %run_id,
            intent = ?routing.intent,
            query = routing.needs_query,
            filters = routing.needs_filters,
            chart = routing.needs_chart,
            schema = routing.needs_schema_analysis,
            "routing decided"
        );
        emit(events, AgentEvent::StepFinished {
            agent: "request_router",
            step,
            summary: Some(routing.summary.clone()).filter(|s| !s.is_empty()),
        })
        .await?;

        // Greeting / question / clarification: nothing to generate.
        if !routing.needs_generation() {
            let response = conversational_response(&routing);
            emit(events, AgentEvent::Result { response: response.clone() }).await?;
            return Ok(response);
        }

        let plan = build_step_plan(&routing, request.schema.is_some());

        let mut analysis = None;
        let mut query_result: Option<QueryResult> = None;
        let mut filter_result: Option<FilterResult> = None;
        let mut chart_result: Option<ChartResult> = None;
        let mut query_template: String = request
            .widget
            .as_ref()
            .and_then(|w| w.query_template.clone())
            .unwrap_or_default();
        let mut output_columns: Vec<OutputColumn> = Vec::new();
        let mut notes: Vec<String> = Vec::new();

        for kind in &plan {
            step += 1;
            match kind {
                PipelineStep::SchemaAnalysis => {
                    emit(events, AgentEvent::StepStarted {
                        agent: "schema_analyzer",
                        label: "Analyzing database schema...",
                        step,
                    })
                    .await?;
                    let schema = request.schema.as_ref().expect("plan requires schema");
                    let id = request.data_source_id.as_deref().unwrap_or("");
                    match self
                        .schema_analyzer
                        .run(schema, id, self.analysis_store.as_deref())
                        .await
                    {
                        Ok(a) => analysis = Some(a),
                        Err(e) => {
                            warn!(%run_id, "schema analysis failed: {}", e);
                            notes.push(
                                "Note: schema analysis was unavailable for this request."
                                    .to_string(),
                            );
                        }
                    }
                    emit(events, AgentEvent::StepFinished {
                        agent: "schema_analyzer",
                        step,
                        summary: None,
                    })
                    .await?;
                }
                PipelineStep::Query => {
                    emit(events, AgentEvent::StepStarted {
                        agent: "query_builder",
                        label: "Building SQL query...",
                        step,
                    })
                    .await?;
                    let ctx = GenerationContext {
                        user_message: &request.user_message,
                        chat_history: &history,
                        widget: request.widget.as_ref(),
                        schema_analysis: analysis.as_ref(),
                        intent_summary: &routing.summary,
                    };
                    match self.query_generator.run(&ctx).await {
                        Ok(result) => {
                            if !result.query_template.is_empty() {
                                query_template = result.query_template.clone();
                            }
                            output_columns = result.output_columns.clone();
                            query_result = Some(result);
                        }
                        Err(e) => {
                            warn!(%run_id, "query generation failed: {}", e);
                            notes.push(
                                "Note: query generation failed; the existing query was kept."
                                    .to_string(),
                            );
                        }
                    }
                    emit(events, AgentEvent::StepFinished {
                        agent: "query_builder",
                        step,
                        summary: None,
                    })
                    .await?;
                }
                PipelineStep::Filters => {
                    emit(events, AgentEvent::StepStarted {
                        agent: "filter_builder",
                        label: "Designing filters...",
                        step,
                    })
                    .await?;
                    let ctx = GenerationContext {
                        user_message: &request.user_message,
                        chat_history: &history,
                        widget: request.widget.as_ref(),
                        schema_analysis: analysis.as_ref(),
                        intent_summary: &routing.summary,
                    };
                    match self.filter_generator.run(&ctx, &query_template).await {
                        Ok(result) => filter_result = Some(result),
                        Err(e) => {
                            warn!(%run_id, "filter generation failed: {}", e);
                            notes.push(
                                "Note: filter generation failed; filters were left unchanged."
                                    .to_string(),
                            );
                        }
                    }
                    emit(events, AgentEvent::StepFinished {
                        agent: "filter_builder",
                        step,
                        summary: None,
                    })
                    .await?;
                }
                PipelineStep::Chart => {
                    emit(events, AgentEvent::StepStarted {
                        agent: "chart_builder",
                        label: "Configuring chart...",
                        step,
                    })
                    .await?;
                    let ctx = GenerationContext {
                        user_message: &request.user_message,
                        chat_history: &history,
                        widget: request.widget.as_ref(),
                        schema_analysis: analysis.as_ref(),
                        intent_summary: &routing.summary,
                    };
                    match self.chart_generator.run(&ctx, &output_columns).await {
                        Ok(result) => chart_result = Some(result),
                        Err(e) => {
                            warn!(%run_id, "chart generation failed: {}", e);
                            notes.push(
                                "Note: chart configuration failed; the chart was left as is."
                                    .to_string(),
                            );
                        }
                    }
                    emit(events, AgentEvent::StepFinished {
                        agent: "chart_builder",
                        step,
                        summary: None,
                    })
                    .await?;
                }
            }
        }

        // ---- Merge -----------------------------------------------------
        let mut response = merge(
            &routing,
            query_result.as_ref(),
            filter_result.as_ref(),
            chart_result.as_ref(),
        );
        if !notes.is_empty() {
            let trailer = notes.join("\n");
            if response.message.is_empty() {
                response.message = trailer;
            } else {
                response.message = format!("{}\n{}", response.message, trailer);
            }
        }

        emit(events, AgentEvent::Result { response: response.clone() }).await?;
        Ok(response)
    }

    /// Compress the history when its estimated token count exceeds the
    /// configured budget. Returns the effective history for downstream
    /// steps: `[summary system message] + last messages` after
    /// compression, the caller's history untouched otherwise.
    async fn maybe_summarize(
        &self,
        request: &ChatRequest,
        events: Option<&mpsc::Sender<AgentEvent>>,
        step: &mut u32,
    ) -> Result<Vec<ChatMessage>> {
        let tokens = estimate_tokens(&request.chat_history);
        if tokens <= self.settings.context_token_limit {
            return Ok(request.chat_history.clone());
        }

        info!(
            "context too long ({} tokens > {}), running summarizer",
            tokens, self.settings.context_token_limit
        );
        *step += 1;
        emit(events, AgentEvent::StepStarted {
            agent: "summarizer",
            label: "Compressing chat context...",
            step: *step,
        })
        .await?;

        let previous = request
            .widget
            .as_ref()
            .and_then(|w| w.chat_summary.clone())
            .unwrap_or_default();

        let summary = match self.summarizer.run(&request.chat_history, &previous).await {
            Ok(summary) => summary,
            Err(e) => {
                // Degrade to the full history; the individual agents
                // bound how much of it they actually send.
                warn!("summarization failed, keeping full history: {}", e);
                emit(events, AgentEvent::StepFinished {
                    agent: "summarizer",
                    step: *step,
                    summary: None,
                })
                .await?;
                return Ok(request.chat_history.clone());
            }
        };

        if let (Some(store), Some(widget_id)) = (
            &self.summary_store,
            request.widget.as_ref().and_then(|w| w.id.as_deref()),
        ) {
            if let Err(e) = store.save_summary(widget_id, &summary).await {
                warn!("failed to persist chat summary: {}", e);
            }
        }

        let mut compressed = vec![ChatMessage::system(format!(
            "[Conversation summary]\n{}",
            summary
        ))];
        compressed.extend(recent(&request.chat_history, SUMMARY_TAIL).iter().cloned());

        emit(events, AgentEvent::StepFinished {
            agent: "summarizer",
            step: *step,
            summary: Some("Compressed chat context".to_string()),
        })
        .await?;

        Ok(compressed)
    }
}

/// Push an event; a closed channel means the caller went away, which
/// cancels the run.
async fn emit(events: Option<&mpsc::Sender<AgentEvent>>, event: AgentEvent) -> Result<()> {
    if let Some(tx) = events {
        tx.send(event).await.map_err(|_| PipelineError::Cancelled)?;
    }
    Ok(())
}

/// Ordered generation steps enabled by one routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineStep {
    SchemaAnalysis,
    Query,
    Filters,
    Chart,
}

fn build_step_plan(routing: &RoutingDecision, schema_available: bool) -> Vec<PipelineStep> {
    let mut plan = Vec::new();
    if routing.needs_schema_analysis && schema_available {
        plan.push(PipelineStep::SchemaAnalysis);
    }
    if routing.needs_query {
        plan.push(PipelineStep::Query);
    }
    if routing.needs_filters {
        plan.push(PipelineStep::Filters);
    }
    if routing.needs_chart {
        plan.push(PipelineStep::Chart);
    }
    plan
}

/// Response for routing outcomes that need no generation.
fn conversational_response(routing: &RoutingDecision) -> ChatResponse {
    let message = if !routing.message.is_empty() {
        routing.message.clone()
    } else if !routing.summary.is_empty() {
        routing.summary.clone()
    } else {
        FALLBACK_MESSAGE.to_string()
    };
    ChatResponse { message, widget_update: None, filters: Vec::new() }
}

/// Combine whichever generator results ran into the canonical response.
///
/// The query template and chart type/config update their widget fields;
/// a filter result replaces the filter list outright. Explanations
/// concatenate in step order (query, chart, filters, then filter
/// warnings); with no generator output the message falls back to the
/// router's summary.
fn merge(
    routing: &RoutingDecision,
    query_result: Option<&QueryResult>,
    filter_result: Option<&FilterResult>,
    chart_result: Option<&ChartResult>,
) -> ChatResponse {
    let mut update = WidgetUpdate::default();
    let mut filters = Vec::new();
    let mut explanations: Vec<String> = Vec::new();

    if let Some(q) = query_result {
        if !q.query_template.is_empty() {
            update.query_template = Some(q.query_template.clone());
        }
        if !q.explanation.is_empty() {
            explanations.push(format!("Query: {}", q.explanation));
        }
    }

    if let Some(c) = chart_result {
        if !c.chart_type.is_empty() {
            update.chart_type = Some(c.chart_type.clone());
        }
        if c.chart_config.as_object().is_some_and(|o| !o.is_empty()) {
            update.chart_config = Some(c.chart_config.clone());
        }
        if !c.explanation.is_empty() {
            explanations.push(format!("Chart: {}", c.explanation));
        }
    }

    if let Some(f) = filter_result {
        filters = f.filters.clone();
        if !f.explanation.is_empty() {
            explanations.push(format!("Filters: {}", f.explanation));
        }
        for warning in &f.warnings {
            explanations.push(format!("Warning: {}", warning));
        }
    }

    let message = if explanations.is_empty() {
        if routing.summary.is_empty() {
            "Done.".to_string()
        } else {
            routing.summary.clone()
        }
    } else {
        explanations.join("\n")
    };

    ChatResponse {
        message,
        widget_update: if update.is_empty() { None } else { Some(update) },
        filters,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Intent;
    use serde_json::json;

    fn routing_with(summary: &str) -> RoutingDecision {
        let mut routing = RoutingDecision::fallback();
        routing.summary = summary.to_string();
        routing
    }

    #[test]
    fn plan_honours_flags_and_schema_presence() {
        let mut routing = RoutingDecision::fallback();
        routing.intent = Intent::CreateChart;
        routing.needs_schema_analysis = true;
        routing.needs_query = true;
        routing.needs_filters = true;
        routing.needs_chart = true;

        let plan = build_step_plan(&routing, true);
        assert_eq!(
            plan,
            vec![
                PipelineStep::SchemaAnalysis,
                PipelineStep::Query,
                PipelineStep::Filters,
                PipelineStep::Chart
            ]
        );

        // No schema available: the analysis step is skipped, not no-op'd.
        let plan = build_step_plan(&routing, false);
        assert_eq!(
            plan,
            vec![PipelineStep::Query, PipelineStep::Filters, PipelineStep::Chart]
        );
    }

    #[test]
    fn merge_orders_explanations() {
        let query = QueryResult {
            query_template: "SELECT 1".to_string(),
            explanation: "counts rows".to_string(),
            output_columns: Vec::new(),
        };
        let chart = ChartResult {
            chart_type: "bar".to_string(),
            chart_config: json!({"x_axis": "a"}),
            explanation: "bars compare".to_string(),
        };
        let filter = FilterResult {
            filters: Vec::new(),
            explanation: "one filter".to_string(),
            warnings: vec!["something was dropped".to_string()],
        };

        let response = merge(&routing_with(""), Some(&query), Some(&filter), Some(&chart));
        let lines: Vec<&str> = response.message.lines().collect();
        assert!(lines[0].starts_with("Query:"));
        assert!(lines[1].starts_with("Chart:"));
        assert!(lines[2].starts_with("Filters:"));
        assert!(lines[3].starts_with("Warning:"));

        let update = response.widget_update.unwrap();
        assert_eq!(update.query_template.as_deref(), Some("SELECT 1"));
        assert_eq!(update.chart_type.as_deref(), Some("bar"));
        assert!(update.chart_config.is_some());
    }

    #[test]
    fn merge_falls_back_to_summary_then_generic() {
        let response = merge(&routing_with("User asked about charts"), None, None, None);
        assert_eq!(response.message, "User asked about charts");
        assert!(response.widget_update.is_none());

        let response = merge(&routing_with(""), None, None, None);
        assert_eq!(response.message, "Done.");
    }

    #[test]
    fn filters_replace_outright() {
        let filter = FilterResult {
            filters: serde_json::from_value(json!([
                {"param_name": "status", "filter_type": "select"}
            ]))
            .unwrap(),
            explanation: String::new(),
            warnings: Vec::new(),
        };
        let response = merge(&routing_with(""), None, Some(&filter), None);
        assert_eq!(response.filters.len(), 1);
        assert_eq!(response.filters[0].param_name, "status");
    }

    #[test]
    fn conversational_response_prefers_message() {
        let mut routing = routing_with("summary text");
        routing.message = "Hello!".to_string();
        assert_eq!(conversational_response(&routing).message, "Hello!");

        routing.message.clear();
        assert_eq!(conversational_response(&routing).message, "summary text");

        routing.summary.clear();
        assert_eq!(conversational_response(&routing).message, FALLBACK_MESSAGE);
    }
}
