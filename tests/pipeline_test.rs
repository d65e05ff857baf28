//! End-to-end pipeline tests driven by a scripted completion client.

use async_trait::async_trait;
use chartsmith::agents::SchemaAnalyzer;
use chartsmith::config::Settings;
use chartsmith::datasource::{SchemaProvider, SummaryStore};
use chartsmith::error::{PipelineError, Result};
use chartsmith::llm::{ChatMessage, CompletionClient};
use chartsmith::model::RawSchema;
use chartsmith::orchestrator::{AgentEvent, ChatRequest, Orchestrator};
use chartsmith::schema_cache::MemoryAnalysisStore;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Replays scripted JSON responses in order and records every request.
/// An exhausted script behaves like a completion failure.
struct MockClient {
    responses: Mutex<VecDeque<Value>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockClient {
    fn new(responses: Vec<Value>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn call(&self, index: usize) -> Vec<ChatMessage> {
        self.calls.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl CompletionClient for MockClient {
    async fn complete(&self, messages: &[ChatMessage], _temperature: f32) -> Result<Value> {
        self.calls.lock().unwrap().push(messages.to_vec());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| PipelineError::Completion("no scripted response left".to_string()))
    }
}

struct MockSchemaProvider;

#[async_trait]
impl SchemaProvider for MockSchemaProvider {
    async fn get_schema(&self, _data_source_id: &str) -> Result<RawSchema> {
        Ok(sample_schema())
    }
}

#[derive(Default)]
struct MockSummaryStore {
    saved: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl SummaryStore for MockSummaryStore {
    async fn save_summary(&self, widget_id: &str, summary: &str) -> Result<()> {
        self.saved
            .lock()
            .unwrap()
            .push((widget_id.to_string(), summary.to_string()));
        Ok(())
    }
}

fn sample_schema() -> RawSchema {
    serde_json::from_value(json!({
        "database": "classicmodels",
        "tables": [
            {
                "name": "orders",
                "columns": [
                    {"name": "orderNumber", "type": "INT", "primary_key": true},
                    {"name": "status", "type": "VARCHAR(15)"},
                    {"name": "orderDate", "type": "DATE"}
                ],
                "foreign_keys": []
            }
        ]
    }))
    .unwrap()
}

fn create_chart_routing() -> Value {
    json!({
        "intent": "create_chart",
        "needs_schema_analysis": true,
        "needs_query": true,
        "needs_filters": true,
        "needs_chart": true,
        "checklist": {
            "has_data_source": true,
            "has_metric": true,
            "has_dimension": true,
            "has_chart_type": false,
            "has_filters": false,
            "has_time_range": false
        },
        "summary": "User wants orders by status as a chart"
    })
}

fn analysis_response() -> Value {
    json!({
        "tables": [
            {"name": "orders", "description": "Customer orders", "key_columns": ["status"]}
        ],
        "suggested_metrics": ["Order count by status"],
        "notes": "Single-table schema"
    })
}

fn query_response() -> Value {
    json!({
        "query_template": "SELECT status, COUNT(*) AS order_count FROM orders WHERE 1=1 {% if status %} AND status = :status {% endif %} GROUP BY status",
        "explanation": "Counts orders per status.",
        "output_columns": [
            {"name": "status", "type": "string"},
            {"name": "order_count", "type": "number"}
        ]
    })
}

fn filter_response() -> Value {
    json!({
        "filters": [
            {
                "param_name": "status",
                "label": "Order status",
                "filter_type": "select",
                "source_table": "orders",
                "source_column": "status"
            }
        ],
        "explanation": "One dropdown over order status.",
        "warnings": []
    })
}

fn chart_response() -> Value {
    json!({
        "chart_type": "bar",
        "chart_config": {"x_axis": "status", "y_axis": "order_count"},
        "explanation": "Bars compare categories well."
    })
}

fn create_chart_request() -> ChatRequest {
    ChatRequest {
        user_message: "Show me orders by status".to_string(),
        chat_history: Vec::new(),
        schema: Some(sample_schema()),
        widget: None,
        data_source_id: Some("conn-1".to_string()),
    }
}

#[tokio::test]
async fn full_create_chart_run_merges_all_generators() {
    let mock = Arc::new(MockClient::new(vec![
        create_chart_routing(),
        analysis_response(),
        query_response(),
        filter_response(),
        chart_response(),
    ]));
    let orchestrator = Orchestrator::new(mock.clone(), Settings::default())
        .with_analysis_store(Arc::new(MemoryAnalysisStore::new()));

    let response = orchestrator.chat(create_chart_request()).await.unwrap();

    assert_eq!(mock.call_count(), 5);

    let update = response.widget_update.unwrap();
    assert!(update.query_template.unwrap().contains(":status"));
    assert_eq!(update.chart_type.as_deref(), Some("bar"));
    assert_eq!(update.chart_config.unwrap()["y_axis"], "order_count");

    assert_eq!(response.filters.len(), 1);
    assert_eq!(response.filters[0].param_name, "status");
    assert_eq!(response.filters[0].source_table.as_deref(), Some("orders"));

    let lines: Vec<&str> = response.message.lines().collect();
    assert!(lines[0].starts_with("Query:"));
    assert!(lines[1].starts_with("Chart:"));
    assert!(lines[2].starts_with("Filters:"));
}

#[tokio::test]
async fn missing_schema_is_introspected_through_provider() {
    let mock = Arc::new(MockClient::new(vec![
        create_chart_routing(),
        analysis_response(),
        query_response(),
        filter_response(),
        chart_response(),
    ]));
    let orchestrator = Orchestrator::new(mock.clone(), Settings::default())
        .with_schema_provider(Arc::new(MockSchemaProvider));

    let mut request = create_chart_request();
    request.schema = None;

    let response = orchestrator.chat(request).await.unwrap();

    // The provider supplied the schema, so the analysis step still ran.
    assert_eq!(mock.call_count(), 5);
    assert!(response.widget_update.is_some());
}

#[tokio::test]
async fn greeting_short_circuits_after_routing() {
    let mock = Arc::new(MockClient::new(vec![json!({
        "intent": "greeting",
        "needs_schema_analysis": false,
        "needs_query": false,
        "needs_filters": false,
        "needs_chart": false,
        "message": "Hello! Connect a database and describe a chart to get started.",
        "summary": "Greeting"
    })]));
    let orchestrator = Orchestrator::new(mock.clone(), Settings::default());

    let response = orchestrator
        .chat(ChatRequest {
            user_message: "hi there".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(mock.call_count(), 1);
    assert!(response.message.starts_with("Hello!"));
    assert!(response.widget_update.is_none());
    assert!(response.filters.is_empty());
}

#[tokio::test]
async fn unready_create_chart_asks_for_clarification() {
    let mock = Arc::new(MockClient::new(vec![json!({
        "intent": "create_chart",
        "needs_schema_analysis": true,
        "needs_query": true,
        "needs_filters": true,
        "needs_chart": true,
        "checklist": {
            "has_data_source": false,
            "has_metric": true,
            "has_dimension": true,
            "has_chart_type": true,
            "has_filters": true,
            "has_time_range": true
        },
        "summary": "User wants some chart"
    })]));
    let orchestrator = Orchestrator::new(mock.clone(), Settings::default());

    let response = orchestrator.chat(create_chart_request()).await.unwrap();

    // The router enforces the gate itself, so no generator ever runs.
    assert_eq!(mock.call_count(), 1);
    assert!(response.widget_update.is_none());
    assert!(response.message.contains("data source"));
}

#[tokio::test]
async fn router_failure_falls_back_conversationally() {
    let mock = Arc::new(MockClient::new(Vec::new()));
    let orchestrator = Orchestrator::new(mock.clone(), Settings::default());

    let response = orchestrator
        .chat(ChatRequest {
            user_message: "anything".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(mock.call_count(), 1);
    assert!(response.widget_update.is_none());
    assert!(response.message.contains("rephrase"));
}

#[tokio::test]
async fn failed_generators_degrade_with_notes() {
    // Routing succeeds, then the script runs dry: every generator fails.
    let mock = Arc::new(MockClient::new(vec![json!({
        "intent": "modify_all",
        "needs_schema_analysis": false,
        "needs_query": true,
        "needs_filters": true,
        "needs_chart": true,
        "summary": "Broad change requested"
    })]));
    let orchestrator = Orchestrator::new(mock.clone(), Settings::default());

    let response = orchestrator
        .chat(ChatRequest {
            user_message: "change everything".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(mock.call_count(), 4);
    assert!(response.widget_update.is_none());
    assert!(response.message.contains("Broad change requested"));
    assert!(response.message.contains("query generation failed"));
    assert!(response.message.contains("filter generation failed"));
    assert!(response.message.contains("chart configuration failed"));
}

#[tokio::test]
async fn schema_analysis_is_cached_by_content_hash() {
    let mock = Arc::new(MockClient::new(vec![analysis_response(), analysis_response()]));
    let analyzer = SchemaAnalyzer::new(mock.clone(), 0.3);
    let store = MemoryAnalysisStore::new();

    let schema = sample_schema();
    let first = analyzer.run(&schema, "conn-1", Some(&store)).await.unwrap();
    let second = analyzer.run(&schema, "conn-1", Some(&store)).await.unwrap();

    // Unchanged schema: one completion call total.
    assert_eq!(mock.call_count(), 1);
    assert_eq!(first.notes, second.notes);

    // A changed column type invalidates the entry.
    let mut altered = sample_schema();
    altered.tables[0].columns[1].data_type = "TEXT".to_string();
    analyzer.run(&altered, "conn-1", Some(&store)).await.unwrap();
    assert_eq!(mock.call_count(), 2);
}

#[tokio::test]
async fn long_history_is_summarized_before_routing() {
    let mock = Arc::new(MockClient::new(vec![
        json!({"summary": "The user built an order-status bar chart."}),
        json!({
            "intent": "question",
            "message": "It groups orders by their status.",
            "summary": "Question about the query"
        }),
    ]));
    let summary_store = Arc::new(MockSummaryStore::default());

    let settings = Settings { context_token_limit: 10, ..Default::default() };
    let orchestrator = Orchestrator::new(mock.clone(), settings)
        .with_summary_store(summary_store.clone());

    let chat_history: Vec<ChatMessage> = (0..6)
        .map(|i| ChatMessage::user(format!("m{} {}", i, "x".repeat(40))))
        .collect();

    let response = orchestrator
        .chat(ChatRequest {
            user_message: "what does the query do?".to_string(),
            chat_history,
            widget: Some(serde_json::from_value(json!({"id": "w1"})).unwrap()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(mock.call_count(), 2);
    assert_eq!(response.message, "It groups orders by their status.");

    // The router saw the compressed projection: summary + last 4 turns.
    let router_call = mock.call(1);
    assert!(router_call
        .iter()
        .any(|m| m.role == "system" && m.content.starts_with("[Conversation summary]")));
    assert!(router_call.iter().any(|m| m.content.starts_with("m5")));
    assert!(!router_call.iter().any(|m| m.content.starts_with("m0")));

    // The new summary was persisted for the widget.
    let saved = summary_store.saved.lock().unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].0, "w1");
    assert!(saved[0].1.contains("bar chart"));
}

#[tokio::test]
async fn stream_emits_ordered_events_with_final_result() {
    let mock = Arc::new(MockClient::new(vec![
        create_chart_routing(),
        analysis_response(),
        query_response(),
        filter_response(),
        chart_response(),
    ]));
    let orchestrator = Orchestrator::new(mock.clone(), Settings::default())
        .with_analysis_store(Arc::new(MemoryAnalysisStore::new()));

    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let response = orchestrator
        .chat_stream(create_chart_request(), tx)
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    let expected_agents = [
        "request_router",
        "schema_analyzer",
        "query_builder",
        "filter_builder",
        "chart_builder",
    ];

    // start/finish pairs per step, in order, then the result event.
    assert_eq!(events.len(), expected_agents.len() * 2 + 1);
    let mut last_step = 0;
    for (i, expected) in expected_agents.iter().enumerate() {
        match &events[i * 2] {
            AgentEvent::StepStarted { agent, step, .. } => {
                assert_eq!(agent, expected);
                assert!(*step > last_step);
                last_step = *step;
            }
            other => panic!("expected StepStarted, got {:?}", other),
        }
        match &events[i * 2 + 1] {
            AgentEvent::StepFinished { agent, step, .. } => {
                assert_eq!(agent, expected);
                assert_eq!(*step, last_step);
            }
            other => panic!("expected StepFinished, got {:?}", other),
        }
    }

    match events.last().unwrap() {
        AgentEvent::Result { response: streamed } => {
            // The streamed payload is the same structure the blocking
            // call returns.
            assert_eq!(streamed.message, response.message);
            assert_eq!(streamed.filters.len(), response.filters.len());
            assert_eq!(streamed.widget_update, response.widget_update);
        }
        other => panic!("expected Result, got {:?}", other),
    }
}

#[tokio::test]
async fn dropped_receiver_cancels_run_without_side_effects() {
    let mock = Arc::new(MockClient::new(vec![
        create_chart_routing(),
        analysis_response(),
        query_response(),
        filter_response(),
        chart_response(),
    ]));
    let orchestrator = Orchestrator::new(mock.clone(), Settings::default());

    let (tx, rx) = tokio::sync::mpsc::channel(1);
    drop(rx);

    let err = orchestrator
        .chat_stream(create_chart_request(), tx)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled));
    // Cancelled before the first step issued its completion call.
    assert_eq!(mock.call_count(), 0);
}
