//! Request router.
//!
//! Classifies the user's intent, decides which downstream agents run,
//! and enforces the readiness checklist for brand-new charts. Routing
//! wants to be fast and cheap, so the prompt is short and the
//! temperature low.

use crate::agents::{bool_field, recent, str_field, ROUTER_HISTORY};
use crate::llm::{ChatMessage, CompletionClient};
use crate::model::{Checklist, Intent, RoutingDecision, WidgetSnapshot};
use crate::prompts::ROUTER_PROMPT;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

pub struct RequestRouter {
    llm: Arc<dyn CompletionClient>,
    temperature: f32,
}

impl RequestRouter {
    pub fn new(llm: Arc<dyn CompletionClient>, temperature: f32) -> Self {
        Self { llm, temperature }
    }

    /// Produce a routing decision for one user message.
    ///
    /// Never fails: a completion failure or malformed response yields
    /// the conversational fallback decision (all flags false), and the
    /// readiness gate is applied to whatever the model returned rather
    /// than trusted from it.
    pub async fn run(
        &self,
        user_message: &str,
        chat_history: &[ChatMessage],
        widget: Option<&WidgetSnapshot>,
        has_connection: bool,
    ) -> RoutingDecision {
        let mut messages = vec![ChatMessage::system(ROUTER_PROMPT)];

        if let Some(widget) = widget {
            messages.push(ChatMessage::system(format!(
                "Current widget state:\n{}",
                widget.summary_text()
            )));
        }
        messages.push(ChatMessage::system(format!(
            "Database connected: {}",
            has_connection
        )));
        messages.extend(recent(chat_history, ROUTER_HISTORY).iter().cloned());
        messages.push(ChatMessage::user(user_message));

        let mut decision = match self.llm.complete(&messages, self.temperature).await {
            Ok(value) => decode_decision(&value),
            Err(e) => {
                warn!("router completion failed, falling back: {}", e);
                RoutingDecision::fallback()
            }
        };

        enforce_readiness(&mut decision);
        decision
    }
}

/// Decode a routing decision from loosely-structured model output.
///
/// Missing flags default to false; checklist fields default to true for
/// non-create intents (nothing to establish) and false for create_chart
/// (unproven readiness keeps the gate closed).
pub(crate) fn decode_decision(value: &Value) -> RoutingDecision {
    let intent = value
        .get("intent")
        .and_then(Value::as_str)
        .map(Intent::parse)
        .unwrap_or(Intent::CreateChart);

    let checklist_default = intent != Intent::CreateChart;
    let empty = Value::Null;
    let checklist_value = value.get("checklist").unwrap_or(&empty);
    let checklist = Checklist {
        has_data_source: bool_field(checklist_value, "has_data_source", checklist_default),
        has_metric: bool_field(checklist_value, "has_metric", checklist_default),
        has_dimension: bool_field(checklist_value, "has_dimension", checklist_default),
        has_chart_type: bool_field(checklist_value, "has_chart_type", checklist_default),
        has_filters: bool_field(checklist_value, "has_filters", checklist_default),
        has_time_range: bool_field(checklist_value, "has_time_range", checklist_default),
    };

    RoutingDecision {
        intent,
        needs_schema_analysis: bool_field(value, "needs_schema_analysis", false),
        needs_query: bool_field(value, "needs_query", false),
        needs_filters: bool_field(value, "needs_filters", false),
        needs_chart: bool_field(value, "needs_chart", false),
        needs_clarification: bool_field(value, "needs_clarification", false),
        checklist,
        message: str_field(value, "message"),
        summary: str_field(value, "summary"),
    }
}

/// Apply the readiness gate and the clarification invariant.
///
/// The gate lives here, not in the prompt: models routinely omit
/// needs_clarification, so the router recomputes it from the required
/// checklist fields instead of trusting the model's own flag.
pub(crate) fn enforce_readiness(decision: &mut RoutingDecision) {
    if decision.intent == Intent::CreateChart && !decision.checklist.required_ok() {
        decision.needs_clarification = true;
    }

    if decision.needs_clarification {
        decision.needs_schema_analysis = false;
        decision.needs_query = false;
        decision.needs_filters = false;
        decision.needs_chart = false;
        if decision.message.is_empty() {
            decision.message = clarification_question(&decision.checklist);
        }
    }
}

fn clarification_question(checklist: &Checklist) -> String {
    let mut missing = Vec::new();
    if !checklist.has_data_source {
        missing.push("which data source to use");
    }
    if !checklist.has_metric {
        missing.push("what metric to measure");
    }
    if !checklist.has_dimension {
        missing.push("how to group or break it down");
    }
    if missing.is_empty() {
        "Could you tell me a bit more about the chart you have in mind?".to_string()
    } else {
        format!(
            "Before I can build that chart, could you tell me {}?",
            missing.join(" and ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_fills_missing_flags_with_false() {
        let decision = decode_decision(&json!({"intent": "modify_chart"}));
        assert_eq!(decision.intent, Intent::ModifyChart);
        assert!(!decision.needs_query);
        assert!(!decision.needs_chart);
        assert_eq!(decision.summary, "");
        // Non-create intents default the checklist to true.
        assert!(decision.checklist.required_ok());
    }

    #[test]
    fn decode_defaults_checklist_false_for_create() {
        let decision = decode_decision(&json!({"intent": "create_chart", "needs_query": true}));
        assert!(!decision.checklist.has_data_source);
    }

    #[test]
    fn gate_forces_clarification_when_data_source_missing() {
        let mut decision = decode_decision(&json!({
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
            }
        }));
        enforce_readiness(&mut decision);
        assert!(decision.needs_clarification);
        assert!(!decision.needs_query);
        assert!(!decision.needs_filters);
        assert!(!decision.needs_chart);
        assert!(!decision.needs_schema_analysis);
        assert!(!decision.message.is_empty());
    }

    #[test]
    fn gate_leaves_ready_create_alone() {
        let mut decision = decode_decision(&json!({
            "intent": "create_chart",
            "needs_query": true,
            "needs_filters": true,
            "needs_chart": true,
            "checklist": Checklist::all(true)
        }));
        enforce_readiness(&mut decision);
        assert!(!decision.needs_clarification);
        assert!(decision.needs_query);
    }

    #[test]
    fn model_clarification_flag_clears_generation() {
        let mut decision = decode_decision(&json!({
            "intent": "modify_query",
            "needs_query": true,
            "needs_clarification": true,
            "message": "Which table did you mean?"
        }));
        enforce_readiness(&mut decision);
        assert!(!decision.needs_query);
        assert_eq!(decision.message, "Which table did you mean?");
    }

    #[test]
    fn fallback_routes_nothing() {
        let mut decision = RoutingDecision::fallback();
        enforce_readiness(&mut decision);
        assert!(!decision.needs_generation());
        assert!(!decision.needs_clarification);
    }
}
