//! Specialist agents.
//!
//! Each agent is a stateless service object holding a shared completion
//! client and its sampling temperature; one `run` issues exactly one
//! completion call (the schema analyzer may short-circuit via cache).
//! Model output is loosely structured JSON, so every agent decodes
//! defensively: missing fields become documented defaults instead of
//! being trusted.

pub mod chart;
pub mod filters;
pub mod query;
pub mod router;
pub mod schema;
pub mod summarizer;

pub use chart::ChartGenerator;
pub use filters::FilterGenerator;
pub use query::QueryGenerator;
pub use router::RequestRouter;
pub use schema::SchemaAnalyzer;
pub use summarizer::ContextSummarizer;

use crate::llm::ChatMessage;
use crate::model::{SchemaAnalysis, WidgetSnapshot};
use serde_json::Value;

/// How much history the router sees.
pub(crate) const ROUTER_HISTORY: usize = 6;

/// How much history the generators see.
pub(crate) const GENERATOR_HISTORY: usize = 4;

/// Context bundle shared by the three generators.
pub struct GenerationContext<'a> {
    pub user_message: &'a str,
    pub chat_history: &'a [ChatMessage],
    pub widget: Option<&'a WidgetSnapshot>,
    pub schema_analysis: Option<&'a SchemaAnalysis>,
    /// The router's one-line intent summary, prefixed to the user message.
    pub intent_summary: &'a str,
}

impl<'a> GenerationContext<'a> {
    /// The user message, prefixed with the router's intent summary when
    /// one is available.
    pub fn user_text(&self) -> String {
        if self.intent_summary.is_empty() {
            self.user_message.to_string()
        } else {
            format!("[Intent: {}]\n{}", self.intent_summary, self.user_message)
        }
    }

    pub fn recent_history(&self, n: usize) -> &'a [ChatMessage] {
        recent(self.chat_history, n)
    }
}

pub(crate) fn recent(history: &[ChatMessage], n: usize) -> &[ChatMessage] {
    &history[history.len().saturating_sub(n)..]
}

// ---------------------------------------------------------------------------
// Defensive field access over loosely-structured model output
// ---------------------------------------------------------------------------

pub(crate) fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

pub(crate) fn bool_field(value: &Value, key: &str, default: bool) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(default)
}

pub(crate) fn string_list_field(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_helpers_default_on_absence() {
        let value = json!({"name": "x", "flag": true, "list": ["a", 1, "b"]});
        assert_eq!(str_field(&value, "name"), "x");
        assert_eq!(str_field(&value, "missing"), "");
        assert!(bool_field(&value, "flag", false));
        assert!(bool_field(&value, "missing", true));
        assert_eq!(string_list_field(&value, "list"), vec!["a", "b"]);
        assert!(string_list_field(&value, "missing").is_empty());
    }

    #[test]
    fn recent_clamps_to_available() {
        let history = vec![ChatMessage::user("a"), ChatMessage::user("b")];
        assert_eq!(recent(&history, 4).len(), 2);
        assert_eq!(recent(&history, 1)[0].content, "b");
    }

    #[test]
    fn user_text_prefixes_intent() {
        let ctx = GenerationContext {
            user_message: "show revenue",
            chat_history: &[],
            widget: None,
            schema_analysis: None,
            intent_summary: "User wants a revenue chart",
        };
        assert_eq!(
            ctx.user_text(),
            "[Intent: User wants a revenue chart]\nshow revenue"
        );
    }
}
