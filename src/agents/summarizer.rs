//! Chat-context summarizer.
//!
//! Compresses long conversations into a short narrative summary so the
//! downstream agents stay inside the token budget. The trigger policy
//! (when to summarize, what the compressed history looks like) belongs
//! to the orchestrator; this agent only produces the summary text.

use crate::agents::str_field;
use crate::error::Result;
use crate::llm::{ChatMessage, CompletionClient};
use crate::prompts::SUMMARIZER_PROMPT;
use std::sync::Arc;

/// Rough estimate: one token per four characters.
const CHARS_PER_TOKEN: usize = 4;

/// Estimated token count of a message list.
pub fn estimate_tokens(messages: &[ChatMessage]) -> usize {
    let total_chars: usize = messages.iter().map(|m| m.content.len()).sum();
    total_chars / CHARS_PER_TOKEN
}

pub struct ContextSummarizer {
    llm: Arc<dyn CompletionClient>,
    temperature: f32,
}

impl ContextSummarizer {
    pub fn new(llm: Arc<dyn CompletionClient>, temperature: f32) -> Self {
        Self { llm, temperature }
    }

    /// Summarise the full history, folding in the previous summary so
    /// early turns are not lost across repeated compressions.
    pub async fn run(&self, chat_history: &[ChatMessage], previous_summary: &str) -> Result<String> {
        let mut messages = vec![ChatMessage::system(SUMMARIZER_PROMPT)];

        if !previous_summary.is_empty() {
            messages.push(ChatMessage::system(format!(
                "Previous conversation summary:\n{}",
                previous_summary
            )));
        }

        let conversation: Vec<String> = chat_history
            .iter()
            .map(|m| format!("{}: {}", m.role.to_uppercase(), m.content))
            .collect();
        messages.push(ChatMessage::user(format!(
            "Summarise this conversation:\n\n{}",
            conversation.join("\n")
        )));

        let value = self.llm.complete(&messages, self.temperature).await?;
        Ok(str_field(&value, "summary"))
    }
}
