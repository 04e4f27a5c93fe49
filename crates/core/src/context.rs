//! Prompt assembly bounded by a character budget.

use crate::chunking::{char_len, sentence_prefix, truncate_at_sentence};
use crate::config::Settings;
use crate::models::{ConversationTurn, RetrievedResult, Role};
use tracing::{debug, warn};

pub const NOT_AVAILABLE: &str = "The answer is not available in the provided books.";

const SEPARATOR: &str = "\n\n";
const HISTORY_WINDOW: usize = 5;
const HISTORY_TURNS: usize = 4;

const INSTRUCTIONS: &str = "You are a knowledgeable and concise assistant. Answer the question based on the provided context and conversation history.
- If the question is about the conversation history or your previous response, answer based on the conversation history.
- For questions about the books, try to provide a relevant answer based on the context, even if it's not a direct match.
- Use clear, professional language and format your response in markdown where appropriate.
- If you cannot find any relevant information in the context or history, respond with: \"The answer is not available in the provided books.\"";

const HEDGING: &str =
    "- If unsure or partially confident, indicate your confidence level (e.g., \"Based on limited context...\").";

/// Join retrieved texts with blank lines within `max_length` characters.
///
/// The first text that does not fit contributes only its whole leading
/// sentences that fit the remaining budget; everything after it is dropped.
pub fn build_context(retrieved: &[RetrievedResult], max_length: usize) -> String {
    let mut context = String::new();
    let mut used = 0usize;

    for result in retrieved {
        let text = result.text.trim();
        if text.is_empty() {
            continue;
        }

        let separator = if context.is_empty() { 0 } else { SEPARATOR.len() };
        let len = char_len(text);

        if used + separator + len <= max_length {
            if separator > 0 {
                context.push_str(SEPARATOR);
            }
            context.push_str(text);
            used += separator + len;
            continue;
        }

        let remaining = max_length.saturating_sub(used + separator);
        if let Some(fragment) = sentence_prefix(text, remaining) {
            let fragment = fragment.trim();
            if !fragment.is_empty() {
                if separator > 0 {
                    context.push_str(SEPARATOR);
                }
                context.push_str(fragment);
            }
        }
        break;
    }

    debug!(chars = char_len(&context), "built context");
    context
}

/// Format recent turns, most recent assistant reply first.
pub fn build_history(turns: &[ConversationTurn], max_length: usize) -> String {
    if turns.is_empty() {
        return String::new();
    }

    let last_response = turns
        .iter()
        .rev()
        .find(|turn| turn.role == Role::Assistant)
        .map(|turn| turn.content.as_str())
        .filter(|content| !content.is_empty());

    let mut lines = Vec::new();
    if let Some(response) = last_response {
        lines.push(format!("Assistant (Previous Response): {response}"));
    }

    let window = &turns[turns.len().saturating_sub(HISTORY_WINDOW)..];
    let recent: Vec<&ConversationTurn> = window
        .iter()
        .filter(|turn| !(turn.role == Role::Assistant && Some(turn.content.as_str()) == last_response))
        .collect();
    let skip = recent.len().saturating_sub(HISTORY_TURNS);
    lines.extend(
        recent[skip..]
            .iter()
            .map(|turn| format!("{}: {}", turn.role.label(), turn.content)),
    );

    let history = lines.join("\n");
    let history = truncate_at_sentence(&history, max_length);
    debug!(chars = char_len(&history), "built history");
    history
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
    /// Context was re-truncated and the hedging line removed to fit the
    /// token budget.
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PromptBuilder {
    pub context_chars: usize,
    pub history_chars: usize,
    pub token_budget: usize,
    pub fallback_context_chars: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self {
            context_chars: 2_000,
            history_chars: 1_000,
            token_budget: 4_000,
            fallback_context_chars: 1_000,
        }
    }
}

impl From<&Settings> for PromptBuilder {
    fn from(settings: &Settings) -> Self {
        Self {
            context_chars: settings.context_chars,
            history_chars: settings.history_chars,
            token_budget: settings.token_budget,
            ..Self::default()
        }
    }
}

impl PromptBuilder {
    pub fn build(
        &self,
        question: &str,
        retrieved: &[RetrievedResult],
        history: &[ConversationTurn],
    ) -> Prompt {
        let context = build_context(retrieved, self.context_chars);
        let history = build_history(history, self.history_chars);

        let text = render(question, &context, &history, true);
        if estimate_tokens(&text) <= self.token_budget as f64 {
            return Prompt {
                text,
                degraded: false,
            };
        }

        warn!(
            tokens = estimate_tokens(&text),
            budget = self.token_budget,
            "prompt exceeds token budget, truncating context"
        );
        let context = truncate_at_sentence(&context, self.fallback_context_chars);
        Prompt {
            text: render(question, &context, &history, false),
            degraded: true,
        }
    }
}

/// Roughly four characters per token.
pub fn estimate_tokens(text: &str) -> f64 {
    char_len(text) as f64 * 0.25
}

fn render(question: &str, context: &str, history: &str, hedge: bool) -> String {
    let mut prompt = String::from(INSTRUCTIONS);
    if hedge {
        prompt.push('\n');
        prompt.push_str(HEDGING);
    }
    prompt.push_str(&format!(
        "\n\n**Conversation History**:\n{history}\n\n**Context from Books**:\n{context}\n\n**Question**:\n{question}\n\n**Answer**:\n"
    ));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn result(text: impl Into<String>) -> RetrievedResult {
        RetrievedResult {
            text: text.into(),
            metadata: Map::new(),
            score: 1.0,
        }
    }

    fn sentence_of(len: usize) -> String {
        let mut text = "a".repeat(len - 1);
        text.push('.');
        text
    }

    #[test]
    fn context_keeps_only_first_chunk_when_next_cannot_fit_a_sentence() {
        let retrieved = vec![
            result(sentence_of(1_800)),
            result(sentence_of(500)),
            result(sentence_of(100)),
        ];
        let context = build_context(&retrieved, 2_000);
        assert_eq!(context, sentence_of(1_800));
    }

    #[test]
    fn overflowing_chunk_contributes_leading_sentences() {
        let retrieved = vec![
            result("First chunk fits."),
            result("Short lead. Then a much longer trailing sentence that will not fit."),
            result("Never reached."),
        ];
        let context = build_context(&retrieved, 35);
        assert_eq!(context, "First chunk fits.\n\nShort lead.");
    }

    #[test]
    fn context_never_exceeds_budget() {
        let retrieved: Vec<_> = (0..20)
            .map(|index| result(format!("Sentence {index} is here. Another one follows.")))
            .collect();
        for budget in [0, 10, 50, 120, 400] {
            assert!(char_len(&build_context(&retrieved, budget)) <= budget);
        }
    }

    #[test]
    fn history_places_last_assistant_reply_first() {
        let turns = vec![
            ConversationTurn::user("What is a pump?"),
            ConversationTurn::assistant("A device that moves fluid."),
            ConversationTurn::user("And a valve?"),
        ];
        let history = build_history(&turns, 1_000);
        let lines: Vec<&str> = history.lines().collect();
        assert_eq!(lines[0], "Assistant (Previous Response): A device that moves fluid.");
        assert_eq!(lines[1], "User: What is a pump?");
        assert_eq!(lines[2], "User: And a valve?");
    }

    #[test]
    fn history_does_not_repeat_last_assistant_reply() {
        let turns = vec![
            ConversationTurn::user("Question one?"),
            ConversationTurn::assistant("X"),
        ];
        let history = build_history(&turns, 1_000);
        assert_eq!(history.matches('X').count(), 1);
    }

    #[test]
    fn history_keeps_at_most_four_recent_turns() {
        let turns: Vec<_> = (0..10)
            .map(|index| ConversationTurn::user(format!("question {index}")))
            .collect();
        let history = build_history(&turns, 1_000);
        assert_eq!(
            history.lines().collect::<Vec<_>>(),
            vec!["User: question 6", "User: question 7", "User: question 8", "User: question 9"]
        );
    }

    #[test]
    fn history_is_truncated_to_budget() {
        let turns = vec![ConversationTurn::assistant("Long answer. ".repeat(200))];
        assert!(char_len(&build_history(&turns, 100)) <= 100);
        assert!(build_history(&[], 100).is_empty());
    }

    #[test]
    fn prompt_within_budget_keeps_hedging_line() {
        let prompt = PromptBuilder::default().build("Why?", &[result("Because.")], &[]);
        assert!(!prompt.degraded);
        assert!(prompt.text.contains("confidence level"));
        assert!(prompt.text.contains("**Question**:\nWhy?"));
    }

    #[test]
    fn oversized_prompt_degrades_context_and_drops_hedging() {
        let builder = PromptBuilder {
            token_budget: 100,
            ..PromptBuilder::default()
        };
        let long = "Fact number one is stated here. ".repeat(60);
        let prompt = builder.build("Why?", &[result(long)], &[]);

        assert!(prompt.degraded);
        assert!(!prompt.text.contains("confidence level"));
        let context = prompt
            .text
            .split("**Context from Books**:\n")
            .nth(1)
            .and_then(|rest| rest.split("\n\n**Question**").next())
            .unwrap_or_default();
        assert!(char_len(context) <= 1_000);
    }
}
