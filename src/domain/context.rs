use crate::domain::models::{ConversationTurn, Message, Role};

pub struct ContextBuilder;

impl ContextBuilder {
    /// Builds the outgoing message list for a turn: system prompt, the most
    /// recent `window` exchanges of history (two messages each), then the user
    /// text unless the history already ends with it.
    pub fn build(turn: &ConversationTurn, default_system_prompt: &str, window: usize) -> Vec<Message> {
        let system_prompt = turn
            .system_prompt
            .as_deref()
            .unwrap_or(default_system_prompt);

        let recent = Self::recent_history(&turn.history, window);

        let mut messages = Vec::with_capacity(recent.len() + 2);
        messages.push(Message::system(system_prompt));
        messages.extend(recent.iter().cloned());

        let already_last = recent
            .last()
            .is_some_and(|m| m.role == Role::User && m.content.as_deref() == Some(turn.user_text.as_str()));
        if !already_last {
            messages.push(Message::user(turn.user_text.clone()));
        }

        messages
    }

    /// The trailing `window * 2` messages of `history`.
    pub fn recent_history(history: &[Message], window: usize) -> &[Message] {
        let keep = window.saturating_mul(2);
        &history[history.len().saturating_sub(keep)..]
    }

    /// Rough token count used only for reporting. Words times 1.3, rounded up.
    pub fn estimate_tokens(text: &str) -> usize {
        let words = text.split_whitespace().count();
        (words * 13).div_ceil(10)
    }

    pub fn estimate_message_tokens(messages: &[Message]) -> usize {
        messages
            .iter()
            .filter_map(|m| m.content.as_deref())
            .map(Self::estimate_tokens)
            .sum()
    }
}
