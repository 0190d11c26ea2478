//! Thread context builder: session entries in, completion request out.

use parley_agent::tokens;
use parley_agent::{ChatRequest, Message, Role};
use tracing::debug;

use crate::session::ChatSession;

/// Token budget for the prompt part of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    /// Model context window.
    pub window: u32,
    /// Tokens kept free for the completion.
    pub reserve: u32,
}

impl Budget {
    pub fn prompt_limit(&self) -> u32 {
        self.window.saturating_sub(self.reserve)
    }
}

/// Assemble the request for a session: one leading system entry (when the
/// preset has one) followed by the conversation in order, trimmed to the
/// prompt budget.
pub fn build_request(session: &ChatSession, budget: Budget) -> ChatRequest {
    let bot = session.participants().bot;
    let mut req = session.options.request_template();

    if let Some(system) = session.options.system_message(bot) {
        req.messages.push(Message::system(system));
    }
    req.messages
        .extend(session.entries().iter().map(|e| e.message.clone()));

    let dropped = truncate(&mut req.messages, budget.prompt_limit());
    if dropped > 0 {
        debug!(
            thread = session.thread_id(),
            dropped,
            limit = budget.prompt_limit(),
            "trimmed conversation to fit the context window"
        );
    }
    req
}

/// Drop the oldest entries after the leading system entry until the
/// estimate fits `limit`. Returns how many were dropped.
pub fn truncate(messages: &mut Vec<Message>, limit: u32) -> usize {
    let keep = usize::from(messages.first().is_some_and(|m| m.role == Role::System));
    let mut estimate = tokens::estimate_messages(messages);
    let mut dropped = 0;

    while estimate > limit && messages.len() > keep {
        let removed = messages.remove(keep);
        estimate -= tokens::estimate_message(&removed);
        dropped += 1;
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_system_and_newest() {
        let mut messages = vec![
            Message::system("rules"),
            Message::user("a".repeat(400)),
            Message::assistant("b".repeat(400)),
            Message::user("latest"),
        ];
        let limit = 100;
        let dropped = truncate(&mut messages, limit);

        assert_eq!(dropped, 2);
        assert_eq!(messages[0], Message::system("rules"));
        assert_eq!(messages[1], Message::user("latest"));
        assert!(tokens::estimate_messages(&messages) <= limit);
    }

    #[test]
    fn truncate_noop_within_budget() {
        let mut messages = vec![Message::system("rules"), Message::user("hi")];
        assert_eq!(truncate(&mut messages, 1_000), 0);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn truncate_without_system_entry() {
        let mut messages = vec![Message::user("x".repeat(800)), Message::user("y")];
        truncate(&mut messages, 20);
        assert_eq!(messages, vec![Message::user("y")]);
    }

    #[test]
    fn prompt_limit_saturates() {
        let budget = Budget {
            window: 100,
            reserve: 500,
        };
        assert_eq!(budget.prompt_limit(), 0);
    }
}
