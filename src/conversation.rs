//! Per-session turn history.

use serde::Serialize;

pub const GREETING: &str = "How can I help you?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Ordered history. Never empty: it starts with, and resets to, a single
/// assistant greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    turns: Vec<ConversationTurn>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self {
            turns: vec![ConversationTurn::assistant(GREETING)],
        }
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    pub fn reset(&mut self) -> &[ConversationTurn] {
        *self = Self::default();
        &self.turns
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.turns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_with_greeting() {
        let conversation = Conversation::new();
        assert_eq!(conversation.history(), [ConversationTurn::assistant(GREETING)]);
    }

    #[test]
    fn test_append_keeps_order_and_reset_restores_greeting() {
        let mut conversation = Conversation::new();
        conversation.append(ConversationTurn::user("list students"));
        conversation.append(ConversationTurn::assistant("Aditya, Vaidehi"));
        assert_eq!(conversation.history().len(), 3);
        assert_eq!(conversation.history()[1].role, Role::User);

        let after = conversation.reset();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].role, Role::Assistant);
        assert_eq!(after[0].content, GREETING);
    }

    #[test]
    fn test_turn_serialization() {
        let json = serde_json::to_string(&ConversationTurn::user("hi")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"hi"}"#);
    }
}
