use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{ChatMessage, ChatRole};

const TITLE_MAX_LEN: usize = 50;

/// Metadata about a conversation
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMetadata {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

impl ConversationMetadata {
    fn fresh() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: "New Conversation".to_string(),
            created_at: now,
            updated_at: now,
            message_count: 0,
        }
    }
}

/// Title from the first user message, cut at a word boundary.
pub fn generate_title(first_message: &str) -> String {
    let trimmed = first_message.trim();
    if trimmed.chars().count() <= TITLE_MAX_LEN {
        return trimmed.to_string();
    }

    let truncated: String = trimmed.chars().take(TITLE_MAX_LEN).collect();
    match truncated.rfind(' ') {
        Some(last_space) if last_space > 0 => format!("{}...", &truncated[..last_space]),
        _ => format!("{}...", truncated),
    }
}

/// Ordered prompt history of one panel. Holds at most one system message,
/// and only at index 0.
#[derive(Clone, Debug)]
pub struct ConversationHistory {
    messages: Vec<ChatMessage>,
    pub metadata: ConversationMetadata,
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            metadata: ConversationMetadata::fresh(),
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn has_system_prompt(&self) -> bool {
        self.messages
            .first()
            .is_some_and(|m| m.role == ChatRole::System)
    }

    /// Install the system prompt unless one is already present.
    /// Returns whether a message was added.
    pub fn ensure_system_prompt(&mut self, prompt: impl Into<String>) -> bool {
        if self.has_system_prompt() {
            return false;
        }
        self.messages.insert(0, ChatMessage::system(prompt));
        self.touch();
        true
    }

    /// Append a turn. A system message replaces the existing one at the
    /// front instead of being appended.
    pub fn push(&mut self, message: ChatMessage) {
        match message.role {
            ChatRole::System => {
                if self.has_system_prompt() {
                    self.messages[0] = message;
                } else {
                    self.messages.insert(0, message);
                }
            }
            ChatRole::User => {
                if !self.messages.iter().any(|m| m.role == ChatRole::User) {
                    self.metadata.title = generate_title(&message.content);
                }
                self.messages.push(message);
            }
            ChatRole::Assistant => self.messages.push(message),
        }
        self.touch();
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drop every turn but keep the conversation identity.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.touch();
    }

    /// Start over as a brand-new conversation.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn touch(&mut self) {
        self.metadata.message_count = self.messages.len();
        self.metadata.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_stays_first_and_unique() {
        let mut conv = ConversationHistory::new();
        conv.push(ChatMessage::user("hi"));
        assert!(conv.ensure_system_prompt("S"));
        assert!(!conv.ensure_system_prompt("S2"));

        conv.push(ChatMessage::system("S3"));
        let system_count = conv
            .messages()
            .iter()
            .filter(|m| m.role == ChatRole::System)
            .count();
        assert_eq!(system_count, 1);
        assert_eq!(conv.messages()[0], ChatMessage::system("S3"));
        assert_eq!(conv.messages()[1], ChatMessage::user("hi"));
    }

    #[test]
    fn test_title_from_first_user_message() {
        let mut conv = ConversationHistory::new();
        conv.ensure_system_prompt("S");
        conv.push(ChatMessage::user("Explain lifetimes"));
        conv.push(ChatMessage::assistant("Sure"));
        conv.push(ChatMessage::user("Another question"));
        assert_eq!(conv.metadata.title, "Explain lifetimes");
        assert_eq!(conv.metadata.message_count, 4);
    }

    #[test]
    fn test_generate_title_truncates_at_word_boundary() {
        let long = "How do I write an incremental parser that survives tags split across chunks";
        let title = generate_title(long);
        assert!(title.ends_with("..."));
        assert!(title.chars().count() <= TITLE_MAX_LEN + 3);
        assert!(!title.contains("chunks"));
        assert_eq!(generate_title("  short  "), "short");
    }

    #[test]
    fn test_reset_gives_new_identity() {
        let mut conv = ConversationHistory::new();
        let old_id = conv.metadata.id.clone();
        conv.push(ChatMessage::user("hello"));
        conv.reset();
        assert!(conv.is_empty());
        assert_ne!(conv.metadata.id, old_id);
        assert_eq!(conv.metadata.title, "New Conversation");
    }

    #[test]
    fn test_clear_keeps_identity() {
        let mut conv = ConversationHistory::new();
        let id = conv.metadata.id.clone();
        conv.push(ChatMessage::user("hello"));
        conv.clear();
        assert_eq!(conv.len(), 0);
        assert_eq!(conv.metadata.id, id);
    }
}
