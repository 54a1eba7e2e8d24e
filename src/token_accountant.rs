//! Token accounting
//!
//! Tracks how many tokens a chat session has spent. Counts are approximate:
//! each message costs its content tokens plus a fixed framing overhead.

use serde::{Deserialize, Serialize};

use crate::protocol::ChatMessage;

/// Approximate per-message framing cost added by chat backends.
pub const MESSAGE_OVERHEAD_TOKENS: u64 = 4;

/// External tokenizer seam.
pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> u64;
}

/// Character-based estimate (~4 characters per token).
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count_tokens(&self, text: &str) -> u64 {
        (text.chars().count() as u64 + 3) / 4
    }
}

/// Session and file-context totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenLedger {
    pub session_tokens: u64,
    pub file_context_tokens: u64,
}

impl TokenLedger {
    pub fn total(&self) -> u64 {
        self.session_tokens.saturating_add(self.file_context_tokens)
    }
}

#[derive(Debug, Default)]
pub struct TokenAccountant {
    ledger: TokenLedger,
}

impl TokenAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_to_session(&mut self, turn_tokens: u64, file_context_tokens: u64) {
        self.ledger.session_tokens = self.ledger.session_tokens.saturating_add(turn_tokens);
        self.ledger.file_context_tokens = self
            .ledger
            .file_context_tokens
            .saturating_add(file_context_tokens);
    }

    /// Replace the attached file context. The change is applied as a delta
    /// and clamped at zero.
    pub fn set_file_context(&mut self, previous: u64, current: u64) {
        let delta = current as i128 - previous as i128;
        self.ledger.file_context_tokens = apply_delta(self.ledger.file_context_tokens, delta);
    }

    pub fn get_session_tokens(&self) -> u64 {
        self.ledger.session_tokens
    }

    pub fn ledger(&self) -> TokenLedger {
        self.ledger
    }

    pub fn reset_session(&mut self) {
        self.ledger = TokenLedger::default();
    }
}

fn apply_delta(value: u64, delta: i128) -> u64 {
    (value as i128 + delta).clamp(0, u64::MAX as i128) as u64
}

/// Tokens for one message including framing overhead.
pub fn message_tokens(counter: &dyn TokenCounter, message: &ChatMessage) -> u64 {
    counter.count_tokens(&message.content) + MESSAGE_OVERHEAD_TOKENS
}

/// Tokens for a prospective prompt.
pub fn count_conversation(counter: &dyn TokenCounter, messages: &[ChatMessage]) -> u64 {
    messages.iter().map(|m| message_tokens(counter, m)).sum()
}
