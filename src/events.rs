//! Panel message contract
//!
//! Inbound `PanelEvent`s come from a chat panel; outbound `PanelNotification`s
//! go back to it. Both serialize as `{"type": "<kind>", ...}` objects with
//! camelCase fields so any postMessage-style channel can carry them.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::capabilities::CapabilitiesSnapshot;
use crate::token_accountant::TokenLedger;
use crate::tools::ToolResult;

/// Notification kinds as constants to prevent typos
pub mod event_names {
    pub const START_STREAM: &str = "startStream";
    pub const STREAM_CHUNK: &str = "streamChunk";
    pub const THINKING_CHUNK: &str = "thinkingChunk";
    pub const END_STREAM: &str = "endStream";
    pub const STOPPED_STREAM: &str = "stoppedStream";
    pub const EARLY_END: &str = "earlyEnd";
    pub const SESSION_TOKEN_UPDATE: &str = "sessionTokenUpdate";
    pub const TOOL_RESULT: &str = "toolResult";
    pub const CAPABILITIES: &str = "capabilities";
}

/// Event received from a chat panel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PanelEvent {
    #[serde(rename = "sendToAI", rename_all = "camelCase")]
    SendToAi {
        message: String,
        #[serde(default)]
        mode: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_context: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
    StopGeneration,
    NewSession,
    ToggleCapability { key: String, value: bool },
    InsertCode { message: String },
}

/// Notification sent to a chat panel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PanelNotification {
    StartStream,
    StreamChunk { message: String },
    ThinkingChunk { message: String },
    EndStream,
    StoppedStream,
    EarlyEnd { reason: String },
    #[serde(rename_all = "camelCase")]
    SessionTokenUpdate {
        session_tokens: u64,
        file_context_tokens: u64,
        total_tokens: u64,
    },
    ToolResult(ToolResult),
    Capabilities(CapabilitiesSnapshot),
}

impl PanelNotification {
    pub fn token_update(ledger: TokenLedger) -> Self {
        PanelNotification::SessionTokenUpdate {
            session_tokens: ledger.session_tokens,
            file_context_tokens: ledger.file_context_tokens,
            total_tokens: ledger.total(),
        }
    }

    /// Whether this ends a request (exactly one per request)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PanelNotification::EndStream
                | PanelNotification::StoppedStream
                | PanelNotification::EarlyEnd { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PanelNotification::StartStream => event_names::START_STREAM,
            PanelNotification::StreamChunk { .. } => event_names::STREAM_CHUNK,
            PanelNotification::ThinkingChunk { .. } => event_names::THINKING_CHUNK,
            PanelNotification::EndStream => event_names::END_STREAM,
            PanelNotification::StoppedStream => event_names::STOPPED_STREAM,
            PanelNotification::EarlyEnd { .. } => event_names::EARLY_END,
            PanelNotification::SessionTokenUpdate { .. } => event_names::SESSION_TOKEN_UPDATE,
            PanelNotification::ToolResult(_) => event_names::TOOL_RESULT,
            PanelNotification::Capabilities(_) => event_names::CAPABILITIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PanelId(Uuid);

impl PanelId {
    pub fn new() -> Self {
        PanelId(Uuid::new_v4())
    }
}

impl Default for PanelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PanelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sending side of one panel's notification channel.
#[derive(Debug, Clone)]
pub struct PanelHandle {
    id: PanelId,
    tx: mpsc::UnboundedSender<PanelNotification>,
}

impl PanelHandle {
    pub fn new(id: PanelId, tx: mpsc::UnboundedSender<PanelNotification>) -> Self {
        Self { id, tx }
    }

    /// New panel with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PanelNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(PanelId::new(), tx), rx)
    }

    pub fn id(&self) -> PanelId {
        self.id
    }

    /// Returns false once the panel has gone away.
    pub fn notify(&self, notification: PanelNotification) -> bool {
        match self.tx.send(notification) {
            Ok(()) => true,
            Err(e) => {
                debug!(panel = %self.id, kind = e.0.kind(), "panel closed, dropping notification");
                false
            }
        }
    }
}
