//! Request Router
//!
//! Picks the backend adapter for a model id, sends the conversation, and
//! turns the raw chunk stream into panel notifications through a fresh
//! `StreamParser`. Every request routed to a panel ends with exactly one
//! terminal notification: `endStream`, `stoppedStream` or `earlyEnd`.
//!
//! The router also owns the per-panel cancellation registry. Beginning a
//! request on a panel cancels whatever that panel had in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::conversation::ConversationHistory;
use crate::error::{ChatError, ChatResult, NO_OUTPUT_PLACEHOLDER};
use crate::events::{PanelHandle, PanelId, PanelNotification};
use crate::models::registry::{self, ModelInfo};
use crate::models::{BackendAdapter, BackendKind};
use crate::protocol::{ChatMessage, ChatRole, StreamErrorKind, StreamEvent};
use crate::stream_parser::StreamParser;
use crate::tools::ToolDispatcher;

pub struct RouteRequest<'a> {
    pub model: &'a str,
    pub conversation: &'a mut ConversationHistory,
    pub cancellation: CancellationToken,
    /// Panel receiving the stream; `None` means a blocking call
    pub destination: Option<&'a PanelHandle>,
}

/// Cancellation entry for the request currently live on a panel
#[derive(Debug, Clone)]
pub struct ActiveRequest {
    id: u64,
    pub token: CancellationToken,
}

enum Outcome {
    Completed,
    Aborted,
    Failed(ChatError),
}

pub struct Router {
    adapters: HashMap<BackendKind, Arc<dyn BackendAdapter>>,
    default_backend: BackendKind,
    streaming: bool,
    dispatcher: Arc<ToolDispatcher>,
    active: Mutex<HashMap<PanelId, ActiveRequest>>,
    next_request_id: AtomicU64,
}

impl Router {
    pub fn new(default_backend: BackendKind, dispatcher: Arc<ToolDispatcher>) -> Self {
        Self {
            adapters: HashMap::new(),
            default_backend,
            streaming: true,
            dispatcher,
            active: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn BackendAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn default_backend(&self) -> BackendKind {
        self.default_backend
    }

    pub fn adapters(&self) -> Vec<Arc<dyn BackendAdapter>> {
        let mut adapters: Vec<_> = self.adapters.values().cloned().collect();
        adapters.sort_by_key(|a| a.kind().to_string());
        adapters
    }

    pub async fn list_models(&self) -> Vec<ModelInfo> {
        registry::list_all(&self.adapters()).await
    }

    /// Adapter for a model id, plus the id with any backend prefix removed.
    pub fn resolve<'m>(&self, model: &'m str) -> ChatResult<(Arc<dyn BackendAdapter>, &'m str)> {
        let (kind, name) = BackendKind::split_model_id(model);
        let kind = kind.unwrap_or(self.default_backend);
        let adapter = self
            .adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| ChatError::config(format!("no {} backend is configured", kind)))?;
        Ok((adapter, name))
    }

    // === Per-panel cancellation registry ===

    fn active_map(&self) -> std::sync::MutexGuard<'_, HashMap<PanelId, ActiveRequest>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new request for `panel`, cancelling the one it supersedes.
    pub fn begin_request(&self, panel: PanelId) -> ActiveRequest {
        let request = ActiveRequest {
            id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        };
        if let Some(previous) = self.active_map().insert(panel, request.clone()) {
            debug!(panel = %panel, "superseding in-flight request");
            previous.token.cancel();
        }
        request
    }

    /// Cancel the panel's live request. Returns whether there was one.
    pub fn cancel(&self, panel: PanelId) -> bool {
        match self.active_map().get(&panel) {
            Some(request) => {
                request.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the registry entry if it still belongs to `request`.
    pub fn release(&self, panel: PanelId, request: &ActiveRequest) {
        let mut active = self.active_map();
        if active.get(&panel).is_some_and(|current| current.id == request.id) {
            active.remove(&panel);
        }
    }

    pub fn dispose_panel(&self, panel: PanelId) {
        if let Some(request) = self.active_map().remove(&panel) {
            request.token.cancel();
        }
    }

    pub fn active_requests(&self) -> usize {
        self.active_map().len()
    }

    // === Routing ===

    /// Without a destination, returns the complete response text. With one,
    /// streams into the panel and returns `None`; failures are reported to
    /// the panel rather than returned.
    pub async fn route(&self, request: RouteRequest<'_>) -> ChatResult<Option<String>> {
        let RouteRequest {
            model,
            conversation,
            cancellation,
            destination,
        } = request;

        let resolved = self.resolve(model);
        let Some(panel) = destination else {
            let (adapter, model_name) = resolved?;
            let messages = adapter_messages(adapter.kind(), conversation.messages());
            return match adapter.send_complete(model_name, &messages, &cancellation).await {
                Ok(text) => Ok(Some(text)),
                Err(e) => {
                    if e.is_recoverable() {
                        self.diagnose(adapter.as_ref()).await;
                    }
                    Err(e)
                }
            };
        };

        panel.notify(PanelNotification::StartStream);
        let (adapter, model_name) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                error!(panel = %panel.id(), model, error = %e, "cannot route request");
                panel.notify(PanelNotification::EarlyEnd { reason: e.user_message() });
                return Ok(None);
            }
        };

        let messages = adapter_messages(adapter.kind(), conversation.messages());
        info!(
            panel = %panel.id(),
            backend = %adapter.kind(),
            model = model_name,
            messages = messages.len(),
            streaming = self.streaming,
            "routing request"
        );

        let mut session = StreamSession {
            panel,
            cancel: &cancellation,
            dispatcher: &self.dispatcher,
            parser: StreamParser::new(),
            visible: String::new(),
            raw: String::new(),
        };

        let outcome = if self.streaming {
            self.run_stream(adapter.as_ref(), model_name, &messages, &mut session).await
        } else {
            self.run_complete(adapter.as_ref(), model_name, &messages, &mut session).await
        };

        let terminal = match outcome {
            Outcome::Completed => {
                let events = session.parser.finish();
                if session.forward(events).await && !cancellation.is_cancelled() {
                    PanelNotification::EndStream
                } else {
                    PanelNotification::StoppedStream
                }
            }
            Outcome::Aborted => {
                session.parser.fail(StreamErrorKind::Aborted, false);
                PanelNotification::StoppedStream
            }
            Outcome::Failed(e) => {
                let events = session.parser.fail(StreamErrorKind::Unknown, true);
                session.forward(events).await;
                error!(panel = %panel.id(), backend = %adapter.kind(), error = %e, "request failed");
                let reason = match &e {
                    ChatError::Auth(_) => e.user_message(),
                    _ if session.visible.is_empty() => NO_OUTPUT_PLACEHOLDER.to_string(),
                    _ => e.user_message(),
                };
                if e.is_recoverable() {
                    self.diagnose(adapter.as_ref()).await;
                }
                PanelNotification::EarlyEnd { reason }
            }
        };

        if terminal == PanelNotification::StoppedStream {
            info!(panel = %panel.id(), "request stopped");
        }
        if !session.visible.is_empty() {
            conversation.push(ChatMessage::assistant(std::mem::take(&mut session.visible)));
        }
        panel.notify(terminal);
        Ok(None)
    }

    async fn run_stream(
        &self,
        adapter: &dyn BackendAdapter,
        model: &str,
        messages: &[ChatMessage],
        session: &mut StreamSession<'_>,
    ) -> Outcome {
        let mut stream = match adapter.send_stream(model, messages, session.cancel).await {
            Ok(stream) => stream,
            Err(e) => return self.fall_back(adapter, model, messages, session, e).await,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = session.cancel.cancelled() => return Outcome::Aborted,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    if !session.feed(&chunk).await {
                        return Outcome::Aborted;
                    }
                }
                Some(Err(e)) => return self.fall_back(adapter, model, messages, session, e).await,
                None => return Outcome::Completed,
            }
        }
    }

    /// One non-streaming retry, only for adapters that support it and only
    /// for transport failures.
    async fn fall_back(
        &self,
        adapter: &dyn BackendAdapter,
        model: &str,
        messages: &[ChatMessage],
        session: &mut StreamSession<'_>,
        err: ChatError,
    ) -> Outcome {
        if err.is_aborted() {
            return Outcome::Aborted;
        }
        if !adapter.supports_complete_fallback() || !err.is_recoverable() {
            return Outcome::Failed(err);
        }

        warn!(
            panel = %session.panel.id(),
            backend = %adapter.kind(),
            error = %err,
            "stream failed, retrying without streaming"
        );
        match adapter.send_complete(model, messages, session.cancel).await {
            Ok(text) => {
                if session.feed_fallback(&text).await {
                    Outcome::Completed
                } else {
                    Outcome::Aborted
                }
            }
            Err(e) if e.is_aborted() => Outcome::Aborted,
            Err(e) => Outcome::Failed(e),
        }
    }

    async fn run_complete(
        &self,
        adapter: &dyn BackendAdapter,
        model: &str,
        messages: &[ChatMessage],
        session: &mut StreamSession<'_>,
    ) -> Outcome {
        match adapter.send_complete(model, messages, session.cancel).await {
            Ok(text) => {
                if session.feed(&text).await {
                    Outcome::Completed
                } else {
                    Outcome::Aborted
                }
            }
            Err(e) if e.is_aborted() => Outcome::Aborted,
            Err(e) => Outcome::Failed(e),
        }
    }

    async fn diagnose(&self, adapter: &dyn BackendAdapter) {
        match adapter.health_check().await {
            Ok(()) => info!(
                backend = %adapter.kind(),
                url = adapter.base_url(),
                "backend is reachable; the failure was request specific"
            ),
            Err(e) => warn!(
                backend = %adapter.kind(),
                url = adapter.base_url(),
                error = %e,
                "backend health check failed"
            ),
        }
    }
}

/// Messages as one backend family accepts them. Ollama's chat endpoint
/// only gets system and user turns; the conversation itself is untouched.
fn adapter_messages(kind: BackendKind, messages: &[ChatMessage]) -> Vec<ChatMessage> {
    match kind {
        BackendKind::Ollama => messages
            .iter()
            .filter(|m| m.role != ChatRole::Assistant)
            .cloned()
            .collect(),
        BackendKind::OpenAi => messages.to_vec(),
    }
}

/// Per-request parse state between the transport and the panel.
struct StreamSession<'a> {
    panel: &'a PanelHandle,
    cancel: &'a CancellationToken,
    dispatcher: &'a ToolDispatcher,
    parser: StreamParser,
    /// Visible text forwarded so far; becomes the assistant turn
    visible: String,
    /// Raw text received from the transport
    raw: String,
}

impl StreamSession<'_> {
    /// Returns false once cancellation has been observed.
    async fn feed(&mut self, chunk: &str) -> bool {
        self.raw.push_str(chunk);
        let events = self.parser.consume(chunk);
        self.forward(events).await
    }

    /// Feed a fallback response as the final chunk. When it repeats what the
    /// stream already delivered, only the rest is new. Otherwise the whole
    /// response follows the partial answer, which the panel has already shown.
    async fn feed_fallback(&mut self, text: &str) -> bool {
        let skip = if text.starts_with(self.raw.as_str()) {
            self.raw.len()
        } else {
            debug!(received = self.raw.len(), "fallback response diverges from partial stream");
            0
        };
        self.feed(&text[skip..]).await
    }

    async fn forward(&mut self, events: Vec<StreamEvent>) -> bool {
        for event in events {
            if self.cancel.is_cancelled() {
                return false;
            }
            match event {
                StreamEvent::PlainText(text) => {
                    self.visible.push_str(&text);
                    self.panel.notify(PanelNotification::StreamChunk { message: text });
                }
                StreamEvent::ThinkingText(text) => {
                    self.panel.notify(PanelNotification::ThinkingChunk { message: text });
                }
                StreamEvent::ToolCallComplete(payload) => {
                    let result = self.dispatcher.dispatch(&payload).await;
                    self.panel.notify(PanelNotification::ToolResult(result));
                }
                StreamEvent::StreamEnd | StreamEvent::StreamError(_) => {}
            }
        }
        true
    }
}
