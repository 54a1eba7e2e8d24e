use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::capabilities::{Capabilities, Capability};
use crate::conversation::ConversationHistory;
use crate::error::{ChatError, ChatResult};
use crate::events::{PanelEvent, PanelHandle, PanelId, PanelNotification};
use crate::prompts::{self, ChatMode, PromptContext};
use crate::protocol::{ChatMessage, ChatRole};
use crate::router::{RouteRequest, Router};
use crate::token_accountant::{self, HeuristicTokenCounter, TokenAccountant, TokenCounter, TokenLedger};

/// Editor side of `insertCode`
pub trait Workbench: Send + Sync {
    fn insert_code(&self, code: &str) -> ChatResult<()>;
}

/// Stops the panel's in-flight request from another task.
#[derive(Clone)]
pub struct StopHandle {
    router: Arc<Router>,
    panel: PanelId,
}

impl StopHandle {
    pub fn stop(&self) -> bool {
        self.router.cancel(self.panel)
    }
}

/// One chat panel's session: its conversation, token ledger and the
/// handling of every event the panel sends.
pub struct ChatManager {
    panel: PanelHandle,
    router: Arc<Router>,
    capabilities: Arc<Capabilities>,
    counter: Arc<dyn TokenCounter>,
    workbench: Option<Arc<dyn Workbench>>,
    conversation: ConversationHistory,
    accountant: TokenAccountant,
    model: String,
    workspace_root: Option<String>,
    /// Tokens of the file context attached to the previous turn
    file_context_tokens: u64,
}

impl ChatManager {
    pub fn new(
        panel: PanelHandle,
        router: Arc<Router>,
        capabilities: Arc<Capabilities>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            panel,
            router,
            capabilities,
            counter: Arc::new(HeuristicTokenCounter),
            workbench: None,
            conversation: ConversationHistory::new(),
            accountant: TokenAccountant::new(),
            model: model.into(),
            workspace_root: None,
            file_context_tokens: 0,
        }
    }

    pub fn with_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn with_workbench(mut self, workbench: Arc<dyn Workbench>) -> Self {
        self.workbench = Some(workbench);
        self
    }

    pub fn with_workspace_root(mut self, root: impl Into<String>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    pub fn panel_id(&self) -> PanelId {
        self.panel.id()
    }

    pub fn conversation(&self) -> &ConversationHistory {
        &self.conversation
    }

    pub fn ledger(&self) -> TokenLedger {
        self.accountant.ledger()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            router: self.router.clone(),
            panel: self.panel.id(),
        }
    }

    pub async fn handle_event(&mut self, event: PanelEvent) -> ChatResult<()> {
        match event {
            PanelEvent::SendToAi {
                message,
                mode,
                file_context,
                language,
            } => {
                self.send(&message, &mode, file_context.as_deref(), language.as_deref())
                    .await
            }
            PanelEvent::StopGeneration => {
                if !self.router.cancel(self.panel.id()) {
                    debug!(panel = %self.panel.id(), "stop requested with nothing in flight");
                }
                Ok(())
            }
            PanelEvent::NewSession => {
                self.new_session();
                Ok(())
            }
            PanelEvent::ToggleCapability { key, value } => self.toggle_capability(&key, value),
            PanelEvent::InsertCode { message } => match &self.workbench {
                Some(workbench) => workbench.insert_code(&message),
                None => {
                    warn!(panel = %self.panel.id(), "insertCode ignored: no workbench attached");
                    Ok(())
                }
            },
        }
    }

    async fn send(
        &mut self,
        message: &str,
        mode: &str,
        file_context: Option<&str>,
        language: Option<&str>,
    ) -> ChatResult<()> {
        let mode = mode.parse::<ChatMode>().unwrap_or_else(|e| {
            warn!(panel = %self.panel.id(), error = %e, "falling back to chat mode");
            ChatMode::Chat
        });

        // System and user turns go in before the request is dispatched
        let mut turn_tokens = 0;
        if !self.conversation.has_system_prompt() {
            let ctx = PromptContext {
                language,
                workspace_root: self.workspace_root.as_deref(),
            };
            let prompt = prompts::system_prompt(mode, &ctx, self.capabilities.is_enabled(Capability::FileEdits));
            turn_tokens += token_accountant::message_tokens(self.counter.as_ref(), &ChatMessage::system(prompt.as_str()));
            self.conversation.ensure_system_prompt(prompt);
        }

        let user = ChatMessage::user(message);
        turn_tokens += token_accountant::message_tokens(self.counter.as_ref(), &user);
        self.conversation
            .push(ChatMessage::user(with_file_context(message, file_context, language)));

        let context_tokens = file_context.map_or(0, |ctx| self.counter.count_tokens(ctx));
        self.accountant.add_to_session(turn_tokens, 0);
        self.accountant
            .set_file_context(self.file_context_tokens, context_tokens);
        self.file_context_tokens = context_tokens;
        self.panel
            .notify(PanelNotification::token_update(self.accountant.ledger()));

        debug!(
            panel = %self.panel.id(),
            prompt_tokens = token_accountant::count_conversation(self.counter.as_ref(), self.conversation.messages()),
            "prompt assembled"
        );

        let request = self.router.begin_request(self.panel.id());
        let before = self.conversation.len();
        let routed = self
            .router
            .route(RouteRequest {
                model: &self.model,
                conversation: &mut self.conversation,
                cancellation: request.token.clone(),
                destination: Some(&self.panel),
            })
            .await;
        self.router.release(self.panel.id(), &request);
        routed?;

        if self.conversation.len() > before {
            if let Some(reply) = self.conversation.last().filter(|m| m.role == ChatRole::Assistant) {
                let reply_tokens = token_accountant::message_tokens(self.counter.as_ref(), reply);
                self.accountant.add_to_session(reply_tokens, 0);
                self.panel
                    .notify(PanelNotification::token_update(self.accountant.ledger()));
            }
        }
        Ok(())
    }

    fn new_session(&mut self) {
        self.router.cancel(self.panel.id());
        self.conversation.reset();
        self.accountant.reset_session();
        self.file_context_tokens = 0;
        info!(panel = %self.panel.id(), conversation = %self.conversation.metadata.id, "new session");
        self.panel
            .notify(PanelNotification::token_update(self.accountant.ledger()));
    }

    fn toggle_capability(&mut self, key: &str, value: bool) -> ChatResult<()> {
        let capability = Capability::from_key(key)
            .ok_or_else(|| ChatError::config(format!("unknown capability '{}'", key)))?;
        self.capabilities.set(capability, value);
        info!(panel = %self.panel.id(), capability = key, value, "capability toggled");
        self.panel
            .notify(PanelNotification::Capabilities(self.capabilities.snapshot()));
        Ok(())
    }
}

/// User turn as sent to the model, with the attached file inlined.
fn with_file_context(message: &str, file_context: Option<&str>, language: Option<&str>) -> String {
    match file_context.filter(|ctx| !ctx.trim().is_empty()) {
        Some(ctx) => format!(
            "{}\n\nCurrent file:\n```{}\n{}\n```",
            message,
            language.unwrap_or_default(),
            ctx
        ),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BackendAdapter, BackendKind};
    use crate::router::tests::{ScriptedBackend, StreamScript};
    use crate::tools::ToolDispatcher;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct CharCounter;

    impl TokenCounter for CharCounter {
        fn count_tokens(&self, text: &str) -> u64 {
            text.chars().count() as u64
        }
    }

    #[derive(Default)]
    struct RecordingWorkbench {
        inserted: Mutex<Vec<String>>,
    }

    impl Workbench for RecordingWorkbench {
        fn insert_code(&self, code: &str) -> ChatResult<()> {
            self.inserted.lock().unwrap().push(code.to_string());
            Ok(())
        }
    }

    fn setup(
        backend: ScriptedBackend,
    ) -> (ChatManager, Arc<ScriptedBackend>, mpsc::UnboundedReceiver<PanelNotification>) {
        let backend = Arc::new(backend);
        let capabilities = Arc::new(Capabilities::default());
        let dispatcher = Arc::new(ToolDispatcher::new(capabilities.clone()));
        let router = Arc::new(Router::new(backend.kind(), dispatcher).with_adapter(backend.clone()));
        let (panel, rx) = PanelHandle::channel();
        let manager = ChatManager::new(panel, router, capabilities, "model").with_counter(Arc::new(CharCounter));
        (manager, backend, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PanelNotification>) -> Vec<PanelNotification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    fn send(message: &str) -> PanelEvent {
        PanelEvent::SendToAi {
            message: message.into(),
            mode: "chat".into(),
            file_context: None,
            language: None,
        }
    }

    #[tokio::test]
    async fn test_first_turn_adds_system_prompt_and_counts_tokens() {
        let (mut manager, backend, mut rx) =
            setup(ScriptedBackend::new(BackendKind::OpenAi).stream(StreamScript::chunks(&["four"])));

        manager.handle_event(send("hello")).await.unwrap();

        let sent = backend.last_received();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].role, ChatRole::System);
        assert_eq!(sent[1], ChatMessage::user("hello"));

        let system_tokens = sent[0].content.chars().count() as u64 + 4;
        let expected = system_tokens + (5 + 4) + (4 + 4);
        assert_eq!(manager.ledger().session_tokens, expected);
        assert_eq!(manager.conversation().len(), 3);

        let updates: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|n| matches!(n, PanelNotification::SessionTokenUpdate { .. }))
            .collect();
        assert_eq!(updates.len(), 2);
    }

    #[tokio::test]
    async fn test_set_model_switches_backend() {
        let (mut manager, backend, mut rx) =
            setup(ScriptedBackend::new(BackendKind::OpenAi).stream(StreamScript::chunks(&["unused"])));
        manager.set_model("ollama/llama3");
        assert_eq!(manager.model(), "ollama/llama3");

        manager.handle_event(send("hello")).await.unwrap();

        // Only an OpenAI-style backend is configured
        assert_eq!(backend.stream_calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            drain(&mut rx).last(),
            Some(PanelNotification::EarlyEnd { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_context_is_tracked_as_delta() {
        let (mut manager, backend, _rx) = setup(
            ScriptedBackend::new(BackendKind::OpenAi)
                .stream(StreamScript::chunks(&["a"]))
                .stream(StreamScript::chunks(&["b"])),
        );

        manager
            .handle_event(PanelEvent::SendToAi {
                message: "fix".into(),
                mode: "refactor".into(),
                file_context: Some("0123456789".into()),
                language: Some("rust".into()),
            })
            .await
            .unwrap();
        assert_eq!(manager.ledger().file_context_tokens, 10);
        assert!(backend.last_received()[1].content.contains("```rust\n0123456789\n```"));

        manager
            .handle_event(PanelEvent::SendToAi {
                message: "again".into(),
                mode: "chat".into(),
                file_context: Some("0123".into()),
                language: None,
            })
            .await
            .unwrap();
        assert_eq!(manager.ledger().file_context_tokens, 4);
    }

    #[tokio::test]
    async fn test_new_session_resets_everything() {
        let (mut manager, _backend, mut rx) =
            setup(ScriptedBackend::new(BackendKind::OpenAi).stream(StreamScript::chunks(&["hi"])));
        manager.handle_event(send("hello")).await.unwrap();
        let old_id = manager.conversation().metadata.id.clone();
        drain(&mut rx);

        manager.handle_event(PanelEvent::NewSession).await.unwrap();
        assert!(manager.conversation().is_empty());
        assert_ne!(manager.conversation().metadata.id, old_id);
        assert_eq!(manager.ledger(), TokenLedger::default());
        assert_eq!(
            drain(&mut rx),
            vec![PanelNotification::token_update(TokenLedger::default())]
        );
    }

    #[tokio::test]
    async fn test_toggle_capability_reports_snapshot() {
        let (mut manager, _backend, mut rx) = setup(ScriptedBackend::new(BackendKind::OpenAi));
        manager
            .handle_event(PanelEvent::ToggleCapability {
                key: "allowFileEdits".into(),
                value: true,
            })
            .await
            .unwrap();
        match drain(&mut rx).as_slice() {
            [PanelNotification::Capabilities(snapshot)] => assert!(snapshot.allow_file_edits),
            other => panic!("unexpected notifications {:?}", other),
        }

        let err = manager
            .handle_event(PanelEvent::ToggleCapability {
                key: "launchRockets".into(),
                value: true,
            })
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_insert_code_reaches_workbench() {
        let (manager, _backend, _rx) = setup(ScriptedBackend::new(BackendKind::OpenAi));
        let workbench = Arc::new(RecordingWorkbench::default());
        let mut manager = manager.with_workbench(workbench.clone());
        manager
            .handle_event(PanelEvent::InsertCode { message: "let x = 1;".into() })
            .await
            .unwrap();
        assert_eq!(*workbench.inserted.lock().unwrap(), vec!["let x = 1;".to_string()]);
    }

    #[tokio::test]
    async fn test_stop_handle_cancels_in_flight_request() {
        let (mut manager, _backend, mut rx) = setup(
            ScriptedBackend::new(BackendKind::OpenAi).stream(StreamScript::chunks_then_hang(&["partial"])),
        );
        let stop = manager.stop_handle();

        let sending = manager.handle_event(send("hello"));
        let stopper = async {
            while let Some(n) = rx.recv().await {
                if matches!(n, PanelNotification::StreamChunk { .. }) {
                    assert!(stop.stop());
                }
                if n.is_terminal() {
                    return n;
                }
            }
            panic!("panel channel closed");
        };

        let (result, terminal) = tokio::join!(sending, stopper);
        result.unwrap();
        assert_eq!(terminal, PanelNotification::StoppedStream);
        assert_eq!(
            manager.conversation().last(),
            Some(&ChatMessage::assistant("partial"))
        );
    }
}
