use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use crate::capabilities::Capabilities;
use crate::chat_manager::ChatManager;
use crate::config::ApiConfig;
use crate::error::{ChatError, ChatResult};
use crate::events::{PanelHandle, PanelId, PanelNotification};
use crate::models::ollama::OllamaBackend;
use crate::models::openai_compat::OpenAiCompatBackend;
use crate::router::Router;
use crate::tool_execution;

/// Process-wide state shared by every panel.
pub struct AppState {
    pub config: ApiConfig,
    pub capabilities: Arc<Capabilities>,
    pub router: Arc<Router>,
    pub workspace_root: PathBuf,
    panels: Mutex<HashSet<PanelId>>,
}

impl AppState {
    pub fn new(config: ApiConfig, workspace_root: PathBuf) -> ChatResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ChatError::config(format!("failed to build HTTP client: {}", e)))?;

        let capabilities = Arc::new(Capabilities::new(config.allow_file_edits));
        let dispatcher = Arc::new(tool_execution::default_dispatcher(&workspace_root, capabilities.clone()));
        let router = Router::new(config.backend, dispatcher)
            .with_streaming(config.streaming)
            .with_adapter(Arc::new(OpenAiCompatBackend::new(
                http.clone(),
                config.openai_url.clone(),
                config.api_key.clone(),
            )))
            .with_adapter(Arc::new(OllamaBackend::new(http, config.ollama_url.clone())));

        Ok(Self::with_router(config, capabilities, Arc::new(router), workspace_root))
    }

    pub fn with_router(
        config: ApiConfig,
        capabilities: Arc<Capabilities>,
        router: Arc<Router>,
        workspace_root: PathBuf,
    ) -> Self {
        Self {
            config,
            capabilities,
            router,
            workspace_root,
            panels: Mutex::new(HashSet::new()),
        }
    }

    /// Create a panel session and the stream of notifications it produces.
    pub fn open_panel(&self, model: impl Into<String>) -> (ChatManager, mpsc::UnboundedReceiver<PanelNotification>) {
        let (panel, rx) = PanelHandle::channel();
        if let Ok(mut panels) = self.panels.lock() {
            panels.insert(panel.id());
        }
        info!(panel = %panel.id(), "panel opened");

        let manager = ChatManager::new(panel, self.router.clone(), self.capabilities.clone(), model)
            .with_workspace_root(self.workspace_root.to_string_lossy());
        (manager, rx)
    }

    /// Dispose a panel; its in-flight request, if any, is cancelled.
    pub fn close_panel(&self, panel: PanelId) {
        self.router.dispose_panel(panel);
        if let Ok(mut panels) = self.panels.lock() {
            panels.remove(&panel);
        }
        info!(panel = %panel, "panel closed");
    }

    pub fn open_panels(&self) -> usize {
        self.panels.lock().map(|p| p.len()).unwrap_or(0)
    }
}
