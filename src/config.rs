use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ChatError, ChatResult};
use crate::models::BackendKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub backend: BackendKind,
    pub openai_url: String,
    pub ollama_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_model: Option<String>,
    pub streaming: bool,
    pub allow_file_edits: bool,
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Ollama,
            openai_url: "http://localhost:8080".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            api_key: None,
            selected_model: None,
            streaming: true,
            allow_file_edits: false,
            request_timeout_secs: 120,
        }
    }
}

impl ApiConfig {
    /// Model to use when none was selected: the first one the backend lists.
    pub fn model_or(&self, fallback: Option<&str>) -> Option<String> {
        self.selected_model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .or_else(|| fallback.map(str::to_string))
    }

    /// Read `.env` and the `CHAT_BRIDGE_*` variables on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                warn!(error = %e, "failed to read .env");
            }
        }
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(backend) = var("CHAT_BRIDGE_BACKEND") {
            match backend.parse() {
                Ok(kind) => self.backend = kind,
                Err(e) => warn!(error = %e, "ignoring CHAT_BRIDGE_BACKEND"),
            }
        }
        if let Some(url) = var("CHAT_BRIDGE_OPENAI_URL") {
            self.openai_url = url;
        }
        if let Some(url) = var("CHAT_BRIDGE_OLLAMA_URL") {
            self.ollama_url = url;
        }
        if let Some(key) = var("CHAT_BRIDGE_API_KEY").or_else(|| var("OPENAI_API_KEY")) {
            self.api_key = Some(key);
        }
        if let Some(model) = var("CHAT_BRIDGE_MODEL") {
            self.selected_model = Some(model);
        }
    }
}

pub fn default_api_config_path() -> PathBuf {
    let Some(dirs) = ProjectDirs::from("dev", "chat-bridge", "chat-bridge") else {
        return Path::new("chat-bridge.json").to_path_buf();
    };
    dirs.config_dir().join("config.json")
}

/// Never fails: a missing or unreadable file gives the defaults.
pub fn load_api_config(path: &Path) -> ApiConfig {
    let Ok(bytes) = fs::read(path) else {
        debug!(path = %path.display(), "no config file, using defaults");
        return ApiConfig::default();
    };
    match serde_json::from_slice::<ApiConfig>(&bytes) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid config file, using defaults");
            ApiConfig::default()
        }
    }
}

pub fn save_api_config(path: &Path, cfg: &ApiConfig) -> ChatResult<()> {
    let json = serde_json::to_vec_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, json).map_err(ChatError::from)
}
