use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chat_bridge_lib::app_state::AppState;
use chat_bridge_lib::chat_manager::Workbench;
use chat_bridge_lib::config::{self, ApiConfig};
use chat_bridge_lib::error::{ChatError, ChatResult};
use chat_bridge_lib::events::{PanelEvent, PanelNotification};
use chat_bridge_lib::models::{BackendAdapter, BackendKind};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chat-bridge", version, about = "Chat with a local or remote LLM from the terminal")]
struct Cli {
    /// Path to config.json (defaults to the per-user config directory)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Backend for unprefixed model ids: openai or ollama
    #[arg(long)]
    backend: Option<BackendKind>,
    /// Model id, optionally prefixed with ollama/ or openai-compat/
    #[arg(long)]
    model: Option<String>,
    /// Use complete responses instead of streaming
    #[arg(long)]
    no_stream: bool,
    /// Let the model edit files in the workspace
    #[arg(long)]
    allow_file_edits: bool,
    /// Workspace root for file edits (defaults to the current directory)
    #[arg(long)]
    workspace: Option<PathBuf>,
    /// Print the available models and exit
    #[arg(long)]
    list_models: bool,
}

impl Cli {
    fn apply(&self, config: &mut ApiConfig) {
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(model) = &self.model {
            config.selected_model = Some(model.clone());
        }
        if self.no_stream {
            config.streaming = false;
        }
        if self.allow_file_edits {
            config.allow_file_edits = true;
        }
    }
}

/// `insertCode` just echoes the snippet; there is no editor buffer here.
struct TerminalWorkbench;

impl Workbench for TerminalWorkbench {
    fn insert_code(&self, code: &str) -> ChatResult<()> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "--- insert ---\n{}\n--------------", code)?;
        Ok(())
    }
}

async fn render(mut rx: mpsc::UnboundedReceiver<PanelNotification>) {
    while let Some(notification) = rx.recv().await {
        let mut out = std::io::stdout().lock();
        let written = match notification {
            PanelNotification::StreamChunk { message } => write!(out, "{}", message),
            PanelNotification::ThinkingChunk { message } => {
                eprint!("\x1b[2m{}\x1b[0m", message);
                Ok(())
            }
            PanelNotification::EndStream => writeln!(out),
            PanelNotification::StoppedStream => writeln!(out, "\n[stopped]"),
            PanelNotification::EarlyEnd { reason } => writeln!(out, "\n[ended early] {}", reason),
            PanelNotification::ToolResult(result) => match (&result.data, &result.error) {
                (_, Some(error)) => writeln!(out, "\n[{} failed] {}", result.tool, error),
                (Some(data), None) => writeln!(out, "\n[{}] {}", result.tool, data),
                (None, None) => writeln!(out, "\n[{}] ok", result.tool),
            },
            PanelNotification::Capabilities(caps) => {
                writeln!(out, "[file edits {}]", if caps.allow_file_edits { "on" } else { "off" })
            }
            PanelNotification::SessionTokenUpdate { total_tokens, .. } => {
                debug!(total_tokens, "token usage");
                Ok(())
            }
            PanelNotification::StartStream => Ok(()),
        };
        if written.and_then(|_| out.flush()).is_err() {
            break;
        }
    }
}

/// Map one input line to a panel event; `None` quits.
fn parse_line(line: &str) -> Option<Option<PanelEvent>> {
    let line = line.trim();
    let event = match line.split_once(' ').unwrap_or((line, "")) {
        ("/quit", _) | ("/exit", _) => return None,
        ("/new", _) => PanelEvent::NewSession,
        ("/edits", value) => PanelEvent::ToggleCapability {
            key: "allowFileEdits".to_string(),
            value: value.trim() == "on",
        },
        ("/insert", code) => PanelEvent::InsertCode {
            message: code.to_string(),
        },
        _ if line.is_empty() => return Some(None),
        _ => PanelEvent::SendToAi {
            message: line.to_string(),
            mode: "chat".to_string(),
            file_context: None,
            language: None,
        },
    };
    Some(Some(event))
}

#[tokio::main]
async fn main() -> ChatResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(config::default_api_config_path);
    let mut api_config = config::load_api_config(&config_path);
    api_config.apply_env_overrides();
    cli.apply(&mut api_config);

    let workspace = match cli.workspace.clone() {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let state = AppState::new(api_config, workspace)?;

    if cli.list_models {
        for model in state.router.list_models().await {
            println!("{}\t{}", model.id, model.description);
        }
        return Ok(());
    }

    // Without a configured model, take the first one the default backend lists
    let first_listed = match (&state.config.selected_model, state.router.resolve("")) {
        (None, Ok((adapter, _))) => adapter.list_models().await.into_iter().next(),
        _ => None,
    };
    let model = state
        .config
        .model_or(first_listed.as_deref())
        .ok_or_else(|| ChatError::config("no model selected and the backend listed none; pass --model"))?;
    eprintln!("chat-bridge: {} ({}). /new, /model <id>, /edits on|off, /quit", model, state.config.backend);

    let (manager, rx) = state.open_panel(model);
    let mut manager = manager.with_workbench(Arc::new(TerminalWorkbench));
    let panel = manager.panel_id();
    let renderer = tokio::spawn(render(rx));

    let stop = manager.stop_handle();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !stop.stop() {
                eprintln!("\n(nothing to stop; /quit exits)");
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(model) = line.trim().strip_prefix("/model ") {
            manager.set_model(model.trim());
            eprintln!("(model: {})", manager.model());
            continue;
        }
        let Some(event) = parse_line(&line) else {
            break;
        };
        if let Some(event) = event {
            if let Err(e) = manager.handle_event(event).await {
                warn!(error = %e, "event failed");
                eprintln!("{}", e.user_message());
            }
        }
    }

    state.close_panel(panel);
    drop(manager);
    if let Err(e) = renderer.await {
        warn!(error = %e, "renderer task failed");
    }
    Ok(())
}
