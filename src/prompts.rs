//! System prompt templates, one per chat mode.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

const BASE_PROMPT: &str = "You are a coding assistant embedded in the user's editor. \
The workspace root is {{WORKSPACE_ROOT}} on {{OS}}. \
The user is working in {{LANGUAGE}}. Answer concisely and use fenced code blocks for code.";

const TOOL_INSTRUCTIONS: &str = "\n\nWhen you need to change a file, emit exactly one tool call per file:\n\
<tool_call>{\"type\": \"editFile\", \"uri\": \"relative/path.ext\", \"edits\": [\
{\"start\": {\"line\": 0, \"character\": 0}, \"end\": {\"line\": 0, \"character\": 0}, \"newText\": \"...\"}]}</tool_call>\n\
Lines and characters are zero-based. The payload must be valid JSON. \
Never wrap a tool call in a code block.";

const EXPLAIN_PROMPT: &str = "\n\nExplain what the provided code does, step by step, before suggesting changes.";

const REFACTOR_PROMPT: &str = "\n\nImprove the provided code without changing its behavior. \
Prefer editFile tool calls over pasting whole files.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    #[default]
    Chat,
    Explain,
    Refactor,
}

impl FromStr for ChatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "chat" => Ok(ChatMode::Chat),
            "explain" => Ok(ChatMode::Explain),
            "refactor" => Ok(ChatMode::Refactor),
            other => Err(format!("unknown chat mode '{}'", other)),
        }
    }
}

/// Values substituted into a template
#[derive(Debug, Clone, Default)]
pub struct PromptContext<'a> {
    pub language: Option<&'a str>,
    pub workspace_root: Option<&'a str>,
}

/// Render the system prompt for `mode`. Tool-call instructions are only
/// included when the model may actually edit files.
pub fn system_prompt(mode: ChatMode, ctx: &PromptContext<'_>, allow_file_edits: bool) -> String {
    let mut template = String::from(BASE_PROMPT);
    match mode {
        ChatMode::Chat => {}
        ChatMode::Explain => template.push_str(EXPLAIN_PROMPT),
        ChatMode::Refactor => template.push_str(REFACTOR_PROMPT),
    }
    if allow_file_edits {
        template.push_str(TOOL_INSTRUCTIONS);
    }

    template
        .replace("{{LANGUAGE}}", ctx.language.filter(|l| !l.is_empty()).unwrap_or("an unspecified language"))
        .replace("{{WORKSPACE_ROOT}}", ctx.workspace_root.unwrap_or("unknown"))
        .replace("{{OS}}", std::env::consts::OS)
}
