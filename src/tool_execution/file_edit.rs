//! `editFile` tool: applies model-proposed text edits to a workspace file.
//!
//! Positions are zero-based `{line, character}` pairs, counted in chars.
//! Edits must not overlap; they are applied back to front so earlier
//! offsets stay valid.

use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::capabilities::Capability;
use crate::tools::ToolHandler;

pub const EDIT_FILE_TOOL: &str = "editFile";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Position {
    pub line: usize,
    pub character: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEdit {
    pub start: Position,
    pub end: Position,
    pub new_text: String,
}

#[derive(Debug, Deserialize)]
struct EditFilePayload {
    uri: String,
    #[serde(default)]
    edits: Vec<TextEdit>,
}

pub struct FileEditHandler {
    workspace_root: PathBuf,
}

impl FileEditHandler {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    /// Resolve a `file://` URI or workspace-relative path, refusing anything
    /// outside the workspace.
    async fn resolve(&self, uri: &str) -> Result<PathBuf, String> {
        let candidate = if uri.starts_with("file://") {
            Url::parse(uri)
                .ok()
                .and_then(|url| url.to_file_path().ok())
                .ok_or_else(|| format!("invalid file URI: {}", uri))?
        } else {
            PathBuf::from(uri)
        };
        let joined = if candidate.is_absolute() {
            candidate
        } else {
            self.workspace_root.join(candidate)
        };

        let root = tokio::fs::canonicalize(&self.workspace_root)
            .await
            .map_err(|e| format!("workspace root unavailable: {}", e))?;
        let path = tokio::fs::canonicalize(&joined)
            .await
            .map_err(|e| format!("cannot open {}: {}", joined.display(), e))?;
        if !path.starts_with(&root) {
            return Err(format!("{} is outside the workspace", path.display()));
        }
        Ok(path)
    }
}

#[async_trait]
impl ToolHandler for FileEditHandler {
    fn required_capability(&self) -> Option<Capability> {
        Some(Capability::FileEdits)
    }

    async fn handle(&self, payload: &Value) -> Result<Value, String> {
        let request: EditFilePayload = serde_json::from_value(payload.clone())
            .map_err(|e| format!("invalid editFile payload: {}", e))?;
        let path = self.resolve(&request.uri).await?;

        let original = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        let updated = apply_edits(&original, &request.edits)?;
        tokio::fs::write(&path, &updated)
            .await
            .map_err(|e| format!("failed to write {}: {}", path.display(), e))?;

        info!(path = %path.display(), edits = request.edits.len(), "applied file edits");
        Ok(json!({
            "uri": request.uri,
            "editsApplied": request.edits.len(),
        }))
    }
}

/// Byte offset of a position. The line after a trailing newline is
/// addressable at character 0.
fn offset_of(text: &str, pos: Position) -> Result<usize, String> {
    let mut line_start = 0;
    for (index, line) in text.split_inclusive('\n').enumerate() {
        if index == pos.line {
            let content = line.strip_suffix('\n').unwrap_or(line);
            let content = content.strip_suffix('\r').unwrap_or(content);
            return char_offset(content, pos.character)
                .map(|off| line_start + off)
                .ok_or_else(|| format!("character {} out of range on line {}", pos.character, pos.line));
        }
        line_start += line.len();
    }

    let line_count = text.split_inclusive('\n').count();
    let ends_open = text.is_empty() || text.ends_with('\n');
    if pos.line == line_count && pos.character == 0 && ends_open {
        Ok(text.len())
    } else {
        Err(format!("line {} out of range", pos.line))
    }
}

fn char_offset(line: &str, character: usize) -> Option<usize> {
    if character == line.chars().count() {
        return Some(line.len());
    }
    line.char_indices().nth(character).map(|(i, _)| i)
}

pub fn apply_edits(text: &str, edits: &[TextEdit]) -> Result<String, String> {
    let mut ranges = Vec::with_capacity(edits.len());
    for edit in edits {
        let start = offset_of(text, edit.start)?;
        let end = offset_of(text, edit.end)?;
        if start > end {
            return Err(format!(
                "edit range is reversed ({}:{} > {}:{})",
                edit.start.line, edit.start.character, edit.end.line, edit.end.character
            ));
        }
        ranges.push((start, end, edit.new_text.as_str()));
    }

    ranges.sort_by_key(|(start, end, _)| (*start, *end));
    if ranges.windows(2).any(|w| w[0].1 > w[1].0) {
        return Err("edits overlap".to_string());
    }

    let mut result = text.to_string();
    for (start, end, new_text) in ranges.into_iter().rev() {
        result.replace_range(start..end, new_text);
    }
    Ok(result)
}
