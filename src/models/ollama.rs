use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ChatError, ChatResult};
use crate::models::{cancellable, decode_lines, BackendAdapter, BackendKind, ChunkStream, LineOutcome};
use crate::protocol::ChatMessage;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct OllamaTagsResponse {
    models: Vec<OllamaModelTag>,
}

#[derive(Deserialize)]
struct OllamaModelTag {
    name: String,
}

#[derive(Serialize)]
struct OllamaMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaChatChunk {
    #[serde(default)]
    message: Option<OllamaChunkMessage>,
    #[serde(default)]
    done: Option<bool>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct OllamaChunkMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Adapter for Ollama's native `/api/chat` endpoint.
pub struct OllamaBackend {
    http: reqwest::Client,
    base_url: String,
}

impl OllamaBackend {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        stream: bool,
        cancel: &CancellationToken,
    ) -> ChatResult<reqwest::Response> {
        let request = OllamaChatRequest {
            model,
            messages: messages
                .iter()
                .map(|m| OllamaMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            stream,
        };
        let url = self.endpoint("/api/chat");
        debug!(%url, model, stream, messages = messages.len(), "posting Ollama chat");

        let response = cancellable(cancel, async {
            Ok::<_, ChatError>(self.http.post(&url).json(&request).send().await?)
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ChatError::from_status(status.as_u16(), &text, "Ollama"));
        }
        Ok(response)
    }
}

/// One NDJSON line of an Ollama chat stream.
pub(crate) fn parse_ndjson_line(line: &str) -> LineOutcome {
    let line = line.trim();
    if line.is_empty() {
        return LineOutcome::Skip;
    }

    let parsed: OllamaChatChunk = match serde_json::from_str(line) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!(error = %e, "failed to parse Ollama chunk");
            return LineOutcome::Skip;
        }
    };

    if let Some(err) = parsed.error {
        return LineOutcome::Error(ChatError::transport(format!("Ollama error: {}", err)));
    }

    let text = parsed
        .message
        .and_then(|m| m.content)
        .unwrap_or_default();
    if parsed.done.unwrap_or(false) && text.is_empty() {
        return LineOutcome::Done;
    }
    LineOutcome::Text(text)
}

#[async_trait]
impl BackendAdapter for OllamaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ollama
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send_complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> ChatResult<String> {
        let response = self.post_chat(model, messages, false, cancel).await?;
        let text = cancellable(cancel, async { Ok::<_, ChatError>(response.text().await?) }).await?;
        let parsed: OllamaChatChunk = serde_json::from_str(&text)
            .map_err(|e| ChatError::parse(format!("unexpected Ollama body: {}", e)))?;
        if let Some(err) = parsed.error {
            return Err(ChatError::transport(format!("Ollama error: {}", err)));
        }
        Ok(parsed.message.and_then(|m| m.content).unwrap_or_default())
    }

    async fn send_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> ChatResult<ChunkStream> {
        let response = self.post_chat(model, messages, true, cancel).await?;
        Ok(decode_lines(response.bytes_stream(), cancel.clone(), parse_ndjson_line))
    }

    async fn fetch_models(&self) -> ChatResult<Vec<String>> {
        let response = self
            .http
            .get(self.endpoint("/api/tags"))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ChatError::from_status(status.as_u16(), &text, "Ollama"));
        }

        let tags: OllamaTagsResponse = serde_json::from_str(&text).map_err(|e| {
            warn!(preview = %format!("{:.300}", text), "Ollama tags did not deserialize");
            ChatError::parse(e.to_string())
        })?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn health_check(&self) -> ChatResult<()> {
        let response = self
            .http
            .get(self.endpoint("/api/tags"))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| ChatError::transport(format!("Failed to connect to Ollama: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            Err(ChatError::from_status(status, &text, "Ollama"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_line() {
        let line = r#"{"model":"llama3","message":{"role":"assistant","content":"Hi"},"done":false}"#;
        match parse_ndjson_line(line) {
            LineOutcome::Text(t) => assert_eq!(t, "Hi"),
            _ => panic!("expected text"),
        }
    }

    #[test]
    fn test_parse_done_line() {
        let line = r#"{"model":"llama3","message":{"role":"assistant","content":""},"done":true}"#;
        assert!(matches!(parse_ndjson_line(line), LineOutcome::Done));
    }

    #[test]
    fn test_parse_error_line() {
        match parse_ndjson_line(r#"{"error":"model not found"}"#) {
            LineOutcome::Error(e) => assert!(e.to_string().contains("model not found")),
            _ => panic!("expected error"),
        }
    }

    #[test]
    fn test_garbage_line_is_skipped() {
        assert!(matches!(parse_ndjson_line("not json"), LineOutcome::Skip));
        assert!(matches!(parse_ndjson_line("   "), LineOutcome::Skip));
    }

    #[test]
    fn test_no_fallback() {
        let backend = OllamaBackend::new(reqwest::Client::new(), "http://localhost:11434");
        assert!(!backend.supports_complete_fallback());
        assert_eq!(backend.endpoint("/api/tags"), "http://localhost:11434/api/tags");
    }
}
