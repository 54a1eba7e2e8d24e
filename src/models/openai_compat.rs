use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ChatError, ChatResult};
use crate::models::{cancellable, decode_lines, BackendAdapter, BackendKind, ChunkStream, LineOutcome};
use crate::protocol::{ChatMessage, ChatRequest, CompletionResponse, OpenAiMessage, StreamChunk};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct OpenAIModelsResponse {
    data: Vec<OpenAIModel>,
}

#[derive(Deserialize)]
struct OpenAIModel {
    id: String,
}

#[derive(Deserialize)]
struct OpenAIErrorBody {
    error: OpenAIErrorDetail,
}

#[derive(Deserialize)]
struct OpenAIErrorDetail {
    message: String,
}

/// Adapter for servers speaking the OpenAI chat-completions API.
pub struct OpenAiCompatBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatBackend {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        // Local servers are usually keyless
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn post_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        stream: bool,
        cancel: &CancellationToken,
    ) -> ChatResult<reqwest::Response> {
        let body = ChatRequest {
            model,
            messages: messages.iter().map(OpenAiMessage::from).collect(),
            stream,
        };
        let url = self.endpoint("/v1/chat/completions");
        debug!(%url, model, stream, messages = messages.len(), "posting chat request");

        let response = cancellable(cancel, async {
            Ok::<_, ChatError>(self.authorized(self.http.post(&url)).json(&body).send().await?)
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ChatError::from_status(status.as_u16(), &text, "OpenAI-compatible server"));
        }
        Ok(response)
    }
}

/// One SSE line of a streamed completion.
pub(crate) fn parse_sse_line(line: &str) -> LineOutcome {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return LineOutcome::Skip;
    }
    let Some(data) = line.strip_prefix("data:") else {
        return LineOutcome::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return LineOutcome::Done;
    }

    // An error object would also deserialize as a chunk with no choices
    if let Ok(body) = serde_json::from_str::<OpenAIErrorBody>(data) {
        return LineOutcome::Error(ChatError::transport(body.error.message));
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => LineOutcome::Text(
            chunk
                .choices
                .into_iter()
                .filter_map(|c| c.delta.content)
                .collect(),
        ),
        Err(e) => {
            warn!(error = %e, "skipping undecodable stream line");
            LineOutcome::Skip
        }
    }
}

#[async_trait]
impl BackendAdapter for OpenAiCompatBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenAi
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn supports_complete_fallback(&self) -> bool {
        true
    }

    async fn send_complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> ChatResult<String> {
        let response = self.post_chat(model, messages, false, cancel).await?;
        let text = cancellable(cancel, async { Ok::<_, ChatError>(response.text().await?) }).await?;
        let parsed: CompletionResponse = serde_json::from_str(&text)
            .map_err(|e| ChatError::parse(format!("unexpected completion body: {}", e)))?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn send_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> ChatResult<ChunkStream> {
        let response = self.post_chat(model, messages, true, cancel).await?;
        Ok(decode_lines(response.bytes_stream(), cancel.clone(), parse_sse_line))
    }

    async fn fetch_models(&self) -> ChatResult<Vec<String>> {
        let response = self
            .authorized(self.http.get(self.endpoint("/v1/models")))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ChatError::from_status(status.as_u16(), &text, "OpenAI-compatible server"));
        }

        let models: OpenAIModelsResponse = serde_json::from_str(&text).map_err(|e| {
            warn!(preview = %format!("{:.300}", text), "model list did not deserialize");
            ChatError::parse(e.to_string())
        })?;
        Ok(models.data.into_iter().map(|m| m.id).collect())
    }

    async fn health_check(&self) -> ChatResult<()> {
        let response = self
            .authorized(self.http.get(self.endpoint("/v1/models")))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| ChatError::transport(format!("Failed to connect to OpenAI-compatible server: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            Err(ChatError::from_status(status, &text, "OpenAI-compatible server"))
        }
    }
}
