//! Backend transport adapters
//!
//! Each adapter turns a normalized message list into one backend family's
//! HTTP call and hands back either the complete text or a flat stream of
//! text chunks. Wire decoding (SSE for OpenAI-compatible servers, NDJSON
//! for Ollama) stays inside the adapter.

pub mod ollama;
pub mod openai_compat;
pub mod registry;

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ChatError, ChatResult};
use crate::protocol::ChatMessage;

/// Lazy, finite, non-restartable sequence of raw text chunks.
pub type ChunkStream = BoxStream<'static, ChatResult<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    OpenAi,
    Ollama,
}

impl BackendKind {
    /// Prefix used for model ids in merged listings
    pub fn model_prefix(&self) -> &'static str {
        match self {
            BackendKind::OpenAi => "openai-compat/",
            BackendKind::Ollama => "ollama/",
        }
    }

    /// Split a possibly prefixed model id into its backend and bare name.
    pub fn split_model_id(model_id: &str) -> (Option<BackendKind>, &str) {
        for kind in [BackendKind::OpenAi, BackendKind::Ollama] {
            if let Some(name) = model_id.strip_prefix(kind.model_prefix()) {
                return (Some(kind), name);
            }
        }
        (None, model_id)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::OpenAi => write!(f, "openai"),
            BackendKind::Ollama => write!(f, "ollama"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" | "openai-compat" => Ok(BackendKind::OpenAi),
            "ollama" => Ok(BackendKind::Ollama),
            other => Err(format!("unknown backend '{}' (expected openai or ollama)", other)),
        }
    }
}

#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn base_url(&self) -> &str;

    /// Whether a failed stream may be retried once as a complete call
    fn supports_complete_fallback(&self) -> bool {
        false
    }

    async fn send_complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> ChatResult<String>;

    async fn send_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> ChatResult<ChunkStream>;

    async fn fetch_models(&self) -> ChatResult<Vec<String>>;

    /// Model identifiers, empty on failure
    async fn list_models(&self) -> Vec<String> {
        match self.fetch_models().await {
            Ok(models) => models,
            Err(e) => {
                warn!(backend = %self.kind(), error = %e, "model listing failed");
                Vec::new()
            }
        }
    }

    async fn health_check(&self) -> ChatResult<()>;
}

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> ChatResult<T>
where
    F: Future<Output = ChatResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ChatError::Aborted),
        result = fut => result,
    }
}

/// Splits a byte stream into complete lines. Splitting on `\n` never cuts
/// a UTF-8 sequence, so each line decodes on its own.
#[derive(Default)]
pub(crate) struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(idx) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=idx).collect();
            lines.push(decode_line(&line[..line.len() - 1]));
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = decode_line(&self.buf);
        self.buf.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let line = String::from_utf8_lossy(bytes);
    line.strip_suffix('\r').unwrap_or(&line).to_string()
}

/// What one wire line means for the text stream.
pub(crate) enum LineOutcome {
    Text(String),
    Skip,
    Done,
    Error(ChatError),
}

struct LineStreamState<S, F> {
    bytes: Pin<Box<S>>,
    decoder: LineDecoder,
    queue: VecDeque<ChatResult<String>>,
    parse_line: F,
    cancel: CancellationToken,
    done: bool,
}

impl<S, F> LineStreamState<S, F>
where
    F: FnMut(&str) -> LineOutcome,
{
    fn handle_line(&mut self, line: &str) {
        if self.done {
            return;
        }
        match (self.parse_line)(line) {
            LineOutcome::Text(text) if !text.is_empty() => self.queue.push_back(Ok(text)),
            LineOutcome::Text(_) | LineOutcome::Skip => {}
            LineOutcome::Done => self.done = true,
            LineOutcome::Error(e) => {
                self.queue.push_back(Err(e));
                self.done = true;
            }
        }
    }
}

/// Turn a line-oriented HTTP body into a chunk stream.
pub(crate) fn decode_lines<S, B, E, F>(bytes: S, cancel: CancellationToken, parse_line: F) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: Into<ChatError>,
    F: FnMut(&str) -> LineOutcome + Send + 'static,
{
    let state = LineStreamState {
        bytes: Box::pin(bytes),
        decoder: LineDecoder::default(),
        queue: VecDeque::new(),
        parse_line,
        cancel,
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.queue.pop_front() {
                if item.is_err() {
                    st.queue.clear();
                }
                return Some((item, st));
            }
            if st.done {
                return None;
            }

            let next = tokio::select! {
                biased;
                _ = st.cancel.cancelled() => None,
                next = st.bytes.next() => Some(next),
            };
            let Some(next) = next else {
                st.done = true;
                return Some((Err(ChatError::Aborted), st));
            };

            match next {
                Some(Ok(bytes)) => {
                    for line in st.decoder.push(bytes.as_ref()) {
                        st.handle_line(&line);
                    }
                }
                Some(Err(e)) => {
                    st.queue.push_back(Err(e.into()));
                    st.done = true;
                }
                None => {
                    if let Some(line) = st.decoder.finish() {
                        st.handle_line(&line);
                    }
                    st.done = true;
                }
            }
        }
    })
    .boxed()
}
