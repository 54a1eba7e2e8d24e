use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::ChatResult;
use crate::models::BackendAdapter;

const CACHE_TTL: Duration = Duration::from_secs(300); // 5 minutes
const MAX_RETRIES: u32 = 2;

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ModelInfo {
    /// Prefixed id, e.g. `ollama/llama3`
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl ModelInfo {
    fn from_backend(adapter: &dyn BackendAdapter, name: String) -> Self {
        let kind = adapter.kind();
        Self {
            id: format!("{}{}", kind.model_prefix(), name),
            description: format!("{} model served at {}", kind, adapter.base_url()),
            name,
            provider: Some(kind.to_string()),
        }
    }
}

struct ModelCache {
    models: Vec<ModelInfo>,
    last_fetch: Instant,
}

lazy_static::lazy_static! {
    static ref MODEL_CACHE: Arc<Mutex<HashMap<String, ModelCache>>> = Arc::new(Mutex::new(HashMap::new()));
    static ref FETCH_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::new(());
}

fn cache_key(adapter: &dyn BackendAdapter) -> String {
    format!("{}:{}", adapter.kind(), adapter.base_url())
}

fn fresh_cached(key: &str) -> Option<Vec<ModelInfo>> {
    let cache = MODEL_CACHE.lock().ok()?;
    cache
        .get(key)
        .filter(|cached| cached.last_fetch.elapsed() < CACHE_TTL)
        .map(|cached| cached.models.clone())
}

async fn fetch_with_retries(adapter: &dyn BackendAdapter) -> ChatResult<Vec<String>> {
    let mut attempt = 0;
    loop {
        match adapter.fetch_models().await {
            Ok(models) => return Ok(models),
            Err(e) if attempt < MAX_RETRIES => {
                attempt += 1;
                let delay = Duration::from_millis(500 * (1 << (attempt - 1)));
                warn!(backend = %adapter.kind(), attempt, ?delay, error = %e, "model fetch failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Models offered by one backend. Served from cache while fresh; on fetch
/// failure an expired entry is still preferred over nothing.
pub async fn get_models(adapter: &dyn BackendAdapter) -> Vec<ModelInfo> {
    let key = cache_key(adapter);
    if let Some(models) = fresh_cached(&key) {
        return models;
    }

    let _lock = FETCH_LOCK.lock().await;

    // Another task may have refreshed while we waited
    if let Some(models) = fresh_cached(&key) {
        return models;
    }

    match fetch_with_retries(adapter).await {
        Ok(names) => {
            let models: Vec<ModelInfo> = names
                .into_iter()
                .map(|name| ModelInfo::from_backend(adapter, name))
                .collect();
            if let Ok(mut cache) = MODEL_CACHE.lock() {
                cache.insert(
                    key,
                    ModelCache {
                        models: models.clone(),
                        last_fetch: Instant::now(),
                    },
                );
            }
            info!(backend = %adapter.kind(), count = models.len(), "fetched model list");
            models
        }
        Err(e) => {
            warn!(backend = %adapter.kind(), error = %e, "model fetch gave up");
            if let Ok(cache) = MODEL_CACHE.lock() {
                if let Some(cached) = cache.get(&key) {
                    warn!(backend = %adapter.kind(), "using expired model cache");
                    return cached.models.clone();
                }
            }
            Vec::new()
        }
    }
}

/// Merged listing across backends, each id carrying its backend prefix.
pub async fn list_all(adapters: &[Arc<dyn BackendAdapter>]) -> Vec<ModelInfo> {
    let mut all = Vec::new();
    for adapter in adapters {
        all.extend(get_models(adapter.as_ref()).await);
    }
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use crate::models::{BackendKind, ChunkStream};
    use crate::protocol::ChatMessage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct FlakyBackend {
        base_url: String,
        failures_left: AtomicUsize,
        calls: AtomicUsize,
        models: Vec<String>,
    }

    impl FlakyBackend {
        fn new(base_url: &str, failures: usize, models: &[&str]) -> Self {
            Self {
                base_url: base_url.to_string(),
                failures_left: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
                models: models.iter().map(|m| m.to_string()).collect(),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackendAdapter for FlakyBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Ollama
        }

        fn base_url(&self) -> &str {
            &self.base_url
        }

        async fn send_complete(&self, _: &str, _: &[ChatMessage], _: &CancellationToken) -> ChatResult<String> {
            unimplemented!()
        }

        async fn send_stream(&self, _: &str, _: &[ChatMessage], _: &CancellationToken) -> ChatResult<ChunkStream> {
            unimplemented!()
        }

        async fn fetch_models(&self) -> ChatResult<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(ChatError::transport("connection refused"));
            }
            Ok(self.models.clone())
        }

        async fn health_check(&self) -> ChatResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_models_are_prefixed_and_cached() {
        let backend = FlakyBackend::new("http://registry-cached", 0, &["llama3", "qwen"]);
        let models = get_models(&backend).await;
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].id, "ollama/llama3");
        assert_eq!(models[0].name, "llama3");
        assert_eq!(models[0].provider.as_deref(), Some("ollama"));

        get_models(&backend).await;
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let backend = FlakyBackend::new("http://registry-retry", 2, &["mistral"]);
        let models = get_models(&backend).await;
        assert_eq!(models.len(), 1);
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_with_empty_list() {
        let backend = FlakyBackend::new("http://registry-down", 10, &["never"]);
        assert!(get_models(&backend).await.is_empty());
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_cache_is_fallback() {
        let backend = FlakyBackend::new("http://registry-expired", 0, &["phi3"]);
        assert_eq!(get_models(&backend).await.len(), 1);

        tokio::time::advance(CACHE_TTL + Duration::from_secs(1)).await;
        backend.failures_left.store(10, Ordering::SeqCst);

        let models = get_models(&backend).await;
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "ollama/phi3");
        assert_eq!(backend.calls(), 4);
    }
}
