//! Opaque worker seam between the orchestration core and the model provider.
//!
//! The core never talks to a model SDK directly. Everything it needs is the
//! narrow [`WorkerRuntime`] contract: create a worker binding, ping it, run a
//! message against it, and tear it down. Production wires a real provider;
//! tests wire [`InMemoryWorker`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{OrchestratorError, Result};

/// Model selection plus provider-specific knobs, passed through verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    pub model_name: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ModelConfig {
    pub fn named(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            extra: serde_json::Map::new(),
        }
    }

    /// Overlay another config: its model name (when set) and extra keys win.
    pub fn merge(&mut self, other: &ModelConfig) {
        if !other.model_name.is_empty() {
            self.model_name = other.model_name.clone();
        }
        for (k, v) in &other.extra {
            self.extra.insert(k.clone(), v.clone());
        }
    }
}

/// Everything a worker needs to serve one agent role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    pub instructions: String,
    pub model: ModelConfig,
    pub temperature: f32,
    pub max_tokens: u32,
    pub tool_schemas: Vec<Value>,
    pub knowledge_bases: Vec<String>,
}

/// Opaque handle to a provisioned worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub id: String,
}

/// Result of a completed (non-streaming) worker run.
#[derive(Debug, Clone)]
pub struct WorkerReply {
    pub text: String,
    pub tokens_used: u64,
    pub latency: Duration,
}

/// One chunk of a streaming worker run.
#[derive(Debug, Clone)]
pub struct WorkerChunk {
    pub delta: String,
    pub done: bool,
}

pub type WorkerStream = Pin<Box<dyn Stream<Item = Result<WorkerChunk>> + Send>>;

/// The worker primitive. Streaming and non-streaming are distinct operations;
/// the DAG executor consumes only [`WorkerRuntime::run`].
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    async fn create(&self, config: WorkerConfig) -> Result<WorkerHandle>;

    /// Lightweight liveness probe. Returns the observed round-trip time.
    async fn ping(&self, handle: &WorkerHandle) -> Result<Duration>;

    async fn run(&self, handle: &WorkerHandle, message: &str) -> Result<WorkerReply>;

    async fn run_streaming(&self, handle: &WorkerHandle, message: &str) -> Result<WorkerStream>;

    async fn destroy(&self, handle: &WorkerHandle) -> Result<()>;
}

type Responder = dyn Fn(&WorkerConfig, &str) -> String + Send + Sync;

/// In-memory worker used by tests and local development.
///
/// Replies are produced by a configurable responder closure; failures and
/// latency can be injected per worker name to exercise retry, circuit-breaker
/// and health paths.
pub struct InMemoryWorker {
    responder: Box<Responder>,
    configs: Mutex<HashMap<String, WorkerConfig>>,
    fail_names: Mutex<HashMap<String, u64>>,
    latency: Duration,
    created: AtomicU64,
    calls: AtomicU64,
}

impl InMemoryWorker {
    pub fn new() -> Self {
        Self {
            responder: Box::new(|config, message| {
                format!("[{}] processed: {message}", config.name)
            }),
            configs: Mutex::new(HashMap::new()),
            fail_names: Mutex::new(HashMap::new()),
            latency: Duration::from_millis(0),
            created: AtomicU64::new(0),
            calls: AtomicU64::new(0),
        }
    }

    /// Replace the reply function. The closure receives the worker's config
    /// and the incoming message.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&WorkerConfig, &str) -> String + Send + Sync + 'static,
    {
        self.responder = Box::new(responder);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `count` runs against workers named `name` fail.
    pub async fn fail_next(&self, name: &str, count: u64) {
        self.fail_names.lock().await.insert(name.to_string(), count);
    }

    pub fn total_calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    async fn take_failure(&self, name: &str) -> bool {
        let mut fail = self.fail_names.lock().await;
        match fail.get_mut(name) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

impl Default for InMemoryWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerRuntime for InMemoryWorker {
    async fn create(&self, config: WorkerConfig) -> Result<WorkerHandle> {
        let seq = self.created.fetch_add(1, Ordering::Relaxed);
        let handle = WorkerHandle {
            id: format!("mem-{}-{seq}", config.name),
        };
        self.configs.lock().await.insert(handle.id.clone(), config);
        Ok(handle)
    }

    async fn ping(&self, handle: &WorkerHandle) -> Result<Duration> {
        let configs = self.configs.lock().await;
        if !configs.contains_key(&handle.id) {
            return Err(OrchestratorError::InstanceNotFound(handle.id.clone()));
        }
        Ok(self.latency)
    }

    async fn run(&self, handle: &WorkerHandle, message: &str) -> Result<WorkerReply> {
        let config = {
            let configs = self.configs.lock().await;
            configs
                .get(&handle.id)
                .cloned()
                .ok_or_else(|| OrchestratorError::InstanceNotFound(handle.id.clone()))?
        };

        if self.latency > Duration::ZERO {
            tokio::time::sleep(self.latency).await;
        }
        self.calls.fetch_add(1, Ordering::Relaxed);

        if self.take_failure(&config.name).await {
            return Err(OrchestratorError::UpstreamFailure(format!(
                "injected failure for worker '{}'",
                config.name
            )));
        }

        let started = Instant::now();
        let text = (self.responder)(&config, message);
        Ok(WorkerReply {
            tokens_used: (text.len() / 4) as u64,
            latency: started.elapsed().max(self.latency),
            text,
        })
    }

    async fn run_streaming(&self, handle: &WorkerHandle, message: &str) -> Result<WorkerStream> {
        let reply = self.run(handle, message).await?;
        let chunks = vec![
            Ok(WorkerChunk {
                delta: reply.text,
                done: false,
            }),
            Ok(WorkerChunk {
                delta: String::new(),
                done: true,
            }),
        ];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn destroy(&self, handle: &WorkerHandle) -> Result<()> {
        self.configs.lock().await.remove(&handle.id);
        Ok(())
    }
}

/// Convenience shared across tests: a worker config with sane defaults.
pub fn default_worker_config(name: impl Into<String>) -> WorkerConfig {
    WorkerConfig {
        name: name.into(),
        instructions: String::new(),
        model: ModelConfig::named("claude-3-5-sonnet"),
        temperature: 0.7,
        max_tokens: 1000,
        tool_schemas: Vec::new(),
        knowledge_bases: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_create_run_destroy() {
        let worker = InMemoryWorker::new();
        let handle = worker
            .create(default_worker_config("echo"))
            .await
            .unwrap();

        let reply = worker.run(&handle, "hello").await.unwrap();
        assert!(reply.text.contains("hello"));

        worker.destroy(&handle).await.unwrap();
        assert!(worker.run(&handle, "hello").await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let worker = InMemoryWorker::new();
        let handle = worker
            .create(default_worker_config("flaky"))
            .await
            .unwrap();

        worker.fail_next("flaky", 2).await;
        assert!(worker.run(&handle, "a").await.is_err());
        assert!(worker.run(&handle, "b").await.is_err());
        assert!(worker.run(&handle, "c").await.is_ok());
    }

    #[tokio::test]
    async fn test_streaming_yields_full_text() {
        let worker = InMemoryWorker::new();
        let handle = worker
            .create(default_worker_config("stream"))
            .await
            .unwrap();

        let mut stream = worker.run_streaming(&handle, "chunks").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(first.delta.contains("chunks"));
        let last = stream.next().await.unwrap().unwrap();
        assert!(last.done);
    }

    #[tokio::test]
    async fn test_model_config_merge() {
        let mut base = ModelConfig::named("claude-3-haiku");
        let mut overlay = ModelConfig::named("claude-3-5-sonnet");
        overlay
            .extra
            .insert("top_p".into(), serde_json::json!(0.9));

        base.merge(&overlay);
        assert_eq!(base.model_name, "claude-3-5-sonnet");
        assert_eq!(base.extra["top_p"], serde_json::json!(0.9));
    }
}
