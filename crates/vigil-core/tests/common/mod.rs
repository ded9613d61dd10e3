//! Shared fixtures: a scripted in-process provider and a fully wired moderation harness.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use vigil_core::{
    AnomalyLifecycle, ApiKey, ChatRequest, ClientFactory, DeterministicDetector, GenerationClient, KeyPool,
    ModerationPipeline, ModerationStore, NotificationDispatcher, NotificationEvent, ProviderClient, ProviderError,
    ProviderStream, RetryPolicy, SemanticDetector, SledModerationStore,
};

// ---------------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------------

/// What one provider attempt does.
#[derive(Debug, Clone)]
pub enum Reply {
    /// HTTP error with body text.
    Status(u16, &'static str),
    Text(String),
    Stream(Vec<String>),
    /// Yields these fragments, then breaks the connection.
    Broken(Vec<String>),
}

pub fn rate_limited() -> Reply {
    Reply::Status(429, "rate limit exceeded")
}

pub fn text(s: &str) -> Reply {
    Reply::Text(s.to_string())
}

pub fn fragments(parts: &[&str]) -> Reply {
    Reply::Stream(parts.iter().map(|s| s.to_string()).collect())
}

/// Per-credential reply queues, a per-credential default once a queue is empty, and a log of attempts.
#[derive(Default)]
pub struct Script {
    queues: Mutex<HashMap<String, VecDeque<Reply>>>,
    defaults: Mutex<HashMap<String, Reply>>,
    attempts: Mutex<Vec<String>>,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, key: &str, reply: Reply) {
        self.queues.lock().unwrap().entry(key.to_string()).or_default().push_back(reply);
    }

    pub fn always(&self, key: &str, reply: Reply) {
        self.defaults.lock().unwrap().insert(key.to_string(), reply);
    }

    /// Credentials in the order they were tried.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    fn next(&self, key: &str) -> Reply {
        self.attempts.lock().unwrap().push(key.to_string());
        if let Some(reply) = self.queues.lock().unwrap().get_mut(key).and_then(VecDeque::pop_front) {
            return reply;
        }
        self.defaults
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or(Reply::Status(500, "unscripted call"))
    }
}

struct ScriptedClient {
    key: String,
    script: Arc<Script>,
}

#[async_trait]
impl ProviderClient for ScriptedClient {
    async fn stream_chat(&self, _request: &ChatRequest) -> Result<ProviderStream, ProviderError> {
        let items: Vec<Result<String, ProviderError>> = match self.script.next(&self.key) {
            Reply::Status(code, body) => return Err(ProviderError::from_status(code, body)),
            Reply::Text(t) => vec![Ok(t)],
            Reply::Stream(parts) => parts.into_iter().map(Ok).collect(),
            Reply::Broken(parts) => {
                let mut items: Vec<_> = parts.into_iter().map(Ok).collect();
                items.push(Err(ProviderError::incomplete()));
                items
            }
        };
        Ok(Box::pin(futures_util::stream::iter(items)))
    }

    async fn complete(&self, _request: &ChatRequest) -> Result<String, ProviderError> {
        match self.script.next(&self.key) {
            Reply::Status(code, body) => Err(ProviderError::from_status(code, body)),
            Reply::Text(t) => Ok(t),
            Reply::Stream(parts) => Ok(parts.concat()),
            Reply::Broken(_) => Err(ProviderError::incomplete()),
        }
    }
}

pub struct ScriptedFactory {
    script: Arc<Script>,
    pub built: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new(script: &Arc<Script>) -> Arc<Self> {
        Arc::new(Self { script: Arc::clone(script), built: AtomicUsize::new(0) })
    }
}

impl ClientFactory for ScriptedFactory {
    fn build(&self, key: &ApiKey) -> Result<Arc<dyn ProviderClient>, ProviderError> {
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedClient { key: key.expose().to_string(), script: Arc::clone(&self.script) }))
    }
}

/// Credentials named `k0`, `k1`, ...
pub fn keys(n: usize) -> Vec<ApiKey> {
    (0..n).map(|i| ApiKey::new(format!("k{}", i))).collect()
}

pub fn generation(script: &Arc<Script>, key_count: usize) -> GenerationClient {
    generation_with(ScriptedFactory::new(script), key_count)
}

pub fn generation_with(factory: Arc<ScriptedFactory>, key_count: usize) -> GenerationClient {
    let pool = Arc::new(KeyPool::new(keys(key_count), factory).unwrap());
    GenerationClient::new(pool, RetryPolicy::default(), "test-model")
}

// ---------------------------------------------------------------------------
// Moderation harness
// ---------------------------------------------------------------------------

/// Dispatcher that keeps every event for assertions.
#[derive(Default)]
pub struct RecordingDispatcher {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingDispatcher {
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl NotificationDispatcher for RecordingDispatcher {
    fn dispatch(&self, event: NotificationEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct Harness {
    pub script: Arc<Script>,
    pub store: Arc<SledModerationStore>,
    pub events: Arc<RecordingDispatcher>,
    pub lifecycle: Arc<AnomalyLifecycle>,
    pub pipeline: Arc<ModerationPipeline>,
}

impl Harness {
    pub fn new(key_count: usize) -> Self {
        let script = Script::new();
        let store = Arc::new(SledModerationStore::temporary().unwrap());
        let events = Arc::new(RecordingDispatcher::default());
        let dyn_store: Arc<dyn ModerationStore> = store.clone();
        let lifecycle = Arc::new(AnomalyLifecycle::new(dyn_store, events.clone()));
        let generation = generation(&script, key_count);
        let pipeline = Arc::new(ModerationPipeline::new(
            DeterministicDetector::with_defaults().unwrap(),
            Some(SemanticDetector::new(generation.clone())),
            lifecycle.clone(),
            generation,
        ));
        Self { script, store, events, lifecycle, pipeline }
    }
}
