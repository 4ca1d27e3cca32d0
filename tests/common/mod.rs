#![allow(dead_code)]

use agent_rag::config::Config;
use agent_rag::embedding::{EmbeddingClient, HashEmbedder};
use agent_rag::error::RagError;
use agent_rag::index::create_index;
use agent_rag::jobs::JobState;
use agent_rag::notify::StatusNotifier;
use agent_rag::services::Services;
use async_trait::async_trait;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Semaphore;

pub const DIMS: usize = 64;

/// Hash embeddings that can be switched to failing, or held until a
/// permit is released.
pub struct TestEmbedder {
    inner: HashEmbedder,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl TestEmbedder {
    pub fn new() -> Self {
        Self {
            inner: HashEmbedder::new(DIMS),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            gate: None,
        }
    }

    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }
}

#[async_trait]
impl EmbeddingClient for TestEmbedder {
    fn model_name(&self) -> &str {
        "test-hash"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| RagError::EmbeddingUnavailable(e.to_string()))?
                .forget();
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(RagError::EmbeddingUnavailable("connection refused".into()));
        }
        self.inner.embed_many(texts).await
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub fail: AtomicBool,
    pub delivered: Mutex<Vec<(String, JobState)>>,
}

#[async_trait]
impl StatusNotifier for RecordingNotifier {
    async fn notify(&self, agent_name: &str, status: JobState) -> Result<(), RagError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RagError::UpstreamUnavailable("503 Service Unavailable".into()));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((agent_name.to_string(), status));
        Ok(())
    }
}

pub struct TestEnv {
    pub tmp: TempDir,
    pub services: Services,
    pub embedder: Arc<TestEmbedder>,
    pub notifier: Arc<RecordingNotifier>,
}

impl TestEnv {
    pub fn agent_dir(&self, agent: &str) -> PathBuf {
        self.services.config.agents.dir.join(agent)
    }

    pub fn write_doc(&self, agent: &str, name: &str, content: &str) {
        let dir = self.agent_dir(agent);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
    }
}

pub fn base_config(tmp: &TempDir) -> Config {
    let mut config = Config::default();
    config.db.path = tmp.path().join("data/agent-rag.sqlite");
    config.agents.dir = tmp.path().join("agents");
    config.embedding.dims = DIMS;
    config.notify.backoff_base_ms = 0;
    fs::create_dir_all(&config.agents.dir).unwrap();
    config
}

pub async fn setup() -> TestEnv {
    setup_with(|_| {}, TestEmbedder::new()).await
}

pub async fn setup_with(tweak: impl FnOnce(&mut Config), embedder: TestEmbedder) -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let mut config = base_config(&tmp);
    tweak(&mut config);

    let pool = agent_rag::db::connect(&config).await.unwrap();
    agent_rag::migrate::run_migrations(&pool).await.unwrap();
    let index = create_index(&config, &pool);
    let embedder = Arc::new(embedder);
    let notifier = Arc::new(RecordingNotifier::default());
    let services = Services::from_parts(config, pool, embedder.clone(), index, notifier.clone());

    TestEnv {
        tmp,
        services,
        embedder,
        notifier,
    }
}

/// `n` distinct whitespace-separated tokens.
pub fn words(n: usize) -> String {
    (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
}
