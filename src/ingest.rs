//! Ingestion orchestration.
//!
//! One ingestion re-reads an agent's whole document directory and replaces
//! its collection: load → chunk → embed → rebuild, then record the outcome
//! in the job store and queue it on the notification outbox.
//!
//! At most one ingestion per agent runs at a time. A trigger that arrives
//! while one is running sets a rerun flag, so the in-flight run is followed
//! by exactly one more run that picks up whatever changed meanwhile. Any
//! number of triggers during a run collapse into that single follow-up.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::chunk::chunk_text;
use crate::config::Config;
use crate::embedding::{embed_all, EmbeddingClient};
use crate::error::{with_timeout, IngestStage, RagError};
use crate::index::VectorIndex;
use crate::jobs::{JobRecord, JobState, JobStore};
use crate::loader::{agent_dir, load_agent_documents};
use crate::models::{chunk_id, validate_agent_name, EmbeddedChunk};
use crate::notify::Outbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// A background run was spawned.
    Started,
    /// A run is already in flight; it will be followed by one more.
    Coalesced,
}

/// Summary of a successful ingestion.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub agent: String,
    pub documents: usize,
    pub chunks: usize,
    pub generation: i64,
    pub fingerprint: String,
    pub elapsed: Duration,
}

/// Agents whose stuck jobs were handled by [`Ingestor::reconcile`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub resumed: Vec<String>,
    pub failed: Vec<String>,
}

pub struct Ingestor {
    config: Arc<Config>,
    embedder: Arc<dyn EmbeddingClient>,
    index: Arc<dyn VectorIndex>,
    jobs: JobStore,
    outbox: Outbox,
    /// Agents with a run in flight in this process, mapped to their rerun flag.
    running: Mutex<HashMap<String, bool>>,
    idle: Notify,
}

impl Ingestor {
    pub fn new(
        config: Arc<Config>,
        embedder: Arc<dyn EmbeddingClient>,
        index: Arc<dyn VectorIndex>,
        jobs: JobStore,
        outbox: Outbox,
    ) -> Self {
        Self {
            config,
            embedder,
            index,
            jobs,
            outbox,
            running: Mutex::new(HashMap::new()),
            idle: Notify::new(),
        }
    }

    /// Start a background ingestion for `agent_name` and return at once.
    ///
    /// Fails with `NotFound` if the agent has no document directory. The
    /// outcome of the run itself is only reported through the outbox.
    pub async fn trigger(self: &Arc<Self>, agent_name: &str) -> Result<TriggerOutcome, RagError> {
        agent_dir(&self.config.agents, agent_name)?;

        if !self.claim(agent_name) {
            tracing::info!(agent = %agent_name, "ingestion already running, coalescing trigger");
            return Ok(TriggerOutcome::Coalesced);
        }

        match self.jobs.begin(agent_name).await {
            Ok(true) => {}
            Ok(false) => {
                // Another process holds the job.
                self.release(agent_name);
                tracing::info!(agent = %agent_name, "ingestion in progress elsewhere, coalescing trigger");
                return Ok(TriggerOutcome::Coalesced);
            }
            Err(e) => {
                self.release(agent_name);
                return Err(e);
            }
        }

        let this = Arc::clone(self);
        let agent = agent_name.to_string();
        tokio::spawn(async move { this.drive(agent).await });
        Ok(TriggerOutcome::Started)
    }

    /// Ingest `agent_name` in the foreground and return the report.
    pub async fn run(&self, agent_name: &str) -> Result<IngestReport, RagError> {
        agent_dir(&self.config.agents, agent_name)?;

        if !self.claim(agent_name) {
            return Err(RagError::Validation(format!(
                "ingestion already in progress for agent {}",
                agent_name
            )));
        }
        let result = match self.jobs.begin(agent_name).await {
            Ok(true) => self.run_once(agent_name).await,
            Ok(false) => Err(RagError::Validation(format!(
                "ingestion already in progress for agent {}",
                agent_name
            ))),
            Err(e) => Err(e),
        };
        self.release(agent_name);
        result
    }

    /// Wait until no run for `agent_name` is in flight in this process.
    pub async fn wait_idle(&self, agent_name: &str) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_running(agent_name) {
                return;
            }
            notified.await;
        }
    }

    pub fn is_running(&self, agent_name: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(agent_name)
    }

    /// Current job record; agents never ingested report `Idle`.
    pub async fn status(&self, agent_name: &str) -> Result<JobRecord, RagError> {
        validate_agent_name(agent_name)?;
        Ok(self
            .jobs
            .get(agent_name)
            .await?
            .unwrap_or_else(|| JobRecord::idle(agent_name)))
    }

    /// Handle jobs left `InProgress` by a previous process.
    ///
    /// Jobs under `jobs.max_attempts` whose directory still exists are run
    /// again in the background; the rest are marked `Failed` and notified.
    pub async fn reconcile(self: &Arc<Self>) -> Result<ReconcileReport, RagError> {
        let mut report = ReconcileReport::default();
        for job in self.jobs.stuck().await? {
            let agent = job.agent_name.clone();
            if self.is_running(&agent) {
                continue;
            }

            let reason = if job.attempt_count >= self.config.jobs.max_attempts {
                Some(format!(
                    "abandoned after {} interrupted attempts",
                    job.attempt_count
                ))
            } else {
                agent_dir(&self.config.agents, &agent)
                    .err()
                    .map(|e| e.to_string())
            };

            if let Some(reason) = reason {
                tracing::warn!(agent = %agent, attempts = job.attempt_count, %reason, "failing stuck ingestion");
                self.jobs.finish(&agent, JobState::Failed, Some(&reason)).await?;
                self.outbox.enqueue(&agent, JobState::Failed).await?;
                report.failed.push(agent);
                continue;
            }

            if !self.claim(&agent) {
                continue;
            }
            match self.jobs.resume(&agent).await {
                Ok(record) => {
                    tracing::info!(agent = %agent, attempt = record.attempt_count, "resuming interrupted ingestion");
                    let this = Arc::clone(self);
                    let name = agent.clone();
                    tokio::spawn(async move { this.drive(name).await });
                    report.resumed.push(agent);
                }
                Err(e) => {
                    self.release(&agent);
                    return Err(e);
                }
            }
        }
        Ok(report)
    }

    /// Delete the agent's collection and job record. Returns whether a
    /// collection existed.
    pub async fn delete_agent(&self, agent_name: &str) -> Result<bool, RagError> {
        validate_agent_name(agent_name)?;
        if self.is_running(agent_name) {
            return Err(RagError::Validation(format!(
                "ingestion in progress for agent {}",
                agent_name
            )));
        }
        let existed = with_timeout(
            self.config.index.timeout_secs,
            "collection delete",
            self.index.delete(agent_name),
        )
        .await?;
        self.jobs.remove(agent_name).await?;
        tracing::info!(agent = %agent_name, existed, "agent collection deleted");
        Ok(existed)
    }

    fn claim(&self, agent_name: &str) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        match running.get_mut(agent_name) {
            Some(rerun) => {
                *rerun = true;
                false
            }
            None => {
                running.insert(agent_name.to_string(), false);
                true
            }
        }
    }

    fn release(&self, agent_name: &str) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent_name);
        self.idle.notify_waiters();
    }

    /// Consume the rerun flag. Releases the agent when none was set.
    fn take_rerun(&self, agent_name: &str) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        match running.get_mut(agent_name) {
            Some(rerun) if *rerun => {
                *rerun = false;
                true
            }
            _ => {
                running.remove(agent_name);
                drop(running);
                self.idle.notify_waiters();
                false
            }
        }
    }

    /// Background loop: the claimed run plus at most one follow-up per
    /// batch of coalesced triggers.
    async fn drive(self: Arc<Self>, agent_name: String) {
        loop {
            let _ = self.run_once(&agent_name).await;
            if !self.take_rerun(&agent_name) {
                return;
            }
            match self.jobs.begin(&agent_name).await {
                Ok(true) => tracing::info!(agent = %agent_name, "running coalesced ingestion"),
                Ok(false) => {
                    self.release(&agent_name);
                    return;
                }
                Err(e) => {
                    tracing::error!(agent = %agent_name, error = %e, "could not start coalesced ingestion");
                    self.release(&agent_name);
                    return;
                }
            }
        }
    }

    /// One attempt for a job already recorded `InProgress`: run the
    /// pipeline, record the outcome and queue the notification.
    async fn run_once(&self, agent_name: &str) -> Result<IngestReport, RagError> {
        tracing::info!(agent = %agent_name, "ingestion started");
        let heartbeat = Heartbeat::start(self.jobs.clone(), agent_name);
        let result = self.pipeline(agent_name).await;
        drop(heartbeat);

        let (state, error) = match &result {
            Ok(report) => {
                tracing::info!(
                    agent = %agent_name,
                    documents = report.documents,
                    chunks = report.chunks,
                    generation = report.generation,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "ingestion ready"
                );
                (JobState::Ready, None)
            }
            Err(e) => {
                tracing::error!(agent = %agent_name, error = %e, "ingestion failed");
                (JobState::Failed, Some(e.to_string()))
            }
        };

        if let Err(e) = self.jobs.finish(agent_name, state, error.as_deref()).await {
            tracing::error!(agent = %agent_name, error = %e, "could not record ingestion outcome");
        }
        if let Err(e) = self.outbox.enqueue(agent_name, state).await {
            tracing::error!(agent = %agent_name, error = %e, "could not queue status notification");
        }
        result
    }

    async fn pipeline(&self, agent_name: &str) -> Result<IngestReport, RagError> {
        let started = Instant::now();

        let agents = self.config.agents.clone();
        let name = agent_name.to_string();
        let documents = tokio::task::spawn_blocking(move || load_agent_documents(&agents, &name))
            .await
            .map_err(|e| RagError::Io(std::io::Error::other(e.to_string())))
            .and_then(|r| r)
            .map_err(|e| e.at_stage(agent_name, IngestStage::Load))?;

        let params = self
            .config
            .chunking
            .params()
            .map_err(|e| e.at_stage(agent_name, IngestStage::Chunk))?;
        let texts: Vec<String> = documents
            .iter()
            .flat_map(|doc| chunk_text(&doc.text, params))
            .map(|chunk| chunk.text)
            .collect();
        tracing::debug!(agent = %agent_name, documents = documents.len(), chunks = texts.len(), "chunked");

        let embedding = &self.config.embedding;
        let vectors = embed_all(
            Arc::clone(&self.embedder),
            &texts,
            embedding.batch_size,
            embedding.concurrency,
        )
        .await
        .map_err(|e| e.at_stage(agent_name, IngestStage::Embed))?;

        let chunks: Vec<EmbeddedChunk> = texts
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (text, vector))| EmbeddedChunk {
                id: chunk_id(i),
                text,
                vector,
            })
            .collect();
        let count = chunks.len();

        let info = with_timeout(
            self.config.index.timeout_secs,
            "index rebuild",
            self.index.rebuild(agent_name, chunks),
        )
        .await
        .map_err(|e| e.at_stage(agent_name, IngestStage::Rebuild))?;

        Ok(IngestReport {
            agent: agent_name.to_string(),
            documents: documents.len(),
            chunks: count,
            generation: info.generation,
            fingerprint: info.fingerprint,
            elapsed: started.elapsed(),
        })
    }
}

/// Renews the job lease until dropped.
struct Heartbeat(JoinHandle<()>);

impl Heartbeat {
    fn start(jobs: JobStore, agent_name: &str) -> Self {
        let agent = agent_name.to_string();
        let period = (jobs.lease() / 4).max(Duration::from_millis(250));
        Self(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                if let Err(e) = jobs.touch(&agent).await {
                    tracing::warn!(agent = %agent, error = %e, "could not renew ingestion lease");
                }
            }
        }))
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}
