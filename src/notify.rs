//! Delivery of ingestion outcomes to the agent directory service.
//!
//! Outcomes are written to the durable `notify_outbox` table first and
//! delivered by a background worker, so a slow or unreachable control
//! plane never fails an ingestion. Failed deliveries are retried with
//! exponential backoff; after `notify.max_attempts` the row is marked
//! `dead` and stays visible to operators (`GET /outbox/dead`,
//! `agent-rag outbox dead`) until requeued.
//!
//! A pending row is coalesced with newer outcomes for the same agent: the
//! control plane only needs the latest status. Delivered rows are deleted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

use crate::config::NotifyConfig;
use crate::error::RagError;
use crate::jobs::JobState;

#[async_trait]
pub trait StatusNotifier: Send + Sync {
    async fn notify(&self, agent_name: &str, status: JobState) -> Result<(), RagError>;
}

/// Build the notifier for `[notify]`: HTTP when `base_url` is set,
/// otherwise log-only.
pub fn create_notifier(config: &NotifyConfig) -> Result<Arc<dyn StatusNotifier>, RagError> {
    match &config.base_url {
        Some(base_url) => Ok(Arc::new(HttpNotifier::new(base_url, config)?)),
        None => Ok(Arc::new(LogNotifier)),
    }
}

/// `POST {base_url}/agents/{agent}/update-embeddings-status`.
pub struct HttpNotifier {
    http: reqwest::Client,
    base_url: reqwest::Url,
    header: Option<(String, String)>,
}

impl HttpNotifier {
    pub fn new(base_url: &str, config: &NotifyConfig) -> Result<Self, RagError> {
        let base_url = reqwest::Url::parse(base_url)
            .map_err(|e| RagError::Validation(format!("notify.base_url: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(RagError::Validation(format!(
                "notify.base_url is not a base URL: {}",
                base_url
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::UpstreamUnavailable(format!("HTTP client: {}", e)))?;
        let header = match (&config.header_name, &config.header_value) {
            (Some(name), Some(value)) => Some((name.clone(), value.clone())),
            _ => None,
        };
        Ok(Self {
            http,
            base_url,
            header,
        })
    }

    pub fn status_url(&self, agent_name: &str) -> reqwest::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["agents", agent_name, "update-embeddings-status"]);
        }
        url
    }
}

#[async_trait]
impl StatusNotifier for HttpNotifier {
    async fn notify(&self, agent_name: &str, status: JobState) -> Result<(), RagError> {
        let mut request = self
            .http
            .post(self.status_url(agent_name))
            .json(&serde_json::json!({ "status": status }));
        if let Some((name, value)) = &self.header {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| RagError::UpstreamUnavailable(format!("status callback: {}", e)))?;
        let code = response.status();
        if code.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(RagError::UpstreamUnavailable(format!(
                "status callback returned {}: {}",
                code, body
            )))
        }
    }
}

/// Used when no control plane is configured.
pub struct LogNotifier;

#[async_trait]
impl StatusNotifier for LogNotifier {
    async fn notify(&self, agent_name: &str, status: JobState) -> Result<(), RagError> {
        tracing::info!(agent = %agent_name, %status, "ingestion outcome (no notify.base_url configured)");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub agent_name: String,
    pub status: JobState,
    pub state: String,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl OutboxEntry {
    fn from_row(row: &SqliteRow) -> Result<Self, RagError> {
        let status: String = row.get("status");
        let attempts: i64 = row.get("attempts");
        let next_ms: i64 = row.get("next_attempt_at");
        Ok(Self {
            id: row.get("id"),
            agent_name: row.get("agent_name"),
            status: status.parse()?,
            state: row.get("state"),
            attempts: attempts.max(0) as u32,
            next_attempt_at: DateTime::from_timestamp_millis(next_ms).unwrap_or_default(),
            last_error: row.get("last_error"),
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: u64,
    pub retried: u64,
    pub dead: u64,
}

#[derive(Clone)]
pub struct Outbox {
    pool: SqlitePool,
    config: NotifyConfig,
    wake: Arc<Notify>,
}

const DUE_BATCH: i64 = 100;

impl Outbox {
    pub fn new(pool: SqlitePool, config: NotifyConfig) -> Self {
        Self {
            pool,
            config,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Queue `status` for delivery, replacing any still-pending status for
    /// the same agent. Returns the row id.
    pub async fn enqueue(&self, agent_name: &str, status: JobState) -> Result<i64, RagError> {
        let now_ms = Utc::now().timestamp_millis();
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let coalesced: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE notify_outbox
            SET status = ?, attempts = 0, next_attempt_at = ?, last_error = NULL, updated_at = ?
            WHERE agent_name = ? AND state = 'pending'
            RETURNING id
            "#,
        )
        .bind(status.as_str())
        .bind(now_ms)
        .bind(now)
        .bind(agent_name)
        .fetch_optional(&mut *tx)
        .await?;

        let id = match coalesced {
            Some(id) => id,
            None => sqlx::query_scalar(
                r#"
                INSERT INTO notify_outbox (agent_name, status, state, attempts, next_attempt_at, created_at, updated_at)
                VALUES (?, ?, 'pending', 0, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(agent_name)
            .bind(status.as_str())
            .bind(now_ms)
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?,
        };

        tx.commit().await?;
        self.wake.notify_one();
        Ok(id)
    }

    /// Delay before the next attempt after `attempts` failures.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(20);
        let ms = self.config.backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms).min(Duration::from_secs(self.config.backoff_max_secs))
    }

    async fn due(&self) -> Result<Vec<OutboxEntry>, RagError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM notify_outbox
            WHERE state = 'pending' AND next_attempt_at <= ?
            ORDER BY next_attempt_at, id
            LIMIT ?
            "#,
        )
        .bind(Utc::now().timestamp_millis())
        .bind(DUE_BATCH)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(OutboxEntry::from_row).collect()
    }

    /// Attempt every due row once.
    pub async fn deliver_due(&self, notifier: &dyn StatusNotifier) -> Result<DeliveryReport, RagError> {
        let mut report = DeliveryReport::default();
        for entry in self.due().await? {
            let now = Utc::now().timestamp();
            match notifier.notify(&entry.agent_name, entry.status).await {
                Ok(()) => {
                    // A newer outcome coalesced in meanwhile keeps the row pending.
                    sqlx::query("DELETE FROM notify_outbox WHERE id = ? AND status = ?")
                        .bind(entry.id)
                        .bind(entry.status.as_str())
                        .execute(&self.pool)
                        .await?;
                    tracing::info!(agent = %entry.agent_name, status = %entry.status, "status callback delivered");
                    report.delivered += 1;
                }
                Err(e) => {
                    let attempts = entry.attempts + 1;
                    let message = e.to_string();
                    if attempts >= self.config.max_attempts {
                        sqlx::query(
                            "UPDATE notify_outbox SET state = 'dead', attempts = ?, last_error = ?, updated_at = ? WHERE id = ?",
                        )
                        .bind(attempts as i64)
                        .bind(&message)
                        .bind(now)
                        .bind(entry.id)
                        .execute(&self.pool)
                        .await?;
                        tracing::error!(
                            agent = %entry.agent_name,
                            status = %entry.status,
                            attempts,
                            error = %message,
                            "status callback permanently failed"
                        );
                        report.dead += 1;
                    } else {
                        let next = Utc::now().timestamp_millis()
                            + self.backoff(attempts).as_millis() as i64;
                        sqlx::query(
                            "UPDATE notify_outbox SET attempts = ?, next_attempt_at = ?, last_error = ?, updated_at = ? WHERE id = ?",
                        )
                        .bind(attempts as i64)
                        .bind(next)
                        .bind(&message)
                        .bind(now)
                        .bind(entry.id)
                        .execute(&self.pool)
                        .await?;
                        tracing::warn!(
                            agent = %entry.agent_name,
                            attempts,
                            error = %message,
                            "status callback failed, will retry"
                        );
                        report.retried += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    pub async fn pending(&self) -> Result<Vec<OutboxEntry>, RagError> {
        self.list_state("pending").await
    }

    pub async fn dead_letters(&self) -> Result<Vec<OutboxEntry>, RagError> {
        self.list_state("dead").await
    }

    async fn list_state(&self, state: &str) -> Result<Vec<OutboxEntry>, RagError> {
        let rows = sqlx::query("SELECT * FROM notify_outbox WHERE state = ? ORDER BY id")
            .bind(state)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(OutboxEntry::from_row).collect()
    }

    /// Re-arm a dead row for immediate delivery.
    pub async fn requeue(&self, id: i64) -> Result<bool, RagError> {
        let updated = sqlx::query(
            r#"
            UPDATE notify_outbox
            SET state = 'pending', attempts = 0, next_attempt_at = ?, updated_at = ?
            WHERE id = ? AND state = 'dead'
            "#,
        )
        .bind(Utc::now().timestamp_millis())
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated > 0 {
            self.wake.notify_one();
        }
        Ok(updated > 0)
    }

    /// Deliver until `shutdown` flips to `true`.
    pub async fn run_worker(self, notifier: Arc<dyn StatusNotifier>, mut shutdown: watch::Receiver<bool>) {
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(10));
        tracing::debug!("notify outbox worker started");
        loop {
            if let Err(e) = self.deliver_due(notifier.as_ref()).await {
                tracing::warn!(error = %e, "outbox delivery pass failed");
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(poll) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("notify outbox worker stopped");
    }
}
