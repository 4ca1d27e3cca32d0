//! Persistent ingestion job records.
//!
//! One row per agent in `ingestion_jobs` tracks where that agent is in the
//! `Idle → InProgress → {Ready, Failed}` cycle, so a process that dies
//! mid-ingestion leaves evidence behind and can be reconciled on restart
//! instead of leaving the agent stuck `in_progress`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::fmt;
use std::str::FromStr;

use crate::error::RagError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    InProgress,
    Ready,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::InProgress => "in_progress",
            JobState::Ready => "ready",
            JobState::Failed => "failed",
        }
    }

    /// `InProgress → InProgress` is a resumed attempt after a restart.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Idle, JobState::InProgress)
                | (JobState::Ready, JobState::InProgress)
                | (JobState::Failed, JobState::InProgress)
                | (JobState::InProgress, JobState::InProgress)
                | (JobState::InProgress, JobState::Ready)
                | (JobState::InProgress, JobState::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Ready | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(JobState::Idle),
            "in_progress" => Ok(JobState::InProgress),
            "ready" => Ok(JobState::Ready),
            "failed" => Ok(JobState::Failed),
            other => Err(RagError::Validation(format!("unknown job state: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub agent_name: String,
    pub state: JobState,
    pub attempt_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl JobRecord {
    /// Record for an agent that has never been ingested.
    pub fn idle(agent_name: &str) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            state: JobState::Idle,
            attempt_count: 0,
            started_at: None,
            finished_at: None,
            updated_at: Utc::now(),
            last_error: None,
        }
    }

    fn from_row(row: &SqliteRow) -> Result<Self, RagError> {
        let state: String = row.get("state");
        let attempts: i64 = row.get("attempt_count");
        let ts = |col: &str| -> Option<DateTime<Utc>> {
            row.get::<Option<i64>, _>(col)
                .and_then(|t| DateTime::from_timestamp(t, 0))
        };
        Ok(Self {
            agent_name: row.get("agent_name"),
            state: state.parse()?,
            attempt_count: attempts.max(0) as u32,
            started_at: ts("started_at"),
            finished_at: ts("finished_at"),
            updated_at: ts("updated_at").unwrap_or_default(),
            last_error: row.get("last_error"),
        })
    }
}

/// Job rows double as leases: a run keeps `updated_at` fresh with
/// [`JobStore::touch`], and an `InProgress` row whose `updated_at` is older
/// than `lease_secs` belongs to a process that is gone.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
    lease_secs: u64,
}

impl JobStore {
    pub fn new(pool: SqlitePool, lease_secs: u64) -> Self {
        Self {
            pool,
            lease_secs: lease_secs.max(1),
        }
    }

    pub fn lease(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.lease_secs)
    }

    pub async fn get(&self, agent_name: &str) -> Result<Option<JobRecord>, RagError> {
        let row = sqlx::query("SELECT * FROM ingestion_jobs WHERE agent_name = ?")
            .bind(agent_name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(JobRecord::from_row).transpose()
    }

    pub async fn state(&self, agent_name: &str) -> Result<JobState, RagError> {
        Ok(self
            .get(agent_name)
            .await?
            .map(|r| r.state)
            .unwrap_or(JobState::Idle))
    }

    /// Move to `InProgress` with a fresh attempt count. Returns `false`
    /// without changing anything if another run holds a live lease.
    ///
    /// An `InProgress` row with an expired lease is taken over and its
    /// attempt count carried forward.
    pub async fn begin(&self, agent_name: &str) -> Result<bool, RagError> {
        let now = Utc::now().timestamp();
        let stale_before = now - self.lease_secs as i64;

        let current = self.get(agent_name).await?;
        let state = current.as_ref().map(|r| r.state).unwrap_or(JobState::Idle);
        if let Some(record) = &current {
            if record.state == JobState::InProgress && record.updated_at.timestamp() >= stale_before {
                return Ok(false);
            }
        }
        if !state.can_transition_to(JobState::InProgress) {
            return Err(RagError::Validation(format!(
                "cannot start ingestion of agent {} from state {}",
                agent_name, state
            )));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO ingestion_jobs (agent_name, state, attempt_count, started_at, finished_at, updated_at, last_error)
            VALUES (?, 'in_progress', 1, ?, NULL, ?, NULL)
            ON CONFLICT(agent_name) DO UPDATE SET
                attempt_count = CASE WHEN ingestion_jobs.state = 'in_progress'
                                     THEN ingestion_jobs.attempt_count + 1 ELSE 1 END,
                state = 'in_progress',
                started_at = excluded.started_at,
                finished_at = NULL,
                updated_at = excluded.updated_at,
                last_error = NULL
            WHERE ingestion_jobs.state != 'in_progress' OR ingestion_jobs.updated_at < ?
            "#,
        )
        .bind(agent_name)
        .bind(now)
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;

        let started = result.rows_affected() == 1;
        if started && state == JobState::InProgress {
            tracing::warn!(agent = %agent_name, "took over expired ingestion lease");
        }
        Ok(started)
    }

    /// Renew the lease of a running job.
    pub async fn touch(&self, agent_name: &str) -> Result<(), RagError> {
        sqlx::query(
            "UPDATE ingestion_jobs SET updated_at = ? WHERE agent_name = ? AND state = 'in_progress'",
        )
        .bind(Utc::now().timestamp())
        .bind(agent_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count another attempt of a job that is still `InProgress`.
    pub async fn resume(&self, agent_name: &str) -> Result<JobRecord, RagError> {
        let now = Utc::now().timestamp();
        let updated = sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET attempt_count = attempt_count + 1, started_at = ?, updated_at = ?
            WHERE agent_name = ? AND state = 'in_progress'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(agent_name)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(RagError::Validation(format!(
                "no ingestion in progress for agent {}",
                agent_name
            )));
        }
        self.get(agent_name)
            .await?
            .ok_or_else(|| RagError::NotFound(format!("job record for agent {}", agent_name)))
    }

    /// Record the outcome of the in-progress attempt.
    pub async fn finish(
        &self,
        agent_name: &str,
        outcome: JobState,
        error: Option<&str>,
    ) -> Result<(), RagError> {
        if !outcome.is_terminal() {
            return Err(RagError::Validation(format!(
                "{} is not a terminal job state",
                outcome
            )));
        }
        let current = self.state(agent_name).await?;
        if !current.can_transition_to(outcome) {
            return Err(RagError::Validation(format!(
                "cannot mark agent {} {}: job is {}",
                agent_name, outcome, current
            )));
        }
        let now = Utc::now().timestamp();
        let updated = sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET state = ?,
                attempt_count = CASE WHEN ? = 'ready' THEN 0 ELSE attempt_count END,
                finished_at = ?, updated_at = ?, last_error = ?
            WHERE agent_name = ? AND state = 'in_progress'
            "#,
        )
        .bind(outcome.as_str())
        .bind(outcome.as_str())
        .bind(now)
        .bind(now)
        .bind(error)
        .bind(agent_name)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(RagError::Validation(format!(
                "cannot mark agent {} {}: no ingestion in progress",
                agent_name, outcome
            )));
        }
        Ok(())
    }

    /// Jobs left `InProgress`, e.g. by a crashed process.
    pub async fn stuck(&self) -> Result<Vec<JobRecord>, RagError> {
        let rows = sqlx::query(
            "SELECT * FROM ingestion_jobs WHERE state = 'in_progress' ORDER BY agent_name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(JobRecord::from_row).collect()
    }

    pub async fn remove(&self, agent_name: &str) -> Result<bool, RagError> {
        let removed = sqlx::query("DELETE FROM ingestion_jobs WHERE agent_name = ?")
            .bind(agent_name)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    async fn store() -> (TempDir, JobStore) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.db.path = tmp.path().join("jobs.sqlite");
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (tmp, JobStore::new(pool, 60))
    }

    #[test]
    fn transition_table() {
        use JobState::*;
        assert!(Idle.can_transition_to(InProgress));
        assert!(!Idle.can_transition_to(Ready));
        assert!(!Idle.can_transition_to(Failed));
        assert!(Ready.can_transition_to(InProgress));
        assert!(Failed.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Failed));
        assert_eq!("in_progress".parse::<JobState>().unwrap(), InProgress);
        assert!("done".parse::<JobState>().is_err());
    }

    #[tokio::test]
    async fn unknown_agent_is_idle() {
        let (_tmp, jobs) = store().await;
        assert_eq!(jobs.state("bot1").await.unwrap(), JobState::Idle);
        assert!(jobs.get("bot1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cannot_finish_without_beginning() {
        let (_tmp, jobs) = store().await;
        assert!(jobs.finish("bot1", JobState::Ready, None).await.is_err());
        assert_eq!(jobs.state("bot1").await.unwrap(), JobState::Idle);
    }

    #[tokio::test]
    async fn full_cycle() {
        let (_tmp, jobs) = store().await;
        assert!(jobs.begin("bot1").await.unwrap());
        assert!(!jobs.begin("bot1").await.unwrap(), "second begin must not re-enter");
        assert_eq!(jobs.state("bot1").await.unwrap(), JobState::InProgress);

        jobs.finish("bot1", JobState::Failed, Some("embedding service down"))
            .await
            .unwrap();
        let record = jobs.get("bot1").await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.last_error.as_deref(), Some("embedding service down"));
        assert!(record.finished_at.is_some());

        assert!(jobs.finish("bot1", JobState::Ready, None).await.is_err());

        assert!(jobs.begin("bot1").await.unwrap());
        jobs.finish("bot1", JobState::Ready, None).await.unwrap();
        let record = jobs.get("bot1").await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Ready);
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn resume_counts_attempts_and_stuck_lists_them() {
        let (_tmp, jobs) = store().await;
        jobs.begin("bot1").await.unwrap();
        jobs.begin("bot2").await.unwrap();
        jobs.finish("bot2", JobState::Ready, None).await.unwrap();

        let stuck = jobs.stuck().await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].agent_name, "bot1");
        assert_eq!(stuck[0].attempt_count, 1);

        let resumed = jobs.resume("bot1").await.unwrap();
        assert_eq!(resumed.attempt_count, 2);
        assert!(jobs.resume("bot2").await.is_err());
    }

    #[tokio::test]
    async fn finish_from_terminal_state_names_the_state() {
        let (_tmp, jobs) = store().await;
        jobs.begin("bot1").await.unwrap();
        jobs.finish("bot1", JobState::Ready, None).await.unwrap();
        let err = jobs.finish("bot1", JobState::Failed, Some("late")).await.unwrap_err();
        assert!(err.to_string().contains("job is ready"), "{}", err);
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let (_tmp, jobs) = store().await;
        assert!(jobs.begin("bot1").await.unwrap());
        assert!(!jobs.begin("bot1").await.unwrap());

        let long_ago = Utc::now().timestamp() - 3600;
        sqlx::query("UPDATE ingestion_jobs SET updated_at = ? WHERE agent_name = 'bot1'")
            .bind(long_ago)
            .execute(&jobs.pool)
            .await
            .unwrap();

        assert!(jobs.begin("bot1").await.unwrap());
        let record = jobs.get("bot1").await.unwrap().unwrap();
        assert_eq!(record.state, JobState::InProgress);
        assert_eq!(record.attempt_count, 2);
        assert!(record.updated_at.timestamp() > long_ago);
    }

    #[tokio::test]
    async fn touch_keeps_the_lease_alive() {
        let (_tmp, jobs) = store().await;
        jobs.begin("bot1").await.unwrap();
        sqlx::query("UPDATE ingestion_jobs SET updated_at = 0 WHERE agent_name = 'bot1'")
            .execute(&jobs.pool)
            .await
            .unwrap();
        jobs.touch("bot1").await.unwrap();
        assert!(!jobs.begin("bot1").await.unwrap());

        // finished jobs are not renewed
        jobs.finish("bot1", JobState::Ready, None).await.unwrap();
        sqlx::query("UPDATE ingestion_jobs SET updated_at = 0 WHERE agent_name = 'bot1'")
            .execute(&jobs.pool)
            .await
            .unwrap();
        jobs.touch("bot1").await.unwrap();
        assert_eq!(jobs.get("bot1").await.unwrap().unwrap().updated_at.timestamp(), 0);
    }

    #[tokio::test]
    async fn non_terminal_finish_is_rejected() {
        let (_tmp, jobs) = store().await;
        jobs.begin("bot1").await.unwrap();
        assert!(jobs.finish("bot1", JobState::Idle, None).await.is_err());
        assert!(jobs.remove("bot1").await.unwrap());
        assert!(!jobs.remove("bot1").await.unwrap());
    }
}
