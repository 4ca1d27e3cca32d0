//! SQLite-backed [`VectorIndex`].
//!
//! Every rebuild writes a new physical collection
//! (`agent_<name>__g<generation>_<suffix>`, state `building`) in its own
//! transaction, then a second transaction retires the generation the alias
//! `agent_<name>` points at and repoints the alias to the new one. Retired
//! generations are deleted afterwards. Queries resolve the alias and read
//! the entries in a single statement, which under WAL runs against one
//! snapshot, so they observe exactly one complete generation.
//!
//! If the build transaction fails the alias is never touched and the
//! previous generation keeps serving.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{check_query_dims, fingerprint, rank, validate_chunks, CollectionInfo, Metric, VectorIndex};
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::RagError;
use crate::models::{collection_name, EmbeddedChunk, ScoredChunk};

pub struct SqliteIndex {
    pool: SqlitePool,
    dims: usize,
    metric: Metric,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool, dims: usize, metric: Metric) -> Self {
        Self { pool, dims, metric }
    }

    async fn write_generation(
        &self,
        agent_name: &str,
        physical: &str,
        generation: i64,
        chunks: &[EmbeddedChunk],
        fingerprint: &str,
        created_at: i64,
    ) -> Result<(), RagError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO collections (name, agent_name, generation, state, dims, size, fingerprint, created_at)
            VALUES (?, ?, ?, 'building', ?, ?, ?, ?)
            "#,
        )
        .bind(physical)
        .bind(agent_name)
        .bind(generation)
        .bind(self.dims as i64)
        .bind(chunks.len() as i64)
        .bind(fingerprint)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        for (ordinal, chunk) in chunks.iter().enumerate() {
            sqlx::query(
                "INSERT INTO collection_entries (collection, ordinal, id, text, embedding) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(physical)
            .bind(ordinal as i64)
            .bind(&chunk.id)
            .bind(&chunk.text)
            .bind(vec_to_blob(&chunk.vector))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn swap_alias(&self, agent_name: &str, alias: &str, physical: &str) -> Result<(), RagError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction takes the write lock up front.
        sqlx::query(
            "UPDATE collections SET state = 'retired' WHERE name = (SELECT collection FROM collection_aliases WHERE alias = ?)",
        )
        .bind(alias)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO collection_aliases (alias, agent_name, collection, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(alias) DO UPDATE SET
                collection = excluded.collection,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(alias)
        .bind(agent_name)
        .bind(physical)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE collections SET state = 'active' WHERE name = ?")
            .bind(physical)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Delete every generation of `agent_name` in `state`.
    async fn purge(&self, agent_name: Option<&str>, states: &[&str]) -> Result<usize, RagError> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0usize;
        for state in states {
            let names: Vec<String> = match agent_name {
                Some(agent) => {
                    sqlx::query_scalar("SELECT name FROM collections WHERE agent_name = ? AND state = ?")
                        .bind(agent)
                        .bind(state)
                        .fetch_all(&mut *tx)
                        .await?
                }
                None => sqlx::query_scalar("SELECT name FROM collections WHERE state = ?")
                    .bind(state)
                    .fetch_all(&mut *tx)
                    .await?,
            };
            for name in names {
                sqlx::query("DELETE FROM collection_entries WHERE collection = ?")
                    .bind(&name)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM collections WHERE name = ?")
                    .bind(&name)
                    .execute(&mut *tx)
                    .await?;
                removed += 1;
            }
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn drop_physical(&self, physical: &str) -> Result<(), RagError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM collection_entries WHERE collection = ?")
            .bind(physical)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(physical)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn rebuild(
        &self,
        agent_name: &str,
        chunks: Vec<EmbeddedChunk>,
    ) -> Result<CollectionInfo, RagError> {
        validate_chunks(&chunks, self.dims)?;

        let alias = collection_name(agent_name);
        let generation: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(generation), 0) + 1 FROM collections WHERE agent_name = ?",
        )
        .bind(agent_name)
        .fetch_one(&self.pool)
        .await?;
        let suffix = Uuid::new_v4().simple().to_string();
        let physical = format!("{}__g{}_{}", alias, generation, &suffix[..8]);
        let fingerprint = fingerprint(&chunks);
        // Stored with second precision; keep the returned value identical.
        let created_at =
            chrono::DateTime::from_timestamp(chrono::Utc::now().timestamp(), 0).unwrap_or_default();

        if let Err(e) = self
            .write_generation(
                agent_name,
                &physical,
                generation,
                &chunks,
                &fingerprint,
                created_at.timestamp(),
            )
            .await
        {
            if let Err(cleanup) = self.drop_physical(&physical).await {
                tracing::warn!(collection = %physical, error = %cleanup, "failed to drop partial collection");
            }
            return Err(e);
        }

        if let Err(e) = self.swap_alias(agent_name, &alias, &physical).await {
            if let Err(cleanup) = self.drop_physical(&physical).await {
                tracing::warn!(collection = %physical, error = %cleanup, "failed to drop unswapped collection");
            }
            return Err(e);
        }

        match self.purge(Some(agent_name), &["retired"]).await {
            Ok(n) if n > 0 => {
                tracing::debug!(agent = %agent_name, removed = n, "dropped retired generations")
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(agent = %agent_name, error = %e, "retired generations left for garbage collection")
            }
        }

        tracing::info!(
            agent = %agent_name,
            collection = %physical,
            generation,
            size = chunks.len(),
            "collection swapped"
        );

        Ok(CollectionInfo {
            name: alias,
            physical,
            generation,
            size: chunks.len(),
            dims: self.dims,
            fingerprint,
            created_at,
        })
    }

    async fn query(
        &self,
        agent_name: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RagError> {
        check_query_dims(vector, self.dims)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT e.id, e.text, e.embedding
            FROM collection_aliases a
            JOIN collection_entries e ON e.collection = a.collection
            WHERE a.alias = ?
            ORDER BY e.ordinal
            "#,
        )
        .bind(collection_name(agent_name))
        .fetch_all(&self.pool)
        .await?;

        let entries: Vec<EmbeddedChunk> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                EmbeddedChunk {
                    id: row.get("id"),
                    text: row.get("text"),
                    vector: blob_to_vec(&blob),
                }
            })
            .collect();

        Ok(rank(&entries, vector, top_k, self.metric))
    }

    async fn delete(&self, agent_name: &str) -> Result<bool, RagError> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM collection_aliases WHERE alias = ?")
            .bind(collection_name(agent_name))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query(
            "DELETE FROM collection_entries WHERE collection IN (SELECT name FROM collections WHERE agent_name = ?)",
        )
        .bind(agent_name)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM collections WHERE agent_name = ?")
            .bind(agent_name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn info(&self, agent_name: &str) -> Result<Option<CollectionInfo>, RagError> {
        let row = sqlx::query(
            r#"
            SELECT c.name, c.generation, c.dims, c.size, c.fingerprint, c.created_at
            FROM collection_aliases a
            JOIN collections c ON c.name = a.collection
            WHERE a.alias = ?
            "#,
        )
        .bind(collection_name(agent_name))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let created_at: i64 = row.get("created_at");
            let dims: i64 = row.get("dims");
            let size: i64 = row.get("size");
            CollectionInfo {
                name: collection_name(agent_name),
                physical: row.get("name"),
                generation: row.get("generation"),
                size: size as usize,
                dims: dims as usize,
                fingerprint: row.get("fingerprint"),
                created_at: chrono::DateTime::from_timestamp(created_at, 0).unwrap_or_default(),
            }
        }))
    }

    /// Removes `building` generations too, so call it only while no
    /// rebuild is running (at startup).
    async fn collect_garbage(&self) -> Result<usize, RagError> {
        self.purge(None, &["retired", "building"]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn setup(dims: usize) -> (TempDir, SqlitePool, SqliteIndex) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.db.path = tmp.path().join("index.sqlite");
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        let index = SqliteIndex::new(pool.clone(), dims, Metric::Cosine);
        (tmp, pool, index)
    }

    fn chunks(n: usize, tag: &str) -> Vec<EmbeddedChunk> {
        (0..n)
            .map(|i| EmbeddedChunk {
                id: format!("doc_chunk_{}", i),
                text: format!("{} {}", tag, i),
                vector: vec![1.0, i as f32],
            })
            .collect()
    }

    async fn count(pool: &SqlitePool, sql: &str) -> i64 {
        sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
    }

    #[tokio::test]
    async fn absent_collection_is_empty_not_error() {
        let (_tmp, _pool, index) = setup(2).await;
        assert!(index.query("bot1", &[1.0, 0.0], 5).await.unwrap().is_empty());
        assert!(index.info("bot1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rebuild_then_query() {
        let (_tmp, _pool, index) = setup(2).await;
        let info = index.rebuild("bot1", chunks(3, "old")).await.unwrap();
        assert_eq!(info.name, "agent_bot1");
        assert_eq!(info.generation, 1);
        assert!(info.physical.starts_with("agent_bot1__g1_"));

        let hits = index.query("bot1", &[1.0, 0.0], 5).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].text, "old 0");
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(index.query("bot1", &[1.0, 0.0], 0).await.unwrap().is_empty());

        assert_eq!(index.info("bot1").await.unwrap(), Some(info));
    }

    #[tokio::test]
    async fn rebuild_swaps_and_collects_old_generation() {
        let (_tmp, pool, index) = setup(2).await;
        index.rebuild("bot1", chunks(3, "old")).await.unwrap();
        let info = index.rebuild("bot1", chunks(5, "new")).await.unwrap();
        assert_eq!(info.generation, 2);

        let hits = index.query("bot1", &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 5);
        assert!(hits.iter().all(|h| h.text.starts_with("new")));

        assert_eq!(count(&pool, "SELECT COUNT(*) FROM collections").await, 1);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM collection_entries").await, 5);
    }

    #[tokio::test]
    async fn failed_rebuild_keeps_previous_generation() {
        let (_tmp, pool, index) = setup(2).await;
        index.rebuild("bot1", chunks(3, "old")).await.unwrap();

        let mut bad = chunks(2, "new");
        bad[1].vector = vec![1.0];
        assert!(matches!(
            index.rebuild("bot1", bad).await,
            Err(RagError::Validation(_))
        ));

        let hits = index.query("bot1", &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM collections").await, 1);
    }

    #[tokio::test]
    async fn agents_are_isolated() {
        let (_tmp, _pool, index) = setup(2).await;
        index.rebuild("bot1", chunks(3, "one")).await.unwrap();
        index.rebuild("bot2", chunks(1, "two")).await.unwrap();
        assert_eq!(index.query("bot1", &[1.0, 0.0], 10).await.unwrap().len(), 3);
        assert_eq!(index.query("bot2", &[1.0, 0.0], 10).await.unwrap().len(), 1);

        assert!(index.delete("bot1").await.unwrap());
        assert!(!index.delete("bot1").await.unwrap());
        assert!(index.query("bot1", &[1.0, 0.0], 10).await.unwrap().is_empty());
        assert_eq!(index.query("bot2", &[1.0, 0.0], 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn garbage_collection_removes_orphans() {
        let (_tmp, pool, index) = setup(2).await;
        index.rebuild("bot1", chunks(2, "live")).await.unwrap();
        sqlx::query(
            "INSERT INTO collections (name, agent_name, generation, state, dims, size, fingerprint, created_at) VALUES ('agent_bot1__g9_dead', 'bot1', 9, 'building', 2, 1, '', 0)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO collection_entries (collection, ordinal, id, text, embedding) VALUES ('agent_bot1__g9_dead', 0, 'doc_chunk_0', 'orphan', x'')",
        )
        .execute(&pool)
        .await
        .unwrap();

        assert_eq!(index.collect_garbage().await.unwrap(), 1);
        assert_eq!(count(&pool, "SELECT COUNT(*) FROM collection_entries").await, 2);
        assert_eq!(index.query("bot1", &[1.0, 0.0], 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_readers_see_complete_generations() {
        let (_tmp, _pool, index) = setup(2).await;
        let index = Arc::new(index);
        index.rebuild("bot1", chunks(3, "a")).await.unwrap();

        let reader = {
            let index = index.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let hits = index.query("bot1", &[1.0, 0.0], 100).await.unwrap();
                    assert!(hits.len() == 3 || hits.len() == 7, "saw {} entries", hits.len());
                    let tag = &hits[0].text[..1];
                    assert!(hits.iter().all(|h| h.text.starts_with(tag)));
                    tokio::task::yield_now().await;
                }
            })
        };

        for round in 0..20 {
            let (n, tag) = if round % 2 == 0 { (7, "b") } else { (3, "a") };
            index.rebuild("bot1", chunks(n, tag)).await.unwrap();
        }

        reader.await.unwrap();
    }
}
