use anyhow::Result;
use sqlx::SqlitePool;

/// Create all tables. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per physical collection generation.
    // state: building | active | retired
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            agent_name TEXT NOT NULL,
            generation INTEGER NOT NULL,
            state TEXT NOT NULL,
            dims INTEGER NOT NULL,
            size INTEGER NOT NULL,
            fingerprint TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collection_entries (
            collection TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            id TEXT NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            PRIMARY KEY (collection, ordinal)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // `agent_<name>` -> the physical collection readers should see.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collection_aliases (
            alias TEXT PRIMARY KEY,
            agent_name TEXT NOT NULL UNIQUE,
            collection TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingestion_jobs (
            agent_name TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            started_at INTEGER,
            finished_at INTEGER,
            updated_at INTEGER NOT NULL,
            last_error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // state: pending | dead; delivered rows are deleted
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS notify_outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_name TEXT NOT NULL,
            status TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER NOT NULL,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_collections_agent ON collections(agent_name, state)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_outbox_due ON notify_outbox(state, next_attempt_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
