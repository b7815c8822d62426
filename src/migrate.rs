use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the database and schema. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS corpora (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            passage_count INTEGER NOT NULL,
            char_count INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS passages (
            id TEXT PRIMARY KEY,
            corpus_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            text TEXT NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            hash TEXT NOT NULL,
            UNIQUE(corpus_id, idx),
            FOREIGN KEY (corpus_id) REFERENCES corpora(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Keyed by the directed passage pair; re-running a comparison replaces it.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS relations (
            focus_passage_id TEXT NOT NULL,
            focus_corpus_id TEXT NOT NULL,
            related_passage_id TEXT NOT NULL,
            related_corpus_id TEXT NOT NULL,
            relation TEXT NOT NULL,
            evidence TEXT NOT NULL,
            similarity REAL NOT NULL,
            basis TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (focus_passage_id, related_passage_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS passage_vectors (
            passage_id TEXT PRIMARY KEY,
            corpus_id TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_state (
            corpus_id TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            indexed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_passages_corpus ON passages(corpus_id, idx)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_relations_focus_corpus ON relations(focus_corpus_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_relations_related_corpus ON relations(related_corpus_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_corpus ON passage_vectors(corpus_id)")
        .execute(pool)
        .await?;

    Ok(())
}
