//! SQLite implementation of the relate storage traits.
//!
//! Wraps a [`SqlitePool`] and implements [`CorpusStore`],
//! [`RelationStore`], and [`EmbeddingCache`]. Vectors are stored as
//! little-endian `f32` BLOBs (see [`vec_to_blob`]).

use std::collections::HashSet;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use relate_core::embedding::{blob_to_vec, vec_to_blob};
use relate_core::models::{
    Corpus, CorpusSummary, Passage, PassageRelation, RelationType, SimilarityBasis,
};
use relate_core::store::{CachedVectors, CorpusStore, EmbeddingCache, RelationStore};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Store a corpus and its passages in one transaction.
    pub async fn insert_corpus(&self, corpus: &Corpus) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO corpora (id, title, created_at, passage_count, char_count)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&corpus.id)
        .bind(&corpus.title)
        .bind(chrono::Utc::now().timestamp())
        .bind(corpus.passages.len() as i64)
        .bind(corpus.char_count() as i64)
        .execute(&mut *tx)
        .await?;

        for p in &corpus.passages {
            sqlx::query(
                r#"
                INSERT INTO passages (id, corpus_id, idx, text, start_offset, end_offset, hash)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&p.id)
            .bind(&corpus.id)
            .bind(p.index as i64)
            .bind(&p.text)
            .bind(p.start_offset as i64)
            .bind(p.end_offset as i64)
            .bind(&p.hash)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete a corpus with its passages, relations on either side, and
    /// cached vectors. Returns `false` when the corpus did not exist.
    pub async fn delete_corpus(&self, corpus_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM relations WHERE focus_corpus_id = ? OR related_corpus_id = ?")
            .bind(corpus_id)
            .bind(corpus_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM passage_vectors WHERE corpus_id = ?")
            .bind(corpus_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM index_state WHERE corpus_id = ?")
            .bind(corpus_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM passages WHERE corpus_id = ?")
            .bind(corpus_id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM corpora WHERE id = ?")
            .bind(corpus_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed > 0)
    }

    /// Corpus ids with a complete cached index for `model`.
    pub async fn indexed_corpora(&self, model: &str) -> Result<HashSet<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT corpus_id FROM index_state WHERE model = ?")
                .bind(model)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().collect())
    }

    pub async fn relation_count(&self, corpus_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM relations WHERE focus_corpus_id = ?")
                .bind(corpus_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

fn passage_from_row(row: &SqliteRow) -> Passage {
    Passage {
        id: row.get("id"),
        corpus_id: row.get("corpus_id"),
        index: row.get::<i64, _>("idx") as usize,
        text: row.get("text"),
        start_offset: row.get::<i64, _>("start_offset") as usize,
        end_offset: row.get::<i64, _>("end_offset") as usize,
        hash: row.get("hash"),
    }
}

fn relation_from_row(row: &SqliteRow) -> Result<PassageRelation> {
    let relation: String = row.get("relation");
    let basis: String = row.get("basis");
    Ok(PassageRelation {
        focus_passage_id: row.get("focus_passage_id"),
        focus_corpus_id: row.get("focus_corpus_id"),
        related_passage_id: row.get("related_passage_id"),
        related_corpus_id: row.get("related_corpus_id"),
        relation: relation.parse::<RelationType>().map_err(|e| anyhow!(e))?,
        evidence: row.get("evidence"),
        similarity: row.get::<f64, _>("similarity") as f32,
        basis: match basis.as_str() {
            "embedding" => SimilarityBasis::Embedding,
            _ => SimilarityBasis::None,
        },
    })
}

#[async_trait]
impl CorpusStore for SqliteStore {
    async fn get_corpus(&self, id: &str) -> Result<Option<Corpus>> {
        let row = sqlx::query("SELECT id, title FROM corpora WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let passages = self.list_passages(id).await?;
        Ok(Some(Corpus {
            id: row.get("id"),
            title: row.get("title"),
            passages,
        }))
    }

    async fn list_corpora(&self) -> Result<Vec<CorpusSummary>> {
        let rows = sqlx::query(
            "SELECT id, title, passage_count, char_count FROM corpora ORDER BY created_at, rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| CorpusSummary {
                id: row.get("id"),
                title: row.get("title"),
                passage_count: row.get::<i64, _>("passage_count") as usize,
                char_count: row.get::<i64, _>("char_count") as usize,
            })
            .collect())
    }

    async fn list_passages(&self, corpus_id: &str) -> Result<Vec<Passage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, corpus_id, idx, text, start_offset, end_offset, hash
            FROM passages
            WHERE corpus_id = ?
            ORDER BY idx
            "#,
        )
        .bind(corpus_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(passage_from_row).collect())
    }
}

#[async_trait]
impl RelationStore for SqliteStore {
    async fn save_relations(
        &self,
        source_corpus_id: &str,
        target_corpus_id: &str,
        relations: &[PassageRelation],
    ) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM relations WHERE focus_corpus_id = ? AND related_corpus_id = ?")
            .bind(source_corpus_id)
            .bind(target_corpus_id)
            .execute(&mut *tx)
            .await?;
        for rel in relations {
            sqlx::query(
                r#"
                INSERT INTO relations (
                    focus_passage_id, focus_corpus_id, related_passage_id, related_corpus_id,
                    relation, evidence, similarity, basis, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(focus_passage_id, related_passage_id) DO UPDATE SET
                    focus_corpus_id = excluded.focus_corpus_id,
                    related_corpus_id = excluded.related_corpus_id,
                    relation = excluded.relation,
                    evidence = excluded.evidence,
                    similarity = excluded.similarity,
                    basis = excluded.basis,
                    created_at = excluded.created_at
                "#,
            )
            .bind(&rel.focus_passage_id)
            .bind(&rel.focus_corpus_id)
            .bind(&rel.related_passage_id)
            .bind(&rel.related_corpus_id)
            .bind(rel.relation.as_str())
            .bind(&rel.evidence)
            .bind(rel.similarity as f64)
            .bind(rel.basis.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(relations.len())
    }

    async fn relations_for(
        &self,
        corpus_id: &str,
        passage_id: Option<&str>,
    ) -> Result<Vec<PassageRelation>> {
        let rows = sqlx::query(
            r#"
            SELECT r.focus_passage_id, r.focus_corpus_id, r.related_passage_id,
                   r.related_corpus_id, r.relation, r.evidence, r.similarity, r.basis
            FROM relations r
            LEFT JOIN passages p ON p.id = r.focus_passage_id
            WHERE r.focus_corpus_id = ?
              AND (? IS NULL OR r.focus_passage_id = ?)
            ORDER BY p.idx, r.similarity DESC
            "#,
        )
        .bind(corpus_id)
        .bind(passage_id)
        .bind(passage_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(relation_from_row).collect()
    }
}

#[async_trait]
impl EmbeddingCache for SqliteStore {
    async fn load_vectors(&self, corpus_id: &str, model: &str) -> Result<Option<CachedVectors>> {
        let indexed: Option<String> =
            sqlx::query_scalar("SELECT model FROM index_state WHERE corpus_id = ? AND model = ?")
                .bind(corpus_id)
                .bind(model)
                .fetch_optional(&self.pool)
                .await?;
        if indexed.is_none() {
            return Ok(None);
        }

        let rows = sqlx::query(
            r#"
            SELECT v.passage_id, v.embedding
            FROM passage_vectors v
            JOIN passages p ON p.id = v.passage_id
            WHERE v.corpus_id = ? AND v.model = ?
            ORDER BY p.idx
            "#,
        )
        .bind(corpus_id)
        .bind(model)
        .fetch_all(&self.pool)
        .await?;

        let vectors = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                (row.get::<String, _>("passage_id"), blob_to_vec(&blob))
            })
            .collect();
        Ok(Some(CachedVectors {
            model: model.to_string(),
            vectors,
        }))
    }

    async fn save_vectors(&self, corpus_id: &str, cached: &CachedVectors) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM passage_vectors WHERE corpus_id = ?")
            .bind(corpus_id)
            .execute(&mut *tx)
            .await?;
        for (passage_id, vector) in &cached.vectors {
            sqlx::query(
                r#"
                INSERT INTO passage_vectors (passage_id, corpus_id, model, dims, embedding)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(passage_id) DO UPDATE SET
                    corpus_id = excluded.corpus_id,
                    model = excluded.model,
                    dims = excluded.dims,
                    embedding = excluded.embedding
                "#,
            )
            .bind(passage_id)
            .bind(corpus_id)
            .bind(&cached.model)
            .bind(vector.len() as i64)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            r#"
            INSERT INTO index_state (corpus_id, model, indexed_at)
            VALUES (?, ?, ?)
            ON CONFLICT(corpus_id) DO UPDATE SET
                model = excluded.model,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(corpus_id)
        .bind(&cached.model)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn clear_vectors(&self, corpus_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM passage_vectors WHERE corpus_id = ?")
            .bind(corpus_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM index_state WHERE corpus_id = ?")
            .bind(corpus_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
