use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;

use super::search::{self, Candidate};
use crate::errors::Result;
use crate::models::{DocumentSource, Pool, Reference, Technology};

const EXCERPT_CHARS: usize = 300;
const DB_FILE: &str = "knowledge.db";
const POOL_MODEL_SQL: &str = "SELECT embedding_model FROM pools WHERE technology = ? AND pool = ?";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub id: String,
    pub document_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub source: DocumentSource,
}

/// A ranked chunk, detached from the store.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk: IndexedChunk,
    pub score: f64,
}

impl SearchHit {
    pub fn to_reference(&self) -> Reference {
        let excerpt: String = self.chunk.content.trim().chars().take(EXCERPT_CHARS).collect();
        Reference {
            source: self.chunk.source.clone(),
            score: self.score,
            excerpt: if excerpt.is_empty() { None } else { Some(excerpt) },
        }
    }
}

/// The query-side embedding, tagged with the model that produced it.
#[derive(Debug, Clone, Copy)]
pub struct QueryVector<'a> {
    pub model: &'a str,
    pub values: &'a [f32],
}

/// Per-(technology, pool) chunk store in SQLite. Chunk text is mirrored into
/// an FTS5 table for BM25 keyword search; vectors are little-endian `f32`
/// blobs. Writers are serialized in-process and every write is one
/// transaction, so concurrent ingestion never loses chunks.
pub struct KnowledgeIndex {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pools (
            technology TEXT NOT NULL,
            pool TEXT NOT NULL,
            embedding_model TEXT,
            PRIMARY KEY (technology, pool)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            technology TEXT NOT NULL,
            pool TEXT NOT NULL,
            id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            content TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            url TEXT,
            embedding BLOB,
            PRIMARY KEY (technology, pool, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 has no IF NOT EXISTS
    let fts_exists: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'")
            .fetch_one(pool)
            .await?;
    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                technology UNINDEXED,
                pool UNINDEXED,
                chunk_id UNINDEXED,
                document_id UNINDEXED,
                content
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(technology, pool, document_id)")
        .execute(pool)
        .await?;
    Ok(())
}

impl KnowledgeIndex {
    /// A private in-memory database. One connection that never expires,
    /// since every SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Open (or create) the index database under `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let db_path = dir.join(DB_FILE);

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;

        let index = Self::with_pool(pool).await?;
        log::info!(
            "Opened knowledge index at {} ({} chunks)",
            db_path.display(),
            index.total_chunks().await?
        );
        Ok(index)
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        migrate(&pool).await?;
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Add a document's chunks, replacing any earlier chunks of the same
    /// document. Vectors from a different embedding model than the pool's
    /// are never mixed: the older vectors are dropped.
    pub async fn add_chunks(
        &self,
        technology: Technology,
        pool: Pool,
        embedding_model: Option<&str>,
        chunks: Vec<IndexedChunk>,
    ) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let (tech, pool_name) = (technology.as_str(), pool.as_str());

        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        if let Some(model) = embedding_model {
            let current = sqlx::query_scalar::<_, Option<String>>(POOL_MODEL_SQL)
                .bind(tech)
                .bind(pool_name)
                .fetch_optional(&mut *tx)
                .await?
                .flatten();
            if current.as_deref() != Some(model) {
                if let Some(previous) = &current {
                    log::warn!(
                        "Embedding model for {}/{} changed from {} to {}; dropping old vectors",
                        technology,
                        pool,
                        previous,
                        model
                    );
                }
                sqlx::query("UPDATE chunks SET embedding = NULL WHERE technology = ? AND pool = ?")
                    .bind(tech)
                    .bind(pool_name)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(
                    r#"
                    INSERT INTO pools (technology, pool, embedding_model) VALUES (?, ?, ?)
                    ON CONFLICT(technology, pool) DO UPDATE SET embedding_model = excluded.embedding_model
                    "#,
                )
                .bind(tech)
                .bind(pool_name)
                .bind(model)
                .execute(&mut *tx)
                .await?;
            }
        }

        let document_ids: HashSet<&str> = chunks.iter().map(|c| c.document_id.as_str()).collect();
        for document_id in document_ids {
            sqlx::query("DELETE FROM chunks_fts WHERE technology = ? AND pool = ? AND document_id = ?")
                .bind(tech)
                .bind(pool_name)
                .bind(document_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM chunks WHERE technology = ? AND pool = ? AND document_id = ?")
                .bind(tech)
                .bind(pool_name)
                .bind(document_id)
                .execute(&mut *tx)
                .await?;
        }

        for chunk in &chunks {
            // Same id under another document
            sqlx::query("DELETE FROM chunks_fts WHERE technology = ? AND pool = ? AND chunk_id = ?")
                .bind(tech)
                .bind(pool_name)
                .bind(&chunk.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO chunks
                    (technology, pool, id, document_id, content, title, description, url, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(tech)
            .bind(pool_name)
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.content)
            .bind(&chunk.source.title)
            .bind(&chunk.source.description)
            .bind(&chunk.source.url)
            .bind(chunk.embedding.as_deref().map(vec_to_blob))
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO chunks_fts (technology, pool, chunk_id, document_id, content) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(tech)
            .bind(pool_name)
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.content)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        log::info!("Indexed {} chunks for {}/{}", chunks.len(), technology, pool);
        Ok(chunks.len())
    }

    /// Rank the pool's chunks for `query`. Falls back to keyword ranking
    /// when there is no query vector or it came from another model.
    pub async fn search(
        &self,
        technology: Technology,
        pool: Pool,
        query: &str,
        query_vec: Option<QueryVector<'_>>,
        semantic_weight: f64,
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        let (tech, pool_name) = (technology.as_str(), pool.as_str());

        let pool_model = sqlx::query_scalar::<_, Option<String>>(POOL_MODEL_SQL)
            .bind(tech)
            .bind(pool_name)
            .fetch_optional(&self.pool)
            .await?
            .flatten();
        let vector = match query_vec {
            Some(qv) if pool_model.as_deref() == Some(qv.model) => Some(qv.values),
            Some(qv) => {
                log::warn!(
                    "Query embedded with {} but {}/{} was built with {:?}; using keyword ranking",
                    qv.model,
                    technology,
                    pool,
                    pool_model
                );
                None
            }
            None => None,
        };

        let keyword = self.keyword_scores(tech, pool_name, query).await?;
        if vector.is_none() && keyword.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT id, document_id, content, title, description, url, embedding
            FROM chunks
            WHERE technology = ? AND pool = ?
            "#,
        )
        .bind(tech)
        .bind(pool_name)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let score = keyword.get(&id).copied();
            if vector.is_none() && score.is_none() {
                continue;
            }
            let embedding: Option<Vec<u8>> = row.try_get("embedding")?;
            candidates.push(Candidate {
                chunk: IndexedChunk {
                    id,
                    document_id: row.try_get("document_id")?,
                    content: row.try_get("content")?,
                    embedding: embedding.as_deref().map(blob_to_vec),
                    source: DocumentSource {
                        title: row.try_get("title")?,
                        description: row.try_get("description")?,
                        url: row.try_get("url")?,
                        source_type: pool,
                    },
                },
                keyword: score,
            });
        }

        Ok(search::rank(&candidates, vector, semantic_weight, top_k)
            .into_iter()
            .map(|s| SearchHit {
                chunk: s.chunk.clone(),
                score: s.score,
            })
            .collect())
    }

    // BM25 per matching chunk id
    async fn keyword_scores(&self, tech: &str, pool_name: &str, query: &str) -> Result<HashMap<String, f64>> {
        let expression = match search::match_expression(query) {
            Some(expression) => expression,
            None => return Ok(HashMap::new()),
        };

        let rows = sqlx::query(
            r#"
            SELECT chunk_id, rank
            FROM chunks_fts
            WHERE chunks_fts MATCH ? AND technology = ? AND pool = ?
            "#,
        )
        .bind(&expression)
        .bind(tech)
        .bind(pool_name)
        .fetch_all(&self.pool)
        .await?;

        let mut scores = HashMap::with_capacity(rows.len());
        for row in rows {
            let rank: f64 = row.try_get("rank")?;
            // negate so higher = better
            scores.insert(row.try_get("chunk_id")?, -rank);
        }
        Ok(scores)
    }

    pub async fn chunk_count(&self, technology: Technology, pool: Pool) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE technology = ? AND pool = ?")
            .bind(technology.as_str())
            .bind(pool.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    pub async fn total_chunks(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn chunk(id: &str, document_id: &str, content: &str, embedding: Option<Vec<f32>>) -> IndexedChunk {
        IndexedChunk {
            id: id.to_string(),
            document_id: document_id.to_string(),
            content: content.to_string(),
            embedding,
            source: DocumentSource {
                title: "Python Documentation".to_string(),
                description: None,
                url: Some("https://docs.python.org".to_string()),
                source_type: Pool::Official,
            },
        }
    }

    #[tokio::test]
    async fn test_pools_are_separate() {
        let index = KnowledgeIndex::in_memory().await.unwrap();
        index
            .add_chunks(
                Technology::Python,
                Pool::Official,
                None,
                vec![chunk("d-0", "d", "list comprehension", None)],
            )
            .await
            .unwrap();

        assert_eq!(index.chunk_count(Technology::Python, Pool::Official).await.unwrap(), 1);
        assert_eq!(index.chunk_count(Technology::Python, Pool::Community).await.unwrap(), 0);
        assert!(index
            .search(Technology::Python, Pool::Community, "list", None, 0.7, 5)
            .await
            .unwrap()
            .is_empty());
        assert!(index
            .search(Technology::Sql, Pool::Official, "list", None, 0.7, 5)
            .await
            .unwrap()
            .is_empty());

        let hits = index
            .search(Technology::Python, Pool::Official, "list", None, 0.7, 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.source.url.as_deref(), Some("https://docs.python.org"));
    }

    #[tokio::test]
    async fn test_reingest_replaces_document() {
        let index = KnowledgeIndex::in_memory().await.unwrap();
        let tech = Technology::Css;
        index
            .add_chunks(tech, Pool::Official, None, vec![chunk("d-0", "d", "old", None), chunk("d-1", "d", "old", None)])
            .await
            .unwrap();
        index
            .add_chunks(tech, Pool::Official, None, vec![chunk("d-0", "d", "new", None)])
            .await
            .unwrap();

        assert_eq!(index.chunk_count(tech, Pool::Official).await.unwrap(), 1);
        assert!(index.search(tech, Pool::Official, "old", None, 0.7, 5).await.unwrap().is_empty());
        assert_eq!(index.search(tech, Pool::Official, "new", None, 0.7, 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_keyword_search_drops_unmatched() {
        let index = KnowledgeIndex::in_memory().await.unwrap();
        let tech = Technology::Python;
        index
            .add_chunks(
                tech,
                Pool::Official,
                None,
                vec![
                    chunk("a", "d1", "decorators wrap functions; decorators take a function and return one", None),
                    chunk("b", "d2", "generators yield values lazily", None),
                    chunk("c", "d3", "a note on decorators", None),
                ],
            )
            .await
            .unwrap();

        let hits = index.search(tech, Pool::Official, "how do decorators work?", None, 0.7, 5).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&"b"));
        assert_eq!(hits[0].score, 1.0);
    }

    #[tokio::test]
    async fn test_vector_search_keeps_embeddings() {
        let index = KnowledgeIndex::in_memory().await.unwrap();
        let tech = Technology::React;
        index
            .add_chunks(
                tech,
                Pool::Community,
                Some("model-a"),
                vec![
                    chunk("a", "d1", "state updates", Some(vec![0.0, 1.0])),
                    chunk("b", "d2", "effects", Some(vec![1.0, 0.0])),
                ],
            )
            .await
            .unwrap();

        let qv = QueryVector {
            model: "model-a",
            values: &[1.0, 0.0],
        };
        let hits = index.search(tech, Pool::Community, "unrelated words", Some(qv), 1.0, 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.id, "b");
        assert_eq!(hits[0].chunk.embedding.as_deref(), Some(&[1.0f32, 0.0][..]));
    }

    #[tokio::test]
    async fn test_model_mismatch_falls_back_to_keyword() {
        let index = KnowledgeIndex::in_memory().await.unwrap();
        let tech = Technology::Python;
        index
            .add_chunks(
                tech,
                Pool::Official,
                Some("model-a"),
                vec![
                    chunk("a", "d1", "python decorators", Some(vec![0.0, 1.0])),
                    chunk("b", "d2", "unrelated text", Some(vec![1.0, 0.0])),
                ],
            )
            .await
            .unwrap();

        let qv = QueryVector {
            model: "model-b",
            values: &[1.0, 0.0],
        };
        let hits = index.search(tech, Pool::Official, "decorators", Some(qv), 1.0, 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.id, "a");
    }

    #[tokio::test]
    async fn test_model_change_drops_old_vectors() {
        let index = KnowledgeIndex::in_memory().await.unwrap();
        let tech = Technology::Node;
        index
            .add_chunks(tech, Pool::Official, Some("model-a"), vec![chunk("a", "d1", "streams", Some(vec![1.0]))])
            .await
            .unwrap();
        index
            .add_chunks(tech, Pool::Official, Some("model-b"), vec![chunk("b", "d2", "buffers", Some(vec![1.0]))])
            .await
            .unwrap();

        let qv = QueryVector {
            model: "model-b",
            values: &[1.0],
        };
        let hits = index.search(tech, Pool::Official, "", Some(qv), 1.0, 5).await.unwrap();
        let a = hits.iter().find(|h| h.chunk.id == "a").unwrap();
        assert!(a.chunk.embedding.is_none());
        assert_eq!(hits[0].chunk.id, "b");
    }

    #[tokio::test]
    async fn test_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = KnowledgeIndex::open(dir.path()).await.unwrap();
            index
                .add_chunks(
                    Technology::React,
                    Pool::Community,
                    Some("local"),
                    vec![chunk("x-0", "x", "useEffect cleanup", Some(vec![1.0]))],
                )
                .await
                .unwrap();
            index.close().await;
        }

        let reopened = KnowledgeIndex::open(dir.path()).await.unwrap();
        assert_eq!(reopened.chunk_count(Technology::React, Pool::Community).await.unwrap(), 1);
        assert_eq!(reopened.total_chunks().await.unwrap(), 1);
        let hits = reopened
            .search(Technology::React, Pool::Community, "cleanup", None, 0.7, 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_all_persist() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(KnowledgeIndex::open(dir.path()).await.unwrap());

        let mut tasks = Vec::new();
        for writer in 0..16 {
            let index = index.clone();
            tasks.push(tokio::spawn(async move {
                let document_id = format!("doc-{}", writer);
                let chunks = (0..50)
                    .map(|n| {
                        let id = format!("{}-{}", document_id, n);
                        chunk(&id, &document_id, &format!("section {} of {}", n, document_id), Some(vec![1.0, 0.0]))
                    })
                    .collect();
                index.add_chunks(Technology::Python, Pool::Official, Some("local"), chunks).await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 50);
        }
        assert_eq!(index.chunk_count(Technology::Python, Pool::Official).await.unwrap(), 800);
        index.close().await;

        let reopened = KnowledgeIndex::open(dir.path()).await.unwrap();
        assert_eq!(reopened.chunk_count(Technology::Python, Pool::Official).await.unwrap(), 800);
        assert_eq!(reopened.total_chunks().await.unwrap(), 800);
    }

    #[test]
    fn test_blob_round_trip() {
        let v = vec![1.0f32, -2.5, 3.125];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn test_reference_excerpt() {
        let hit = SearchHit {
            chunk: chunk("a", "d", &"x".repeat(500), None),
            score: 0.5,
        };
        let reference = hit.to_reference();
        assert_eq!(reference.excerpt.unwrap().len(), EXCERPT_CHARS);
        assert_eq!(reference.score, 0.5);
    }
}
