// src/embedder.rs
//
// Embedding pipeline and vector similarity search.
//
//   TranscriptionSession ──enqueue──> bounded queue ──> worker task
//                                                         │ batches of N
//                                                         ▼
//                                       text → 384-float32 vector (embedder)
//                                                         │
//                                        one transaction: vector row + metadata
//
// The vector row and its metadata row share the same rowid — that coupling
// is the only link between the two storage layers, so both inserts happen
// in a single transaction. Embedding generation is out-of-order with respect
// to segment arrival; embeddings are addressable only by transcript id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rusqlite::params;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::db::Db;
use crate::error::{CoreError, CoreResult};
use crate::models::{TranscriptMatch, TranscriptSegment};

pub const EMBEDDING_DIM: usize = 384;
const QUEUE_CAPACITY: usize = 512;
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Candidate cutoff for the SQL predicate: rows at an L2 distance of 10 or
/// more never make it into the ranking.
const MAX_L2_DISTANCE: f64 = 10.0;

// ─── Text-to-vector function ────────────────────────────────────────────────

/// Abstract text-to-vector function. Implementations MUST produce
/// mean-pooled, L2-normalized vectors of exactly [`EMBEDDING_DIM`] floats.
pub trait TextEmbedder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Blocking batch embedding; the worker runs it on the blocking pool.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String>;
}

/// Deterministic hashing embedder: tokenized bag-of-words folded into the
/// vector space, L2-normalized. No model download, stable across runs —
/// the development/test stand-in for the ONNX-backed embedder, with real
/// overlap semantics (shared tokens → closer vectors).
pub struct HashEmbedder;

impl HashEmbedder {
    fn token_bucket(token: &str) -> usize {
        // djb2
        let mut hash: u64 = 5381;
        for byte in token.bytes() {
            hash = hash.wrapping_mul(33).wrapping_add(u64::from(byte));
        }
        (hash % EMBEDDING_DIM as u64) as usize
    }

    fn embed_one(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; EMBEDDING_DIM];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            vector[Self::token_bucket(token)] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl TextEmbedder for HashEmbedder {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
        Ok(texts.iter().map(|t| Self::embed_one(t)).collect())
    }
}

/// ONNX-backed embedder (AllMiniLM-L6-v2, 384 dims) behind the `fastembed`
/// feature.
#[cfg(feature = "fastembed")]
pub struct OnnxEmbedder {
    model: std::sync::Mutex<fastembed::TextEmbedding>,
}

#[cfg(feature = "fastembed")]
impl OnnxEmbedder {
    pub fn new(cache_dir: std::path::PathBuf) -> Result<Self, String> {
        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed::EmbeddingModel::AllMiniLML6V2)
                .with_cache_dir(cache_dir),
        )
        .map_err(|e| format!("failed to load embedding model: {e}"))?;
        Ok(Self {
            model: std::sync::Mutex::new(model),
        })
    }
}

#[cfg(feature = "fastembed")]
impl TextEmbedder for OnnxEmbedder {
    fn name(&self) -> &'static str {
        "all-minilm-l6-v2"
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
        let mut model = self.model.lock().unwrap();
        model
            .embed(texts.to_vec(), None)
            .map_err(|e| format!("embedding generation failed: {e}"))
    }
}

// ─── Queue plumbing ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EmbedTask {
    pub transcript_id: i64,
    pub text: String,
    pub room_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: Option<u32>,
    pub min_score: Option<f64>,
    pub channel_name: Option<String>,
}

/// Handle to the embedding pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Embedder {
    tx: Option<mpsc::Sender<EmbedTask>>,
    inner: Arc<EmbedderInner>,
}

struct EmbedderInner {
    db: Db,
    text_embedder: Option<Arc<dyn TextEmbedder>>,
    processed: AtomicU64,
    dropped: AtomicU64,
}

impl Embedder {
    /// Start the worker and return the handle.
    pub fn spawn(db: Db, text_embedder: Arc<dyn TextEmbedder>, batch_size: usize) -> Self {
        let (tx, rx) = mpsc::channel::<EmbedTask>(QUEUE_CAPACITY);
        let inner = Arc::new(EmbedderInner {
            db,
            text_embedder: Some(text_embedder.clone()),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let worker_inner = inner.clone();
        tokio::spawn(async move {
            embed_worker(worker_inner, rx, batch_size.max(1)).await;
        });
        info!(embedder = text_embedder.name(), "embedding worker started");

        Self {
            tx: Some(tx),
            inner,
        }
    }

    /// A no-op pipeline for `EMBEDDING_ENABLED=false`.
    pub fn disabled(db: Db) -> Self {
        Self {
            tx: None,
            inner: Arc::new(EmbedderInner {
                db,
                text_embedder: None,
                processed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Enqueue a segment for embedding. Never blocks: when the queue is full
    /// the task is dropped and logged — search stays queryable without that
    /// row.
    pub fn enqueue(&self, task: EmbedTask) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(task) {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("embedding queue full, dropping segment: {e}");
        }
    }

    pub fn processed_count(&self) -> u64 {
        self.inner.processed.load(Ordering::Relaxed)
    }

    /// Generate the query vector and run the similarity search.
    ///
    /// Fails hard when no embedder is available — there is deliberately no
    /// text-match fallback.
    pub fn search_similar(
        &self,
        query_text: &str,
        room_id: &str,
        options: &SearchOptions,
    ) -> CoreResult<Vec<TranscriptMatch>> {
        let text_embedder = self
            .inner
            .text_embedder
            .as_ref()
            .ok_or_else(|| CoreError::Embedding("embedding pipeline is disabled".into()))?;

        let query_vec = text_embedder
            .embed(&[query_text.to_string()])
            .map_err(CoreError::Embedding)?
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::Embedding("embedder returned no vector".into()))?;
        validate_dim(&query_vec)?;

        let limit = options.limit.unwrap_or(10);
        let min_score = options.min_score.unwrap_or(0.5);
        let channel = options.channel_name.as_deref();

        let scored = if self.inner.db.vec_native() {
            self.search_native(&query_vec, room_id, channel, limit)?
        } else {
            self.search_fallback(&query_vec, room_id, channel, limit)?
        };

        Ok(scored
            .into_iter()
            .map(|(segment, dist)| TranscriptMatch {
                segment,
                similarity: 1.0 / (1.0 + dist),
            })
            .filter(|m| m.similarity >= min_score)
            .collect())
    }

    fn search_native(
        &self,
        query_vec: &[f32],
        room_id: &str,
        channel: Option<&str>,
        limit: u32,
    ) -> CoreResult<Vec<(TranscriptSegment, f64)>> {
        let blob = vec_to_blob(query_vec);
        self.inner.db.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT t.id, t.room_id, t.channel_name, t.producer_id, \
                        t.producer_display_name, t.text_content, t.timestamp_start, \
                        t.timestamp_end, t.confidence, t.language, t.created_at, \
                        vec_distance_L2(v.embedding, ?1) AS dist \
                 FROM transcript_vectors v \
                 JOIN embedding_metadata m ON m.id = v.rowid \
                 JOIN transcripts t ON t.id = m.transcript_id \
                 WHERE m.room_id = ?2 AND dist < ?3",
            );
            if channel.is_some() {
                sql.push_str(" AND t.channel_name = ?5");
            }
            sql.push_str(" ORDER BY dist ASC LIMIT ?4");

            let mut stmt = conn.prepare(&sql)?;
            let map = |row: &rusqlite::Row<'_>| {
                Ok((map_segment_prefix(row)?, row.get::<_, f64>(11)?))
            };
            let rows = match channel {
                Some(c) => stmt
                    .query_map(
                        params![blob, room_id, MAX_L2_DISTANCE, limit, c],
                        map,
                    )?
                    .collect(),
                None => stmt
                    .query_map(params![blob, room_id, MAX_L2_DISTANCE, limit], map)?
                    .collect(),
            };
            rows
        })
    }

    /// Extension-less backend: pull the room's vectors and rank in process.
    fn search_fallback(
        &self,
        query_vec: &[f32],
        room_id: &str,
        channel: Option<&str>,
        limit: u32,
    ) -> CoreResult<Vec<(TranscriptSegment, f64)>> {
        let mut scored = self.inner.db.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT t.id, t.room_id, t.channel_name, t.producer_id, \
                        t.producer_display_name, t.text_content, t.timestamp_start, \
                        t.timestamp_end, t.confidence, t.language, t.created_at, \
                        v.embedding \
                 FROM transcript_vectors v \
                 JOIN embedding_metadata m ON m.id = v.id \
                 JOIN transcripts t ON t.id = m.transcript_id \
                 WHERE m.room_id = ?1",
            );
            if channel.is_some() {
                sql.push_str(" AND t.channel_name = ?2");
            }

            let mut stmt = conn.prepare(&sql)?;
            let map = |row: &rusqlite::Row<'_>| {
                let segment = map_segment_prefix(row)?;
                let blob: Vec<u8> = row.get(11)?;
                Ok((segment, blob))
            };
            let rows: rusqlite::Result<Vec<_>> = match channel {
                Some(c) => stmt.query_map(params![room_id, c], map)?.collect(),
                None => stmt.query_map(params![room_id], map)?.collect(),
            };
            rows
        })?;

        let mut ranked: Vec<(TranscriptSegment, f64)> = scored
            .drain(..)
            .map(|(segment, blob)| {
                let dist = l2_distance(query_vec, &blob_to_vec(&blob));
                (segment, dist)
            })
            .filter(|(_, dist)| *dist < MAX_L2_DISTANCE)
            .collect();
        ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(limit as usize);
        Ok(ranked)
    }

    /// Generate and persist one batch. Used by the worker; exposed so tests
    /// can drive the pipeline synchronously.
    pub fn embed_and_store(&self, tasks: &[EmbedTask]) -> CoreResult<usize> {
        let Some(text_embedder) = &self.inner.text_embedder else {
            return Ok(0);
        };
        if tasks.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = tasks.iter().map(|t| t.text.clone()).collect();
        let vectors = text_embedder.embed(&texts).map_err(CoreError::Embedding)?;
        if vectors.len() != tasks.len() {
            return Err(CoreError::Embedding(format!(
                "embedder returned {} vectors for {} texts",
                vectors.len(),
                tasks.len()
            )));
        }

        let mut stored = 0;
        for (task, vector) in tasks.iter().zip(vectors) {
            validate_dim(&vector)?;
            // Vector first, then metadata with the vector's rowid — one
            // transaction so the shared-rowid invariant can never be
            // half-written.
            self.inner.db.with_tx(|tx| {
                tx.execute(
                    "INSERT INTO transcript_vectors (embedding) VALUES (?1)",
                    params![vec_to_blob(&vector)],
                )?;
                let vector_id = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO embedding_metadata (id, transcript_id, room_id)
                     VALUES (?1, ?2, ?3)",
                    params![vector_id, task.transcript_id, task.room_id],
                )?;
                Ok(())
            })?;
            stored += 1;
        }
        self.inner
            .processed
            .fetch_add(stored as u64, Ordering::Relaxed);
        Ok(stored)
    }
}

async fn embed_worker(
    inner: Arc<EmbedderInner>,
    mut rx: mpsc::Receiver<EmbedTask>,
    batch_size: usize,
) {
    let embedder = Embedder {
        tx: None,
        inner: inner.clone(),
    };

    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(task) => batch.push(task),
                Err(_) => break,
            }
        }

        let worker = embedder.clone();
        let result =
            tokio::task::spawn_blocking(move || worker.embed_and_store(&batch)).await;

        match result {
            Ok(Ok(stored)) => debug!(stored, "embedding batch persisted"),
            Ok(Err(e)) => warn!("embedding batch failed (segments stay un-indexed): {e}"),
            Err(e) => warn!("embedding worker join error: {e}"),
        }
    }
}

fn map_segment_prefix(row: &rusqlite::Row<'_>) -> rusqlite::Result<TranscriptSegment> {
    Ok(TranscriptSegment {
        id: row.get(0)?,
        room_id: row.get(1)?,
        channel_name: row.get(2)?,
        producer_id: row.get(3)?,
        producer_display_name: row.get(4)?,
        text_content: row.get(5)?,
        timestamp_start: row.get(6)?,
        timestamp_end: row.get(7)?,
        confidence: row.get(8)?,
        language: row.get(9)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&row.get::<_, String>(10)?)
            .map(|t| t.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
    })
}

// ─── Vector helpers ─────────────────────────────────────────────────────────

fn validate_dim(vector: &[f32]) -> CoreResult<()> {
    if vector.len() != EMBEDDING_DIM {
        return Err(CoreError::Embedding(format!(
            "expected {EMBEDDING_DIM}-dim vector, got {}",
            vector.len()
        )));
    }
    Ok(())
}

pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn l2_distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = f64::from(x - y);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
