// src/transcription.rs
//
// Per-producer transcription sessions: fork the producer's audio, stream the
// converter's PCM into the speech-to-text engine, and route every emitted
// segment to the store, the embedder, the live bus and (when a recording is
// active) the transcript file writer.
//
// Timestamp policy: the engine's reported offsets are used only for the
// segment duration. The persisted end time is `now()` at arrival and the
// start is `now() - duration`, so segments from different producers are
// globally comparable and monotonically unique per arrival.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::embedder::{EmbedTask, Embedder};
use crate::error::CoreResult;
use crate::forker::{ConverterSpec, RtpFork};
use crate::models::NewTranscriptSegment;
use crate::ports::PortArena;
use crate::sfu::SfuRouter;
use crate::stt::{resolve_model_path, SessionOptions, Transcriber, TranscriberSession};
use crate::transcript_writer::TranscriptFileWriter;
use crate::transcripts::TranscriptStore;

const MIN_SEGMENT_CHARS: usize = 2;

// ─── Session identity ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProducerContext {
    /// The server's internal producer id (session key).
    pub producer_id: String,
    /// The engine's own producer id, used for the side-car consume.
    pub sfu_producer_id: String,
    pub room_id: String,
    pub channel_name: String,
    pub display_name: String,
    pub language: String,
}

// ─── Stats ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub producer_id: String,
    pub channel_name: String,
    pub uptime_secs: u64,
    pub segments_processed: u64,
    pub errors: u64,
    pub queue_bytes: usize,
    pub failed: bool,
}

struct Counters {
    segments: AtomicU64,
    errors: AtomicU64,
    queue_bytes: AtomicUsize,
    failed: AtomicBool,
}

// ─── Handle ─────────────────────────────────────────────────────────────────

pub struct TranscriptionHandle {
    context: ProducerContext,
    fork: RtpFork,
    session: Mutex<Option<Box<dyn TranscriberSession>>>,
    writer: Mutex<Option<Arc<Mutex<TranscriptFileWriter>>>>,
    counters: Counters,
    started: Instant,
    cancel: CancellationToken,
}

impl TranscriptionHandle {
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            producer_id: self.context.producer_id.clone(),
            channel_name: self.context.channel_name.clone(),
            uptime_secs: self.started.elapsed().as_secs(),
            segments_processed: self.counters.segments.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            queue_bytes: self.counters.queue_bytes.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    pub fn failed(&self) -> bool {
        self.counters.failed.load(Ordering::Relaxed)
    }

    async fn bind_writer(&self, writer: Arc<Mutex<TranscriptFileWriter>>) {
        *self.writer.lock().await = Some(writer);
    }

    async fn unbind_writer(&self) {
        *self.writer.lock().await = None;
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        self.fork.teardown().await;
        if let Some(session) = self.session.lock().await.take() {
            if let Err(e) = session.end().await {
                warn!(
                    producer = %self.context.producer_id,
                    "transcriber end() failed: {e}"
                );
            }
        }
    }
}

// ─── Manager ────────────────────────────────────────────────────────────────

pub struct TranscriptionManager {
    enabled: bool,
    model_dir: std::path::PathBuf,
    model_size: String,
    transcriber: Arc<dyn Transcriber>,
    store: TranscriptStore,
    embedder: Embedder,
    arena: Arc<PortArena>,
    converter: ConverterSpec,
    active: DashMap<String, Arc<TranscriptionHandle>>,
}

impl TranscriptionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        enabled: bool,
        model_dir: std::path::PathBuf,
        model_size: String,
        transcriber: Arc<dyn Transcriber>,
        store: TranscriptStore,
        embedder: Embedder,
        arena: Arc<PortArena>,
        converter: ConverterSpec,
    ) -> Self {
        Self {
            enabled,
            model_dir,
            model_size,
            transcriber,
            store,
            embedder,
            arena,
            converter,
            active: DashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn stats(&self) -> Vec<SessionStats> {
        let mut stats: Vec<SessionStats> =
            self.active.iter().map(|entry| entry.stats()).collect();
        stats.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));
        stats
    }

    /// Start a session for a freshly arrived producer. A no-op when the
    /// pipeline is disabled or a session already exists for this producer.
    pub async fn start_for_producer(
        &self,
        router: &Arc<dyn SfuRouter>,
        context: ProducerContext,
        writer: Option<Arc<Mutex<TranscriptFileWriter>>>,
    ) -> CoreResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.active.contains_key(&context.producer_id) {
            return Ok(());
        }

        let model_path =
            resolve_model_path(&self.model_dir, &self.model_size, &context.language)?;

        let (session, segments_rx) = self
            .transcriber
            .start_session(SessionOptions {
                model_path,
                language: context.language.clone(),
                threads: std::thread::available_parallelism()
                    .map(|n| n.get().min(4))
                    .unwrap_or(2),
            })
            .await?;

        let (pcm_tx, pcm_rx) = mpsc::channel(64);
        let fork = match RtpFork::start(
            router,
            &self.arena,
            &context.sfu_producer_id,
            &self.converter,
            Some(pcm_tx),
        )
        .await
        {
            Ok(fork) => fork,
            Err(e) => {
                // The engine session is already open; flush it on the way
                // out.
                tokio::spawn(async move {
                    let _ = session.end().await;
                });
                return Err(e);
            }
        };

        let handle = Arc::new(TranscriptionHandle {
            context: context.clone(),
            fork,
            session: Mutex::new(Some(session)),
            writer: Mutex::new(writer),
            counters: Counters {
                segments: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                queue_bytes: AtomicUsize::new(0),
                failed: AtomicBool::new(false),
            },
            started: Instant::now(),
            cancel: CancellationToken::new(),
        });

        spawn_pcm_pump(handle.clone(), pcm_rx);
        spawn_segment_task(
            handle.clone(),
            segments_rx,
            self.store.clone(),
            self.embedder.clone(),
        );

        info!(
            producer = %context.producer_id,
            channel = %context.channel_name,
            language = %context.language,
            "transcription session started"
        );
        self.active.insert(context.producer_id.clone(), handle);
        Ok(())
    }

    /// Stop and tear down a producer's session (no-op when absent).
    pub async fn stop_for_producer(&self, producer_id: &str) {
        if let Some((_, handle)) = self.active.remove(producer_id) {
            handle.shutdown().await;
            info!(producer = producer_id, "transcription session stopped");
        }
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop_for_producer(&id).await;
        }
    }

    /// Attach a transcript file writer to a running session (recording
    /// started after the producer).
    pub async fn bind_writer(&self, producer_id: &str, writer: Arc<Mutex<TranscriptFileWriter>>) {
        if let Some(handle) = self.active.get(producer_id) {
            handle.bind_writer(writer).await;
        }
    }

    pub async fn unbind_writer(&self, producer_id: &str) {
        if let Some(handle) = self.active.get(producer_id) {
            handle.unbind_writer().await;
        }
    }
}

// ─── Tasks ──────────────────────────────────────────────────────────────────

fn spawn_pcm_pump(handle: Arc<TranscriptionHandle>, mut pcm_rx: mpsc::Receiver<bytes::Bytes>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = handle.cancel.cancelled() => break,
                chunk = pcm_rx.recv() => {
                    let Some(chunk) = chunk else { break };
                    let session = handle.session.lock().await;
                    if let Some(session) = session.as_ref() {
                        session.write(chunk);
                        handle
                            .counters
                            .queue_bytes
                            .store(session.queued_bytes(), Ordering::Relaxed);
                    } else {
                        break;
                    }
                }
            }
        }
    });
}

fn spawn_segment_task(
    handle: Arc<TranscriptionHandle>,
    mut segments_rx: mpsc::Receiver<crate::stt::SttSegment>,
    store: TranscriptStore,
    embedder: Embedder,
) {
    tokio::spawn(async move {
        while let Some(segment) = segments_rx.recv().await {
            let text = segment.text.trim().to_string();
            if text.chars().count() < MIN_SEGMENT_CHARS {
                continue;
            }

            // Wall-clock absolutes; the engine offset only supplies the
            // duration.
            let end = Utc::now().timestamp_millis() as f64 / 1000.0;
            let start = end - segment.duration_ms() as f64 / 1000.0;

            let new_segment = NewTranscriptSegment {
                room_id: handle.context.room_id.clone(),
                channel_name: handle.context.channel_name.clone(),
                producer_id: handle.context.producer_id.clone(),
                producer_display_name: handle.context.display_name.clone(),
                text_content: text,
                timestamp_start: start,
                timestamp_end: end,
                confidence: 1.0,
                language: handle.context.language.clone(),
            };

            match store.create(new_segment) {
                Ok(stored) => {
                    handle.counters.segments.fetch_add(1, Ordering::Relaxed);
                    embedder.enqueue(EmbedTask {
                        transcript_id: stored.id,
                        text: stored.text_content.clone(),
                        room_id: stored.room_id.clone(),
                    });
                    if let Some(writer) = handle.writer.lock().await.clone() {
                        writer.lock().await.append(&stored).await;
                    }
                }
                Err(e) => {
                    handle.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        producer = %handle.context.producer_id,
                        "failed to persist transcript segment: {e}"
                    );
                }
            }
        }

        // The channel closed. If nobody asked for that, the adapter died:
        // mark the session failed and tear down its fork. The recording (if
        // any) is unaffected.
        if !handle.cancel.is_cancelled() {
            handle.counters.failed.store(true, Ordering::Relaxed);
            warn!(
                producer = %handle.context.producer_id,
                "transcriber closed unexpectedly, session marked failed"
            );
            handle.shutdown().await;
        }
    });
}

// ─── Tests ──────────────────────────────────────────────────────────────────
