// src/stt.rs
//
// Speech-to-text adapter boundary.
//
// The core drives an abstract streaming engine: load a model once per
// session, push raw mono 16 kHz Float32-LE PCM at it, receive timestamped
// segments, flush on end. `StubTranscriber` is the deterministic in-process
// engine (scripted segments per N bytes of audio); the whisper.cpp binding
// lives behind the `whisper` feature.
//
// Model artifacts follow the ggml naming convention. Downloads are
// resumable: a partial `.tmp` survives cancellation and the retry continues
// it with an HTTP Range request, renaming into place only on completion.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};

pub const SEGMENT_CHANNEL_CAPACITY: usize = 64;

// ─── Segments ───────────────────────────────────────────────────────────────

/// One utterance as reported by the engine. Offsets are relative to the
/// session's audio stream; the transcription pipeline converts them to
/// wall-clock absolutes before persisting.
#[derive(Debug, Clone, PartialEq)]
pub struct SttSegment {
    pub text: String,
    pub start_ms: i64,
    pub end_ms: i64,
}

impl SttSegment {
    pub fn duration_ms(&self) -> i64 {
        (self.end_ms - self.start_ms).max(0)
    }
}

// ─── Adapter traits ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub model_path: PathBuf,
    pub language: String,
    pub threads: usize,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    fn name(&self) -> &'static str;

    /// Load the model and open a streaming session. Blocking model load
    /// happens here, once per session. Segments arrive on the returned
    /// receiver; the channel closes after `end()` resolves — never later.
    async fn start_session(
        &self,
        options: SessionOptions,
    ) -> CoreResult<(Box<dyn TranscriberSession>, mpsc::Receiver<SttSegment>)>;
}

#[async_trait]
pub trait TranscriberSession: Send + Sync {
    /// Non-blocking enqueue of raw PCM bytes.
    fn write(&self, pcm: Bytes);

    /// Bytes accepted but not yet turned into segments.
    fn queued_bytes(&self) -> usize;

    /// Flush and close. No restart semantics: a session that failed stays
    /// failed, the caller tears it down and reports `AdapterFatal`.
    async fn end(self: Box<Self>) -> CoreResult<()>;
}

// ─── Stub engine ────────────────────────────────────────────────────────────

/// Deterministic engine for development and tests: every
/// `bytes_per_segment` bytes of input releases the next scripted segment.
pub struct StubTranscriber {
    script: Mutex<VecDeque<SttSegment>>,
    bytes_per_segment: usize,
}

impl StubTranscriber {
    pub fn with_script(script: Vec<SttSegment>, bytes_per_segment: usize) -> Self {
        Self {
            script: Mutex::new(script.into()),
            bytes_per_segment: bytes_per_segment.max(1),
        }
    }
}

#[async_trait]
impl Transcriber for StubTranscriber {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn start_session(
        &self,
        options: SessionOptions,
    ) -> CoreResult<(Box<dyn TranscriberSession>, mpsc::Receiver<SttSegment>)> {
        info!(
            model = %options.model_path.display(),
            language = %options.language,
            "stub transcriber session started"
        );
        let (tx, rx) = mpsc::channel(SEGMENT_CHANNEL_CAPACITY);
        let script: VecDeque<SttSegment> = std::mem::take(&mut *self.script.lock().unwrap());
        Ok((
            Box::new(StubSession {
                tx,
                script: Mutex::new(script),
                bytes_per_segment: self.bytes_per_segment,
                pending_bytes: AtomicUsize::new(0),
            }),
            rx,
        ))
    }
}

struct StubSession {
    tx: mpsc::Sender<SttSegment>,
    script: Mutex<VecDeque<SttSegment>>,
    bytes_per_segment: usize,
    pending_bytes: AtomicUsize,
}

#[async_trait]
impl TranscriberSession for StubSession {
    fn write(&self, pcm: Bytes) {
        let total = self.pending_bytes.fetch_add(pcm.len(), Ordering::AcqRel) + pcm.len();
        let due = total / self.bytes_per_segment;
        for _ in 0..due {
            let previous = self.pending_bytes.load(Ordering::Acquire);
            if previous < self.bytes_per_segment {
                break;
            }
            self.pending_bytes
                .fetch_sub(self.bytes_per_segment, Ordering::AcqRel);
            let Some(segment) = self.script.lock().unwrap().pop_front() else {
                break;
            };
            if self.tx.try_send(segment).is_err() {
                warn!("stub segment channel full, dropping segment");
            }
        }
    }

    fn queued_bytes(&self) -> usize {
        self.pending_bytes.load(Ordering::Acquire)
    }

    async fn end(self: Box<Self>) -> CoreResult<()> {
        // Flush whatever the script still holds, then close the channel by
        // dropping the sender.
        let remaining: Vec<SttSegment> = self.script.lock().unwrap().drain(..).collect();
        for segment in remaining {
            let _ = self.tx.send(segment).await;
        }
        Ok(())
    }
}

// ─── Model resolution ───────────────────────────────────────────────────────

/// Resolve the on-disk model artifact for `(size, language)`.
///
/// English sessions prefer the English-only artifact
/// (`ggml-<size>.en.bin`) when it exists; otherwise the multilingual
/// `ggml-<size>.bin`. Nothing on disk is a `ModelMissing` error.
pub fn resolve_model_path(model_dir: &Path, size: &str, language: &str) -> CoreResult<PathBuf> {
    if language == "en" {
        let english = model_dir.join(format!("ggml-{size}.en.bin"));
        if english.exists() {
            return Ok(english);
        }
    }
    let multilingual = model_dir.join(format!("ggml-{size}.bin"));
    if multilingual.exists() {
        return Ok(multilingual);
    }
    Err(CoreError::ModelMissing(format!(
        "no ggml-{size} model in {} (expected ggml-{size}.en.bin or ggml-{size}.bin)",
        model_dir.display()
    )))
}

/// Canonical download URL for a ggml artifact.
pub fn model_url(file_name: &str) -> String {
    format!("https://huggingface.co/ggerganov/whisper.cpp/resolve/main/{file_name}")
}

// ─── Resumable download ─────────────────────────────────────────────────────

/// Download `url` into `dest` via a `<dest>.tmp` partial.
///
/// A pre-existing partial is continued with `Range: bytes=<len>-`; servers
/// that ignore the range (200) restart the file from scratch. The partial is
/// deliberately left behind on failure or cancellation — that is the resume
/// state. Only a completed download renames into place, so `dest` is always
/// byte-identical to a fresh full download.
pub async fn download_model(client: &reqwest::Client, url: &str, dest: &Path) -> CoreResult<()> {
    let tmp = partial_path(dest);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let resume_from = match tokio::fs::metadata(&tmp).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };

    let mut request = client.get(url);
    if resume_from > 0 {
        request = request.header(reqwest::header::RANGE, format!("bytes={resume_from}-"));
        info!(url, resume_from, "resuming model download");
    } else {
        info!(url, "starting model download");
    }

    let response = request
        .send()
        .await
        .map_err(|e| CoreError::ModelMissing(format!("model download failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(CoreError::ModelMissing(format!(
            "model download failed: HTTP {status}"
        )));
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&tmp)
        .await?;

    if status == reqwest::StatusCode::PARTIAL_CONTENT && resume_from > 0 {
        file.seek(std::io::SeekFrom::Start(resume_from)).await?;
    } else {
        // Full body — the server ignored the range (or there was none).
        file.set_len(0).await?;
    }

    let mut response = response;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| CoreError::ModelMissing(format!("model download interrupted: {e}")))?
    {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&tmp, dest).await?;
    info!(dest = %dest.display(), "model download complete");
    Ok(())
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".tmp");
    dest.with_file_name(name)
}

// ─── whisper.cpp engine (feature-gated) ─────────────────────────────────────

#[cfg(feature = "whisper")]
pub mod whisper {
    //! Streaming whisper.cpp binding. One `WhisperContext` per session;
    //! inference runs on the blocking pool over accumulated PCM windows.

    use super::*;
    use std::sync::Arc;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// Seconds of audio accumulated before each inference pass.
    const WINDOW_SECS: usize = 5;
    const SAMPLE_RATE: usize = 16_000;

    pub struct WhisperTranscriber;

    #[async_trait]
    impl Transcriber for WhisperTranscriber {
        fn name(&self) -> &'static str {
            "whisper"
        }

        async fn start_session(
            &self,
            options: SessionOptions,
        ) -> CoreResult<(Box<dyn TranscriberSession>, mpsc::Receiver<SttSegment>)> {
            let model_path = options.model_path.clone();
            let context = tokio::task::spawn_blocking(move || {
                WhisperContext::new_with_params(
                    model_path.to_str().unwrap_or_default(),
                    WhisperContextParameters::default(),
                )
            })
            .await
            .map_err(|e| CoreError::AdapterFatal(format!("model load join error: {e}")))?
            .map_err(|e| CoreError::ModelMissing(format!("failed to load model: {e}")))?;

            let (segment_tx, segment_rx) = mpsc::channel(SEGMENT_CHANNEL_CAPACITY);
            let (pcm_tx, pcm_rx) = mpsc::unbounded_channel::<Option<Bytes>>();
            let queued = Arc::new(AtomicUsize::new(0));

            let worker_queued = queued.clone();
            let language = options.language.clone();
            let threads = options.threads.max(1) as i32;
            tokio::task::spawn_blocking(move || {
                inference_loop(context, pcm_rx, segment_tx, worker_queued, language, threads);
            });

            Ok((
                Box::new(WhisperSession {
                    pcm_tx,
                    queued,
                }),
                segment_rx,
            ))
        }
    }

    struct WhisperSession {
        pcm_tx: mpsc::UnboundedSender<Option<Bytes>>,
        queued: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TranscriberSession for WhisperSession {
        fn write(&self, pcm: Bytes) {
            self.queued.fetch_add(pcm.len(), Ordering::AcqRel);
            let _ = self.pcm_tx.send(Some(pcm));
        }

        fn queued_bytes(&self) -> usize {
            self.queued.load(Ordering::Acquire)
        }

        async fn end(self: Box<Self>) -> CoreResult<()> {
            let _ = self.pcm_tx.send(None);
            Ok(())
        }
    }

    fn inference_loop(
        context: WhisperContext,
        mut pcm_rx: mpsc::UnboundedReceiver<Option<Bytes>>,
        segment_tx: mpsc::Sender<SttSegment>,
        queued: Arc<AtomicUsize>,
        language: String,
        threads: i32,
    ) {
        let mut samples: Vec<f32> = Vec::new();
        let mut stream_offset_ms: i64 = 0;
        let window = WINDOW_SECS * SAMPLE_RATE;

        while let Some(message) = pcm_rx.blocking_recv() {
            let flush = message.is_none();
            if let Some(pcm) = message {
                queued.fetch_sub(pcm.len().min(queued.load(Ordering::Acquire)), Ordering::AcqRel);
                samples.extend(
                    pcm.chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
                );
            }

            while samples.len() >= window || (flush && !samples.is_empty()) {
                let take = samples.len().min(window);
                let chunk: Vec<f32> = samples.drain(..take).collect();
                let chunk_ms = (chunk.len() * 1000 / SAMPLE_RATE) as i64;

                match run_inference(&context, &chunk, &language, threads) {
                    Ok(segments) => {
                        for mut segment in segments {
                            segment.start_ms += stream_offset_ms;
                            segment.end_ms += stream_offset_ms;
                            if segment_tx.blocking_send(segment).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("whisper inference failed, ending session: {e}");
                        return;
                    }
                }
                stream_offset_ms += chunk_ms;
            }

            if flush {
                return;
            }
        }
    }

    fn run_inference(
        context: &WhisperContext,
        samples: &[f32],
        language: &str,
        threads: i32,
    ) -> Result<Vec<SttSegment>, String> {
        let mut padded = samples.to_vec();
        // whisper.cpp requires at least a second of audio.
        let min_samples = SAMPLE_RATE + SAMPLE_RATE / 20;
        if padded.len() < min_samples {
            padded.resize(min_samples, 0.0);
        }

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        if language != "auto" {
            params.set_language(Some(language));
        }
        params.set_n_threads(threads);
        params.set_translate(false);
        params.set_no_context(true);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        let mut state = context
            .create_state()
            .map_err(|e| format!("create_state: {e}"))?;
        state
            .full(params, &padded)
            .map_err(|e| format!("inference: {e}"))?;

        let count = state
            .full_n_segments()
            .map_err(|e| format!("segment count: {e}"))?;
        let mut segments = Vec::with_capacity(count as usize);
        for i in 0..count {
            let text = state
                .full_get_segment_text(i)
                .map_err(|e| format!("segment text: {e}"))?;
            let start = state.full_get_segment_t0(i).map_err(|e| e.to_string())? * 10;
            let end = state.full_get_segment_t1(i).map_err(|e| e.to_string())? * 10;
            segments.push(SttSegment {
                text: text.trim().to_string(),
                start_ms: start,
                end_ms: end,
            });
        }
        Ok(segments)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn scripted(texts: &[&str]) -> Vec<SttSegment> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| SttSegment {
                text: (*t).to_string(),
                start_ms: i as i64 * 1000,
                end_ms: i as i64 * 1000 + 900,
            })
            .collect()
    }

    #[tokio::test]
    async fn stub_releases_segments_per_written_bytes() {
        let engine = StubTranscriber::with_script(scripted(&["one", "two", "three"]), 100);
        let (session, mut rx) = engine
            .start_session(SessionOptions {
                model_path: PathBuf::from("ggml-base.en.bin"),
                language: "en".into(),
                threads: 2,
            })
            .await
            .unwrap();

        session.write(Bytes::from(vec![0u8; 150]));
        assert_eq!(rx.recv().await.unwrap().text, "one");
        assert_eq!(session.queued_bytes(), 50);

        session.write(Bytes::from(vec![0u8; 50]));
        assert_eq!(rx.recv().await.unwrap().text, "two");

        // end() flushes the remaining script and closes the channel.
        session.end().await.unwrap();
        assert_eq!(rx.recv().await.unwrap().text, "three");
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn model_resolution_prefers_english_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let english = dir.path().join("ggml-base.en.bin");
        let multilingual = dir.path().join("ggml-base.bin");

        // Nothing on disk → ModelMissing.
        let err = resolve_model_path(dir.path(), "base", "en").unwrap_err();
        assert_eq!(err.code(), "model_missing");

        std::fs::write(&multilingual, b"m").unwrap();
        assert_eq!(
            resolve_model_path(dir.path(), "base", "en").unwrap(),
            multilingual
        );

        std::fs::write(&english, b"e").unwrap();
        assert_eq!(
            resolve_model_path(dir.path(), "base", "en").unwrap(),
            english
        );

        // Non-English sessions never pick the .en artifact.
        assert_eq!(
            resolve_model_path(dir.path(), "base", "fr").unwrap(),
            multilingual
        );
    }

    #[test]
    fn partial_path_appends_tmp() {
        assert_eq!(
            partial_path(Path::new("/models/ggml-base.bin")),
            PathBuf::from("/models/ggml-base.bin.tmp")
        );
    }

    // A tiny Range-aware file server so the resume path is exercised for
    // real: serve `body`, honoring `Range: bytes=N-`.
    async fn spawn_range_server(body: &'static [u8]) -> String {
        use axum::http::{header, StatusCode};
        use axum::response::IntoResponse;
        use axum::routing::get;

        let app = axum::Router::new().route(
            "/model.bin",
            get(move |headers: axum::http::HeaderMap| async move {
                let range = headers
                    .get(header::RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("bytes="))
                    .and_then(|v| v.strip_suffix('-'))
                    .and_then(|v| v.parse::<usize>().ok());
                match range {
                    Some(start) if start < body.len() => {
                        (StatusCode::PARTIAL_CONTENT, body[start..].to_vec()).into_response()
                    }
                    _ => (StatusCode::OK, body.to_vec()).into_response(),
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/model.bin")
    }

    #[tokio::test]
    async fn range_resume_produces_byte_identical_file() {
        const BODY: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
        let url = spawn_range_server(BODY).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("ggml-base.bin");
        let client = reqwest::Client::new();

        // Simulate an interrupted download: a non-empty partial on disk.
        std::fs::write(partial_path(&dest), &BODY[..10]).unwrap();

        download_model(&client, &url, &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), BODY);
        assert!(!partial_path(&dest).exists());

        // A fresh download of the same URL matches bit for bit.
        let fresh = dir.path().join("fresh.bin");
        download_model(&client, &url, &fresh).await.unwrap();
        assert_eq!(std::fs::read(&fresh).unwrap(), std::fs::read(&dest).unwrap());
    }
}
