// src/recording.rs
//
// Recording sink: one active recording per room; each live producer gets a
// plain-RTP fork into an encoder child whose output is a per-track Ogg file
// inside the recording folder:
//
//   recordings/
//     └─ <roomSlug>_<UTC_YYYYMMDDTHHMMSS>/
//         ├─ metadata.json                (rewritten on every change)
//         └─ <sanitizedChannel>/
//             └─ <sanitizedProducer>_<epochMs>.ogg  (+ .txt/.srt/.vtt/.json)
//
// Producers arriving mid-recording start additional tracks; departures stop
// single tracks. A track failure (port exhaustion, spawn failure) marks only
// that track as error — the recording and its other tracks continue.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::db::Db;
use crate::error::{CoreError, CoreResult};
use crate::forker::{ConverterSpec, RtpFork};
use crate::models::{sanitize_name, Recording, RecordingStatus, RecordingTrack, Room};
use crate::ports::PortArena;
use crate::sfu::SfuRouter;
use crate::transcript_writer::TranscriptFileWriter;
use crate::transcription::ProducerContext;

pub type ConverterFactory = Box<dyn Fn(&std::path::Path) -> ConverterSpec + Send + Sync>;

// ---------------------------------------------------------------------------
// Active state
// ---------------------------------------------------------------------------

struct TrackHandle {
    track_id: String,
    producer_id: String,
    fork: RtpFork,
    relative_path: String,
    writer: Arc<Mutex<TranscriptFileWriter>>,
}

pub struct ActiveRecording {
    pub recording_id: String,
    pub room_id: String,
    pub room_slug: String,
    pub folder: PathBuf,
    started_at: DateTime<Utc>,
    tracks: Mutex<HashMap<String, TrackHandle>>,
}

// ---------------------------------------------------------------------------
// Metadata journal
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetadataFile<'a> {
    recording_id: &'a str,
    room_slug: &'a str,
    status: RecordingStatus,
    started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stopped_at: Option<DateTime<Utc>>,
    tracks: Vec<MetadataTrack>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetadataTrack {
    id: String,
    channel_name: String,
    producer_id: String,
    producer_display_name: String,
    file_path: Option<String>,
    status: RecordingStatus,
    started_at: DateTime<Utc>,
    stopped_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// RecordingManager
// ---------------------------------------------------------------------------

pub struct RecordingManager {
    db: Db,
    base_dir: PathBuf,
    arena: Arc<PortArena>,
    converter_factory: ConverterFactory,
    active: DashMap<String, Arc<ActiveRecording>>,
}

impl RecordingManager {
    pub fn new(
        db: Db,
        base_dir: PathBuf,
        arena: Arc<PortArena>,
        converter_factory: ConverterFactory,
    ) -> Self {
        Self {
            db,
            base_dir,
            arena,
            converter_factory,
            active: DashMap::new(),
        }
    }

    pub fn is_recording(&self, room_id: &str) -> bool {
        self.active.contains_key(room_id)
    }

    pub fn active_recording(&self, room_id: &str) -> Option<Arc<ActiveRecording>> {
        self.active.get(room_id).map(|entry| entry.value().clone())
    }

    /// Start a recording for a room with its currently-live producers.
    ///
    /// A per-room singleton: a second start while one is running is a
    /// `Conflict`. Individual track failures do not fail the start — those
    /// tracks are journaled as `error`.
    pub async fn start_recording(
        &self,
        router: &Arc<dyn SfuRouter>,
        room: &Room,
        live_producers: &[ProducerContext],
    ) -> CoreResult<Recording> {
        if self.active.contains_key(&room.id)
            || self.db.active_recording_for_room(&room.id)?.is_some()
        {
            return Err(CoreError::conflict(format!(
                "room '{}' is already being recorded",
                room.slug
            )));
        }

        let started_at = Utc::now();
        let folder_name = format!(
            "{}_{}",
            sanitize_name(&room.slug),
            started_at.format("%Y%m%dT%H%M%S")
        );
        let folder = self.base_dir.join(&folder_name);
        tokio::fs::create_dir_all(&folder).await?;

        let recording = Recording {
            id: uuid::Uuid::new_v4().to_string(),
            room_id: room.id.clone(),
            folder_name,
            status: RecordingStatus::Recording,
            started_at,
            stopped_at: None,
        };
        self.db.insert_recording(&recording)?;

        let active = Arc::new(ActiveRecording {
            recording_id: recording.id.clone(),
            room_id: room.id.clone(),
            room_slug: room.slug.clone(),
            folder,
            started_at,
            tracks: Mutex::new(HashMap::new()),
        });
        self.active.insert(room.id.clone(), active.clone());

        for producer in live_producers {
            // Failures are already journaled per-track; keep going.
            let _ = self.start_track(router, &active, producer).await;
        }

        self.rewrite_metadata(&active, RecordingStatus::Recording, None)
            .await;
        info!(
            room = %room.slug,
            recording = %recording.id,
            tracks = live_producers.len(),
            "recording started"
        );
        Ok(recording)
    }

    /// A producer arrived while the room is recording: start its track and
    /// hand back the transcript writer to bind to the producer's
    /// transcription session.
    pub async fn on_producer_added(
        &self,
        router: &Arc<dyn SfuRouter>,
        producer: &ProducerContext,
    ) -> Option<Arc<Mutex<TranscriptFileWriter>>> {
        let active = self.active_recording(&producer.room_id)?;
        match self.start_track(router, &active, producer).await {
            Ok(writer) => {
                self.rewrite_metadata(&active, RecordingStatus::Recording, None)
                    .await;
                Some(writer)
            }
            Err(e) => {
                warn!(
                    producer = %producer.producer_id,
                    "recording track failed to start: {e}"
                );
                self.rewrite_metadata(&active, RecordingStatus::Recording, None)
                    .await;
                None
            }
        }
    }

    /// A producer departed: stop just its track.
    pub async fn on_producer_departed(&self, room_id: &str, producer_id: &str) {
        let Some(active) = self.active_recording(room_id) else {
            return;
        };
        let handle = active.tracks.lock().await.remove(producer_id);
        if let Some(handle) = handle {
            self.stop_track(handle, RecordingStatus::Stopped).await;
            self.rewrite_metadata(&active, RecordingStatus::Recording, None)
                .await;
        }
    }

    /// The transcript writer bound to a live track, if any (used to attach
    /// transcription sessions started after the track).
    pub async fn writer_for_producer(
        &self,
        room_id: &str,
        producer_id: &str,
    ) -> Option<Arc<Mutex<TranscriptFileWriter>>> {
        let active = self.active_recording(room_id)?;
        let tracks = active.tracks.lock().await;
        tracks.get(producer_id).map(|h| h.writer.clone())
    }

    /// Stop the room's recording: tear down every track, finalize every
    /// transcript writer, journal the final state.
    pub async fn stop_recording(&self, room_id: &str) -> CoreResult<Recording> {
        let Some((_, active)) = self.active.remove(room_id) else {
            return Err(CoreError::not_found(format!(
                "no active recording for room '{room_id}'"
            )));
        };

        let stopped_at = Utc::now();
        let handles: Vec<TrackHandle> = active.tracks.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            self.stop_track(handle, RecordingStatus::Stopped).await;
        }

        self.db
            .update_recording_status(&active.recording_id, RecordingStatus::Stopped, Some(stopped_at))?;
        self.rewrite_metadata(&active, RecordingStatus::Stopped, Some(stopped_at))
            .await;

        info!(
            room = %active.room_slug,
            recording = %active.recording_id,
            "recording stopped"
        );

        Ok(Recording {
            id: active.recording_id.clone(),
            room_id: active.room_id.clone(),
            folder_name: active
                .folder
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            status: RecordingStatus::Stopped,
            started_at: active.started_at,
            stopped_at: Some(stopped_at),
        })
    }

    /// Stop everything (process shutdown).
    pub async fn stop_all(&self) {
        let room_ids: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        for room_id in room_ids {
            let _ = self.stop_recording(&room_id).await;
        }
    }

    // ── Internals ───────────────────────────────────────────────────────

    async fn start_track(
        &self,
        router: &Arc<dyn SfuRouter>,
        active: &Arc<ActiveRecording>,
        producer: &ProducerContext,
    ) -> CoreResult<Arc<Mutex<TranscriptFileWriter>>> {
        let started_at = Utc::now();
        let track_id = uuid::Uuid::new_v4().to_string();

        let channel_dir = sanitize_name(&producer.channel_name);
        let base_name = format!(
            "{}_{}",
            sanitize_name(&producer.display_name),
            started_at.timestamp_millis()
        );
        let relative_path = format!("{channel_dir}/{base_name}.ogg");

        let mut track_row = RecordingTrack {
            id: track_id.clone(),
            recording_id: active.recording_id.clone(),
            channel_name: producer.channel_name.clone(),
            producer_id: producer.producer_id.clone(),
            producer_display_name: producer.display_name.clone(),
            file_path: Some(relative_path.clone()),
            status: RecordingStatus::Recording,
            started_at,
            stopped_at: None,
        };

        let absolute_dir = active.folder.join(&channel_dir);
        if let Err(e) = tokio::fs::create_dir_all(&absolute_dir).await {
            track_row.status = RecordingStatus::Error;
            track_row.stopped_at = Some(Utc::now());
            self.db.insert_track(&track_row)?;
            return Err(CoreError::Sink(format!(
                "failed to create track folder: {e}"
            )));
        }
        let output = absolute_dir.join(format!("{base_name}.ogg"));

        let fork = match RtpFork::start(
            router,
            &self.arena,
            &producer.sfu_producer_id,
            &(self.converter_factory)(&output),
            None,
        )
        .await
        {
            Ok(fork) => fork,
            Err(e) => {
                track_row.status = RecordingStatus::Error;
                track_row.stopped_at = Some(Utc::now());
                self.db.insert_track(&track_row)?;
                return Err(e);
            }
        };

        if let Err(e) = self.db.insert_track(&track_row) {
            fork.teardown().await;
            return Err(e);
        }

        let writer = Arc::new(Mutex::new(TranscriptFileWriter::new(
            absolute_dir.join(&base_name),
            active.recording_id.clone(),
            producer.producer_id.clone(),
            producer.display_name.clone(),
            producer.channel_name.clone(),
            producer.language.clone(),
            started_at,
        )));

        active.tracks.lock().await.insert(
            producer.producer_id.clone(),
            TrackHandle {
                track_id,
                producer_id: producer.producer_id.clone(),
                fork,
                relative_path,
                writer: writer.clone(),
            },
        );

        info!(
            producer = %producer.producer_id,
            recording = %active.recording_id,
            "recording track started"
        );
        Ok(writer)
    }

    async fn stop_track(&self, handle: TrackHandle, status: RecordingStatus) {
        handle.fork.teardown().await;
        let stopped_at = Utc::now();
        if let Err(e) = self.db.update_track(
            &handle.track_id,
            status,
            Some(&handle.relative_path),
            Some(stopped_at),
        ) {
            warn!(track = %handle.track_id, "track row update failed: {e}");
        }
        handle.writer.lock().await.finalize(stopped_at).await;
        info!(
            producer = %handle.producer_id,
            track = %handle.track_id,
            "recording track stopped"
        );
    }

    async fn rewrite_metadata(
        &self,
        active: &Arc<ActiveRecording>,
        status: RecordingStatus,
        stopped_at: Option<DateTime<Utc>>,
    ) {
        let tracks = match self.db.tracks_for_recording(&active.recording_id) {
            Ok(rows) => rows
                .into_iter()
                .map(|t| MetadataTrack {
                    id: t.id,
                    channel_name: t.channel_name,
                    producer_id: t.producer_id,
                    producer_display_name: t.producer_display_name,
                    file_path: t.file_path,
                    status: t.status,
                    started_at: t.started_at,
                    stopped_at: t.stopped_at,
                })
                .collect(),
            Err(e) => {
                warn!("metadata track query failed: {e}");
                Vec::new()
            }
        };

        let metadata = MetadataFile {
            recording_id: &active.recording_id,
            room_slug: &active.room_slug,
            status,
            started_at: active.started_at,
            stopped_at,
            tracks,
        };

        let path = active.folder.join("metadata.json");
        match serde_json::to_vec_pretty(&metadata) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    warn!(path = %path.display(), "metadata write failed: {e}");
                }
            }
            Err(e) => warn!("metadata serialization failed: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
