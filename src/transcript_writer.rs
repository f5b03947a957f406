// src/transcript_writer.rs
//
// Streaming transcript files for a recording's transcription session. Four
// sibling files share one base name inside the track's channel folder:
//
//   <base>.txt   [HH:MM:SS.mmm] <producer>: <text>
//   <base>.srt   numbered blocks, comma milliseconds
//   <base>.vtt   WEBVTT header + voice-tagged cues
//   <base>.json  written once at finalize — the authoritative summary
//
// TXT/SRT/VTT timestamps are relative to the writer's start; the JSON
// summary carries the absolute wall-clock segment times. Append failures
// never propagate: a broken sidecar file must not take down the session.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::models::TranscriptSegment;

pub struct TranscriptFileWriter {
    base: PathBuf,
    recording_id: String,
    producer_id: String,
    producer_name: String,
    channel_name: String,
    language: String,
    started_at: DateTime<Utc>,
    started_at_unix: f64,
    sequence: u32,
    vtt_initialized: bool,
    segments: Vec<JsonSegment>,
}

#[derive(Serialize, Clone)]
#[serde(rename_all = "camelCase")]
struct JsonSegment {
    id: i64,
    timestamp_start: f64,
    timestamp_end: f64,
    text: String,
    confidence: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonSummary<'a> {
    recording_id: &'a str,
    producer_id: &'a str,
    producer_name: &'a str,
    channel_name: &'a str,
    language: &'a str,
    started_at: DateTime<Utc>,
    stopped_at: DateTime<Utc>,
    segments: &'a [JsonSegment],
    total_segments: usize,
}

impl TranscriptFileWriter {
    /// `base` is the extension-less path shared with the track's container
    /// file (`<channel>/<sanitizedProducer>_<epochMs>`).
    pub fn new(
        base: PathBuf,
        recording_id: String,
        producer_id: String,
        producer_name: String,
        channel_name: String,
        language: String,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            base,
            recording_id,
            producer_id,
            producer_name,
            channel_name,
            language,
            started_at,
            started_at_unix: started_at.timestamp_millis() as f64 / 1000.0,
            sequence: 0,
            vtt_initialized: false,
            segments: Vec::new(),
        }
    }

    pub fn base(&self) -> &PathBuf {
        &self.base
    }

    /// Append one segment to the TXT/SRT/VTT streams and remember it for
    /// the JSON summary.
    pub async fn append(&mut self, segment: &TranscriptSegment) {
        let start = (segment.timestamp_start - self.started_at_unix).max(0.0);
        let end = (segment.timestamp_end - self.started_at_unix).max(start);

        self.segments.push(JsonSegment {
            id: segment.id,
            timestamp_start: segment.timestamp_start,
            timestamp_end: segment.timestamp_end,
            text: segment.text_content.clone(),
            confidence: segment.confidence,
        });

        let txt_line = format!(
            "[{}] {}: {}\n",
            format_timestamp(start, '.'),
            self.producer_name,
            segment.text_content
        );
        self.append_to("txt", txt_line).await;

        self.sequence += 1;
        let srt_block = format!(
            "{}\n{} --> {}\n{}\n\n",
            self.sequence,
            format_timestamp(start, ','),
            format_timestamp(end, ','),
            segment.text_content
        );
        self.append_to("srt", srt_block).await;

        let mut vtt_block = String::new();
        if !self.vtt_initialized {
            vtt_block.push_str("WEBVTT\n\n");
            self.vtt_initialized = true;
        }
        vtt_block.push_str(&format!(
            "{} --> {}\n<v {}>{}\n\n",
            format_timestamp(start, '.'),
            format_timestamp(end, '.'),
            self.producer_name,
            segment.text_content
        ));
        self.append_to("vtt", vtt_block).await;
    }

    /// Write the JSON summary. Called once when the recording stops.
    pub async fn finalize(&self, stopped_at: DateTime<Utc>) {
        let summary = JsonSummary {
            recording_id: &self.recording_id,
            producer_id: &self.producer_id,
            producer_name: &self.producer_name,
            channel_name: &self.channel_name,
            language: &self.language,
            started_at: self.started_at,
            stopped_at,
            segments: &self.segments,
            total_segments: self.segments.len(),
        };
        let path = self.base.with_extension("json");
        match serde_json::to_vec_pretty(&summary) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    warn!(path = %path.display(), "transcript json write failed: {e}");
                }
            }
            Err(e) => warn!("transcript json serialization failed: {e}"),
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    async fn append_to(&self, extension: &str, content: String) {
        let path = self.base.with_extension(extension);
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(content.as_bytes()).await
        }
        .await;
        if let Err(e) = result {
            warn!(path = %path.display(), "transcript append failed: {e}");
        }
    }
}

/// `HH:MM:SS<sep>mmm` from fractional seconds.
fn format_timestamp(seconds: f64, millis_separator: char) -> String {
    let total_millis = (seconds * 1000.0).round().max(0.0) as u64;
    let hours = total_millis / 3_600_000;
    let minutes = (total_millis % 3_600_000) / 60_000;
    let secs = (total_millis % 60_000) / 1000;
    let millis = total_millis % 1000;
    format!("{hours:02}:{minutes:02}:{secs:02}{millis_separator}{millis:03}")
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(id: i64, start: f64, end: f64, text: &str) -> TranscriptSegment {
        TranscriptSegment {
            id,
            room_id: "room1".into(),
            channel_name: "main".into(),
            producer_id: "prod1".into(),
            producer_display_name: "Host".into(),
            text_content: text.into(),
            timestamp_start: start,
            timestamp_end: end,
            confidence: 1.0,
            language: "en".into(),
            created_at: Utc::now(),
        }
    }

    fn writer(base: PathBuf, started_at: DateTime<Utc>) -> TranscriptFileWriter {
        TranscriptFileWriter::new(
            base,
            "rec1".into(),
            "prod1".into(),
            "Host".into(),
            "main".into(),
            "en".into(),
            started_at,
        )
    }

    #[test]
    fn timestamp_formats() {
        assert_eq!(format_timestamp(0.0, '.'), "00:00:00.000");
        assert_eq!(format_timestamp(3723.456, '.'), "01:02:03.456");
        assert_eq!(format_timestamp(59.9995, ','), "00:01:00,000");
        assert_eq!(format_timestamp(-5.0, '.'), "00:00:00.000");
    }

    #[tokio::test]
    async fn writes_all_four_formats() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("Host_1700000000000");
        let started_at = Utc::now();
        let t0 = started_at.timestamp_millis() as f64 / 1000.0;

        let mut writer = writer(base.clone(), started_at);
        writer.append(&segment(1, t0 + 1.0, t0 + 2.5, "hello there")).await;
        writer.append(&segment(2, t0 + 3.0, t0 + 4.0, "general greeting")).await;
        writer.finalize(started_at + chrono::Duration::seconds(10)).await;

        let txt = std::fs::read_to_string(base.with_extension("txt")).unwrap();
        assert_eq!(
            txt,
            "[00:00:01.000] Host: hello there\n[00:00:03.000] Host: general greeting\n"
        );

        let srt = std::fs::read_to_string(base.with_extension("srt")).unwrap();
        assert!(srt.starts_with("1\n00:00:01,000 --> 00:00:02,500\nhello there\n\n"));
        assert!(srt.contains("2\n00:00:03,000 --> 00:00:04,000\n"));

        let vtt = std::fs::read_to_string(base.with_extension("vtt")).unwrap();
        assert!(vtt.starts_with("WEBVTT\n\n"));
        assert!(vtt.contains("<v Host>hello there\n"));
        // Header exactly once.
        assert_eq!(vtt.matches("WEBVTT").count(), 1);

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(base.with_extension("json")).unwrap())
                .unwrap();
        assert_eq!(json["recordingId"], "rec1");
        assert_eq!(json["totalSegments"], 2);
        assert_eq!(json["segments"][0]["id"], 1);
        assert_eq!(json["segments"][0]["text"], "hello there");
        // JSON keeps absolute wall-clock timestamps.
        assert!(json["segments"][0]["timestampStart"].as_f64().unwrap() > 1.0e9);
    }

    #[tokio::test]
    async fn append_failure_does_not_panic_or_propagate() {
        // A base inside a directory that does not exist — every append
        // fails, the writer just logs and keeps going.
        let mut writer = writer(PathBuf::from("/nonexistent-dir/deep/base"), Utc::now());
        writer.append(&segment(1, 1.0, 2.0, "lost")).await;
        assert_eq!(writer.segment_count(), 1);
    }
}
