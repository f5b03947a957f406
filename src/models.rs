use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Relational rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub api_key: String,
    pub created_at: DateTime<Utc>,
}

/// A room owns channels. `slug` is globally unique; `(tenant_id, name)` is
/// unique per tenant. `ice_servers_json` is an opaque JSON array (entries may
/// carry a TURN shared secret that is stripped before reaching clients,
/// see `turn::resolve_ice_servers`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub tenant_id: String,
    pub slug: String,
    pub name: String,
    pub is_local_only: bool,
    pub sfu_url: Option<String>,
    pub ice_servers_json: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A named publisher slot in a room. The clear join token is shown once at
/// creation by the CRUD boundary; only the bcrypt hash is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publisher {
    pub id: String,
    pub room_id: String,
    pub name: String,
    pub channel_name: String,
    pub source_language: String,
    #[serde(skip_serializing)]
    pub join_token_hash: String,
}

// ---------------------------------------------------------------------------
// Recording lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    Recording,
    Stopped,
    Error,
}

impl RecordingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recording => "recording",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "recording" => Self::Recording,
            "stopped" => Self::Stopped,
            _ => Self::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    pub id: String,
    pub room_id: String,
    pub folder_name: String,
    pub status: RecordingStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingTrack {
    pub id: String,
    pub recording_id: String,
    pub channel_name: String,
    pub producer_id: String,
    pub producer_display_name: String,
    pub file_path: Option<String>,
    pub status: RecordingStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Transcripts
// ---------------------------------------------------------------------------

/// A persisted transcript segment. Timestamps are Unix seconds (floating
/// point, wall-clock — globally comparable across producers). Rows are
/// append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub id: i64,
    pub room_id: String,
    pub channel_name: String,
    pub producer_id: String,
    pub producer_display_name: String,
    pub text_content: String,
    pub timestamp_start: f64,
    pub timestamp_end: f64,
    pub confidence: f64,
    pub language: String,
    pub created_at: DateTime<Utc>,
}

/// Input for `transcripts::TranscriptStore::create`.
#[derive(Debug, Clone)]
pub struct NewTranscriptSegment {
    pub room_id: String,
    pub channel_name: String,
    pub producer_id: String,
    pub producer_display_name: String,
    pub text_content: String,
    pub timestamp_start: f64,
    pub timestamp_end: f64,
    pub confidence: f64,
    pub language: String,
}

/// A similarity-search hit: the segment plus its score in `[0, 1]`.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptMatch {
    #[serde(flatten)]
    pub segment: TranscriptSegment,
    pub similarity: f64,
}

// ---------------------------------------------------------------------------
// Filename / folder sanitization
// ---------------------------------------------------------------------------

/// Replace anything outside `[A-Za-z0-9_-]` with `_` and cap at 50 chars.
/// Shared by recording folders, track files and transcript files.
pub fn sanitize_name(input: &str) -> String {
    let mut out: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(50);
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_and_truncates() {
        assert_eq!(sanitize_name("Main Stage (FR)"), "Main_Stage__FR_");
        assert_eq!(sanitize_name("ok_name-1"), "ok_name-1");

        let long = "x".repeat(80);
        assert_eq!(sanitize_name(&long).len(), 50);

        assert_eq!(sanitize_name("späker"), "sp_ker");
    }

    #[test]
    fn recording_status_roundtrip() {
        for status in [
            RecordingStatus::Recording,
            RecordingStatus::Stopped,
            RecordingStatus::Error,
        ] {
            assert_eq!(RecordingStatus::parse(status.as_str()), status);
        }
        // Unknown strings degrade to error, never panic.
        assert_eq!(RecordingStatus::parse("bogus"), RecordingStatus::Error);
    }

    #[test]
    fn join_token_hash_never_serializes() {
        let publisher = Publisher {
            id: "p1".into(),
            room_id: "r1".into(),
            name: "Host".into(),
            channel_name: "main".into(),
            source_language: "en".into(),
            join_token_hash: "$2b$12$secret".into(),
        };
        let json = serde_json::to_string(&publisher).unwrap();
        assert!(!json.contains("secret"));
    }
}
