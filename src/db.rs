// src/db.rs
//
// SQLite persistence. One connection behind a mutex — the write rate here is
// human-scale (recordings, transcript segments) and single-writer
// serialization keeps every statement transactional without a pool.
//
// The vector index lives in the same database: a `vec0` virtual table when
// the sqlite-vec loadable extension is configured, otherwise a plain BLOB
// shadow table that the embedder scans in process (same contract, same
// shared-rowid invariant).

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::models::{Publisher, Recording, RecordingStatus, RecordingTrack, Room, Tenant};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    api_key     TEXT NOT NULL UNIQUE,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rooms (
    id               TEXT PRIMARY KEY,
    tenant_id        TEXT NOT NULL REFERENCES tenants(id),
    slug             TEXT NOT NULL UNIQUE,
    name             TEXT NOT NULL,
    is_local_only    INTEGER NOT NULL DEFAULT 1,
    sfu_url          TEXT,
    ice_servers_json TEXT,
    created_at       TEXT NOT NULL,
    UNIQUE (tenant_id, name)
);

CREATE TABLE IF NOT EXISTS publishers (
    id               TEXT PRIMARY KEY,
    room_id          TEXT NOT NULL REFERENCES rooms(id),
    name             TEXT NOT NULL,
    channel_name     TEXT NOT NULL,
    source_language  TEXT NOT NULL DEFAULT 'en',
    join_token_hash  TEXT NOT NULL,
    UNIQUE (room_id, name)
);

CREATE TABLE IF NOT EXISTS recordings (
    id          TEXT PRIMARY KEY,
    room_id     TEXT NOT NULL REFERENCES rooms(id),
    folder_name TEXT NOT NULL,
    status      TEXT NOT NULL CHECK (status IN ('recording', 'stopped', 'error')),
    started_at  TEXT NOT NULL,
    stopped_at  TEXT
);

CREATE TABLE IF NOT EXISTS recording_tracks (
    id                    TEXT PRIMARY KEY,
    recording_id          TEXT NOT NULL REFERENCES recordings(id),
    channel_name          TEXT NOT NULL,
    producer_id           TEXT NOT NULL,
    producer_display_name TEXT NOT NULL,
    file_path             TEXT,
    status                TEXT NOT NULL CHECK (status IN ('recording', 'stopped', 'error')),
    started_at            TEXT NOT NULL,
    stopped_at            TEXT
);

CREATE TABLE IF NOT EXISTS transcripts (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    room_id               TEXT NOT NULL,
    channel_name          TEXT NOT NULL,
    producer_id           TEXT NOT NULL,
    producer_display_name TEXT NOT NULL,
    text_content          TEXT NOT NULL,
    timestamp_start       REAL NOT NULL,
    timestamp_end         REAL NOT NULL,
    confidence            REAL NOT NULL DEFAULT 1.0,
    language              TEXT NOT NULL DEFAULT 'en',
    created_at            TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transcripts_room_time
    ON transcripts (room_id, timestamp_start);

CREATE TABLE IF NOT EXISTS embedding_metadata (
    id            INTEGER PRIMARY KEY,
    transcript_id INTEGER NOT NULL REFERENCES transcripts(id),
    room_id       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_embedding_metadata_room
    ON embedding_metadata (room_id);
"#;

const VEC_FALLBACK_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transcript_vectors (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    embedding BLOB NOT NULL
);
"#;

// ---------------------------------------------------------------------------
// Db handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
    vec_native: bool,
}

impl Db {
    /// Open (or create) the database, optionally loading the sqlite-vec
    /// extension, and apply the schema.
    pub fn open(path: &Path, sqlite_vec_path: Option<&Path>) -> CoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let vec_native = match sqlite_vec_path {
            Some(ext) => match load_vec_extension(&conn, ext) {
                Ok(()) => {
                    info!("sqlite-vec extension loaded from {}", ext.display());
                    true
                }
                Err(e) => {
                    warn!(
                        "failed to load sqlite-vec from {} — falling back to in-process vector scan: {e}",
                        ext.display()
                    );
                    false
                }
            },
            None => false,
        };

        conn.execute_batch(SCHEMA)?;
        if vec_native {
            conn.execute_batch(
                "CREATE VIRTUAL TABLE IF NOT EXISTS transcript_vectors USING vec0(embedding float[384]);",
            )?;
        } else {
            conn.execute_batch(VEC_FALLBACK_TABLE)?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            vec_native,
        })
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open(Path::new(":memory:"), None)
    }

    /// Whether `vec_distance_L2` is available SQL-side.
    pub fn vec_native(&self) -> bool {
        self.vec_native
    }

    /// Run a closure against the connection under the writer lock.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> CoreResult<T> {
        let conn = self.conn.lock().unwrap();
        f(&conn).map_err(CoreError::from)
    }

    /// Run a closure inside an explicit transaction.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> CoreResult<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ── Startup ─────────────────────────────────────────────────────────

    /// Crash recovery: anything left at status=recording was interrupted.
    /// Content recovery is not attempted.
    pub fn recover_interrupted_recordings(&self) -> CoreResult<usize> {
        self.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE recording_tracks SET status = 'error', stopped_at = ?1
                 WHERE status = 'recording'",
                params![now],
            )?;
            conn.execute(
                "UPDATE recordings SET status = 'error', stopped_at = ?1
                 WHERE status = 'recording'",
                params![now],
            )
        })
    }

    /// `SINGLE_TENANT` bootstrap: a default tenant keyed by `ADMIN_KEY` and
    /// a local room `main`. Idempotent across restarts (the key is
    /// refreshed so a changed `ADMIN_KEY` takes effect).
    pub fn bootstrap_single_tenant(&self, admin_key: &str) -> CoreResult<Room> {
        self.with_tx(|tx| {
            let now = Utc::now().to_rfc3339();
            tx.execute(
                "INSERT INTO tenants (id, name, api_key, created_at)
                 VALUES (?1, 'default', ?2, ?3)
                 ON CONFLICT (name) DO UPDATE SET api_key = excluded.api_key",
                params![uuid::Uuid::new_v4().to_string(), admin_key, now],
            )?;
            let tenant_id: String =
                tx.query_row("SELECT id FROM tenants WHERE name = 'default'", [], |r| {
                    r.get(0)
                })?;
            tx.execute(
                "INSERT INTO rooms (id, tenant_id, slug, name, is_local_only, created_at)
                 VALUES (?1, ?2, 'main', 'main', 1, ?3)
                 ON CONFLICT (slug) DO NOTHING",
                params![uuid::Uuid::new_v4().to_string(), tenant_id, now],
            )?;
            tx.query_row(
                "SELECT id, tenant_id, slug, name, is_local_only, sfu_url, ice_servers_json, created_at
                 FROM rooms WHERE slug = 'main'",
                [],
                map_room,
            )
        })
    }

    // ── Tenants / rooms / publishers ────────────────────────────────────

    pub fn tenant_by_api_key(&self, api_key: &str) -> CoreResult<Option<Tenant>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, api_key, created_at FROM tenants WHERE api_key = ?1",
                params![api_key],
                map_tenant,
            )
            .optional()
        })
    }

    pub fn room_by_slug(&self, slug: &str) -> CoreResult<Option<Room>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, tenant_id, slug, name, is_local_only, sfu_url, ice_servers_json, created_at
                 FROM rooms WHERE slug = ?1",
                params![slug],
                map_room,
            )
            .optional()
        })
    }

    pub fn rooms_for_tenant(&self, tenant_id: &str) -> CoreResult<Vec<Room>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tenant_id, slug, name, is_local_only, sfu_url, ice_servers_json, created_at
                 FROM rooms WHERE tenant_id = ?1 ORDER BY created_at",
            )?;
            let rows = stmt.query_map(params![tenant_id], map_room)?;
            rows.collect()
        })
    }

    pub fn publishers_for_room(&self, room_id: &str) -> CoreResult<Vec<Publisher>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, room_id, name, channel_name, source_language, join_token_hash
                 FROM publishers WHERE room_id = ?1 ORDER BY name",
            )?;
            let rows = stmt.query_map(params![room_id], map_publisher)?;
            rows.collect()
        })
    }

    pub fn publisher_by_id(&self, id: &str) -> CoreResult<Option<Publisher>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, room_id, name, channel_name, source_language, join_token_hash
                 FROM publishers WHERE id = ?1",
                params![id],
                map_publisher,
            )
            .optional()
        })
    }

    /// Insert helpers used by the bootstrap path and the test fixtures; the
    /// full CRUD lives in the out-of-scope management boundary.
    pub fn insert_room(&self, room: &Room) -> CoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rooms (id, tenant_id, slug, name, is_local_only, sfu_url, ice_servers_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    room.id,
                    room.tenant_id,
                    room.slug,
                    room.name,
                    room.is_local_only,
                    room.sfu_url,
                    room.ice_servers_json,
                    room.created_at.to_rfc3339(),
                ],
            )
            .map(|_| ())
        })
    }

    pub fn insert_publisher(&self, publisher: &Publisher) -> CoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO publishers (id, room_id, name, channel_name, source_language, join_token_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    publisher.id,
                    publisher.room_id,
                    publisher.name,
                    publisher.channel_name,
                    publisher.source_language,
                    publisher.join_token_hash,
                ],
            )
            .map(|_| ())
        })
    }

    // ── Recordings ──────────────────────────────────────────────────────

    pub fn insert_recording(&self, recording: &Recording) -> CoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO recordings (id, room_id, folder_name, status, started_at, stopped_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    recording.id,
                    recording.room_id,
                    recording.folder_name,
                    recording.status.as_str(),
                    recording.started_at.to_rfc3339(),
                    recording.stopped_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map(|_| ())
        })
    }

    pub fn update_recording_status(
        &self,
        id: &str,
        status: RecordingStatus,
        stopped_at: Option<DateTime<Utc>>,
    ) -> CoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE recordings SET status = ?2, stopped_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), stopped_at.map(|t| t.to_rfc3339())],
            )
            .map(|_| ())
        })
    }

    pub fn active_recording_for_room(&self, room_id: &str) -> CoreResult<Option<Recording>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, room_id, folder_name, status, started_at, stopped_at
                 FROM recordings WHERE room_id = ?1 AND status = 'recording'",
                params![room_id],
                map_recording,
            )
            .optional()
        })
    }

    pub fn recordings_for_room(&self, room_id: &str) -> CoreResult<Vec<Recording>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, room_id, folder_name, status, started_at, stopped_at
                 FROM recordings WHERE room_id = ?1 ORDER BY started_at DESC",
            )?;
            let rows = stmt.query_map(params![room_id], map_recording)?;
            rows.collect()
        })
    }

    pub fn insert_track(&self, track: &RecordingTrack) -> CoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO recording_tracks
                 (id, recording_id, channel_name, producer_id, producer_display_name,
                  file_path, status, started_at, stopped_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    track.id,
                    track.recording_id,
                    track.channel_name,
                    track.producer_id,
                    track.producer_display_name,
                    track.file_path,
                    track.status.as_str(),
                    track.started_at.to_rfc3339(),
                    track.stopped_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map(|_| ())
        })
    }

    pub fn update_track(
        &self,
        id: &str,
        status: RecordingStatus,
        file_path: Option<&str>,
        stopped_at: Option<DateTime<Utc>>,
    ) -> CoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE recording_tracks
                 SET status = ?2, file_path = COALESCE(?3, file_path), stopped_at = ?4
                 WHERE id = ?1",
                params![
                    id,
                    status.as_str(),
                    file_path,
                    stopped_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map(|_| ())
        })
    }

    pub fn tracks_for_recording(&self, recording_id: &str) -> CoreResult<Vec<RecordingTrack>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, recording_id, channel_name, producer_id, producer_display_name,
                        file_path, status, started_at, stopped_at
                 FROM recording_tracks WHERE recording_id = ?1 ORDER BY started_at",
            )?;
            let rows = stmt.query_map(params![recording_id], map_track)?;
            rows.collect()
        })
    }
}

// ---------------------------------------------------------------------------
// Extension loading
// ---------------------------------------------------------------------------

fn load_vec_extension(conn: &Connection, path: &Path) -> rusqlite::Result<()> {
    unsafe {
        let _guard = rusqlite::LoadExtensionGuard::new(conn)?;
        conn.load_extension(path, None)
    }
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(parse_ts)
}

fn map_tenant(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        api_key: row.get(2)?,
        created_at: parse_ts(row.get(3)?),
    })
}

fn map_room(row: &Row<'_>) -> rusqlite::Result<Room> {
    Ok(Room {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        slug: row.get(2)?,
        name: row.get(3)?,
        is_local_only: row.get(4)?,
        sfu_url: row.get(5)?,
        ice_servers_json: row.get(6)?,
        created_at: parse_ts(row.get(7)?),
    })
}

fn map_publisher(row: &Row<'_>) -> rusqlite::Result<Publisher> {
    Ok(Publisher {
        id: row.get(0)?,
        room_id: row.get(1)?,
        name: row.get(2)?,
        channel_name: row.get(3)?,
        source_language: row.get(4)?,
        join_token_hash: row.get(5)?,
    })
}

fn map_recording(row: &Row<'_>) -> rusqlite::Result<Recording> {
    Ok(Recording {
        id: row.get(0)?,
        room_id: row.get(1)?,
        folder_name: row.get(2)?,
        status: RecordingStatus::parse(&row.get::<_, String>(3)?),
        started_at: parse_ts(row.get(4)?),
        stopped_at: parse_ts_opt(row.get(5)?),
    })
}

fn map_track(row: &Row<'_>) -> rusqlite::Result<RecordingTrack> {
    Ok(RecordingTrack {
        id: row.get(0)?,
        recording_id: row.get(1)?,
        channel_name: row.get(2)?,
        producer_id: row.get(3)?,
        producer_display_name: row.get(4)?,
        file_path: row.get(5)?,
        status: RecordingStatus::parse(&row.get::<_, String>(6)?),
        started_at: parse_ts(row.get(7)?),
        stopped_at: parse_ts_opt(row.get(8)?),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
