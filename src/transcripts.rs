// src/transcripts.rs
//
// Transcript segment store. Rows are append-only; every successful insert is
// also pushed onto a broadcast bus so live consumers (admin surfaces, tests)
// see segments as they land, independent of the query paths.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tokio::sync::broadcast;

use crate::db::Db;
use crate::error::CoreResult;
use crate::models::{NewTranscriptSegment, TranscriptSegment};

/// Options for [`TranscriptStore::get_by_room`].
#[derive(Debug, Clone, Default)]
pub struct TranscriptQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub channel_name: Option<String>,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
}

const DEFAULT_LIMIT: u32 = 100;

#[derive(Clone)]
pub struct TranscriptStore {
    db: Db,
    live_tx: broadcast::Sender<TranscriptSegment>,
}

impl TranscriptStore {
    pub fn new(db: Db) -> Self {
        // Send-to-zero-receivers is normal; capacity absorbs slow admin
        // consumers without backpressuring the transcription sessions.
        let (live_tx, _) = broadcast::channel(1024);
        Self { db, live_tx }
    }

    /// Subscribe to segments persisted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptSegment> {
        self.live_tx.subscribe()
    }

    /// Persist a segment and emit it on the live bus.
    pub fn create(&self, new: NewTranscriptSegment) -> CoreResult<TranscriptSegment> {
        let created_at = Utc::now();
        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO transcripts
                 (room_id, channel_name, producer_id, producer_display_name, text_content,
                  timestamp_start, timestamp_end, confidence, language, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    new.room_id,
                    new.channel_name,
                    new.producer_id,
                    new.producer_display_name,
                    new.text_content,
                    new.timestamp_start,
                    new.timestamp_end,
                    new.confidence,
                    new.language,
                    created_at.to_rfc3339(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        let segment = TranscriptSegment {
            id,
            room_id: new.room_id,
            channel_name: new.channel_name,
            producer_id: new.producer_id,
            producer_display_name: new.producer_display_name,
            text_content: new.text_content,
            timestamp_start: new.timestamp_start,
            timestamp_end: new.timestamp_end,
            confidence: new.confidence,
            language: new.language,
            created_at,
        };
        let _ = self.live_tx.send(segment.clone());
        Ok(segment)
    }

    pub fn get_by_id(&self, id: i64) -> CoreResult<Option<TranscriptSegment>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("{SELECT_SEGMENT} WHERE id = ?1"),
                params![id],
                map_segment,
            )
            .optional()
        })
    }

    /// Newest-first page of a room's segments with optional channel and
    /// time-window filters.
    pub fn get_by_room(
        &self,
        room_id: &str,
        query: &TranscriptQuery,
    ) -> CoreResult<Vec<TranscriptSegment>> {
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
        let offset = query.offset.unwrap_or(0);

        self.db.with_conn(|conn| {
            let mut sql = format!("{SELECT_SEGMENT} WHERE room_id = ?1");
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(room_id.to_string())];

            if let Some(channel) = &query.channel_name {
                args.push(Box::new(channel.clone()));
                sql.push_str(&format!(" AND channel_name = ?{}", args.len()));
            }
            if let Some(start) = query.start_time {
                args.push(Box::new(start));
                sql.push_str(&format!(" AND timestamp_start >= ?{}", args.len()));
            }
            if let Some(end) = query.end_time {
                args.push(Box::new(end));
                sql.push_str(&format!(" AND timestamp_start <= ?{}", args.len()));
            }

            args.push(Box::new(limit));
            sql.push_str(&format!(" ORDER BY timestamp_start DESC LIMIT ?{}", args.len()));
            args.push(Box::new(offset));
            sql.push_str(&format!(" OFFSET ?{}", args.len()));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                map_segment,
            )?;
            rows.collect()
        })
    }

    /// Ascending slice of `[start, end]`.
    pub fn get_by_time_range(
        &self,
        room_id: &str,
        start: f64,
        end: f64,
        channel_name: Option<&str>,
    ) -> CoreResult<Vec<TranscriptSegment>> {
        self.db.with_conn(|conn| {
            let sql = match channel_name {
                Some(_) => format!(
                    "{SELECT_SEGMENT}
                     WHERE room_id = ?1 AND timestamp_start >= ?2 AND timestamp_start <= ?3
                       AND channel_name = ?4
                     ORDER BY timestamp_start ASC"
                ),
                None => format!(
                    "{SELECT_SEGMENT}
                     WHERE room_id = ?1 AND timestamp_start >= ?2 AND timestamp_start <= ?3
                     ORDER BY timestamp_start ASC"
                ),
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = match channel_name {
                Some(channel) => stmt
                    .query_map(params![room_id, start, end, channel], map_segment)?
                    .collect(),
                None => stmt
                    .query_map(params![room_id, start, end], map_segment)?
                    .collect(),
            };
            rows
        })
    }

    /// The last `minutes` (default 60) of segments, ascending.
    pub fn get_recent(
        &self,
        room_id: &str,
        minutes: Option<u32>,
        channel_name: Option<&str>,
    ) -> CoreResult<Vec<TranscriptSegment>> {
        let minutes = minutes.unwrap_or(60);
        let now = Utc::now().timestamp() as f64;
        let start = now - f64::from(minutes) * 60.0;
        self.get_by_time_range(room_id, start, now, channel_name)
    }

    pub fn count_by(&self, room_id: &str, channel_name: Option<&str>) -> CoreResult<i64> {
        self.db.with_conn(|conn| match channel_name {
            Some(channel) => conn.query_row(
                "SELECT COUNT(*) FROM transcripts WHERE room_id = ?1 AND channel_name = ?2",
                params![room_id, channel],
                |r| r.get(0),
            ),
            None => conn.query_row(
                "SELECT COUNT(*) FROM transcripts WHERE room_id = ?1",
                params![room_id],
                |r| r.get(0),
            ),
        })
    }
}

const SELECT_SEGMENT: &str = "SELECT id, room_id, channel_name, producer_id, \
     producer_display_name, text_content, timestamp_start, timestamp_end, \
     confidence, language, created_at FROM transcripts";

fn map_segment(row: &Row<'_>) -> rusqlite::Result<TranscriptSegment> {
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

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support;

    fn seg(room_id: &str, channel: &str, start: f64, text: &str) -> NewTranscriptSegment {
        NewTranscriptSegment {
            room_id: room_id.into(),
            channel_name: channel.into(),
            producer_id: "prod1".into(),
            producer_display_name: "Host".into(),
            text_content: text.into(),
            timestamp_start: start,
            timestamp_end: start + 2.0,
            confidence: 1.0,
            language: "en".into(),
        }
    }

    #[test]
    fn create_assigns_ids_and_preserves_order() {
        let (db, room, _) = test_support::seeded();
        let store = TranscriptStore::new(db);

        let a = store.create(seg(&room.id, "main", 100.0, "first")).unwrap();
        let b = store.create(seg(&room.id, "main", 110.0, "second")).unwrap();
        assert!(b.id > a.id);

        let rows = store
            .get_by_room(&room.id, &TranscriptQuery::default())
            .unwrap();
        assert_eq!(rows.len(), 2);
        // Newest first.
        assert_eq!(rows[0].text_content, "second");
    }

    #[test]
    fn filters_compose() {
        let (db, room, _) = test_support::seeded();
        let store = TranscriptStore::new(db);
        store.create(seg(&room.id, "main", 100.0, "a")).unwrap();
        store.create(seg(&room.id, "side", 105.0, "b")).unwrap();
        store.create(seg(&room.id, "main", 200.0, "c")).unwrap();

        let query = TranscriptQuery {
            channel_name: Some("main".into()),
            start_time: Some(50.0),
            end_time: Some(150.0),
            ..Default::default()
        };
        let rows = store.get_by_room(&room.id, &query).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text_content, "a");

        assert_eq!(store.count_by(&room.id, None).unwrap(), 3);
        assert_eq!(store.count_by(&room.id, Some("side")).unwrap(), 1);
    }

    #[test]
    fn time_range_is_ascending() {
        let (db, room, _) = test_support::seeded();
        let store = TranscriptStore::new(db);
        store.create(seg(&room.id, "main", 300.0, "late")).unwrap();
        store.create(seg(&room.id, "main", 100.0, "early")).unwrap();

        let rows = store
            .get_by_time_range(&room.id, 0.0, 1000.0, None)
            .unwrap();
        assert_eq!(rows[0].text_content, "early");
        assert_eq!(rows[1].text_content, "late");
    }

    #[test]
    fn recent_window_excludes_old_segments() {
        let (db, room, _) = test_support::seeded();
        let store = TranscriptStore::new(db);
        let now = Utc::now().timestamp() as f64;
        store.create(seg(&room.id, "main", now - 30.0, "fresh")).unwrap();
        store
            .create(seg(&room.id, "main", now - 7200.0, "stale"))
            .unwrap();

        let rows = store.get_recent(&room.id, Some(60), None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text_content, "fresh");
    }

    #[tokio::test]
    async fn live_bus_sees_inserts() {
        let (db, room, _) = test_support::seeded();
        let store = TranscriptStore::new(db);
        let mut rx = store.subscribe();

        store.create(seg(&room.id, "main", 1.0, "hello")).unwrap();
        let live = rx.recv().await.unwrap();
        assert_eq!(live.text_content, "hello");
    }
}
