// src/api.rs
//
// REST surface the core exposes to the management boundary: health,
// recording lifecycle, transcript queries and similarity search. Everything
// except /health is gated on the tenant API key (`Authorization: Bearer`).

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::embedder::SearchOptions;
use crate::error::{CoreError, CoreResult};
use crate::models::{Recording, Room, Tenant, TranscriptMatch, TranscriptSegment};
use crate::transcription::ProducerContext;
use crate::transcripts::TranscriptQuery;
use crate::ws::WsContext;

// ─── Auth helpers ───────────────────────────────────────────────────────────

fn bearer_token(headers: &HeaderMap) -> CoreResult<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| CoreError::auth("Authorization header is missing or malformed"))
}

fn require_tenant(ctx: &WsContext, headers: &HeaderMap) -> CoreResult<Tenant> {
    let token = bearer_token(headers)?;
    ctx.server
        .db
        .tenant_by_api_key(token)?
        .ok_or_else(|| CoreError::auth("the provided API key is not valid"))
}

fn owned_room(ctx: &WsContext, tenant: &Tenant, slug: &str) -> CoreResult<Room> {
    let room = ctx
        .server
        .db
        .room_by_slug(slug)?
        .ok_or_else(|| CoreError::not_found(format!("room '{slug}' does not exist")))?;
    if room.tenant_id != tenant.id {
        return Err(CoreError::auth(format!(
            "room '{slug}' is not owned by this tenant"
        )));
    }
    Ok(room)
}

// ─── Health ─────────────────────────────────────────────────────────────────

pub async fn health(State(ctx): State<WsContext>) -> impl IntoResponse {
    let server = &ctx.server;
    let mut subscribers = 0usize;
    for key in server.registry.snapshot_channel_keys() {
        if let Some(channel) = server.registry.get(&key) {
            subscribers += channel.lock().await.listener_count();
        }
    }

    Json(json!({
        "status": "ok",
        "channels_active": server.registry.len(),
        "subscribers_active": subscribers,
        "clients_connected": server.clients.len(),
        "transcription_enabled": server.transcription.enabled(),
        "transcription_sessions": server.transcription.stats(),
        "embedding_enabled": server.embedder.enabled(),
    }))
}

// ─── Recording lifecycle ────────────────────────────────────────────────────

/// POST /v1/rooms/:slug/recording/start
pub async fn start_recording(
    State(ctx): State<WsContext>,
    Path(slug): Path<String>,
    headers: HeaderMap,
) -> CoreResult<Json<Recording>> {
    let tenant = require_tenant(&ctx, &headers)?;
    let room = owned_room(&ctx, &tenant, &slug)?;
    let server = &ctx.server;

    // Every currently-live producer in every channel of this room becomes a
    // track.
    let mut live_producers: Vec<ProducerContext> = Vec::new();
    for key in server.registry.snapshot_channel_keys() {
        if key.room_slug() != room.slug {
            continue;
        }
        let Some(channel) = server.registry.get(&key) else {
            continue;
        };
        let state = channel.lock().await;
        for (producer_id, entry) in state.producers() {
            live_producers.push(ProducerContext {
                producer_id: producer_id.clone(),
                sfu_producer_id: entry.producer.id().to_string(),
                room_id: room.id.clone(),
                channel_name: key.channel_name().to_string(),
                display_name: entry.display_name.clone(),
                language: entry.source_language.clone(),
            });
        }
    }

    let recording = server
        .recording
        .start_recording(&server.router, &room, &live_producers)
        .await?;

    // Running transcription sessions pick up the new transcript writers.
    for producer in &live_producers {
        if let Some(writer) = server
            .recording
            .writer_for_producer(&room.id, &producer.producer_id)
            .await
        {
            server
                .transcription
                .bind_writer(&producer.producer_id, writer)
                .await;
        }
    }

    Ok(Json(recording))
}

/// POST /v1/rooms/:slug/recording/stop
pub async fn stop_recording(
    State(ctx): State<WsContext>,
    Path(slug): Path<String>,
    headers: HeaderMap,
) -> CoreResult<Json<Recording>> {
    let tenant = require_tenant(&ctx, &headers)?;
    let room = owned_room(&ctx, &tenant, &slug)?;
    let server = &ctx.server;

    let recording = server.recording.stop_recording(&room.id).await?;

    // Unbind the writers from whatever transcription sessions still run.
    match server.db.tracks_for_recording(&recording.id) {
        Ok(tracks) => {
            for track in tracks {
                server.transcription.unbind_writer(&track.producer_id).await;
            }
        }
        Err(e) => warn!("track lookup after stop failed: {e}"),
    }

    Ok(Json(recording))
}

/// GET /v1/rooms/:slug/recordings
pub async fn list_recordings(
    State(ctx): State<WsContext>,
    Path(slug): Path<String>,
    headers: HeaderMap,
) -> CoreResult<Json<Vec<Recording>>> {
    let tenant = require_tenant(&ctx, &headers)?;
    let room = owned_room(&ctx, &tenant, &slug)?;
    Ok(Json(ctx.server.db.recordings_for_room(&room.id)?))
}

// ─── Transcript queries ─────────────────────────────────────────────────────

fn parse<T: std::str::FromStr>(params: &HashMap<String, String>, key: &str) -> Option<T> {
    params.get(key).and_then(|v| v.parse().ok())
}

/// GET /v1/rooms/:slug/transcripts
pub async fn list_transcripts(
    State(ctx): State<WsContext>,
    Path(slug): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> CoreResult<Json<Vec<TranscriptSegment>>> {
    let tenant = require_tenant(&ctx, &headers)?;
    let room = owned_room(&ctx, &tenant, &slug)?;

    let query = TranscriptQuery {
        limit: parse(&params, "limit"),
        offset: parse(&params, "offset"),
        channel_name: params.get("channel").cloned(),
        start_time: parse(&params, "startTime"),
        end_time: parse(&params, "endTime"),
    };
    Ok(Json(ctx.server.transcripts.get_by_room(&room.id, &query)?))
}

/// GET /v1/rooms/:slug/transcripts/recent
pub async fn recent_transcripts(
    State(ctx): State<WsContext>,
    Path(slug): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> CoreResult<Json<Vec<TranscriptSegment>>> {
    let tenant = require_tenant(&ctx, &headers)?;
    let room = owned_room(&ctx, &tenant, &slug)?;
    let rows = ctx.server.transcripts.get_recent(
        &room.id,
        parse(&params, "minutes"),
        params.get("channel").map(String::as_str),
    )?;
    Ok(Json(rows))
}

/// GET /v1/rooms/:slug/transcripts/count
pub async fn count_transcripts(
    State(ctx): State<WsContext>,
    Path(slug): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> CoreResult<Json<serde_json::Value>> {
    let tenant = require_tenant(&ctx, &headers)?;
    let room = owned_room(&ctx, &tenant, &slug)?;
    let count = ctx
        .server
        .transcripts
        .count_by(&room.id, params.get("channel").map(String::as_str))?;
    Ok(Json(json!({ "roomSlug": slug, "count": count })))
}

/// GET /v1/rooms/:slug/transcripts/search?q=...
pub async fn search_transcripts(
    State(ctx): State<WsContext>,
    Path(slug): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> CoreResult<Json<Vec<TranscriptMatch>>> {
    let tenant = require_tenant(&ctx, &headers)?;
    let room = owned_room(&ctx, &tenant, &slug)?;

    let query_text = params
        .get("q")
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| CoreError::protocol("missing query parameter 'q'"))?;

    let options = SearchOptions {
        limit: parse(&params, "limit"),
        min_score: parse(&params, "minScore"),
        channel_name: params.get("channel").cloned(),
    };
    let matches = ctx
        .server
        .embedder
        .search_similar(query_text, &room.id, &options)?;
    Ok(Json(matches))
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());

        headers.insert("authorization", "Basic nope".parse().unwrap());
        assert!(bearer_token(&headers).is_err());

        headers.insert("authorization", "Bearer the-key".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), "the-key");
    }

    #[test]
    fn query_param_parsing() {
        let mut params = HashMap::new();
        params.insert("limit".to_string(), "25".to_string());
        params.insert("minScore".to_string(), "0.4".to_string());
        params.insert("bad".to_string(), "x".to_string());

        assert_eq!(parse::<u32>(&params, "limit"), Some(25));
        assert_eq!(parse::<f64>(&params, "minScore"), Some(0.4));
        assert_eq!(parse::<u32>(&params, "bad"), None);
        assert_eq!(parse::<u32>(&params, "absent"), None);
    }
}
