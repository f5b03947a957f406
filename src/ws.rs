// src/ws.rs
//
// WebSocket endpoints:
//
//   /ws                       signaling (session state machine, §session)
//   /ws/room/:slug/listen     room config, no token
//   /ws/room/:slug/publish    room config, ?token= verified against the
//                             room's publisher join-token hashes
//   /ws/admin                 ?apiKey= tenant stats push
//   /ws/sfu-stats             ?secretKey= remote SFU stats ingest
//
// Auth failures on admin/publisher sockets send one error frame and close.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{Publisher, Room};
use crate::session::ClientSession;
use crate::state::CoreServer;
use crate::stats::{AdminConn, SfuStatsMessage};
use crate::turn;

/// Router state for the WS layer; `secure` distinguishes the HTTPS listener
/// so the advertised SFU URL can be rewritten.
#[derive(Clone)]
pub struct WsContext {
    pub server: Arc<CoreServer>,
    pub secure: bool,
}

fn error_frame(message: &str) -> Message {
    Message::Text(
        json!({ "action": "error", "data": { "message": message } }).to_string(),
    )
}

/// A connection is "secure" when it arrived on the TLS listener or through a
/// terminating proxy that says so.
fn is_secure(ctx: &WsContext, headers: &HeaderMap) -> bool {
    ctx.secure
        || headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("https"))
            .unwrap_or(false)
}

// ─── Signaling ──────────────────────────────────────────────────────────────

pub async fn ws_signaling(
    ws: WebSocketUpgrade,
    State(ctx): State<WsContext>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_signaling_socket(socket, ctx.server))
}

async fn handle_signaling_socket(socket: WebSocket, server: Arc<CoreServer>) {
    let (session, mut outbound) = ClientSession::connect(server);
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(event) => {
                        if sink.send(Message::Text(event.to_json())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => session.handle_frame(&text).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(client = %session.client_id(), "signaling socket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    // Outstanding SFU state for this connection is cleaned up even when the
    // peer vanished mid-operation.
    session.disconnect().await;
}

// ─── Room config sockets ────────────────────────────────────────────────────

pub async fn ws_room_listen(
    ws: WebSocketUpgrade,
    Path(slug): Path<String>,
    State(ctx): State<WsContext>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let secure = is_secure(&ctx, &headers);
    ws.on_upgrade(move |socket| handle_room_config_socket(socket, ctx.server, slug, secure, None))
}

pub async fn ws_room_publish(
    ws: WebSocketUpgrade,
    Path(slug): Path<String>,
    State(ctx): State<WsContext>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let secure = is_secure(&ctx, &headers);
    let token = params.get("token").cloned();
    ws.on_upgrade(move |socket| {
        handle_room_config_socket(socket, ctx.server, slug, secure, Some(token))
    })
}

/// `publish_token`: `None` for listener sockets; `Some(token)` for publisher
/// sockets, verified before any config is revealed.
async fn handle_room_config_socket(
    mut socket: WebSocket,
    server: Arc<CoreServer>,
    slug: String,
    secure: bool,
    publish_token: Option<Option<String>>,
) {
    let room = match server.db.room_by_slug(&slug) {
        Ok(Some(room)) => room,
        Ok(None) => {
            let _ = socket.send(error_frame(&format!("room '{slug}' does not exist"))).await;
            return;
        }
        Err(e) => {
            warn!("room lookup failed: {e}");
            let _ = socket.send(error_frame("internal error")).await;
            return;
        }
    };

    // Publisher sockets must present a valid join token up front.
    let publisher = match publish_token {
        None => None,
        Some(token) => {
            let Some(token) = token else {
                let _ = socket.send(error_frame("missing publisher token")).await;
                return;
            };
            match verify_join_token(&server, &room, &token) {
                Some(publisher) => Some(publisher),
                None => {
                    warn!(room = %slug, "publisher socket rejected: bad join token");
                    let _ = socket.send(error_frame("invalid publisher token")).await;
                    return;
                }
            }
        }
    };

    info!(
        room = %slug,
        publisher = publisher.as_ref().map(|p| p.name.as_str()).unwrap_or("-"),
        "room config socket open"
    );

    // The config frame is sent only in response to get-config.
    while let Some(incoming) = socket.recv().await {
        match incoming {
            Ok(Message::Text(text)) => {
                let wants_config = serde_json::from_str::<Value>(&text)
                    .ok()
                    .and_then(|v| v.get("type").and_then(Value::as_str).map(String::from))
                    .map(|t| t == "get-config")
                    .unwrap_or(false);
                if wants_config {
                    let frame = config_frame(&server, &room, publisher.as_ref(), secure);
                    if socket.send(Message::Text(frame.to_string())).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

fn verify_join_token(server: &CoreServer, room: &Room, token: &str) -> Option<Publisher> {
    let publishers = match server.db.publishers_for_room(&room.id) {
        Ok(publishers) => publishers,
        Err(e) => {
            warn!("publisher lookup failed: {e}");
            return None;
        }
    };
    publishers
        .into_iter()
        .find(|p| bcrypt::verify(token, &p.join_token_hash).unwrap_or(false))
}

fn config_frame(
    server: &CoreServer,
    room: &Room,
    publisher: Option<&Publisher>,
    secure: bool,
) -> Value {
    let ice_servers = room
        .ice_servers_json
        .as_deref()
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .map(|raw| turn::resolve_ice_servers(&raw))
        .unwrap_or_default();

    let sfu_url = room.sfu_url.as_deref().map(|url| {
        if secure {
            turn::rewrite_sfu_url_for_tls(url, server.config.port, server.config.https_port)
        } else {
            url.to_string()
        }
    });

    let mut data = json!({
        "roomSlug": room.slug,
        "isLocalOnly": room.is_local_only,
        "sfuUrl": sfu_url,
        "iceServers": ice_servers,
    });

    match publisher {
        Some(publisher) => {
            data["channelName"] = Value::String(publisher.channel_name.clone());
        }
        None => {
            // Listener sockets get the room's configured channel set.
            let mut channels: Vec<String> = server
                .db
                .publishers_for_room(&room.id)
                .map(|publishers| publishers.into_iter().map(|p| p.channel_name).collect())
                .unwrap_or_default();
            channels.sort();
            channels.dedup();
            data["channels"] = serde_json::to_value(channels).unwrap_or(Value::Null);
        }
    }

    json!({ "type": "config", "data": data })
}

// ─── Admin stats socket ─────────────────────────────────────────────────────

pub async fn ws_admin(
    ws: WebSocketUpgrade,
    State(ctx): State<WsContext>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let api_key = params.get("apiKey").cloned();
    ws.on_upgrade(move |socket| handle_admin_socket(socket, ctx.server, api_key))
}

async fn handle_admin_socket(mut socket: WebSocket, server: Arc<CoreServer>, api_key: Option<String>) {
    let tenant = api_key
        .as_deref()
        .and_then(|key| server.db.tenant_by_api_key(key).ok().flatten());
    let Some(tenant) = tenant else {
        warn!("admin socket rejected: bad api key");
        let _ = socket.send(error_frame("invalid api key")).await;
        return;
    };

    let room_slugs = match server.db.rooms_for_tenant(&tenant.id) {
        Ok(rooms) => rooms.into_iter().map(|r| r.slug).collect(),
        Err(e) => {
            warn!("tenant room lookup failed: {e}");
            let _ = socket.send(error_frame("internal error")).await;
            return;
        }
    };

    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    server.stats.register_admin(
        conn_id,
        AdminConn {
            tenant_id: tenant.id.clone(),
            room_slugs,
            tx,
        },
    );
    info!(tenant = %tenant.name, "admin stats socket connected");

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    server.stats.unregister_admin(conn_id);
    info!(tenant = %tenant.name, "admin stats socket closed");
}

// ─── Remote SFU stats socket ────────────────────────────────────────────────

pub async fn ws_sfu_stats(
    ws: WebSocketUpgrade,
    State(ctx): State<WsContext>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let secret = params.get("secretKey").cloned();
    ws.on_upgrade(move |socket| handle_sfu_stats_socket(socket, ctx.server, secret))
}

async fn handle_sfu_stats_socket(
    mut socket: WebSocket,
    server: Arc<CoreServer>,
    secret: Option<String>,
) {
    if secret.as_deref() != Some(server.config.admin_key.as_str()) {
        warn!("sfu stats socket rejected: bad secret");
        let _ = socket.send(error_frame("invalid secret")).await;
        return;
    }

    let sfu_id = format!("sfu-{}", Uuid::new_v4());
    info!(sfu = %sfu_id, "remote sfu stats socket connected");

    while let Some(incoming) = socket.recv().await {
        match incoming {
            Ok(Message::Text(text)) => match serde_json::from_str::<SfuStatsMessage>(&text) {
                Ok(SfuStatsMessage::StatsUpdate { channels }) => {
                    server.stats.apply_remote(&sfu_id, channels);
                }
                Err(e) => debug!(sfu = %sfu_id, "ignoring unparseable stats frame: {e}"),
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // Everything this SFU reported is now stale.
    server.stats.sfu_disconnected(&sfu_id);
    info!(sfu = %sfu_id, "remote sfu stats socket closed");
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn config_frame_for_publisher_names_its_channel() {
        let room = Room {
            id: "r1".into(),
            tenant_id: "t1".into(),
            slug: "demo".into(),
            name: "demo".into(),
            is_local_only: false,
            sfu_url: Some("ws://sfu.example.org:3000/ws".into()),
            ice_servers_json: Some(
                r#"[{"urls":"turn:t.example.org","__turn_secret__":"s"}]"#.into(),
            ),
            created_at: Utc::now(),
        };
        let publisher = Publisher {
            id: "p1".into(),
            room_id: "r1".into(),
            name: "Host".into(),
            channel_name: "main".into(),
            source_language: "en".into(),
            join_token_hash: String::new(),
        };

        let server = test_core_server();
        let frame = config_frame(&server, &room, Some(&publisher), true);
        assert_eq!(frame["type"], "config");
        assert_eq!(frame["data"]["roomSlug"], "demo");
        assert_eq!(frame["data"]["channelName"], "main");
        // Secure origin: scheme and port rewritten.
        assert_eq!(frame["data"]["sfuUrl"], "wss://sfu.example.org:3443/ws");
        // TURN secret resolved and stripped.
        let ice = frame["data"]["iceServers"].as_array().unwrap();
        assert!(ice[0].get("__turn_secret__").is_none());
        assert!(ice[0]["credential"].is_string());
    }

    #[test]
    fn config_frame_for_listener_lists_channels() {
        let (db, room, _publisher) = crate::db::test_support::seeded();
        let server = test_core_server_with_db(db);
        let frame = config_frame(&server, &room, None, false);
        assert_eq!(
            frame["data"]["channels"],
            serde_json::json!(["main"])
        );
        assert!(frame["data"].get("channelName").is_none());
    }

    #[test]
    fn join_token_verification() {
        let (db, room, publisher) = crate::db::test_support::seeded();
        let server = test_core_server_with_db(db);

        let found = verify_join_token(&server, &room, "join-me").unwrap();
        assert_eq!(found.id, publisher.id);
        assert!(verify_join_token(&server, &room, "wrong").is_none());
    }

    fn test_core_server() -> Arc<CoreServer> {
        let db = crate::db::Db::open_in_memory().unwrap();
        test_core_server_with_db(db)
    }

    fn test_core_server_with_db(db: crate::db::Db) -> Arc<CoreServer> {
        use crate::forker::ConverterSpec;
        let store = crate::transcripts::TranscriptStore::new(db.clone());
        let embedder = crate::embedder::Embedder::disabled(db.clone());
        Arc::new(CoreServer {
            config: crate::config::Config::default(),
            db: db.clone(),
            router: Arc::new(crate::sfu::LoopbackSfu::new()),
            registry: crate::registry::ChannelRegistry::new(),
            clients: dashmap::DashMap::new(),
            transcripts: store.clone(),
            embedder: embedder.clone(),
            recording: crate::recording::RecordingManager::new(
                db.clone(),
                std::env::temp_dir().join(format!("rec-{}", Uuid::new_v4())),
                Arc::new(crate::ports::PortArena::new(57000, 57010)),
                Box::new(|_| ConverterSpec::custom("sh", vec!["-c".into(), "true".into()])),
            ),
            transcription: crate::transcription::TranscriptionManager::new(
                false,
                std::path::PathBuf::from("/nowhere"),
                "base".into(),
                Arc::new(crate::stt::StubTranscriber::with_script(vec![], 1)),
                store,
                embedder,
                Arc::new(crate::ports::PortArena::new(57100, 57110)),
                ConverterSpec::custom("sh", vec!["-c".into(), "true".into()]),
            ),
            stats: crate::stats::StatsAggregator::new(),
        })
    }
}
