use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use soundcast::config::Config;
use soundcast::db::Db;
use soundcast::embedder::{Embedder, HashEmbedder, TextEmbedder, DEFAULT_BATCH_SIZE};
use soundcast::forker::ConverterSpec;
use soundcast::ports::PortArena;
use soundcast::recording::RecordingManager;
use soundcast::registry::ChannelRegistry;
use soundcast::sfu::{LoopbackSfu, SfuRouter};
use soundcast::state::CoreServer;
use soundcast::stats::StatsAggregator;
use soundcast::stt::{StubTranscriber, Transcriber};
use soundcast::transcription::TranscriptionManager;
use soundcast::transcripts::TranscriptStore;
use soundcast::{api, ws};

// ─── Engine selection ───────────────────────────────────────────────────────

/// The speech-to-text engine. The whisper.cpp binding is compiled in behind
/// the `whisper` feature; otherwise the deterministic stub stands in.
fn build_transcriber() -> Arc<dyn Transcriber> {
    #[cfg(feature = "whisper")]
    {
        Arc::new(soundcast::stt::whisper::WhisperTranscriber)
    }
    #[cfg(not(feature = "whisper"))]
    {
        warn!("built without the 'whisper' feature — transcription uses the stub engine");
        Arc::new(StubTranscriber::with_script(Vec::new(), 64 * 1024))
    }
}

/// The text-to-vector function. AllMiniLM via ONNX behind the `fastembed`
/// feature; the hashing embedder otherwise.
fn build_text_embedder(config: &Config) -> Arc<dyn TextEmbedder> {
    #[cfg(feature = "fastembed")]
    {
        match soundcast::embedder::OnnxEmbedder::new(config.whisper_model_dir.join("fastembed")) {
            Ok(embedder) => return Arc::new(embedder),
            Err(e) => warn!("falling back to hashing embedder: {e}"),
        }
    }
    let _ = config;
    Arc::new(HashEmbedder)
}

// ─── CORS ───────────────────────────────────────────────────────────────────

fn build_cors_layer(allowed_origins: &str) -> CorsLayer {
    if allowed_origins == "*" {
        warn!("CORS: permissive mode (allow all origins) — not suitable for production");
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<HeaderValue>().expect("invalid origin header value"))
            .collect();

        info!("CORS: restricted to {} origin(s)", origins.len());

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([
                HeaderName::from_static("content-type"),
                HeaderName::from_static("authorization"),
            ])
    }
}

// ─── Router assembly ────────────────────────────────────────────────────────

fn build_router(server: Arc<CoreServer>, secure: bool, cors: CorsLayer) -> Router {
    let ctx = ws::WsContext { server, secure };
    Router::new()
        // Health (no auth)
        .route("/health", get(api::health))
        // Signaling + room config WebSockets
        .route("/ws", get(ws::ws_signaling))
        .route("/ws/room/:slug/listen", get(ws::ws_room_listen))
        .route("/ws/room/:slug/publish", get(ws::ws_room_publish))
        // Stats WebSockets
        .route("/ws/admin", get(ws::ws_admin))
        .route("/ws/sfu-stats", get(ws::ws_sfu_stats))
        // Recording lifecycle
        .route("/v1/rooms/:slug/recording/start", post(api::start_recording))
        .route("/v1/rooms/:slug/recording/stop", post(api::stop_recording))
        .route("/v1/rooms/:slug/recordings", get(api::list_recordings))
        // Transcripts
        .route("/v1/rooms/:slug/transcripts", get(api::list_transcripts))
        .route("/v1/rooms/:slug/transcripts/recent", get(api::recent_transcripts))
        .route("/v1/rooms/:slug/transcripts/count", get(api::count_transcripts))
        .route("/v1/rooms/:slug/transcripts/search", get(api::search_transcripts))
        .layer(cors)
        .with_state(ctx)
}

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Must happen before any TLS operation.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let _ = dotenvy::dotenv();
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    let config = Config::from_env();

    // ── Persistence (store corruption here is fatal by design) ──────────
    let db = match Db::open(&config.db_path, config.sqlite_vec_path.as_deref()) {
        Ok(db) => db,
        Err(e) => {
            error!("failed to open database at {}: {e}", config.db_path.display());
            std::process::exit(1);
        }
    };

    match db.recover_interrupted_recordings() {
        Ok(0) => {}
        Ok(n) => warn!("{n} recording(s) were interrupted by a crash, marked as error"),
        Err(e) => {
            error!("recording crash recovery failed: {e}");
            std::process::exit(1);
        }
    }

    if config.single_tenant {
        match db.bootstrap_single_tenant(&config.admin_key) {
            Ok(room) => info!("single-tenant mode: room '{}' ready", room.slug),
            Err(e) => {
                error!("single-tenant bootstrap failed: {e}");
                std::process::exit(1);
            }
        }
    }

    // ── Media engine facade ─────────────────────────────────────────────
    // A production deployment links a real engine behind `SfuRouter`; the
    // loopback engine keeps every signaling and pipeline path alive without
    // one.
    let router: Arc<dyn SfuRouter> = Arc::new(LoopbackSfu::new());

    // ── Pipelines ───────────────────────────────────────────────────────
    let transcripts = TranscriptStore::new(db.clone());

    let embedder = if config.embedding_enabled {
        Embedder::spawn(db.clone(), build_text_embedder(&config), DEFAULT_BATCH_SIZE)
    } else {
        Embedder::disabled(db.clone())
    };

    let recording_arena = Arc::new(PortArena::new(
        config.recording_rtp_port_min,
        config.recording_rtp_port_max,
    ));
    let transcription_arena = Arc::new(PortArena::new(
        config.transcription_rtp_port_min,
        config.transcription_rtp_port_max,
    ));

    let recording = RecordingManager::new(
        db.clone(),
        config.recording_dir.clone(),
        recording_arena,
        Box::new(|output| ConverterSpec::ogg_file(output)),
    );

    let transcription = TranscriptionManager::new(
        config.transcription_enabled,
        config.whisper_model_dir.clone(),
        config.whisper_model_size.clone(),
        build_transcriber(),
        transcripts.clone(),
        embedder.clone(),
        transcription_arena,
        ConverterSpec::pcm_stream(),
    );

    let cors = build_cors_layer(&config.allowed_origins);
    let http_addr = format!("{}:{}", config.listen_ip, config.port);
    let tls = if config.tls_enabled() {
        Some((
            config.tls_cert_path.clone().unwrap(),
            config.tls_key_path.clone().unwrap(),
            format!("{}:{}", config.listen_ip, config.https_port),
        ))
    } else {
        None
    };

    let server = Arc::new(CoreServer {
        config,
        db,
        router,
        registry: ChannelRegistry::new(),
        clients: dashmap::DashMap::new(),
        transcripts,
        embedder,
        recording,
        transcription,
        stats: StatsAggregator::new(),
    });

    // ── Listeners ───────────────────────────────────────────────────────
    if let Some((cert_path, key_path, https_addr)) = tls {
        let tls_config =
            axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert_path, &key_path)
                .await
                .expect("failed to load TLS configuration");
        let https_app = build_router(server.clone(), true, cors.clone());
        let addr: std::net::SocketAddr = https_addr.parse().expect("invalid HTTPS bind address");
        info!("soundcast listening on https://{https_addr}");
        tokio::spawn(async move {
            if let Err(e) = axum_server::bind_rustls(addr, tls_config)
                .serve(https_app.into_make_service())
                .await
            {
                error!("HTTPS listener failed: {e}");
            }
        });
    }

    let app = build_router(server, false, cors);
    info!("soundcast listening on http://{http_addr}");
    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .expect("failed to bind HTTP listener");
    axum::serve(listener, app).await.expect("HTTP server failed");
}
