//! Shared fixture: a fully wired `CoreServer` over the in-process engines
//! (loopback SFU, stub transcriber, hashing embedder) and an in-memory
//! database seeded with one tenant, the room `main` and one publisher.

use std::sync::Arc;

use soundcast::config::Config;
use soundcast::db::Db;
use soundcast::embedder::{Embedder, HashEmbedder};
use soundcast::forker::ConverterSpec;
use soundcast::models::{Publisher, Room};
use soundcast::ports::PortArena;
use soundcast::recording::RecordingManager;
use soundcast::registry::ChannelRegistry;
use soundcast::sfu::LoopbackSfu;
use soundcast::state::CoreServer;
use soundcast::stats::StatsAggregator;
use soundcast::stt::{SttSegment, StubTranscriber};
use soundcast::transcription::TranscriptionManager;
use soundcast::transcripts::TranscriptStore;

pub struct Harness {
    pub server: Arc<CoreServer>,
    pub room: Room,
    pub publisher: Publisher,
    pub recording_dir: std::path::PathBuf,
    _tempdir: tempfile::TempDir,
}

/// A converter stand-in that writes a few bytes into the output file (when
/// the factory hands one over) and then lingers until SIGTERM.
fn converter_factory() -> Box<dyn Fn(&std::path::Path) -> ConverterSpec + Send + Sync> {
    Box::new(|output| {
        ConverterSpec::custom(
            "sh",
            vec![
                "-c".into(),
                format!("printf OggS > '{}' && sleep 30", output.display()),
            ],
        )
    })
}

/// Transcription-side converter stand-in: emits a burst of "PCM" bytes on
/// stdout (each byte releases one scripted stub segment) and then lingers
/// until SIGTERM.
pub fn pcm_burst_converter() -> ConverterSpec {
    ConverterSpec::custom("sh", vec!["-c".into(), "printf xxxxxxxx && sleep 30".into()])
}

/// Build the full server. `script` seeds the stub transcription engine
/// (released one segment per byte of PCM); `embedding` turns the embedding
/// worker on.
pub fn harness(script: Vec<SttSegment>, transcription: bool, embedding: bool) -> Harness {
    let tempdir = tempfile::tempdir().unwrap();
    let recording_dir = tempdir.path().join("recordings");
    let model_dir = tempdir.path().join("models");
    std::fs::create_dir_all(&model_dir).unwrap();
    std::fs::write(model_dir.join("ggml-base.en.bin"), b"model").unwrap();

    let db = Db::open_in_memory().unwrap();
    db.bootstrap_single_tenant("test-key").unwrap();
    let room = db.room_by_slug("main").unwrap().unwrap();

    let publisher = Publisher {
        id: uuid::Uuid::new_v4().to_string(),
        room_id: room.id.clone(),
        name: "Host".into(),
        channel_name: "main".into(),
        source_language: "en".into(),
        join_token_hash: bcrypt::hash("join-me", 4).unwrap(),
    };
    db.insert_publisher(&publisher).unwrap();

    let store = TranscriptStore::new(db.clone());
    let embedder = if embedding {
        Embedder::spawn(db.clone(), Arc::new(HashEmbedder), 4)
    } else {
        Embedder::disabled(db.clone())
    };

    let recording = RecordingManager::new(
        db.clone(),
        recording_dir.clone(),
        Arc::new(PortArena::new(58000, 58050)),
        converter_factory(),
    );
    let transcription = TranscriptionManager::new(
        transcription,
        model_dir,
        "base".into(),
        Arc::new(StubTranscriber::with_script(script, 1)),
        store.clone(),
        embedder.clone(),
        Arc::new(PortArena::new(58100, 58150)),
        pcm_burst_converter(),
    );

    let server = Arc::new(CoreServer {
        config: Config::default(),
        db,
        router: Arc::new(LoopbackSfu::new()),
        registry: ChannelRegistry::new(),
        clients: dashmap::DashMap::new(),
        transcripts: store,
        embedder,
        recording,
        transcription,
        stats: StatsAggregator::new(),
    });

    Harness {
        server,
        room,
        publisher,
        recording_dir,
        _tempdir: tempdir,
    }
}
