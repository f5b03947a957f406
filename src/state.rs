// src/state.rs
//
// `CoreServer` owns every piece of cross-session state: the channel
// registry, the connected-clients map, the persistence handles and the
// pipeline managers. It is constructed once in `main()` with explicit
// dependency injection — there are no package-level mutables.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Config;
use crate::db::Db;
use crate::embedder::Embedder;
use crate::recording::RecordingManager;
use crate::registry::{ChannelKey, ChannelRegistry};
use crate::sfu::{SfuRouter, SfuTransport};
use crate::signaling::ServerEvent;
use crate::stats::StatsAggregator;
use crate::transcription::TranscriptionManager;
use crate::transcripts::TranscriptStore;

// ─── Per-session shared view ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    None,
    Admin,
    Publisher,
    Listener,
}

/// The slice of a session's state other tasks may read (fan-out eligibility,
/// listener counts). Only the owning WebSocket task writes to it.
pub struct SessionShared {
    pub client_id: Uuid,
    role: RwLock<Role>,
    channel_key: RwLock<Option<ChannelKey>>,
    display_name: RwLock<String>,
    source_language: RwLock<String>,
    receiver_caps: RwLock<Option<Value>>,
    transport: RwLock<Option<Arc<dyn SfuTransport>>>,
    transport_connected: AtomicBool,
    producer_id: RwLock<Option<String>>,
}

impl SessionShared {
    pub fn new(client_id: Uuid) -> Self {
        Self {
            client_id,
            role: RwLock::new(Role::None),
            channel_key: RwLock::new(None),
            display_name: RwLock::new(String::from("anonymous")),
            source_language: RwLock::new(String::from("en")),
            receiver_caps: RwLock::new(None),
            transport: RwLock::new(None),
            transport_connected: AtomicBool::new(false),
            producer_id: RwLock::new(None),
        }
    }

    pub fn role(&self) -> Role {
        *self.role.read().unwrap()
    }

    pub fn set_role(&self, role: Role) {
        *self.role.write().unwrap() = role;
    }

    pub fn channel_key(&self) -> Option<ChannelKey> {
        self.channel_key.read().unwrap().clone()
    }

    pub fn set_channel_key(&self, key: Option<ChannelKey>) {
        *self.channel_key.write().unwrap() = key;
    }

    pub fn display_name(&self) -> String {
        self.display_name.read().unwrap().clone()
    }

    pub fn set_display_name(&self, name: String) {
        *self.display_name.write().unwrap() = name;
    }

    pub fn source_language(&self) -> String {
        self.source_language.read().unwrap().clone()
    }

    pub fn set_source_language(&self, language: String) {
        *self.source_language.write().unwrap() = language;
    }

    pub fn receiver_caps(&self) -> Option<Value> {
        self.receiver_caps.read().unwrap().clone()
    }

    pub fn set_receiver_caps(&self, caps: Value) {
        *self.receiver_caps.write().unwrap() = Some(caps);
    }

    pub fn clear_receiver_caps(&self) {
        *self.receiver_caps.write().unwrap() = None;
    }

    pub fn transport(&self) -> Option<Arc<dyn SfuTransport>> {
        self.transport.read().unwrap().clone()
    }

    pub fn set_transport(&self, transport: Arc<dyn SfuTransport>) {
        *self.transport.write().unwrap() = Some(transport);
        self.transport_connected.store(false, Ordering::Release);
    }

    pub fn take_transport(&self) -> Option<Arc<dyn SfuTransport>> {
        self.transport_connected.store(false, Ordering::Release);
        self.transport.write().unwrap().take()
    }

    pub fn transport_connected(&self) -> bool {
        self.transport_connected.load(Ordering::Acquire)
    }

    pub fn set_transport_connected(&self) {
        self.transport_connected.store(true, Ordering::Release);
    }

    pub fn producer_id(&self) -> Option<String> {
        self.producer_id.read().unwrap().clone()
    }

    pub fn set_producer_id(&self, id: Option<String>) {
        *self.producer_id.write().unwrap() = id;
    }
}

/// Registry entry for one connected signaling client.
#[derive(Clone)]
pub struct ClientHandle {
    pub shared: Arc<SessionShared>,
    pub tx: mpsc::UnboundedSender<ServerEvent>,
}

// ─── CoreServer ─────────────────────────────────────────────────────────────

pub struct CoreServer {
    pub config: Config,
    pub db: Db,
    pub router: Arc<dyn SfuRouter>,
    pub registry: ChannelRegistry,
    pub clients: DashMap<Uuid, ClientHandle>,
    pub transcripts: TranscriptStore,
    pub embedder: Embedder,
    pub recording: RecordingManager,
    pub transcription: TranscriptionManager,
    pub stats: StatsAggregator,
}

impl CoreServer {
    pub fn register_client(&self, shared: Arc<SessionShared>) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients
            .insert(shared.client_id, ClientHandle { shared, tx });
        rx
    }

    pub fn unregister_client(&self, client_id: Uuid) {
        self.clients.remove(&client_id);
    }

    /// Push a frame to one client. Silently drops when the client is gone —
    /// per-session failures never propagate across sessions.
    pub fn send_to(&self, client_id: Uuid, event: ServerEvent) {
        if let Some(handle) = self.clients.get(&client_id) {
            let _ = handle.tx.send(event);
        }
    }

    /// Push a frame to every connected signaling client.
    pub fn broadcast(&self, event: ServerEvent) {
        for handle in self.clients.iter() {
            let _ = handle.tx.send(event.clone());
        }
    }

    /// Snapshot of clients for fan-out iteration (never hold the map shard
    /// lock across an await).
    pub fn client_snapshot(&self) -> Vec<ClientHandle> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_shared_defaults() {
        let shared = SessionShared::new(Uuid::new_v4());
        assert_eq!(shared.role(), Role::None);
        assert!(shared.channel_key().is_none());
        assert!(shared.receiver_caps().is_none());
        assert!(shared.transport().is_none());
        assert!(!shared.transport_connected());
        assert_eq!(shared.display_name(), "anonymous");
    }

    #[test]
    fn transport_swap_resets_connected_flag() {
        let shared = SessionShared::new(Uuid::new_v4());
        shared.set_transport(Arc::new(DummyTransport));
        shared.set_transport_connected();
        assert!(shared.transport_connected());

        shared.set_transport(Arc::new(DummyTransport));
        assert!(!shared.transport_connected());

        assert!(shared.take_transport().is_some());
        assert!(shared.transport().is_none());
    }

    struct DummyTransport;

    #[async_trait::async_trait]
    impl SfuTransport for DummyTransport {
        fn id(&self) -> &str {
            "dummy"
        }

        fn params(&self) -> crate::sfu::TransportParams {
            crate::sfu::TransportParams {
                id: "dummy".into(),
                ice_parameters: serde_json::json!({}),
                ice_candidates: serde_json::json!([]),
                dtls_parameters: serde_json::json!({}),
            }
        }

        async fn connect(&self, _dtls: Value) -> crate::error::CoreResult<()> {
            Ok(())
        }

        async fn produce(
            &self,
            _kind: crate::sfu::MediaKind,
            _rtp: Value,
        ) -> crate::error::CoreResult<Arc<dyn crate::sfu::SfuProducer>> {
            Err(crate::error::CoreError::sfu("dummy"))
        }

        async fn consume(
            &self,
            _producer_id: &str,
            _caps: Value,
            _paused: bool,
        ) -> crate::error::CoreResult<Arc<dyn crate::sfu::SfuConsumer>> {
            Err(crate::error::CoreError::sfu("dummy"))
        }

        async fn close(&self) {}
    }
}
