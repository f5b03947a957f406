// src/sfu.rs
//
// Abstract facade over the media engine.
//
// The core never talks to a concrete SFU library; it drives transports,
// producers and consumers through these traits. Parameter blobs
// (ICE/DTLS/RTP parameters, RTP capabilities) are opaque `serde_json::Value`s
// negotiated between the engine and the browser — the core only routes them.
//
// `LoopbackSfu` is the in-process engine registered by default: it performs
// no media I/O but implements the full lifecycle contract, which makes the
// binary runnable and the signaling paths testable without a media stack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{CoreError, CoreResult};

// ─── Shared types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Parameters a client needs to complete a WebRTC transport.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
    pub listen_ip: String,
    pub announced_ip: String,
    pub enable_udp: bool,
    pub enable_tcp: bool,
}

#[derive(Debug, Clone)]
pub struct PlainTransportOptions {
    pub listen_ip: String,
    pub rtcp_mux: bool,
    pub comedia: bool,
}

// ─── Facade traits ──────────────────────────────────────────────────────────

#[async_trait]
pub trait SfuRouter: Send + Sync {
    /// The router's RTP capabilities, handed verbatim to clients.
    fn rtp_capabilities(&self) -> Value;

    async fn create_webrtc_transport(
        &self,
        opts: WebRtcTransportOptions,
    ) -> CoreResult<Arc<dyn SfuTransport>>;

    async fn create_plain_transport(
        &self,
        opts: PlainTransportOptions,
    ) -> CoreResult<Arc<dyn SfuPlainTransport>>;

    /// Whether a consumer with the given receiver capabilities can be
    /// attached to the producer. Mismatches are not errors — callers skip.
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool;
}

#[async_trait]
pub trait SfuTransport: Send + Sync {
    fn id(&self) -> &str;

    /// The parameter bundle for the client-side half of the transport.
    fn params(&self) -> TransportParams;

    async fn connect(&self, dtls_parameters: Value) -> CoreResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> CoreResult<Arc<dyn SfuProducer>>;

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> CoreResult<Arc<dyn SfuConsumer>>;

    /// Closing a transport closes everything it carries. Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait SfuProducer: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> Value;
    async fn close(&self);
}

#[async_trait]
pub trait SfuConsumer: Send + Sync {
    fn id(&self) -> &str;
    fn producer_id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> Value;
    fn paused(&self) -> bool;
    async fn resume(&self) -> CoreResult<()>;
    async fn close(&self);
}

/// A plain (non-WebRTC) RTP transport used to side-car a producer's media
/// out to a known UDP port.
#[async_trait]
pub trait SfuPlainTransport: Send + Sync {
    fn id(&self) -> &str;

    /// Point the engine's RTP output at `ip:port`.
    async fn connect(&self, ip: &str, port: u16) -> CoreResult<()>;

    /// Attach a consumer for `producer_id` on this transport.
    async fn consume(&self, producer_id: &str) -> CoreResult<Arc<dyn SfuConsumer>>;

    async fn close(&self);
}

// ─── Loopback engine ────────────────────────────────────────────────────────

#[derive(Default)]
struct LoopbackState {
    producers: HashMap<String, (MediaKind, Value)>,
}

/// In-process engine implementing the facade with no media I/O.
pub struct LoopbackSfu {
    state: Arc<Mutex<LoopbackState>>,
    rtp_capabilities: Value,
}

impl LoopbackSfu {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LoopbackState::default())),
            rtp_capabilities: json!({
                "codecs": [{
                    "kind": "audio",
                    "mimeType": "audio/opus",
                    "clockRate": 48000,
                    "channels": 2,
                    "preferredPayloadType": 100
                }],
                "headerExtensions": []
            }),
        }
    }

    fn synth_consumer_params(producer_params: &Value) -> Value {
        // Echo the producer's negotiated codec; fill in loopback defaults
        // where the producer left fields out.
        let payload_type = producer_params
            .pointer("/codecs/0/payloadType")
            .and_then(Value::as_u64)
            .unwrap_or(100);
        let ssrc = producer_params
            .pointer("/encodings/0/ssrc")
            .and_then(Value::as_u64)
            .unwrap_or_else(|| u64::from(rand::random::<u32>()));
        json!({
            "codecs": [{
                "mimeType": "audio/opus",
                "payloadType": payload_type,
                "clockRate": 48000,
                "channels": 2
            }],
            "encodings": [{ "ssrc": ssrc }]
        })
    }
}

impl Default for LoopbackSfu {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SfuRouter for LoopbackSfu {
    fn rtp_capabilities(&self) -> Value {
        self.rtp_capabilities.clone()
    }

    async fn create_webrtc_transport(
        &self,
        _opts: WebRtcTransportOptions,
    ) -> CoreResult<Arc<dyn SfuTransport>> {
        Ok(Arc::new(LoopbackTransport {
            id: uuid::Uuid::new_v4().to_string(),
            state: self.state.clone(),
            closed: AtomicBool::new(false),
            owned: Mutex::new(Vec::new()),
        }))
    }

    async fn create_plain_transport(
        &self,
        _opts: PlainTransportOptions,
    ) -> CoreResult<Arc<dyn SfuPlainTransport>> {
        Ok(Arc::new(LoopbackPlainTransport {
            id: uuid::Uuid::new_v4().to_string(),
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let state = self.state.lock().unwrap();
        if !state.producers.contains_key(producer_id) {
            return false;
        }
        if !rtp_capabilities.is_object() {
            return false;
        }
        // A receiver that enumerates codecs must include Opus; a receiver
        // that sends no codec list is assumed compatible.
        match rtp_capabilities.get("codecs").and_then(Value::as_array) {
            Some(codecs) => codecs.iter().any(|c| {
                c.get("mimeType")
                    .and_then(Value::as_str)
                    .map(|m| m.eq_ignore_ascii_case("audio/opus"))
                    .unwrap_or(false)
            }),
            None => true,
        }
    }
}

struct LoopbackTransport {
    id: String,
    state: Arc<Mutex<LoopbackState>>,
    closed: AtomicBool,
    owned: Mutex<Vec<String>>,
}

#[async_trait]
impl SfuTransport for LoopbackTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn params(&self) -> TransportParams {
        TransportParams {
            id: self.id.clone(),
            ice_parameters: json!({
                "usernameFragment": uuid::Uuid::new_v4().to_string(),
                "password": uuid::Uuid::new_v4().to_string(),
                "iceLite": true
            }),
            ice_candidates: json!([]),
            dtls_parameters: json!({ "role": "auto", "fingerprints": [] }),
        }
    }

    async fn connect(&self, _dtls_parameters: Value) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::sfu("transport is closed"));
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> CoreResult<Arc<dyn SfuProducer>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::sfu("transport is closed"));
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.state
            .lock()
            .unwrap()
            .producers
            .insert(id.clone(), (kind, rtp_parameters.clone()));
        self.owned.lock().unwrap().push(id.clone());
        Ok(Arc::new(LoopbackProducer {
            id,
            kind,
            rtp_parameters,
            state: self.state.clone(),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        _rtp_capabilities: Value,
        paused: bool,
    ) -> CoreResult<Arc<dyn SfuConsumer>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::sfu("transport is closed"));
        }
        let producer_params = {
            let state = self.state.lock().unwrap();
            let (_, params) = state
                .producers
                .get(producer_id)
                .ok_or_else(|| CoreError::sfu(format!("unknown producer '{producer_id}'")))?;
            params.clone()
        };
        Ok(Arc::new(LoopbackConsumer {
            id: uuid::Uuid::new_v4().to_string(),
            producer_id: producer_id.to_string(),
            rtp_parameters: LoopbackSfu::synth_consumer_params(&producer_params),
            paused: AtomicBool::new(paused),
        }))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let owned = std::mem::take(&mut *self.owned.lock().unwrap());
        let mut state = self.state.lock().unwrap();
        for producer_id in owned {
            state.producers.remove(&producer_id);
        }
    }
}

struct LoopbackProducer {
    id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    state: Arc<Mutex<LoopbackState>>,
}

#[async_trait]
impl SfuProducer for LoopbackProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    async fn close(&self) {
        self.state.lock().unwrap().producers.remove(&self.id);
    }
}

struct LoopbackConsumer {
    id: String,
    producer_id: String,
    rtp_parameters: Value,
    paused: AtomicBool,
}

#[async_trait]
impl SfuConsumer for LoopbackConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    async fn resume(&self) -> CoreResult<()> {
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    async fn close(&self) {}
}

struct LoopbackPlainTransport {
    id: String,
    state: Arc<Mutex<LoopbackState>>,
    closed: AtomicBool,
}

#[async_trait]
impl SfuPlainTransport for LoopbackPlainTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self, _ip: &str, _port: u16) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::sfu("plain transport is closed"));
        }
        Ok(())
    }

    async fn consume(&self, producer_id: &str) -> CoreResult<Arc<dyn SfuConsumer>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::sfu("plain transport is closed"));
        }
        let producer_params = {
            let state = self.state.lock().unwrap();
            let (_, params) = state
                .producers
                .get(producer_id)
                .ok_or_else(|| CoreError::sfu(format!("unknown producer '{producer_id}'")))?;
            params.clone()
        };
        Ok(Arc::new(LoopbackConsumer {
            id: uuid::Uuid::new_v4().to_string(),
            producer_id: producer_id.to_string(),
            rtp_parameters: LoopbackSfu::synth_consumer_params(&producer_params),
            paused: AtomicBool::new(false),
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ─── Parameter extraction helpers ───────────────────────────────────────────

/// Payload type of the first negotiated codec (defaults to dynamic PT 100).
pub fn payload_type_of(rtp_parameters: &Value) -> u8 {
    rtp_parameters
        .pointer("/codecs/0/payloadType")
        .and_then(Value::as_u64)
        .map(|pt| pt as u8)
        .unwrap_or(100)
}

/// SSRC of the first encoding, when the engine reported one.
pub fn ssrc_of(rtp_parameters: &Value) -> Option<u32> {
    rtp_parameters
        .pointer("/encodings/0/ssrc")
        .and_then(Value::as_u64)
        .map(|s| s as u32)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
