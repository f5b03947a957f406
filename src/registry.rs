// src/registry.rs
//
// The channel registry: the authoritative in-memory map of active channels,
// their producers and their consumers.
//
// Locking discipline: the outer map is a sharded concurrent map; each
// channel's producer/consumer state sits behind its own async mutex (the
// "channel-scoped lock"). All mutations of a channel happen under that lock,
// and the lock is never held across SFU I/O — callers stage SFU work outside
// and reconcile with compensating removes when an SFU call fails.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::sfu::{SfuConsumer, SfuProducer, SfuTransport};

// ─── ChannelKey ─────────────────────────────────────────────────────────────

/// Composite key `(roomSlug, channelName)`. The wire form is
/// `<roomSlug>:<channelName>`; room slugs never contain `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey {
    room_slug: String,
    channel_name: String,
}

impl ChannelKey {
    pub fn new(room_slug: impl Into<String>, channel_name: impl Into<String>) -> Self {
        Self {
            room_slug: room_slug.into(),
            channel_name: channel_name.into(),
        }
    }

    /// Parse the wire form. `None` when the separator is missing or either
    /// half is empty.
    pub fn parse(full: &str) -> Option<Self> {
        let (room, channel) = full.split_once(':')?;
        if room.is_empty() || channel.is_empty() {
            return None;
        }
        Some(Self::new(room, channel))
    }

    pub fn room_slug(&self) -> &str {
        &self.room_slug
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.room_slug, self.channel_name)
    }
}

// ─── Entries ────────────────────────────────────────────────────────────────

/// A live producer inside a channel, keyed by the server's internal producer
/// id (a UUID — deliberately not the engine's own id).
#[derive(Clone)]
pub struct ProducerEntry {
    pub transport: Arc<dyn SfuTransport>,
    pub producer: Arc<dyn SfuProducer>,
    pub owning_client_id: Uuid,
    pub display_name: String,
    pub source_language: String,
}

/// A live consumer inside a channel. `source_producer_id` always references
/// an existing `ProducerEntry` of the same channel.
#[derive(Clone)]
pub struct ConsumerEntry {
    pub transport: Arc<dyn SfuTransport>,
    pub consumer: Arc<dyn SfuConsumer>,
    pub client_id: Uuid,
    pub display_name: String,
    pub source_producer_id: String,
}

// ─── Channel ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ChannelState {
    producers: HashMap<String, ProducerEntry>,
    consumers: HashMap<String, ConsumerEntry>,
}

impl ChannelState {
    pub fn producers(&self) -> &HashMap<String, ProducerEntry> {
        &self.producers
    }

    pub fn consumers(&self) -> &HashMap<String, ConsumerEntry> {
        &self.consumers
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty() && self.consumers.is_empty()
    }

    pub fn insert_producer(&mut self, producer_id: String, entry: ProducerEntry) {
        self.producers.insert(producer_id, entry);
    }

    /// Insert a consumer, enforcing the referential invariant: the source
    /// producer must be live in this channel at insertion time.
    pub fn insert_consumer(&mut self, consumer_id: String, entry: ConsumerEntry) -> CoreResult<()> {
        if !self.producers.contains_key(&entry.source_producer_id) {
            return Err(CoreError::protocol(format!(
                "producer '{}' is not live in this channel",
                entry.source_producer_id
            )));
        }
        self.consumers.insert(consumer_id, entry);
        Ok(())
    }

    /// Remove a producer and atomically drain every consumer derived from
    /// it. Returns the producer entry (if it existed) and the orphaned
    /// consumers for the caller to close outside the lock.
    pub fn remove_producer(
        &mut self,
        producer_id: &str,
    ) -> (Option<ProducerEntry>, Vec<(String, ConsumerEntry)>) {
        let producer = self.producers.remove(producer_id);
        let orphan_ids: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.source_producer_id == producer_id)
            .map(|(id, _)| id.clone())
            .collect();
        let orphans = orphan_ids
            .into_iter()
            .filter_map(|id| self.consumers.remove(&id).map(|c| (id, c)))
            .collect();
        (producer, orphans)
    }

    pub fn remove_consumer(&mut self, consumer_id: &str) -> Option<ConsumerEntry> {
        self.consumers.remove(consumer_id)
    }

    /// Drain every consumer owned by `client_id` (listener teardown).
    pub fn remove_consumers_of_client(&mut self, client_id: Uuid) -> Vec<(String, ConsumerEntry)> {
        let ids: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.client_id == client_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.consumers.remove(&id).map(|c| (id, c)))
            .collect()
    }

    /// Producers owned by `client_id` (normally at most one).
    pub fn producer_ids_of_client(&self, client_id: Uuid) -> Vec<String> {
        self.producers
            .iter()
            .filter(|(_, p)| p.owning_client_id == client_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of **unique** subscribing clients across all consumers.
    pub fn listener_count(&self) -> usize {
        let mut clients: Vec<Uuid> = self.consumers.values().map(|c| c.client_id).collect();
        clients.sort_unstable();
        clients.dedup();
        clients.len()
    }
}

pub struct Channel {
    state: Mutex<ChannelState>,
}

impl Channel {
    fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState::default()),
        }
    }

    /// Acquire the channel-scoped lock.
    pub async fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().await
    }

    fn try_is_empty(&self) -> bool {
        match self.state.try_lock() {
            Ok(state) => state.is_empty(),
            Err(_) => false,
        }
    }
}

// ─── Registry ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<ChannelKey, Arc<Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic get-or-create: channels come into being lazily on the first
    /// produce or subscribe request for their key.
    pub fn get_or_create(&self, key: &ChannelKey) -> Arc<Channel> {
        self.channels
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Channel::new()))
            .clone()
    }

    pub fn get(&self, key: &ChannelKey) -> Option<Arc<Channel>> {
        self.channels.get(key).map(|entry| entry.value().clone())
    }

    /// Consistent point-in-time list of live channel keys, sorted for
    /// deterministic wire output.
    pub fn snapshot_channel_keys(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<ChannelKey> =
            self.channels.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Delete the channel only when both maps are empty. The check runs
    /// under the map shard lock with a non-blocking attempt at the channel
    /// lock, so a concurrent `get_or_create` + insert cannot race the
    /// removal into losing entries.
    pub fn remove_if_empty(&self, key: &ChannelKey) -> bool {
        self.channels
            .remove_if(key, |_, channel| channel.try_is_empty())
            .is_some()
    }

    /// Unconditional removal (admin delete). The caller owns closing the
    /// transports of whatever was inside.
    pub fn remove(&self, key: &ChannelKey) -> Option<Arc<Channel>> {
        self.channels.remove(key).map(|(_, channel)| channel)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sfu::{LoopbackSfu, MediaKind, SfuRouter, WebRtcTransportOptions};
    use serde_json::json;

    async fn entries() -> (ProducerEntry, ConsumerEntry) {
        let router = LoopbackSfu::new();
        let opts = WebRtcTransportOptions {
            listen_ip: "127.0.0.1".into(),
            announced_ip: "127.0.0.1".into(),
            enable_udp: true,
            enable_tcp: false,
        };
        let transport = router.create_webrtc_transport(opts.clone()).await.unwrap();
        let producer = transport.produce(MediaKind::Audio, json!({})).await.unwrap();
        let consumer = transport
            .consume(producer.id(), json!({}), false)
            .await
            .unwrap();

        let producer_entry = ProducerEntry {
            transport: transport.clone(),
            producer,
            owning_client_id: Uuid::new_v4(),
            display_name: "Host".into(),
            source_language: "en".into(),
        };
        let consumer_entry = ConsumerEntry {
            transport,
            consumer,
            client_id: Uuid::new_v4(),
            display_name: "Ada".into(),
            source_producer_id: String::new(), // set by each test
        };
        (producer_entry, consumer_entry)
    }

    #[test]
    fn key_parse_and_display() {
        let key = ChannelKey::parse("demo:main").unwrap();
        assert_eq!(key.room_slug(), "demo");
        assert_eq!(key.channel_name(), "main");
        assert_eq!(key.to_string(), "demo:main");

        // Channel names may themselves contain ':'.
        let nested = ChannelKey::parse("demo:stage:2").unwrap();
        assert_eq!(nested.channel_name(), "stage:2");

        assert!(ChannelKey::parse("no-separator").is_none());
        assert!(ChannelKey::parse(":empty-room").is_none());
        assert!(ChannelKey::parse("empty-channel:").is_none());
    }

    #[tokio::test]
    async fn consumer_requires_live_producer() {
        let registry = ChannelRegistry::new();
        let key = ChannelKey::new("demo", "main");
        let channel = registry.get_or_create(&key);

        let (producer_entry, mut consumer_entry) = entries().await;
        let mut state = channel.lock().await;

        consumer_entry.source_producer_id = "ghost".into();
        assert!(state
            .insert_consumer("c1".into(), consumer_entry.clone())
            .is_err());

        state.insert_producer("p1".into(), producer_entry);
        consumer_entry.source_producer_id = "p1".into();
        state.insert_consumer("c1".into(), consumer_entry).unwrap();
        assert_eq!(state.consumers().len(), 1);
    }

    #[tokio::test]
    async fn remove_producer_drains_derived_consumers() {
        let registry = ChannelRegistry::new();
        let key = ChannelKey::new("demo", "main");
        let channel = registry.get_or_create(&key);

        let (producer_entry, mut consumer_entry) = entries().await;
        let mut state = channel.lock().await;
        state.insert_producer("p1".into(), producer_entry.clone());
        state.insert_producer("p2".into(), producer_entry);

        consumer_entry.source_producer_id = "p1".into();
        state
            .insert_consumer("c1".into(), consumer_entry.clone())
            .unwrap();
        consumer_entry.source_producer_id = "p2".into();
        state.insert_consumer("c2".into(), consumer_entry).unwrap();

        let (removed, orphans) = state.remove_producer("p1");
        assert!(removed.is_some());
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].0, "c1");

        // The invariant holds after the cascade: every surviving consumer
        // still references a live producer.
        for consumer in state.consumers().values() {
            assert!(state.producers().contains_key(&consumer.source_producer_id));
        }
    }

    #[tokio::test]
    async fn listener_count_dedupes_clients() {
        let registry = ChannelRegistry::new();
        let channel = registry.get_or_create(&ChannelKey::new("demo", "main"));
        let (producer_entry, mut consumer_entry) = entries().await;

        let mut state = channel.lock().await;
        state.insert_producer("p1".into(), producer_entry.clone());
        state.insert_producer("p2".into(), producer_entry);

        // One client consuming two producers counts once.
        let client = Uuid::new_v4();
        consumer_entry.client_id = client;
        consumer_entry.source_producer_id = "p1".into();
        state
            .insert_consumer("c1".into(), consumer_entry.clone())
            .unwrap();
        consumer_entry.source_producer_id = "p2".into();
        state.insert_consumer("c2".into(), consumer_entry).unwrap();

        assert_eq!(state.listener_count(), 1);
    }

    #[tokio::test]
    async fn remove_if_empty_only_removes_empty_channels() {
        let registry = ChannelRegistry::new();
        let key = ChannelKey::new("demo", "main");
        let channel = registry.get_or_create(&key);
        assert_eq!(registry.len(), 1);

        let (producer_entry, _) = entries().await;
        {
            let mut state = channel.lock().await;
            state.insert_producer("p1".into(), producer_entry);
        }
        assert!(!registry.remove_if_empty(&key));
        assert_eq!(registry.len(), 1);

        {
            let mut state = channel.lock().await;
            state.remove_producer("p1");
        }
        assert!(registry.remove_if_empty(&key));
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_is_sorted() {
        let registry = ChannelRegistry::new();
        registry.get_or_create(&ChannelKey::new("zeta", "a"));
        registry.get_or_create(&ChannelKey::new("alpha", "b"));
        registry.get_or_create(&ChannelKey::new("alpha", "a"));

        let keys: Vec<String> = registry
            .snapshot_channel_keys()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(keys, vec!["alpha:a", "alpha:b", "zeta:a"]);
    }
}
