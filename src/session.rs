// src/session.rs
//
// Per-connection signaling session: one `ClientSession` per WebSocket,
// driving role election, transport setup, produce/consume and teardown.
//
// The state machine is driven exclusively by the session's own view
// (`SessionShared`), never by peeking at other sessions — that is what
// rules out TOCTOU between connections. Roles are sticky once assigned;
// a connection never publishes and listens at the same time.
//
// Frame handling is serial: the socket loop reads one frame, awaits the
// handler to completion, then reads the next. Outgoing frames ride an
// unbounded ordered queue owned by the socket task.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::fanout;
use crate::registry::{ChannelKey, ConsumerEntry, ProducerEntry};
use crate::sfu::{MediaKind, WebRtcTransportOptions};
use crate::signaling::{
    self, AdminChangePublisherChannel, AdminRemoveSubscriber, ChannelRef, ClientAction,
    ConnectTransport, ConsumeAudio, ConsumerInfo, CreateListenerTransport,
    CreatePublisherTransport, ProduceAudio, ServerEvent, SubscriberInfo,
};
use crate::state::{CoreServer, Role, SessionShared};
use crate::transcription::ProducerContext;

pub struct ClientSession {
    server: Arc<CoreServer>,
    shared: Arc<SessionShared>,
}

impl ClientSession {
    /// Register a fresh session; the returned receiver is the ordered
    /// outbound frame queue for the socket task.
    pub fn connect(
        server: Arc<CoreServer>,
    ) -> (Self, tokio::sync::mpsc::UnboundedReceiver<ServerEvent>) {
        let shared = Arc::new(SessionShared::new(Uuid::new_v4()));
        let rx = server.register_client(shared.clone());
        info!(client = %shared.client_id, "signaling session connected");
        (Self { server, shared }, rx)
    }

    pub fn client_id(&self) -> Uuid {
        self.shared.client_id
    }

    pub fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    fn send_self(&self, event: ServerEvent) {
        self.server.send_to(self.client_id(), event);
    }

    /// Decode and process one incoming text frame. Protocol errors answer
    /// with an `error` frame on the same connection; the connection stays
    /// open.
    pub async fn handle_frame(&self, text: &str) {
        match signaling::decode_frame(text) {
            Ok(Some(action)) => {
                if let Err(e) = self.handle_action(action).await {
                    warn!(client = %self.client_id(), "action failed: {e}");
                    self.send_self(ServerEvent::error_from(&e));
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(client = %self.client_id(), "{e}");
                self.send_self(ServerEvent::error_from(&e));
            }
        }
    }

    pub async fn handle_action(&self, action: ClientAction) -> CoreResult<()> {
        match action {
            ClientAction::GetRtpCapabilities => {
                self.send_self(ServerEvent::RtpCapabilities(
                    self.server.router.rtp_capabilities(),
                ));
                Ok(())
            }
            ClientAction::GetChannels => {
                self.send_self(fanout::channel_list_event(&self.server));
                Ok(())
            }
            ClientAction::CreatePublisherTransport(data) => {
                self.create_publisher_transport(data).await
            }
            ClientAction::ConnectPublisherTransport(data) => {
                self.connect_transport(Role::Publisher, data).await
            }
            ClientAction::ProduceAudio(data) => self.produce_audio(data).await,
            ClientAction::CreateListenerTransport(data) => {
                self.create_listener_transport(data).await
            }
            ClientAction::ConnectListenerTransport(data) => {
                self.connect_transport(Role::Listener, data).await
            }
            ClientAction::ConsumeAudio(data) => self.consume_audio(data).await,
            ClientAction::StopBroadcasting(data) => self.stop_broadcasting(data).await,
            ClientAction::LeaveChannel => self.leave_channel().await,
            ClientAction::AdminCreateChannel(data) => self.admin_create_channel(data).await,
            ClientAction::AdminDeleteChannel(data) => self.admin_delete_channel(data).await,
            ClientAction::AdminGetChannelsSubscribers => {
                self.admin_get_channels_subscribers().await
            }
            ClientAction::AdminRemoveSubscriber(data) => self.admin_remove_subscriber(data).await,
            ClientAction::AdminChangePublisherChannel(data) => {
                self.admin_change_publisher_channel(data).await
            }
        }
    }

    /// Connection close: equivalent to stop-broadcasting and/or
    /// leave-channel for whichever role the session held, plus transport
    /// close.
    pub async fn disconnect(&self) {
        match self.shared.role() {
            Role::Publisher => {
                if let (Some(key), Some(producer_id)) =
                    (self.shared.channel_key(), self.shared.producer_id())
                {
                    self.end_producer(&key, &producer_id).await;
                    self.shared.set_producer_id(None);
                }
            }
            Role::Listener => {
                self.detach_listener().await;
            }
            Role::Admin | Role::None => {}
        }
        if let Some(transport) = self.shared.take_transport() {
            transport.close().await;
        }
        self.server.unregister_client(self.client_id());
        info!(client = %self.client_id(), "signaling session closed");
    }

    // ── Publisher path ──────────────────────────────────────────────────

    async fn create_publisher_transport(&self, data: CreatePublisherTransport) -> CoreResult<()> {
        match self.shared.role() {
            Role::None => {}
            Role::Publisher if self.shared.producer_id().is_none() => {}
            Role::Publisher => {
                return Err(CoreError::protocol("already publishing on this connection"))
            }
            _ => return Err(CoreError::protocol("connection already holds another role")),
        }

        let key = parse_channel_id(Some(data.channel_id.as_str()))?;
        // Channels come into being lazily — this can never fail for want of
        // channel existence.
        self.server.registry.get_or_create(&key);

        let transport = self
            .server
            .router
            .create_webrtc_transport(self.transport_options())
            .await?;
        let params = transport.params();

        self.shared.set_role(Role::Publisher);
        self.shared.set_channel_key(Some(key));
        if let Some(name) = data.display_name {
            self.shared.set_display_name(name);
        }
        if let Some(language) = data.source_language {
            self.shared.set_source_language(language);
        }
        self.shared.set_transport(transport);

        self.send_self(ServerEvent::PublisherTransportCreated(
            serde_json::to_value(params).expect("transport params serialize"),
        ));
        Ok(())
    }

    async fn connect_transport(&self, expected: Role, data: ConnectTransport) -> CoreResult<()> {
        if self.shared.role() != expected {
            return Err(CoreError::protocol("transport does not belong to this role"));
        }
        let transport = self
            .shared
            .transport()
            .ok_or_else(|| CoreError::protocol("create a transport first"))?;
        transport.connect(data.dtls_parameters).await?;
        self.shared.set_transport_connected();

        self.send_self(match expected {
            Role::Publisher => ServerEvent::PublisherTransportConnected,
            _ => ServerEvent::ListenerTransportConnected,
        });
        Ok(())
    }

    async fn produce_audio(&self, data: ProduceAudio) -> CoreResult<()> {
        if self.shared.role() != Role::Publisher {
            return Err(CoreError::protocol("produce-audio requires a publisher transport"));
        }
        if !self.shared.transport_connected() {
            return Err(CoreError::protocol("connect the publisher transport first"));
        }
        if self.shared.producer_id().is_some() {
            return Err(CoreError::protocol("already producing on this connection"));
        }
        let key = self
            .shared
            .channel_key()
            .ok_or_else(|| CoreError::protocol("no channel bound to this session"))?;
        let transport = self
            .shared
            .transport()
            .ok_or_else(|| CoreError::protocol("create a transport first"))?;

        let producer = transport
            .produce(MediaKind::Audio, data.rtp_parameters)
            .await?;
        let sfu_producer_id = producer.id().to_string();

        // The server's own producer id, deliberately distinct from the
        // engine's.
        let internal_id = Uuid::new_v4().to_string();

        let channel = self.server.registry.get_or_create(&key);
        {
            let mut state = channel.lock().await;
            state.insert_producer(
                internal_id.clone(),
                ProducerEntry {
                    transport: transport.clone(),
                    producer,
                    owning_client_id: self.client_id(),
                    display_name: self.shared.display_name(),
                    source_language: self.shared.source_language(),
                },
            );
            self.shared.set_producer_id(Some(internal_id.clone()));

            fanout::fan_out_new_producer(&self.server, &key, &mut state, &internal_id).await;
            fanout::notify_publishers_listener_count(&self.server, &key, &state);
            fanout::push_channel_stats(&self.server, &key, &state);
        }
        fanout::broadcast_channel_list(&self.server);

        self.send_self(ServerEvent::Produced {
            id: internal_id.clone(),
        });

        self.start_producer_pipelines(&key, &internal_id, &sfu_producer_id)
            .await;
        info!(
            client = %self.client_id(),
            channel = %key,
            producer = %internal_id,
            "producer started"
        );
        Ok(())
    }

    async fn stop_broadcasting(&self, data: ChannelRef) -> CoreResult<()> {
        // A no-op that still reports success when the session is not (or no
        // longer) publishing.
        if self.shared.role() != Role::Publisher || self.shared.producer_id().is_none() {
            self.send_self(ServerEvent::BroadcastingStopped {
                channel_id: data.channel_id.unwrap_or_default(),
            });
            return Ok(());
        }

        let key = self
            .shared
            .channel_key()
            .ok_or_else(|| CoreError::protocol("no channel bound to this session"))?;
        let producer_id = self.shared.producer_id().expect("checked above");

        self.end_producer(&key, &producer_id).await;
        self.shared.set_producer_id(None);
        if let Some(transport) = self.shared.take_transport() {
            transport.close().await;
        }

        self.send_self(ServerEvent::BroadcastingStopped {
            channel_id: key.to_string(),
        });
        Ok(())
    }

    /// Producer teardown shared by stop-broadcasting, disconnect and admin
    /// eviction: cascade-close derived consumers, close the producer,
    /// collapse the channel if empty, detach the pipelines.
    async fn end_producer(&self, key: &ChannelKey, producer_id: &str) {
        if let Some(channel) = self.server.registry.get(key) {
            let mut state = channel.lock().await;
            if let Some(entry) =
                fanout::close_producer(&self.server, &mut state, producer_id).await
            {
                entry.producer.close().await;
            }
            fanout::notify_publishers_listener_count(&self.server, key, &state);
            fanout::push_channel_stats(&self.server, key, &state);
            drop(state);
            if self.server.registry.remove_if_empty(key) {
                fanout::drop_channel_stats(&self.server, key);
            }
        }
        fanout::broadcast_channel_list(&self.server);
        self.stop_producer_pipelines(key, producer_id).await;
    }

    // ── Listener path ───────────────────────────────────────────────────

    async fn create_listener_transport(&self, data: CreateListenerTransport) -> CoreResult<()> {
        match self.shared.role() {
            Role::None | Role::Listener => {}
            _ => return Err(CoreError::protocol("connection already holds another role")),
        }

        let key = parse_channel_id(Some(data.channel_id.as_str()))?;
        self.server.registry.get_or_create(&key);

        let transport = self
            .server
            .router
            .create_webrtc_transport(self.transport_options())
            .await?;
        let params = transport.params();

        self.shared.set_role(Role::Listener);
        self.shared.set_channel_key(Some(key));
        if let Some(name) = data.display_name {
            self.shared.set_display_name(name);
        }
        self.shared.set_transport(transport);

        self.send_self(ServerEvent::ListenerTransportCreated(
            serde_json::to_value(params).expect("transport params serialize"),
        ));
        Ok(())
    }

    async fn consume_audio(&self, data: ConsumeAudio) -> CoreResult<()> {
        if self.shared.role() != Role::Listener {
            return Err(CoreError::protocol("consume-audio requires a listener transport"));
        }
        if !self.shared.transport_connected() {
            return Err(CoreError::protocol("connect the listener transport first"));
        }
        let key = self
            .shared
            .channel_key()
            .ok_or_else(|| CoreError::protocol("no channel bound to this session"))?;
        let transport = self
            .shared
            .transport()
            .ok_or_else(|| CoreError::protocol("create a transport first"))?;

        self.shared.set_receiver_caps(data.rtp_capabilities.clone());

        let Some(channel) = self.server.registry.get(&key) else {
            self.send_self(ServerEvent::WaitingForPublisher);
            return Ok(());
        };

        let mut state = channel.lock().await;
        if state.producers().is_empty() {
            drop(state);
            self.send_self(ServerEvent::WaitingForPublisher);
            return Ok(());
        }

        let producers: Vec<(String, String)> = state
            .producers()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.producer.id().to_string()))
            .collect();

        let mut batch: Vec<ConsumerInfo> = Vec::new();
        for (internal_producer_id, sfu_producer_id) in producers {
            // Capability mismatches are skipped silently; a zero-entry reply
            // is a valid outcome, not an error.
            if !self
                .server
                .router
                .can_consume(&sfu_producer_id, &data.rtp_capabilities)
            {
                continue;
            }
            match transport
                .consume(&sfu_producer_id, data.rtp_capabilities.clone(), false)
                .await
            {
                Ok(consumer) => {
                    let consumer_id = Uuid::new_v4().to_string();
                    batch.push(ConsumerInfo {
                        id: consumer_id.clone(),
                        producer_id: internal_producer_id.clone(),
                        kind: consumer.kind().as_str().to_string(),
                        rtp_parameters: consumer.rtp_parameters(),
                    });
                    let entry = ConsumerEntry {
                        transport: transport.clone(),
                        consumer,
                        client_id: self.client_id(),
                        display_name: self.shared.display_name(),
                        source_producer_id: internal_producer_id,
                    };
                    if let Err(e) = state.insert_consumer(consumer_id, entry) {
                        warn!("consume insert failed: {e}");
                        batch.pop();
                    }
                }
                Err(e) => {
                    warn!(client = %self.client_id(), "consume failed, skipping producer: {e}");
                }
            }
        }

        fanout::notify_publishers_listener_count(&self.server, &key, &state);
        fanout::push_channel_stats(&self.server, &key, &state);
        drop(state);

        self.send_self(ServerEvent::consumer_batch(batch));
        Ok(())
    }

    async fn leave_channel(&self) -> CoreResult<()> {
        // No-op for anything that is not currently a listener.
        if self.shared.role() != Role::Listener {
            return Ok(());
        }
        self.detach_listener().await;
        self.shared.set_role(Role::None);
        self.shared.set_channel_key(None);
        self.shared.clear_receiver_caps();
        Ok(())
    }

    /// Close and delete every ConsumerEntry owned by this client. Leaves
    /// the channel itself alone unless it became empty.
    async fn detach_listener(&self) {
        let Some(key) = self.shared.channel_key() else {
            return;
        };
        let Some(channel) = self.server.registry.get(&key) else {
            return;
        };
        let mut state = channel.lock().await;
        let removed = state.remove_consumers_of_client(self.client_id());
        for (_, entry) in removed {
            entry.consumer.close().await;
        }
        fanout::notify_publishers_listener_count(&self.server, &key, &state);
        fanout::push_channel_stats(&self.server, &key, &state);
        drop(state);
        if self.server.registry.remove_if_empty(&key) {
            fanout::drop_channel_stats(&self.server, &key);
            fanout::broadcast_channel_list(&self.server);
        }
    }

    // ── Admin path ──────────────────────────────────────────────────────

    fn ensure_admin(&self) -> CoreResult<()> {
        match self.shared.role() {
            Role::Admin => Ok(()),
            Role::None => {
                self.shared.set_role(Role::Admin);
                Ok(())
            }
            _ => Err(CoreError::protocol(
                "admin actions are not available to publisher/listener sessions",
            )),
        }
    }

    async fn admin_create_channel(&self, data: ChannelRef) -> CoreResult<()> {
        self.ensure_admin()?;
        let key = parse_channel_id(data.channel_id.as_deref())?;
        // Idempotent: creating an existing channel changes nothing.
        self.server.registry.get_or_create(&key);
        self.server.stats.update_local(
            key.room_slug(),
            key.channel_name(),
            crate::stats::ChannelStats::ZERO,
        );
        fanout::broadcast_channel_list(&self.server);
        self.send_self(ServerEvent::ChannelCreated {
            channel_id: key.to_string(),
        });
        Ok(())
    }

    async fn admin_delete_channel(&self, data: ChannelRef) -> CoreResult<()> {
        self.ensure_admin()?;
        let key = parse_channel_id(data.channel_id.as_deref())?;

        if let Some(channel) = self.server.registry.remove(&key) {
            let mut state = channel.lock().await;

            // Consumers first: close each one plus its owning transport and
            // remember the affected listeners.
            let consumer_ids: Vec<String> = state.consumers().keys().cloned().collect();
            let mut listeners: Vec<Uuid> = Vec::new();
            for consumer_id in consumer_ids {
                let Some(entry) = state.remove_consumer(&consumer_id) else {
                    continue;
                };
                entry.consumer.close().await;
                entry.transport.close().await;
                if !listeners.contains(&entry.client_id) {
                    listeners.push(entry.client_id);
                }
            }

            // Then the producers and their transports.
            let producer_ids: Vec<String> = state.producers().keys().cloned().collect();
            for producer_id in &producer_ids {
                let (producer, _) = state.remove_producer(producer_id);
                if let Some(entry) = producer {
                    entry.producer.close().await;
                    entry.transport.close().await;
                    if let Some(owner) = self.server.clients.get(&entry.owning_client_id) {
                        owner.shared.set_producer_id(None);
                        owner.shared.take_transport();
                    }
                }
            }

            for client_id in listeners {
                self.server.send_to(
                    client_id,
                    ServerEvent::ForcedDisconnect {
                        reason: format!("channel '{key}' was deleted"),
                    },
                );
            }
            drop(state);

            for producer_id in &producer_ids {
                self.stop_producer_pipelines(&key, producer_id).await;
            }
            fanout::drop_channel_stats(&self.server, &key);
        }

        fanout::broadcast_channel_list(&self.server);
        self.send_self(ServerEvent::ChannelDeleted {
            channel_id: key.to_string(),
        });
        Ok(())
    }

    async fn admin_get_channels_subscribers(&self) -> CoreResult<()> {
        self.ensure_admin()?;
        let mut mapping = std::collections::BTreeMap::new();
        for key in self.server.registry.snapshot_channel_keys() {
            let Some(channel) = self.server.registry.get(&key) else {
                continue;
            };
            let state = channel.lock().await;
            let subscribers: Vec<SubscriberInfo> = state
                .consumers()
                .iter()
                .map(|(id, entry)| SubscriberInfo {
                    id: id.clone(),
                    display_name: entry.display_name.clone(),
                })
                .collect();
            mapping.insert(key.to_string(), subscribers);
        }
        self.send_self(ServerEvent::ChannelsSubscribers(mapping));
        Ok(())
    }

    async fn admin_remove_subscriber(&self, data: AdminRemoveSubscriber) -> CoreResult<()> {
        self.ensure_admin()?;
        let key = parse_channel_id(Some(data.channel_id.as_str()))?;
        let channel = self
            .server
            .registry
            .get(&key)
            .ok_or_else(|| CoreError::not_found(format!("channel '{key}' is not live")))?;

        let mut state = channel.lock().await;
        let entry = state.remove_consumer(&data.consumer_id).ok_or_else(|| {
            CoreError::not_found(format!(
                "consumer '{}' not found in channel '{key}'",
                data.consumer_id
            ))
        })?;
        entry.consumer.close().await;
        entry.transport.close().await;

        self.server.send_to(
            entry.client_id,
            ServerEvent::ForcedDisconnect {
                reason: "removed by admin".into(),
            },
        );
        fanout::notify_publishers_listener_count(&self.server, &key, &state);
        fanout::push_channel_stats(&self.server, &key, &state);
        drop(state);

        self.send_self(ServerEvent::SubscriberRemoved {
            channel_id: key.to_string(),
            consumer_id: data.consumer_id,
        });
        Ok(())
    }

    async fn admin_change_publisher_channel(
        &self,
        data: AdminChangePublisherChannel,
    ) -> CoreResult<()> {
        self.ensure_admin()?;
        let new_key = ChannelKey::parse(&data.new_channel_id).ok_or_else(|| {
            CoreError::protocol(format!("invalid channel id '{}'", data.new_channel_id))
        })?;

        // Locate the channel currently holding the producer.
        let mut old_key = None;
        for key in self.server.registry.snapshot_channel_keys() {
            if let Some(channel) = self.server.registry.get(&key) {
                if channel
                    .lock()
                    .await
                    .producers()
                    .contains_key(&data.publisher_id)
                {
                    old_key = Some(key);
                    break;
                }
            }
        }
        let old_key = old_key.ok_or_else(|| {
            CoreError::not_found(format!("publisher '{}' is not live", data.publisher_id))
        })?;

        if old_key == new_key {
            self.send_self(ServerEvent::AdminChannelChanged {
                publisher_id: data.publisher_id,
                old_channel_id: old_key.to_string(),
                new_channel_id: new_key.to_string(),
            });
            return Ok(());
        }

        let old_channel = self
            .server
            .registry
            .get(&old_key)
            .ok_or_else(|| CoreError::not_found(format!("channel '{old_key}' is gone")))?;
        let new_channel = self.server.registry.get_or_create(&new_key);

        // Both channel locks, in key order — concurrent moves of the same
        // publisher serialize here instead of racing.
        let (mut old_state, mut new_state) = if old_key < new_key {
            let old_guard = old_channel.lock().await;
            let new_guard = new_channel.lock().await;
            (old_guard, new_guard)
        } else {
            let new_guard = new_channel.lock().await;
            let old_guard = old_channel.lock().await;
            (old_guard, new_guard)
        };

        // (a) Detach from the old channel; its consumers learn via
        // producer-stopped.
        let entry = fanout::close_producer(&self.server, &mut old_state, &data.publisher_id)
            .await
            .ok_or_else(|| {
                CoreError::not_found(format!(
                    "publisher '{}' left during the move",
                    data.publisher_id
                ))
            })?;
        let owning_client_id = entry.owning_client_id;

        // (b) Same entry, same internal producer id, new channel.
        new_state.insert_producer(data.publisher_id.clone(), entry);

        // (c) Listeners already in the new channel get synthesized
        // consumers.
        fanout::fan_out_new_producer(&self.server, &new_key, &mut new_state, &data.publisher_id)
            .await;

        fanout::notify_publishers_listener_count(&self.server, &old_key, &old_state);
        fanout::push_channel_stats(&self.server, &old_key, &old_state);
        fanout::notify_publishers_listener_count(&self.server, &new_key, &new_state);
        fanout::push_channel_stats(&self.server, &new_key, &new_state);
        drop(old_state);
        drop(new_state);

        if let Some(owner) = self.server.clients.get(&owning_client_id) {
            owner.shared.set_channel_key(Some(new_key.clone()));
        }
        if self.server.registry.remove_if_empty(&old_key) {
            fanout::drop_channel_stats(&self.server, &old_key);
        }
        fanout::broadcast_channel_list(&self.server);

        // Re-home the pipelines: the forks and the transcription context
        // carry the channel name, so the old ones end and fresh ones start
        // under the new key.
        self.stop_producer_pipelines(&old_key, &data.publisher_id).await;
        if let Some(channel) = self.server.registry.get(&new_key) {
            let state = channel.lock().await;
            if let Some(entry) = state.producers().get(&data.publisher_id) {
                let sfu_producer_id = entry.producer.id().to_string();
                drop(state);
                self.start_producer_pipelines(&new_key, &data.publisher_id, &sfu_producer_id)
                    .await;
            }
        }

        info!(
            publisher = %data.publisher_id,
            from = %old_key,
            to = %new_key,
            "publisher moved between channels"
        );
        self.send_self(ServerEvent::AdminChannelChanged {
            publisher_id: data.publisher_id,
            old_channel_id: old_key.to_string(),
            new_channel_id: new_key.to_string(),
        });
        Ok(())
    }

    // ── Pipeline glue ───────────────────────────────────────────────────

    /// Attach the recording track and transcription session for a fresh
    /// producer. Pipeline failures are logged — they never fail the
    /// signaling action that triggered them.
    async fn start_producer_pipelines(
        &self,
        key: &ChannelKey,
        producer_id: &str,
        sfu_producer_id: &str,
    ) {
        let room = match self.server.db.room_by_slug(key.room_slug()) {
            Ok(Some(room)) => room,
            Ok(None) => return,
            Err(e) => {
                warn!("room lookup failed: {e}");
                return;
            }
        };

        let context = ProducerContext {
            producer_id: producer_id.to_string(),
            sfu_producer_id: sfu_producer_id.to_string(),
            room_id: room.id,
            channel_name: key.channel_name().to_string(),
            display_name: self.producer_display_name(key, producer_id).await,
            language: self.producer_language(key, producer_id).await,
        };

        let writer = self
            .server
            .recording
            .on_producer_added(&self.server.router, &context)
            .await;

        if let Err(e) = self
            .server
            .transcription
            .start_for_producer(&self.server.router, context, writer)
            .await
        {
            warn!(producer = producer_id, "transcription did not start: {e}");
        }
    }

    async fn stop_producer_pipelines(&self, key: &ChannelKey, producer_id: &str) {
        self.server.transcription.stop_for_producer(producer_id).await;
        match self.server.db.room_by_slug(key.room_slug()) {
            Ok(Some(room)) => {
                self.server
                    .recording
                    .on_producer_departed(&room.id, producer_id)
                    .await;
            }
            Ok(None) => {}
            Err(e) => warn!("room lookup failed: {e}"),
        }
    }

    async fn producer_display_name(&self, key: &ChannelKey, producer_id: &str) -> String {
        if let Some(channel) = self.server.registry.get(key) {
            let state = channel.lock().await;
            if let Some(entry) = state.producers().get(producer_id) {
                return entry.display_name.clone();
            }
        }
        self.shared.display_name()
    }

    async fn producer_language(&self, key: &ChannelKey, producer_id: &str) -> String {
        if let Some(channel) = self.server.registry.get(key) {
            let state = channel.lock().await;
            if let Some(entry) = state.producers().get(producer_id) {
                return entry.source_language.clone();
            }
        }
        self.shared.source_language()
    }

    fn transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: self.server.config.listen_ip.clone(),
            announced_ip: self.server.config.announced_ip.clone(),
            enable_udp: true,
            enable_tcp: true,
        }
    }
}

fn parse_channel_id(channel_id: Option<&str>) -> CoreResult<ChannelKey> {
    let raw = channel_id.ok_or_else(|| CoreError::protocol("missing channelId"))?;
    ChannelKey::parse(raw)
        .ok_or_else(|| CoreError::protocol(format!("invalid channel id '{raw}'")))
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{test_support, Db};
    use crate::embedder::Embedder;
    use crate::forker::ConverterSpec;
    use crate::ports::PortArena;
    use crate::recording::RecordingManager;
    use crate::registry::ChannelRegistry;
    use crate::sfu::LoopbackSfu;
    use crate::stats::StatsAggregator;
    use crate::stt::StubTranscriber;
    use crate::transcription::TranscriptionManager;
    use crate::transcripts::TranscriptStore;
    use dashmap::DashMap;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_server(db: Db) -> Arc<CoreServer> {
        let store = TranscriptStore::new(db.clone());
        let embedder = Embedder::disabled(db.clone());
        let recording = RecordingManager::new(
            db.clone(),
            std::env::temp_dir().join(format!("rec-{}", Uuid::new_v4())),
            Arc::new(PortArena::new(56000, 56050)),
            Box::new(|_| ConverterSpec::custom("sh", vec!["-c".into(), "sleep 30".into()])),
        );
        let transcription = TranscriptionManager::new(
            false,
            std::path::PathBuf::from("/nowhere"),
            "base".into(),
            Arc::new(StubTranscriber::with_script(vec![], 1)),
            store.clone(),
            embedder.clone(),
            Arc::new(PortArena::new(56100, 56150)),
            ConverterSpec::custom("sh", vec!["-c".into(), "sleep 30".into()]),
        );
        Arc::new(CoreServer {
            config: Config::default(),
            db,
            router: Arc::new(LoopbackSfu::new()),
            registry: ChannelRegistry::new(),
            clients: DashMap::new(),
            transcripts: store,
            embedder,
            recording,
            transcription,
            stats: StatsAggregator::new(),
        })
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn opus_caps() -> serde_json::Value {
        json!({ "codecs": [{ "mimeType": "audio/opus" }] })
    }

    async fn join_listener(
        server: &Arc<CoreServer>,
        channel: &str,
        name: &str,
    ) -> (ClientSession, UnboundedReceiver<ServerEvent>) {
        let (session, mut rx) = ClientSession::connect(server.clone());
        session
            .handle_action(ClientAction::CreateListenerTransport(
                CreateListenerTransport {
                    channel_id: channel.into(),
                    display_name: Some(name.into()),
                },
            ))
            .await
            .unwrap();
        session
            .handle_action(ClientAction::ConnectListenerTransport(ConnectTransport {
                dtls_parameters: json!({}),
            }))
            .await
            .unwrap();
        session
            .handle_action(ClientAction::ConsumeAudio(ConsumeAudio {
                rtp_capabilities: opus_caps(),
            }))
            .await
            .unwrap();
        drain(&mut rx);
        (session, rx)
    }

    async fn join_publisher(
        server: &Arc<CoreServer>,
        channel: &str,
        name: &str,
    ) -> (ClientSession, UnboundedReceiver<ServerEvent>, String) {
        let (session, mut rx) = ClientSession::connect(server.clone());
        session
            .handle_action(ClientAction::CreatePublisherTransport(
                CreatePublisherTransport {
                    channel_id: channel.into(),
                    display_name: Some(name.into()),
                    source_language: None,
                },
            ))
            .await
            .unwrap();
        session
            .handle_action(ClientAction::ConnectPublisherTransport(ConnectTransport {
                dtls_parameters: json!({}),
            }))
            .await
            .unwrap();
        session
            .handle_action(ClientAction::ProduceAudio(ProduceAudio {
                rtp_parameters: json!({ "codecs": [{ "payloadType": 100 }] }),
            }))
            .await
            .unwrap();

        let producer_id = drain(&mut rx)
            .into_iter()
            .find_map(|event| match event {
                ServerEvent::Produced { id } => Some(id),
                _ => None,
            })
            .expect("produced frame");
        (session, rx, producer_id)
    }

    #[tokio::test]
    async fn listener_before_publisher_gets_followup_consumer() {
        let (db, ..) = test_support::seeded();
        let server = test_server(db);

        // Listener first: nothing to consume yet.
        let (listener, mut listener_rx) = ClientSession::connect(server.clone());
        listener
            .handle_action(ClientAction::CreateListenerTransport(
                CreateListenerTransport {
                    channel_id: "demo:main".into(),
                    display_name: Some("Ada".into()),
                },
            ))
            .await
            .unwrap();
        listener
            .handle_action(ClientAction::ConnectListenerTransport(ConnectTransport {
                dtls_parameters: json!({}),
            }))
            .await
            .unwrap();
        listener
            .handle_action(ClientAction::ConsumeAudio(ConsumeAudio {
                rtp_capabilities: opus_caps(),
            }))
            .await
            .unwrap();

        let events = drain(&mut listener_rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::WaitingForPublisher)));

        // Publisher arrives: the listener receives exactly one follow-up
        // consumer-created frame referencing the new producer.
        let (_publisher, mut publisher_rx, producer_id) =
            join_publisher(&server, "demo:main", "Host").await;

        let consumer_frames: Vec<_> = drain(&mut listener_rx)
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::ConsumerCreated(data) => Some(data),
                _ => None,
            })
            .collect();
        assert_eq!(consumer_frames.len(), 1);
        // Single-object form, not an array, and it names the producer.
        assert!(consumer_frames[0].is_object());
        assert_eq!(consumer_frames[0]["producerId"], producer_id.as_str());

        // The publisher sees its listener count.
        let counts: Vec<_> = drain(&mut publisher_rx)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::ListenerCount { count: 1, .. }))
            .collect();
        assert!(!counts.is_empty());
    }

    #[tokio::test]
    async fn consume_batch_lists_live_producers() {
        let (db, ..) = test_support::seeded();
        let server = test_server(db);

        let (_publisher, _prx, producer_id) = join_publisher(&server, "demo:main", "Host").await;

        let (listener, mut rx) = ClientSession::connect(server.clone());
        listener
            .handle_action(ClientAction::CreateListenerTransport(
                CreateListenerTransport {
                    channel_id: "demo:main".into(),
                    display_name: None,
                },
            ))
            .await
            .unwrap();
        listener
            .handle_action(ClientAction::ConnectListenerTransport(ConnectTransport {
                dtls_parameters: json!({}),
            }))
            .await
            .unwrap();
        listener
            .handle_action(ClientAction::ConsumeAudio(ConsumeAudio {
                rtp_capabilities: opus_caps(),
            }))
            .await
            .unwrap();

        let batch = drain(&mut rx)
            .into_iter()
            .find_map(|event| match event {
                ServerEvent::ConsumerCreated(data) => Some(data),
                _ => None,
            })
            .expect("batch frame");
        assert!(batch.is_array());
        assert_eq!(batch.as_array().unwrap().len(), 1);
        assert_eq!(batch[0]["producerId"], producer_id.as_str());
    }

    #[tokio::test]
    async fn mismatched_caps_yield_empty_batch_not_error() {
        let (db, ..) = test_support::seeded();
        let server = test_server(db);
        let (_publisher, _prx, _pid) = join_publisher(&server, "demo:main", "Host").await;

        let (listener, mut rx) = ClientSession::connect(server.clone());
        listener
            .handle_action(ClientAction::CreateListenerTransport(
                CreateListenerTransport {
                    channel_id: "demo:main".into(),
                    display_name: None,
                },
            ))
            .await
            .unwrap();
        listener
            .handle_action(ClientAction::ConnectListenerTransport(ConnectTransport {
                dtls_parameters: json!({}),
            }))
            .await
            .unwrap();
        listener
            .handle_action(ClientAction::ConsumeAudio(ConsumeAudio {
                rtp_capabilities: json!({ "codecs": [{ "mimeType": "video/VP8" }] }),
            }))
            .await
            .unwrap();

        let events = drain(&mut rx);
        let batch = events
            .iter()
            .find_map(|event| match event {
                ServerEvent::ConsumerCreated(data) => Some(data),
                _ => None,
            })
            .expect("batch frame");
        assert_eq!(batch.as_array().unwrap().len(), 0);
        assert!(!events.iter().any(|e| matches!(e, ServerEvent::Error { .. })));
    }

    #[tokio::test]
    async fn publisher_disconnect_cascades_to_listeners() {
        let (db, ..) = test_support::seeded();
        let server = test_server(db);

        let (publisher, _prx, producer_id) = join_publisher(&server, "demo:main", "Host").await;
        let (_listener, mut listener_rx) = join_listener(&server, "demo:main", "Ada").await;

        publisher.disconnect().await;

        let events = drain(&mut listener_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::ProducerStopped { producer_id: id } if *id == producer_id
        )));

        // No consumer for that producer remains anywhere.
        for key in server.registry.snapshot_channel_keys() {
            let channel = server.registry.get(&key).unwrap();
            let state = channel.lock().await;
            assert!(state
                .consumers()
                .values()
                .all(|c| c.source_producer_id != producer_id));
        }
    }

    #[tokio::test]
    async fn stop_broadcasting_by_non_publisher_is_a_noop_success() {
        let (db, ..) = test_support::seeded();
        let server = test_server(db);
        let (session, mut rx) = ClientSession::connect(server.clone());

        session
            .handle_action(ClientAction::StopBroadcasting(ChannelRef {
                channel_id: Some("demo:main".into()),
            }))
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::BroadcastingStopped { .. })));
        assert!(!events.iter().any(|e| matches!(e, ServerEvent::Error { .. })));
    }

    #[tokio::test]
    async fn leave_channel_by_non_listener_is_a_noop() {
        let (db, ..) = test_support::seeded();
        let server = test_server(db);
        let (session, mut rx) = ClientSession::connect(server.clone());
        session.handle_action(ClientAction::LeaveChannel).await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn produce_without_transport_is_a_protocol_error() {
        let (db, ..) = test_support::seeded();
        let server = test_server(db);
        let (session, _rx) = ClientSession::connect(server.clone());

        let err = session
            .handle_action(ClientAction::ProduceAudio(ProduceAudio {
                rtp_parameters: json!({}),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "protocol_error");
    }

    #[tokio::test]
    async fn roles_are_sticky_and_exclusive() {
        let (db, ..) = test_support::seeded();
        let server = test_server(db);
        let (session, _rx) = ClientSession::connect(server.clone());

        session
            .handle_action(ClientAction::CreateListenerTransport(
                CreateListenerTransport {
                    channel_id: "demo:main".into(),
                    display_name: None,
                },
            ))
            .await
            .unwrap();

        let err = session
            .handle_action(ClientAction::CreatePublisherTransport(
                CreatePublisherTransport {
                    channel_id: "demo:main".into(),
                    display_name: None,
                    source_language: None,
                },
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "protocol_error");
    }

    #[tokio::test]
    async fn admin_create_channel_is_idempotent() {
        let (db, ..) = test_support::seeded();
        let server = test_server(db);
        let (admin, _rx) = ClientSession::connect(server.clone());

        for _ in 0..2 {
            admin
                .handle_action(ClientAction::AdminCreateChannel(ChannelRef {
                    channel_id: Some("demo:lobby".into()),
                }))
                .await
                .unwrap();
        }
        assert_eq!(server.registry.len(), 1);
    }

    #[tokio::test]
    async fn admin_remove_subscriber_forces_listener_out() {
        let (db, ..) = test_support::seeded();
        let server = test_server(db);
        let (_publisher, _prx, _pid) = join_publisher(&server, "demo:main", "Host").await;
        let (_listener, mut listener_rx) = join_listener(&server, "demo:main", "Ada").await;

        // Find the consumer id through the admin listing.
        let (admin, mut admin_rx) = ClientSession::connect(server.clone());
        admin
            .handle_action(ClientAction::AdminGetChannelsSubscribers)
            .await
            .unwrap();
        let consumer_id = drain(&mut admin_rx)
            .into_iter()
            .find_map(|event| match event {
                ServerEvent::ChannelsSubscribers(map) => {
                    map.get("demo:main")?.first().map(|s| s.id.clone())
                }
                _ => None,
            })
            .expect("one subscriber listed");

        admin
            .handle_action(ClientAction::AdminRemoveSubscriber(AdminRemoveSubscriber {
                channel_id: "demo:main".into(),
                consumer_id: consumer_id.clone(),
            }))
            .await
            .unwrap();

        assert!(drain(&mut listener_rx)
            .iter()
            .any(|e| matches!(e, ServerEvent::ForcedDisconnect { .. })));
        assert!(drain(&mut admin_rx).iter().any(|e| matches!(
            e,
            ServerEvent::SubscriberRemoved { consumer_id: id, .. } if *id == consumer_id
        )));
    }

    #[tokio::test]
    async fn publisher_move_keeps_producer_id_stable() {
        let (db, ..) = test_support::seeded();
        let server = test_server(db);

        let (_publisher, _prx, producer_id) = join_publisher(&server, "demo:a", "Host").await;
        let (_listener_a, mut rx_a) = join_listener(&server, "demo:a", "InA").await;
        let (_listener_b, mut rx_b) = join_listener(&server, "demo:b", "InB").await;

        let (admin, mut admin_rx) = ClientSession::connect(server.clone());
        admin
            .handle_action(ClientAction::AdminChangePublisherChannel(
                AdminChangePublisherChannel {
                    publisher_id: producer_id.clone(),
                    new_channel_id: "demo:b".into(),
                },
            ))
            .await
            .unwrap();

        // A-listener: producer-stopped for the old producer id.
        assert!(drain(&mut rx_a).iter().any(|e| matches!(
            e,
            ServerEvent::ProducerStopped { producer_id: id } if *id == producer_id
        )));

        // B-listener: consumer-created carrying the *same* producer id.
        let created: Vec<_> = drain(&mut rx_b)
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::ConsumerCreated(data) => Some(data),
                _ => None,
            })
            .collect();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0]["producerId"], producer_id.as_str());

        assert!(drain(&mut admin_rx).iter().any(|e| matches!(
            e,
            ServerEvent::AdminChannelChanged { publisher_id: id, .. } if *id == producer_id
        )));

        // The registry agrees: producer lives under demo:b only.
        let new_channel = server
            .registry
            .get(&ChannelKey::new("demo", "b"))
            .unwrap();
        assert!(new_channel
            .lock()
            .await
            .producers()
            .contains_key(&producer_id));
        assert!(server.registry.get(&ChannelKey::new("demo", "a")).is_none()
            || !server
                .registry
                .get(&ChannelKey::new("demo", "a"))
                .unwrap()
                .lock()
                .await
                .producers()
                .contains_key(&producer_id));
    }

    #[tokio::test]
    async fn admin_delete_channel_force_disconnects_listeners() {
        let (db, ..) = test_support::seeded();
        let server = test_server(db);
        let (_publisher, _prx, _pid) = join_publisher(&server, "demo:main", "Host").await;
        let (_listener, mut listener_rx) = join_listener(&server, "demo:main", "Ada").await;

        let (admin, _admin_rx) = ClientSession::connect(server.clone());
        admin
            .handle_action(ClientAction::AdminDeleteChannel(ChannelRef {
                channel_id: Some("demo:main".into()),
            }))
            .await
            .unwrap();

        assert!(drain(&mut listener_rx)
            .iter()
            .any(|e| matches!(e, ServerEvent::ForcedDisconnect { .. })));
        assert!(server.registry.is_empty());
    }
}
