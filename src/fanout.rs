// src/fanout.rs
//
// Fan-out engine: reactions to producer arrivals and departures.
//
// All functions here run with the channel-scoped lock already held by the
// caller, which is what makes producer-arrival processing atomic with
// respect to other producer/consume events on the same channel. Per-listener
// failures are logged and skipped — one broken listener never aborts the
// loop.

use tracing::{debug, warn};
use uuid::Uuid;

use crate::registry::{ChannelKey, ChannelState, ConsumerEntry, ProducerEntry};
use crate::signaling::{ConsumerInfo, ServerEvent};
use crate::state::{CoreServer, Role};
use crate::stats::ChannelStats;

/// On producer arrival: synthesize a consumer for every already-subscribed
/// listener of the channel and push each a single-object `consumer-created`
/// frame.
pub async fn fan_out_new_producer(
    server: &CoreServer,
    key: &ChannelKey,
    state: &mut ChannelState,
    internal_producer_id: &str,
) {
    let Some(entry) = state.producers().get(internal_producer_id) else {
        return;
    };
    let sfu_producer_id = entry.producer.id().to_string();

    // Eligible listeners: same channel, caps cached, transport connected.
    let listeners: Vec<_> = server
        .client_snapshot()
        .into_iter()
        .filter(|handle| {
            handle.shared.role() == Role::Listener
                && handle.shared.channel_key().as_ref() == Some(key)
                && handle.shared.transport_connected()
        })
        .filter_map(|handle| {
            let caps = handle.shared.receiver_caps()?;
            let transport = handle.shared.transport()?;
            Some((handle, caps, transport))
        })
        .collect();

    for (handle, caps, transport) in listeners {
        if !server.router.can_consume(&sfu_producer_id, &caps) {
            continue;
        }
        match transport.consume(&sfu_producer_id, caps, false).await {
            Ok(consumer) => {
                let consumer_id = Uuid::new_v4().to_string();
                let info = ConsumerInfo {
                    id: consumer_id.clone(),
                    producer_id: internal_producer_id.to_string(),
                    kind: consumer.kind().as_str().to_string(),
                    rtp_parameters: consumer.rtp_parameters(),
                };
                let entry = ConsumerEntry {
                    transport: transport.clone(),
                    consumer,
                    client_id: handle.shared.client_id,
                    display_name: handle.shared.display_name(),
                    source_producer_id: internal_producer_id.to_string(),
                };
                if let Err(e) = state.insert_consumer(consumer_id, entry) {
                    warn!("fan-out consumer insert failed: {e}");
                    continue;
                }
                server.send_to(handle.shared.client_id, ServerEvent::consumer_single(info));
            }
            Err(e) => {
                warn!(
                    listener = %handle.shared.client_id,
                    "fan-out consume failed, skipping listener: {e}"
                );
            }
        }
    }
}

/// On producer departure: remove the entry, close every consumer derived
/// from it and push `producer-stopped` to each affected listener. Returns
/// the removed producer entry for the caller to close.
pub async fn close_producer(
    server: &CoreServer,
    state: &mut ChannelState,
    internal_producer_id: &str,
) -> Option<ProducerEntry> {
    let (producer, orphans) = state.remove_producer(internal_producer_id);

    for (consumer_id, orphan) in orphans {
        orphan.consumer.close().await;
        debug!(consumer = consumer_id, "closed orphaned consumer");
        server.send_to(
            orphan.client_id,
            ServerEvent::ProducerStopped {
                producer_id: internal_producer_id.to_string(),
            },
        );
    }

    producer
}

/// Current live channel list as a `channel-list` event.
pub fn channel_list_event(server: &CoreServer) -> ServerEvent {
    ServerEvent::ChannelList(
        server
            .registry
            .snapshot_channel_keys()
            .iter()
            .map(ToString::to_string)
            .collect(),
    )
}

/// Broadcast the channel list to every connected signaling client. Called
/// after every channel-set change.
pub fn broadcast_channel_list(server: &CoreServer) {
    server.broadcast(channel_list_event(server));
}

/// Push `{count, channelId}` to every publisher of the channel, where count
/// is the number of unique subscribing clients.
pub fn notify_publishers_listener_count(
    server: &CoreServer,
    key: &ChannelKey,
    state: &ChannelState,
) {
    let count = state.listener_count();
    let mut notified: Vec<Uuid> = Vec::new();
    for producer in state.producers().values() {
        if notified.contains(&producer.owning_client_id) {
            continue;
        }
        notified.push(producer.owning_client_id);
        server.send_to(
            producer.owning_client_id,
            ServerEvent::ListenerCount {
                count,
                channel_id: key.to_string(),
            },
        );
    }
}

/// Feed the channel's current counts into the admin stats aggregator.
pub fn push_channel_stats(server: &CoreServer, key: &ChannelKey, state: &ChannelState) {
    server.stats.update_local(
        key.room_slug(),
        key.channel_name(),
        ChannelStats {
            publishers: state.producers().len(),
            subscribers: state.listener_count(),
        },
    );
}

/// The channel disappeared entirely.
pub fn drop_channel_stats(server: &CoreServer, key: &ChannelKey) {
    server.stats.remove_local(key.room_slug(), key.channel_name());
}
