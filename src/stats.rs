// src/stats.rs
//
// Admin stats aggregation: the merged view of in-process channels and
// channels pushed by remote SFUs, delivered to per-tenant admin WebSockets.
//
//   local channel change ──┐
//                          ├──> diff ──> channel-update frames to the
//   remote stats-update ───┘            admins owning that room
//
// On admin connect, one full `channel-stats` snapshot; afterwards only
// per-channel increments. When a remote SFU disconnects, every channel it
// ever reported is re-pushed as zeros.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelStats {
    pub publishers: usize,
    pub subscribers: usize,
}

impl ChannelStats {
    pub const ZERO: ChannelStats = ChannelStats {
        publishers: 0,
        subscribers: 0,
    };
}

/// `(roomSlug, channelName)` — the aggregator always keeps the halves
/// separate and sends the short name in `channelName`.
type StatKey = (String, String);

pub struct AdminConn {
    pub tenant_id: String,
    pub room_slugs: HashSet<String>,
    pub tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
pub struct StatsAggregator {
    local: RwLock<HashMap<StatKey, ChannelStats>>,
    remote: RwLock<HashMap<String, HashMap<StatKey, ChannelStats>>>,
    admins: DashMap<Uuid, AdminConn>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Admin connections ───────────────────────────────────────────────

    /// Register an admin socket and send it the full snapshot for the
    /// rooms its tenant owns.
    pub fn register_admin(&self, conn_id: Uuid, conn: AdminConn) {
        let snapshot = self.merged_for_rooms(&conn.room_slugs);
        let _ = conn.tx.send(channel_stats_frame(&snapshot));
        self.admins.insert(conn_id, conn);
    }

    pub fn unregister_admin(&self, conn_id: Uuid) {
        self.admins.remove(&conn_id);
    }

    pub fn admin_count(&self) -> usize {
        self.admins.len()
    }

    // ── Local (in-process) channels ─────────────────────────────────────

    /// Record the current counts for an in-process channel; pushes an
    /// update only when something actually changed.
    pub fn update_local(&self, room_slug: &str, channel_name: &str, stats: ChannelStats) {
        let key = (room_slug.to_string(), channel_name.to_string());
        let changed = {
            let mut local = self.local.write().unwrap();
            match local.get(&key) {
                Some(previous) if *previous == stats => false,
                _ => {
                    local.insert(key, stats);
                    true
                }
            }
        };
        if changed {
            self.push_update(room_slug, channel_name, stats);
        }
    }

    /// An in-process channel went away entirely.
    pub fn remove_local(&self, room_slug: &str, channel_name: &str) {
        let key = (room_slug.to_string(), channel_name.to_string());
        let existed = self.local.write().unwrap().remove(&key).is_some();
        if existed {
            self.push_update(room_slug, channel_name, ChannelStats::ZERO);
        }
    }

    // ── Remote SFU pushes ───────────────────────────────────────────────

    /// Apply a `stats-update` snapshot from one remote SFU. The snapshot
    /// replaces the SFU's previous one; every changed channel (including
    /// those that disappeared, as zeros) is pushed.
    pub fn apply_remote(&self, sfu_id: &str, channels: HashMap<String, ChannelStats>) {
        let incoming: HashMap<StatKey, ChannelStats> = channels
            .into_iter()
            .filter_map(|(full_key, stats)| {
                let (room, channel) = full_key.split_once(':')?;
                Some(((room.to_string(), channel.to_string()), stats))
            })
            .collect();

        let mut updates: Vec<(StatKey, ChannelStats)> = Vec::new();
        {
            let mut remote = self.remote.write().unwrap();
            let previous = remote.entry(sfu_id.to_string()).or_default();

            for (key, stats) in &incoming {
                if previous.get(key) != Some(stats) {
                    updates.push((key.clone(), *stats));
                }
            }
            for key in previous.keys() {
                if !incoming.contains_key(key) {
                    updates.push((key.clone(), ChannelStats::ZERO));
                }
            }
            *previous = incoming;
        }

        for ((room, channel), stats) in updates {
            self.push_update(&room, &channel, stats);
        }
    }

    /// A remote SFU disconnected: everything it reported is now zero.
    pub fn sfu_disconnected(&self, sfu_id: &str) {
        let previous = self.remote.write().unwrap().remove(sfu_id);
        if let Some(previous) = previous {
            for (room, channel) in previous.into_keys() {
                self.push_update(&room, &channel, ChannelStats::ZERO);
            }
        }
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    /// Merged `roomSlug → channelName → stats` across local and every
    /// remote SFU, restricted to `room_slugs`.
    pub fn merged_for_rooms(
        &self,
        room_slugs: &HashSet<String>,
    ) -> BTreeMap<String, BTreeMap<String, ChannelStats>> {
        let mut merged: BTreeMap<String, BTreeMap<String, ChannelStats>> = BTreeMap::new();

        let mut absorb = |key: &StatKey, stats: &ChannelStats| {
            if room_slugs.contains(&key.0) {
                merged
                    .entry(key.0.clone())
                    .or_default()
                    .insert(key.1.clone(), *stats);
            }
        };

        for (key, stats) in self.local.read().unwrap().iter() {
            absorb(key, stats);
        }
        for sfu_channels in self.remote.read().unwrap().values() {
            for (key, stats) in sfu_channels {
                absorb(key, stats);
            }
        }
        merged
    }

    fn push_update(&self, room_slug: &str, channel_name: &str, stats: ChannelStats) {
        debug!(
            room = room_slug,
            channel = channel_name,
            publishers = stats.publishers,
            subscribers = stats.subscribers,
            "channel stats update"
        );
        let frame = channel_update_frame(room_slug, channel_name, stats);
        for admin in self.admins.iter() {
            if admin.room_slugs.contains(room_slug) {
                let _ = admin.tx.send(frame.clone());
            }
        }
    }
}

// ─── Wire frames ────────────────────────────────────────────────────────────

fn channel_stats_frame(rooms: &BTreeMap<String, BTreeMap<String, ChannelStats>>) -> String {
    serde_json::json!({
        "action": "channel-stats",
        "data": { "rooms": rooms }
    })
    .to_string()
}

fn channel_update_frame(room_slug: &str, channel_name: &str, stats: ChannelStats) -> String {
    serde_json::json!({
        "action": "channel-update",
        "data": {
            "roomSlug": room_slug,
            "channelName": channel_name,
            "publishers": stats.publishers,
            "subscribers": stats.subscribers,
        }
    })
    .to_string()
}

/// The payload a remote SFU pushes on its stats socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum SfuStatsMessage {
    #[serde(rename = "stats-update")]
    StatsUpdate {
        channels: HashMap<String, ChannelStats>,
    },
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn admin(rooms: &[&str]) -> (Uuid, AdminConn, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = AdminConn {
            tenant_id: "t1".into(),
            room_slugs: rooms.iter().map(|s| s.to_string()).collect(),
            tx,
        };
        (Uuid::new_v4(), conn, rx)
    }

    fn stats(publishers: usize, subscribers: usize) -> ChannelStats {
        ChannelStats {
            publishers,
            subscribers,
        }
    }

    #[test]
    fn admin_gets_merged_snapshot_on_connect() {
        let agg = StatsAggregator::new();
        agg.update_local("demo", "main", stats(1, 2));
        agg.apply_remote(
            "sfu-1",
            HashMap::from([("demo:other".to_string(), stats(1, 3))]),
        );

        let (id, conn, mut rx) = admin(&["demo"]);
        agg.register_admin(id, conn);

        let frame: serde_json::Value =
            serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["action"], "channel-stats");
        assert_eq!(frame["data"]["rooms"]["demo"]["main"]["publishers"], 1);
        assert_eq!(frame["data"]["rooms"]["demo"]["main"]["subscribers"], 2);
        assert_eq!(frame["data"]["rooms"]["demo"]["other"]["publishers"], 1);
        assert_eq!(frame["data"]["rooms"]["demo"]["other"]["subscribers"], 3);
    }

    #[test]
    fn updates_are_diff_based_and_room_scoped() {
        let agg = StatsAggregator::new();
        let (id, conn, mut rx) = admin(&["demo"]);
        agg.register_admin(id, conn);
        let _ = rx.try_recv(); // initial snapshot

        agg.update_local("demo", "main", stats(1, 0));
        let frame: serde_json::Value =
            serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["action"], "channel-update");
        assert_eq!(frame["data"]["roomSlug"], "demo");
        assert_eq!(frame["data"]["channelName"], "main");
        assert_eq!(frame["data"]["publishers"], 1);

        // Unchanged counts push nothing.
        agg.update_local("demo", "main", stats(1, 0));
        assert!(rx.try_recv().is_err());

        // Other tenants' rooms push nothing here.
        agg.update_local("elsewhere", "main", stats(5, 5));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn remote_snapshot_replacement_zeroes_missing_channels() {
        let agg = StatsAggregator::new();
        let (id, conn, mut rx) = admin(&["demo"]);
        agg.register_admin(id, conn);
        let _ = rx.try_recv();

        agg.apply_remote(
            "sfu-1",
            HashMap::from([
                ("demo:a".to_string(), stats(1, 1)),
                ("demo:b".to_string(), stats(2, 2)),
            ]),
        );
        let mut seen = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            seen.push(serde_json::from_str::<serde_json::Value>(&frame).unwrap());
        }
        assert_eq!(seen.len(), 2);

        // Next push drops channel `b` — it must be zeroed.
        agg.apply_remote(
            "sfu-1",
            HashMap::from([("demo:a".to_string(), stats(1, 1))]),
        );
        let frame: serde_json::Value =
            serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["data"]["channelName"], "b");
        assert_eq!(frame["data"]["publishers"], 0);
        assert_eq!(frame["data"]["subscribers"], 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sfu_disconnect_zeroes_everything_it_reported() {
        let agg = StatsAggregator::new();
        let (id, conn, mut rx) = admin(&["demo"]);
        agg.register_admin(id, conn);
        let _ = rx.try_recv();

        agg.apply_remote(
            "sfu-1",
            HashMap::from([("demo:live".to_string(), stats(1, 9))]),
        );
        let _ = rx.try_recv();

        agg.sfu_disconnected("sfu-1");
        let frame: serde_json::Value =
            serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["data"]["channelName"], "live");
        assert_eq!(frame["data"]["publishers"], 0);

        // Idempotent.
        agg.sfu_disconnected("sfu-1");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn local_removal_pushes_zeros_once() {
        let agg = StatsAggregator::new();
        let (id, conn, mut rx) = admin(&["demo"]);
        agg.register_admin(id, conn);
        let _ = rx.try_recv();

        agg.update_local("demo", "main", stats(1, 1));
        let _ = rx.try_recv();

        agg.remove_local("demo", "main");
        let frame: serde_json::Value =
            serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["data"]["publishers"], 0);

        agg.remove_local("demo", "main");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sfu_stats_message_parses() {
        let msg: SfuStatsMessage = serde_json::from_str(
            r#"{"type":"stats-update","channels":{"demo:main":{"publishers":1,"subscribers":4}}}"#,
        )
        .unwrap();
        let SfuStatsMessage::StatsUpdate { channels } = msg;
        assert_eq!(channels["demo:main"].subscribers, 4);
    }
}
