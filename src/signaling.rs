// src/signaling.rs
//
// Wire protocol for the signaling WebSocket.
//
// Every frame in both directions is a JSON `{action, data}` envelope. The
// envelope is decoded exactly once at the session boundary into a tagged
// variant; handlers only ever see typed payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

// ─── Client → server ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", content = "data")]
pub enum ClientAction {
    #[serde(rename = "get-rtpCapabilities")]
    GetRtpCapabilities,

    #[serde(rename = "get-channels")]
    GetChannels,

    #[serde(rename = "create-publisher-transport")]
    CreatePublisherTransport(CreatePublisherTransport),

    #[serde(rename = "connect-publisher-transport")]
    ConnectPublisherTransport(ConnectTransport),

    #[serde(rename = "produce-audio")]
    ProduceAudio(ProduceAudio),

    #[serde(rename = "create-listener-transport")]
    CreateListenerTransport(CreateListenerTransport),

    #[serde(rename = "connect-listener-transport")]
    ConnectListenerTransport(ConnectTransport),

    #[serde(rename = "consume-audio")]
    ConsumeAudio(ConsumeAudio),

    #[serde(rename = "stop-broadcasting")]
    StopBroadcasting(ChannelRef),

    #[serde(rename = "leave-channel")]
    LeaveChannel,

    #[serde(rename = "admin-create-channel")]
    AdminCreateChannel(ChannelRef),

    #[serde(rename = "admin-delete-channel")]
    AdminDeleteChannel(ChannelRef),

    #[serde(rename = "admin-get-channels-subscribers")]
    AdminGetChannelsSubscribers,

    #[serde(rename = "admin-remove-subscriber")]
    AdminRemoveSubscriber(AdminRemoveSubscriber),

    #[serde(rename = "admin-change-publisher-channel")]
    AdminChangePublisherChannel(AdminChangePublisherChannel),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePublisherTransport {
    pub channel_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub source_language: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateListenerTransport {
    pub channel_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransport {
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceAudio {
    pub rtp_parameters: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeAudio {
    pub rtp_capabilities: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRef {
    #[serde(default)]
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminRemoveSubscriber {
    pub channel_id: String,
    pub consumer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminChangePublisherChannel {
    pub publisher_id: String,
    pub new_channel_id: String,
}

/// Decode one incoming text frame.
///
/// * Malformed JSON (or a known action with a bad payload) is a
///   [`CoreError::Protocol`] — the session answers with an `error` frame.
/// * A syntactically valid envelope with an *unrecognized* action decodes to
///   `Ok(None)`: logged and ignored, the connection stays healthy.
pub fn decode_frame(text: &str) -> CoreResult<Option<ClientAction>> {
    match serde_json::from_str::<ClientAction>(text) {
        Ok(action) => Ok(Some(action)),
        Err(decode_err) => {
            let value: Value = serde_json::from_str(text)
                .map_err(|e| CoreError::protocol(format!("malformed JSON frame: {e}")))?;
            let action = value.get("action").and_then(Value::as_str);
            match action {
                Some(name) if !KNOWN_ACTIONS.contains(&name) => {
                    tracing::debug!(action = name, "ignoring unknown action");
                    Ok(None)
                }
                Some(name) => Err(CoreError::protocol(format!(
                    "invalid payload for '{name}': {decode_err}"
                ))),
                None => Err(CoreError::protocol("frame is missing 'action'")),
            }
        }
    }
}

const KNOWN_ACTIONS: &[&str] = &[
    "get-rtpCapabilities",
    "get-channels",
    "create-publisher-transport",
    "connect-publisher-transport",
    "produce-audio",
    "create-listener-transport",
    "connect-listener-transport",
    "consume-audio",
    "stop-broadcasting",
    "leave-channel",
    "admin-create-channel",
    "admin-delete-channel",
    "admin-get-channels-subscribers",
    "admin-remove-subscriber",
    "admin-change-publisher-channel",
];

// ─── Server → client ────────────────────────────────────────────────────────

/// One consumer handed to a listener, either inside the `consume-audio`
/// batch array or as a follow-up single-object `consumer-created` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: String,
    pub producer_id: String,
    pub kind: String,
    pub rtp_parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberInfo {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "rtpCapabilities")]
    RtpCapabilities(Value),

    #[serde(rename = "channel-list")]
    ChannelList(Vec<String>),

    #[serde(rename = "publisher-transport-created")]
    PublisherTransportCreated(Value),

    #[serde(rename = "publisher-transport-connected")]
    PublisherTransportConnected,

    #[serde(rename = "produced")]
    Produced { id: String },

    #[serde(rename = "listener-transport-created")]
    ListenerTransportCreated(Value),

    #[serde(rename = "listener-transport-connected")]
    ListenerTransportConnected,

    /// Array-valued for the initial `consume-audio` batch; single-object for
    /// every subsequent fan-out push.
    #[serde(rename = "consumer-created")]
    ConsumerCreated(Value),

    #[serde(rename = "producer-stopped")]
    #[serde(rename_all = "camelCase")]
    ProducerStopped { producer_id: String },

    #[serde(rename = "waiting-for-publisher")]
    WaitingForPublisher,

    #[serde(rename = "broadcasting-stopped")]
    #[serde(rename_all = "camelCase")]
    BroadcastingStopped { channel_id: String },

    #[serde(rename = "forced-disconnect")]
    ForcedDisconnect { reason: String },

    #[serde(rename = "listener-count")]
    #[serde(rename_all = "camelCase")]
    ListenerCount { count: usize, channel_id: String },

    #[serde(rename = "channels-subscribers")]
    ChannelsSubscribers(std::collections::BTreeMap<String, Vec<SubscriberInfo>>),

    #[serde(rename = "channel-created")]
    #[serde(rename_all = "camelCase")]
    ChannelCreated { channel_id: String },

    #[serde(rename = "channel-deleted")]
    #[serde(rename_all = "camelCase")]
    ChannelDeleted { channel_id: String },

    #[serde(rename = "subscriber-removed")]
    #[serde(rename_all = "camelCase")]
    SubscriberRemoved {
        channel_id: String,
        consumer_id: String,
    },

    #[serde(rename = "admin-channel-changed")]
    #[serde(rename_all = "camelCase")]
    AdminChannelChanged {
        publisher_id: String,
        old_channel_id: String,
        new_channel_id: String,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerEvent {
    pub fn consumer_batch(consumers: Vec<ConsumerInfo>) -> Self {
        Self::ConsumerCreated(serde_json::to_value(consumers).expect("consumer batch serializes"))
    }

    pub fn consumer_single(consumer: ConsumerInfo) -> Self {
        Self::ConsumerCreated(serde_json::to_value(consumer).expect("consumer serializes"))
    }

    pub fn error_from(err: &CoreError) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("server event serializes")
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_dataless_action() {
        let action = decode_frame(r#"{"action":"get-rtpCapabilities"}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(action, ClientAction::GetRtpCapabilities));
    }

    #[test]
    fn decodes_camel_case_payload() {
        let frame = r#"{
            "action": "create-listener-transport",
            "data": { "channelId": "demo:main", "displayName": "Ada" }
        }"#;
        let action = decode_frame(frame).unwrap().unwrap();
        match action {
            ClientAction::CreateListenerTransport(data) => {
                assert_eq!(data.channel_id, "demo:main");
                assert_eq!(data.display_name.as_deref(), Some("Ada"));
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn unknown_action_is_ignored_not_an_error() {
        let result = decode_frame(r#"{"action":"warp-core-eject","data":{}}"#).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn malformed_json_is_a_protocol_error() {
        let err = decode_frame("{nope").unwrap_err();
        assert_eq!(err.code(), "protocol_error");
    }

    #[test]
    fn bad_payload_for_known_action_is_a_protocol_error() {
        let err = decode_frame(r#"{"action":"admin-remove-subscriber","data":{}}"#).unwrap_err();
        assert_eq!(err.code(), "protocol_error");
        assert!(err.to_string().contains("admin-remove-subscriber"));
    }

    #[test]
    fn missing_action_field_is_a_protocol_error() {
        let err = decode_frame(r#"{"data":{}}"#).unwrap_err();
        assert!(err.to_string().contains("action"));
    }

    #[test]
    fn server_event_envelope_shape() {
        let event = ServerEvent::ListenerCount {
            count: 3,
            channel_id: "demo:main".into(),
        };
        let value: Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["action"], "listener-count");
        assert_eq!(value["data"]["count"], 3);
        assert_eq!(value["data"]["channelId"], "demo:main");
    }

    #[test]
    fn dataless_event_omits_data() {
        let value: Value =
            serde_json::from_str(&ServerEvent::WaitingForPublisher.to_json()).unwrap();
        assert_eq!(value["action"], "waiting-for-publisher");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn consumer_created_is_array_for_batch_object_for_single() {
        let info = ConsumerInfo {
            id: "c1".into(),
            producer_id: "p1".into(),
            kind: "audio".into(),
            rtp_parameters: json!({}),
        };

        let batch: Value =
            serde_json::from_str(&ServerEvent::consumer_batch(vec![info.clone()]).to_json())
                .unwrap();
        assert!(batch["data"].is_array());
        assert_eq!(batch["data"][0]["producerId"], "p1");

        let single: Value =
            serde_json::from_str(&ServerEvent::consumer_single(info).to_json()).unwrap();
        assert!(single["data"].is_object());
        assert_eq!(single["data"]["id"], "c1");
    }
}
