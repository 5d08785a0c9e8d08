// Request/response bodies for the publish and streaming-pull operations.
use bytes::Bytes;
use courier_common::Message;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Error, Result, base64_body};

pub const PUBLISH_PATH: &str = "/courier.v1.Publisher/Publish";
pub const STREAMING_PULL_PATH: &str = "/courier.v1.Subscriber/StreamingPull";

pub fn encode_body<T: Serialize>(body: &T) -> Result<Bytes> {
    serde_json::to_vec(body)
        .map(Bytes::from)
        .map_err(Error::Serialize)
}

pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(Error::Deserialize)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(with = "base64_body")]
    pub data: Bytes,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordering_key: Option<String>,
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        Self {
            data: message.data.clone(),
            attributes: message.attributes.clone(),
            ordering_key: message.ordering_key().map(str::to_string),
        }
    }
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        Message {
            data: wire.data,
            attributes: wire.attributes,
            ordering_key: wire.ordering_key,
        }
    }
}

/// One publish call: an ordered batch for a single topic.
///
/// ```
/// use courier_common::Message;
/// use courier_wire::{PublishRequest, WireMessage, decode_body, encode_body};
///
/// let request = PublishRequest {
///     topic: "orders".to_string(),
///     messages: vec![WireMessage::from(&Message::new("x"))],
/// };
/// let bytes = encode_body(&request).expect("encode");
/// assert_eq!(&bytes[..], br#"{"topic":"orders","messages":[{"data":"eA=="}]}"#);
/// let decoded: PublishRequest = decode_body(&bytes).expect("decode");
/// assert_eq!(decoded, request);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub topic: String,
    pub messages: Vec<WireMessage>,
}

/// Per-message result, positionally aligned with `PublishRequest::messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PublishOutcome {
    Published { message_id: String },
    Rejected { error: courier_common::Error },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub results: Vec<PublishOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlineModification {
    pub ack_id: String,
    pub deadline_ms: u64,
}

/// Client-to-server frame on a streaming pull.
///
/// The first frame names the subscription and the stream ack deadline; later
/// frames only carry acks, nacks and deadline modifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingPullRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_ack_deadline_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ack_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nack_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deadline_modifications: Vec<DeadlineModification>,
}

impl StreamingPullRequest {
    pub fn is_empty(&self) -> bool {
        self.ack_ids.is_empty() && self.nack_ids.is_empty() && self.deadline_modifications.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedWireMessage {
    pub ack_id: String,
    pub message_id: String,
    pub message: WireMessage,
    pub delivery_attempt: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingPullResponse {
    pub received_messages: Vec<ReceivedWireMessage>,
}
