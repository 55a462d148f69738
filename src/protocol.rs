//! Message envelope and typed payloads for agent-to-agent task coordination.
//!
//! Envelopes travel as UTF-8 JSON. The payload is an open JSON object so that
//! fields added by newer peers survive a decode/encode cycle untouched; the typed
//! payload structs below are views over it.

use crate::error::{HyphaError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Message type tag. Unrecognised tags are carried verbatim in [`MessageType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    TaskRequest,
    TaskResponse,
    TaskComplete,
    TaskReject,
    PaymentNotification,
    Ping,
    Pong,
    Error,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::TaskRequest => "task_request",
            MessageType::TaskResponse => "task_response",
            MessageType::TaskComplete => "task_complete",
            MessageType::TaskReject => "task_reject",
            MessageType::PaymentNotification => "payment_notification",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Error => "error",
            MessageType::Other(tag) => tag,
        }
    }
}

impl From<&str> for MessageType {
    fn from(tag: &str) -> Self {
        match tag {
            "task_request" => MessageType::TaskRequest,
            "task_response" => MessageType::TaskResponse,
            "task_complete" => MessageType::TaskComplete,
            "task_reject" => MessageType::TaskReject,
            "payment_notification" => MessageType::PaymentNotification,
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            "error" => MessageType::Error,
            other => MessageType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(MessageType::from(tag.as_str()))
    }
}

/// The outer envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(rename = "sender", alias = "sender_id")]
    pub sender_id: String,
    #[serde(rename = "recipient", alias = "recipient_id")]
    pub recipient_id: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub timestamp: i64,
    /// Lowercase hex Ed25519 signature over [`canonical_bytes`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Message {
    /// Build an unsigned envelope stamped with the current Unix time.
    pub fn create(
        message_type: MessageType,
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            message_type,
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            payload,
            timestamp: chrono::Utc::now().timestamp(),
            signature: None,
        }
    }

    /// Convenience accessor for the correlation id carried by task messages.
    pub fn escrow_id(&self) -> Option<&str> {
        self.payload.get("escrow_id").and_then(Value::as_str)
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        deserialize(bytes)
    }
}

pub fn serialize(message: &Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode an envelope. Any failure, including invalid UTF-8, is `MalformedEnvelope`.
pub fn deserialize(bytes: &[u8]) -> Result<Message> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| HyphaError::MalformedEnvelope(format!("envelope is not UTF-8: {}", e)))?;
    serde_json::from_str(text).map_err(|e| HyphaError::MalformedEnvelope(e.to_string()))
}

/// The exact bytes that get signed: the envelope serialized without its signature.
pub fn canonical_bytes(message: &Message) -> Result<Vec<u8>> {
    #[derive(Serialize)]
    struct Unsigned<'a> {
        #[serde(rename = "type")]
        message_type: &'a MessageType,
        sender: &'a str,
        recipient: &'a str,
        payload: &'a Map<String, Value>,
        timestamp: i64,
    }

    let unsigned = Unsigned {
        message_type: &message.message_type,
        sender: &message.sender_id,
        recipient: &message.recipient_id,
        payload: &message.payload,
        timestamp: message.timestamp,
    };
    Ok(serde_json::to_vec(&unsigned)?)
}

/// A typed view over a message payload.
pub trait Payload: Serialize + DeserializeOwned {
    const MESSAGE_TYPE: MessageType;

    fn to_message(&self, sender_id: &str, recipient_id: &str) -> Result<Message> {
        let payload = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            other => {
                return Err(HyphaError::Serialization(format!(
                    "payload must be a JSON object, got {}",
                    other
                )))
            }
        };
        Ok(Message::create(Self::MESSAGE_TYPE, sender_id, recipient_id, payload))
    }

    fn from_message(message: &Message) -> Result<Self> {
        if message.message_type != Self::MESSAGE_TYPE {
            return Err(HyphaError::MalformedEnvelope(format!(
                "expected {} payload, got {}",
                Self::MESSAGE_TYPE,
                message.message_type
            )));
        }
        serde_json::from_value(Value::Object(message.payload.clone())).map_err(|e| {
            HyphaError::MalformedEnvelope(format!("{} payload: {}", Self::MESSAGE_TYPE, e))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub escrow_id: String,
    pub task_description: String,
    pub amount: f64,
    /// Unix timestamp (seconds).
    pub deadline: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<Map<String, Value>>,
    /// `host:port` where the requester accepts the TASK_RESPONSE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl Payload for TaskRequest {
    const MESSAGE_TYPE: MessageType = MessageType::TaskRequest;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub escrow_id: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Payload for TaskResponse {
    const MESSAGE_TYPE: MessageType = MessageType::TaskResponse;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskComplete {
    pub escrow_id: String,
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_proof: Option<String>,
}

impl Payload for TaskComplete {
    const MESSAGE_TYPE: MessageType = MessageType::TaskComplete;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentNotification {
    pub escrow_id: String,
    pub amount: f64,
    pub tx_hash: String,
    pub from_address: String,
    pub to_address: String,
}

impl Payload for PaymentNotification {
    const MESSAGE_TYPE: MessageType = MessageType::PaymentNotification;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error_code: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
}

impl Payload for ErrorPayload {
    const MESSAGE_TYPE: MessageType = MessageType::Error;
}
