// Live channel contract
// Wire frames exchanged with the chat socket and the trait a transport implements

use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::ConversationContext;
use super::connection::LifecycleEvent;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel is closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication rejected: {0}")]
    Unauthorized(String),

    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Frame sent to the socket for every outgoing chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum OutboundPayload {
    #[serde(rename = "sendMessage")]
    SendMessage {
        #[serde(rename = "senderID")]
        sender_id: String,
        #[serde(rename = "receiverID")]
        receiver_id: String,
        #[serde(rename = "conversationID")]
        conversation_id: String,
        message: String,
        #[serde(rename = "clientMessageID")]
        client_message_id: String,
    },
}

impl OutboundPayload {
    pub fn send_message(context: &ConversationContext, client_message_id: &str, text: &str) -> Self {
        OutboundPayload::SendMessage {
            sender_id: context.local_user_id.clone(),
            receiver_id: context.remote_user_id.clone(),
            conversation_id: context.conversation_id.clone(),
            message: text.to_string(),
            client_message_id: client_message_id.to_string(),
        }
    }

    pub fn client_message_id(&self) -> &str {
        match self {
            OutboundPayload::SendMessage { client_message_id, .. } => client_message_id,
        }
    }

    pub fn to_json(&self) -> Result<String, ChannelError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frame received from the socket, tagged by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum InboundFrame {
    Success {
        #[serde(rename = "senderID")]
        sender_id: String,
        message: String,
        timestamp: String,
        /// Present when the server echoes the id we generated.
        #[serde(rename = "clientMessageID", default, skip_serializing_if = "Option::is_none")]
        client_message_id: Option<String>,
        /// Present when the server reports the id it archived the message under.
        #[serde(rename = "messageID", default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl InboundFrame {
    pub fn parse(raw: &str) -> Result<Self, ChannelError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Everything a channel can report to the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Lifecycle(LifecycleEvent),
    Frame(InboundFrame),
}

impl ChannelEvent {
    /// Decode a raw text frame. Undecodable frames are logged and dropped so
    /// a bad payload never interrupts the event loop.
    pub fn from_text(raw: &str) -> Option<Self> {
        match InboundFrame::parse(raw) {
            Ok(frame) => Some(ChannelEvent::Frame(frame)),
            Err(e) => {
                warn!("Dropping undecodable frame: {}", e);
                None
            }
        }
    }
}

impl From<LifecycleEvent> for ChannelEvent {
    fn from(event: LifecycleEvent) -> Self {
        ChannelEvent::Lifecycle(event)
    }
}

impl From<InboundFrame> for ChannelEvent {
    fn from(frame: InboundFrame) -> Self {
        ChannelEvent::Frame(frame)
    }
}

/// Outgoing half of the live channel, supplied by the host.
///
/// Incoming traffic is delivered separately as a stream of [`ChannelEvent`]s.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Put one payload on the wire. An error means it never left.
    async fn transmit(&self, payload: OutboundPayload) -> Result<(), ChannelError>;

    /// Ask the transport to re-establish the connection. Progress is
    /// reported through lifecycle events, not through the return value.
    async fn reconnect(&self) -> Result<(), ChannelError>;
}

/// Bearer credential accessor handed to channel implementations.
pub trait TokenSource: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_payload_wire_shape() {
        let context = ConversationContext::new("u-local", "u-remote", "post-7", 20);
        let payload = OutboundPayload::send_message(&context, "c-1", "Is the lamp still free?");
        let value: serde_json::Value = serde_json::from_str(&payload.to_json().unwrap()).unwrap();

        assert_eq!(value["action"], "sendMessage");
        assert_eq!(value["senderID"], "u-local");
        assert_eq!(value["receiverID"], "u-remote");
        assert_eq!(value["conversationID"], "post-7");
        assert_eq!(value["message"], "Is the lamp still free?");
        assert_eq!(value["clientMessageID"], "c-1");
    }

    #[test]
    fn test_parse_success_frame_without_ids() {
        let raw = r#"{"status":"success","senderID":"u-remote","message":"yes","timestamp":"2024-03-01T12:00:00Z"}"#;
        match InboundFrame::parse(raw).unwrap() {
            InboundFrame::Success { sender_id, message, client_message_id, message_id, .. } => {
                assert_eq!(sender_id, "u-remote");
                assert_eq!(message, "yes");
                assert!(client_message_id.is_none());
                assert!(message_id.is_none());
            }
            other => panic!("Expected success frame, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_frame() {
        let frame = InboundFrame::parse(r#"{"status":"error","error":"throttled"}"#).unwrap();
        assert_eq!(frame, InboundFrame::Error { error: Some("throttled".to_string()) });

        let bare = InboundFrame::parse(r#"{"status":"error"}"#).unwrap();
        assert_eq!(bare, InboundFrame::Error { error: None });
    }

    #[test]
    fn test_unknown_status_is_dropped() {
        assert!(ChannelEvent::from_text(r#"{"status":"typing","senderID":"x"}"#).is_none());
        assert!(ChannelEvent::from_text("not json").is_none());
    }
}
