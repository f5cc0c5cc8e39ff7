use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::conversation::EngineEvent;

/// Which side of the conversation wrote a message, relative to the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sender {
    LocalUser,
    RemoteUser,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum MessageStatus {
    Pending,  // Shown locally, waiting for the channel echo
    Sent,     // Echo received for our own message
    Received, // Message from the other participant
    Failed,   // Transmission failed, can be retried
}

impl MessageStatus {
    /// Whether a message may move from `self` to `next`.
    ///
    /// `Received` is never reached by a transition; remote messages are
    /// created with it.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        matches!(
            (self, next),
            (MessageStatus::Pending, MessageStatus::Sent)
                | (MessageStatus::Pending, MessageStatus::Failed)
                | (MessageStatus::Failed, MessageStatus::Pending)
        )
    }

    /// Settled messages will not change status again.
    pub fn is_settled(self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Received)
    }
}

/// Zero-argument retry action attached to a failed message.
///
/// Calling [`RetryHandle::retry`] does not touch the message directly; it
/// queues a retry command for the conversation that owns the message.
#[derive(Clone)]
pub struct RetryHandle {
    message_id: String,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl RetryHandle {
    pub(crate) fn new(message_id: impl Into<String>, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        RetryHandle {
            message_id: message_id.into(),
            events,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Queue a retry. Returns false once the host has dropped the event queue.
    pub fn retry(&self) -> bool {
        self.events
            .send(EngineEvent::Retry {
                message_id: self.message_id.clone(),
            })
            .is_ok()
    }
}

impl fmt::Debug for RetryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryHandle")
            .field("message_id", &self.message_id)
            .finish()
    }
}

impl PartialEq for RetryHandle {
    fn eq(&self, other: &Self) -> bool {
        self.message_id == other.message_id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    pub retry: Option<RetryHandle>,
}

impl Message {
    /// A locally composed message that has not been acknowledged yet.
    pub fn pending(id: impl Into<String>, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Message {
            id: id.into(),
            sender: Sender::LocalUser,
            text: text.into(),
            timestamp,
            status: MessageStatus::Pending,
            retry: None,
        }
    }

    /// A message delivered by the other participant.
    pub fn received(id: impl Into<String>, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Message {
            id: id.into(),
            sender: Sender::RemoteUser,
            text: text.into(),
            timestamp,
            status: MessageStatus::Received,
            retry: None,
        }
    }

    /// A message loaded from the server archive. Our own archived messages
    /// count as sent.
    pub fn archived(
        id: impl Into<String>,
        sender: Sender,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let status = match sender {
            Sender::LocalUser => MessageStatus::Sent,
            Sender::RemoteUser => MessageStatus::Received,
        };
        Message {
            id: id.into(),
            sender,
            text: text.into(),
            timestamp,
            status,
            retry: None,
        }
    }

    pub fn is_local(&self) -> bool {
        self.sender == Sender::LocalUser
    }
}

/// Read-only description of the conversation a chat view is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub local_user_id: String,
    pub remote_user_id: String,
    pub conversation_id: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page_size() -> usize {
    20
}

impl ConversationContext {
    pub fn new(local_user_id: &str, remote_user_id: &str, conversation_id: &str, page_size: usize) -> Self {
        ConversationContext {
            local_user_id: local_user_id.to_string(),
            remote_user_id: remote_user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            page_size,
        }
    }

    /// Map an absolute participant id to a viewer-relative sender.
    pub fn sender_for(&self, participant_id: &str) -> Option<Sender> {
        if participant_id == self.local_user_id {
            Some(Sender::LocalUser)
        } else if participant_id == self.remote_user_id {
            Some(Sender::RemoteUser)
        } else {
            None
        }
    }
}

/// Parse a server timestamp. Accepts RFC 3339 and offset-less ISO-8601,
/// the latter taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}
