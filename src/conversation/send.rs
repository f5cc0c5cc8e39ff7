// Optimistic sending and channel echo handling
// Outgoing messages are shown before the channel confirms them.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::{parse_timestamp, ConversationContext, Message, MessageStatus, RetryHandle, Sender};
use super::connection::ConnectionState;
use super::store::MessageStore;
use super::transport::{Channel, InboundFrame, OutboundPayload};
use super::EngineEvent;

/// What an inbound frame did to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// One of our sends was confirmed.
    Acknowledged(String),
    /// The other participant wrote a new message.
    Received(String),
    /// One of our sends was reported as failed.
    Failed(String),
    /// Nothing matched; the frame was dropped.
    Ignored,
}

pub struct SendPipeline {
    context: ConversationContext,
    channel: Arc<dyn Channel>,
    events: mpsc::UnboundedSender<EngineEvent>,
    /// Local ids awaiting an echo, in the order they were put on the wire.
    outstanding: VecDeque<String>,
}

impl SendPipeline {
    pub fn new(
        context: ConversationContext,
        channel: Arc<dyn Channel>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        SendPipeline {
            context,
            channel,
            events,
            outstanding: VecDeque::new(),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Show `text` immediately as a pending message and put it on the wire.
    ///
    /// Blank text and sends while the channel is not connected are refused
    /// and leave the store untouched. Returns the local id of the new message.
    pub fn send(&mut self, store: &mut MessageStore, state: ConnectionState, text: &str) -> Option<String> {
        let text = text.trim();
        if text.is_empty() {
            debug!("Ignoring blank message");
            return None;
        }
        if state != ConnectionState::Connected {
            debug!("Refusing to send while {:?}", state);
            return None;
        }

        let id = Uuid::new_v4().to_string();
        info!("Sending message {} in {}", id, self.context.conversation_id);
        store.push_live(Message::pending(id.clone(), text, Utc::now()));
        self.outstanding.push_back(id.clone());
        self.transmit(&id, text);
        Some(id)
    }

    /// Send a failed message again under the same id.
    pub fn retry(&mut self, store: &mut MessageStore, state: ConnectionState, id: &str) -> bool {
        if state != ConnectionState::Connected {
            debug!("Refusing to retry {} while {:?}", id, state);
            return false;
        }
        let text = match store.get(id) {
            Some(message) if message.is_local() && message.status == MessageStatus::Failed => message.text.clone(),
            Some(message) => {
                debug!("Not retrying {} in status {:?}", id, message.status);
                return false;
            }
            None => {
                warn!("Retry requested for unknown message {}", id);
                return false;
            }
        };
        if let Err(e) = store.mark_pending(id) {
            warn!("Could not retry {}: {}", id, e);
            return false;
        }
        info!("Retrying message {}", id);
        self.outstanding.push_back(id.to_string());
        self.transmit(id, &text);
        true
    }

    /// Apply a frame from the channel.
    pub fn receive(&mut self, store: &mut MessageStore, frame: InboundFrame) -> Inbound {
        match frame {
            InboundFrame::Success {
                sender_id,
                message,
                timestamp,
                client_message_id,
                message_id,
            } => match self.context.sender_for(&sender_id) {
                Some(Sender::LocalUser) => self.acknowledge(store, client_message_id, message_id),
                Some(Sender::RemoteUser) => {
                    if message.trim().is_empty() {
                        warn!("Dropping empty message from {}", sender_id);
                        return Inbound::Ignored;
                    }
                    let timestamp = parse_timestamp(&timestamp).unwrap_or_else(|| {
                        debug!("Unreadable timestamp {:?}, using local time", timestamp);
                        Utc::now()
                    });
                    let id = message_id.unwrap_or_else(|| Uuid::new_v4().to_string());
                    if !store.push_live(Message::received(id.clone(), message, timestamp)) {
                        return Inbound::Ignored;
                    }
                    Inbound::Received(id)
                }
                None => {
                    warn!("Dropping message from {} who is not in this conversation", sender_id);
                    Inbound::Ignored
                }
            },
            InboundFrame::Error { error } => {
                let reason = error.unwrap_or_else(|| "unspecified".to_string());
                match self.outstanding.pop_front() {
                    Some(id) => {
                        error!("Channel rejected message {}: {}", id, reason);
                        self.fail(store, &id);
                        Inbound::Failed(id)
                    }
                    None => {
                        debug!("Channel error with nothing outstanding: {}", reason);
                        Inbound::Ignored
                    }
                }
            }
        }
    }

    /// The transport could not put a message on the wire.
    pub fn transmit_failed(&mut self, store: &mut MessageStore, id: &str, reason: &str) -> bool {
        let position = match self.outstanding.iter().position(|pending| pending == id) {
            Some(position) => position,
            None => {
                debug!("Transmit failure for {} which is no longer outstanding", id);
                return false;
            }
        };
        self.outstanding.remove(position);
        error!("Failed to transmit message {}: {}", id, reason);
        self.fail(store, id);
        true
    }

    /// The channel dropped; nothing outstanding can be acknowledged anymore.
    pub fn fail_outstanding(&mut self, store: &mut MessageStore) -> usize {
        let lost: Vec<String> = self.outstanding.drain(..).collect();
        if !lost.is_empty() {
            warn!("Connection lost with {} unacknowledged messages", lost.len());
        }
        for id in &lost {
            self.fail(store, id);
        }
        lost.len()
    }

    fn acknowledge(
        &mut self,
        store: &mut MessageStore,
        client_message_id: Option<String>,
        server_message_id: Option<String>,
    ) -> Inbound {
        // An echoed client id is exact; otherwise acks are assumed to arrive
        // in the order the sends went out.
        let position = match client_message_id.as_deref() {
            Some(cid) => self.outstanding.iter().position(|pending| pending == cid),
            None if self.outstanding.is_empty() => None,
            None => Some(0),
        };

        let id = match position.and_then(|p| self.outstanding.remove(p)) {
            Some(id) => id,
            None => match client_message_id {
                Some(cid) if Self::is_failed_local(store, &cid) => {
                    // Confirmed after a disconnect already gave up on it.
                    info!("Late echo for {}, no retry needed", cid);
                    if let Err(e) = store.mark_pending(&cid) {
                        warn!("Could not revive {}: {}", cid, e);
                        return Inbound::Ignored;
                    }
                    cid
                }
                _ => {
                    debug!("Echo of our own message matched nothing outstanding");
                    return Inbound::Ignored;
                }
            },
        };

        if let Err(e) = store.mark_sent(&id) {
            warn!("Could not confirm {}: {}", id, e);
            return Inbound::Ignored;
        }
        debug!("Message {} confirmed", id);

        match server_message_id {
            Some(server_id) if server_id != id => {
                if let Err(e) = store.rekey(&id, &server_id) {
                    warn!("Could not adopt server id {} for {}: {}", server_id, id, e);
                    return Inbound::Acknowledged(id);
                }
                Inbound::Acknowledged(server_id)
            }
            _ => Inbound::Acknowledged(id),
        }
    }

    fn is_failed_local(store: &MessageStore, id: &str) -> bool {
        store
            .get(id)
            .map_or(false, |m| m.is_local() && m.status == MessageStatus::Failed)
    }

    fn fail(&self, store: &mut MessageStore, id: &str) {
        let retry = RetryHandle::new(id, self.events.clone());
        if let Err(e) = store.mark_failed(id, retry) {
            warn!("Could not mark {} as failed: {}", id, e);
        }
    }

    fn transmit(&self, id: &str, text: &str) {
        let payload = OutboundPayload::send_message(&self.context, id, text);
        let channel = self.channel.clone();
        let events = self.events.clone();
        let message_id = id.to_string();

        // Fire and forget; the outcome comes back as an echo or a failure event.
        tokio::spawn(async move {
            if let Err(e) = channel.transmit(payload).await {
                let _ = events.send(EngineEvent::TransmitFailed {
                    message_id,
                    error: e.to_string(),
                });
            }
        });
    }
}
