// Message store for a single conversation
// Keeps archived and live messages apart and serves their merged view.

use chrono::Duration;
use log::{debug, warn};
use thiserror::Error;

use crate::models::{Message, MessageStatus, RetryHandle};
use super::reconcile;

#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Illegal status change for {id}: {from:?} -> {to:?}")]
    IllegalTransition {
        id: String,
        from: MessageStatus,
        to: MessageStatus,
    },
}

/// Ordered, deduplicated messages of one conversation.
///
/// `history` holds what the archive returned, oldest first. `live` holds what
/// was sent or received on the channel since the view opened. Readers only
/// ever see the merged view; every mutation bumps `revision`.
#[derive(Debug, Default)]
pub struct MessageStore {
    history: Vec<Message>,
    live: Vec<Message>,
    merged: Vec<Message>,
    revision: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.merged
    }

    pub fn len(&self) -> usize {
        self.merged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.merged.iter().rev().find(|m| m.id == id)
    }

    pub fn live(&self) -> &[Message] {
        &self.live
    }

    /// Add an older page in front of the known history.
    /// Returns how many messages became newly visible.
    pub fn prepend_history(&mut self, page: Vec<Message>) -> usize {
        let before = self.merged.len();
        self.history = reconcile::merge(&page, &self.history);
        self.rebuild();
        self.merged.len().saturating_sub(before)
    }

    /// Add the newest page after a reconnect. Settled live messages that the
    /// archive now also holds under a server id are dropped.
    /// Returns the messages from this page the reader has not seen in any form.
    pub fn extend_history(&mut self, page: Vec<Message>, echo_window: Duration) -> Vec<Message> {
        let known: std::collections::HashSet<String> =
            self.merged.iter().map(|m| m.id.clone()).collect();
        let before = self.merged.len();

        self.history = reconcile::merge(&self.history, &page);
        let live = std::mem::take(&mut self.live);
        let (kept, absorbed) = reconcile::prune_echoed(live, &self.history, echo_window);
        self.live = kept;
        self.rebuild();

        debug!(
            "Extended history with latest page: {} -> {} visible messages",
            before,
            self.merged.len()
        );
        page.into_iter()
            .filter(|m| !known.contains(&m.id) && !absorbed.contains(&m.id) && self.contains(&m.id))
            .collect()
    }

    /// Append a message produced on the live channel.
    /// Returns false if a message with the same id is already shown.
    pub fn push_live(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            warn!("Ignoring live message with duplicate id {}", message.id);
            return false;
        }
        let in_order = self
            .merged
            .last()
            .map_or(true, |last| last.timestamp <= message.timestamp);

        self.live.push(message.clone());
        if in_order {
            self.merged.push(message);
            self.revision += 1;
        } else {
            self.rebuild();
        }
        true
    }

    pub fn mark_sent(&mut self, id: &str) -> Result<(), StoreError> {
        self.transition(id, MessageStatus::Sent, None)
    }

    pub fn mark_failed(&mut self, id: &str, retry: RetryHandle) -> Result<(), StoreError> {
        self.transition(id, MessageStatus::Failed, Some(retry))
    }

    pub fn mark_pending(&mut self, id: &str) -> Result<(), StoreError> {
        self.transition(id, MessageStatus::Pending, None)
    }

    /// Replace a local id with the id the server assigned to the same message.
    pub fn rekey(&mut self, local_id: &str, server_id: &str) -> Result<(), StoreError> {
        if local_id == server_id {
            return Ok(());
        }
        let entry = self
            .live
            .iter_mut()
            .find(|m| m.id == local_id)
            .ok_or_else(|| StoreError::UnknownMessage(local_id.to_string()))?;
        entry.id = server_id.to_string();
        // A server id that is already archived collapses into the archived copy.
        self.rebuild();
        Ok(())
    }

    fn contains(&self, id: &str) -> bool {
        self.merged.iter().any(|m| m.id == id)
    }

    fn transition(
        &mut self,
        id: &str,
        to: MessageStatus,
        retry: Option<RetryHandle>,
    ) -> Result<(), StoreError> {
        let entry = self
            .live
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| StoreError::UnknownMessage(id.to_string()))?;

        if !entry.status.can_transition_to(to) {
            return Err(StoreError::IllegalTransition {
                id: id.to_string(),
                from: entry.status,
                to,
            });
        }
        entry.status = to;
        entry.retry = retry;
        let updated = entry.clone();

        // Archived copies shadow live ones; only touch the view if the live
        // copy is what is displayed.
        if !self.history.iter().any(|m| m.id == id) {
            if let Some(shown) = self.merged.iter_mut().rev().find(|m| m.id == id) {
                *shown = updated;
            }
        }
        self.revision += 1;
        Ok(())
    }

    fn rebuild(&mut self) {
        self.merged = reconcile::merge(&self.history, &self.live);
        self.revision += 1;
    }
}
