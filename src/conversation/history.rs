// Message history collaborator
// Paged archive contract and validation of archived records at ingestion

use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{parse_timestamp, ConversationContext, Message};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("History service unavailable: {0}")]
    Unavailable(String),

    #[error("Could not decode history page: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Reasons an archived record is refused at the ingestion boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("Record {id} has sender {sender_id} who is not part of this conversation")]
    UnknownSender { id: String, sender_id: String },

    #[error("Record {0} has no text")]
    EmptyText(String),

    #[error("Record {id} has an unreadable timestamp: {raw}")]
    BadTimestamp { id: String, raw: String },
}

/// One archived message as the history endpoint returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    #[serde(rename = "senderID")]
    pub sender_id: String,
    #[serde(rename = "message")]
    pub text: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PageOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HistoryPage {
    pub records: Vec<HistoryRecord>,
    #[serde(default)]
    pub order: PageOrder,
    /// Whether older pages exist. When the service does not say, a full page
    /// is taken to mean there may be more.
    #[serde(default, rename = "hasMore")]
    pub has_more: Option<bool>,
}

impl HistoryPage {
    pub fn has_more(&self, page_size: usize) -> bool {
        self.has_more.unwrap_or(self.records.len() >= page_size)
    }
}

/// Page 0 is the newest page; larger indexes go further back in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub conversation_id: String,
    pub limit: usize,
    pub page: u32,
}

#[async_trait]
pub trait HistoryProvider: Send + Sync {
    async fn fetch_page(&self, request: PageRequest) -> Result<HistoryPage, HistoryError>;
}

pub fn record_to_message(record: HistoryRecord, context: &ConversationContext) -> Result<Message, IngestError> {
    let sender = context
        .sender_for(&record.sender_id)
        .ok_or_else(|| IngestError::UnknownSender {
            id: record.id.clone(),
            sender_id: record.sender_id.clone(),
        })?;
    if record.text.trim().is_empty() {
        return Err(IngestError::EmptyText(record.id));
    }
    let timestamp = parse_timestamp(&record.created_at).ok_or_else(|| IngestError::BadTimestamp {
        id: record.id.clone(),
        raw: record.created_at.clone(),
    })?;
    Ok(Message::archived(record.id, sender, record.text, timestamp))
}

/// Turn a fetched page into oldest-first messages, skipping invalid records.
pub fn ingest(page: HistoryPage, context: &ConversationContext) -> Vec<Message> {
    let mut records = page.records;
    if page.order == PageOrder::NewestFirst {
        records.reverse();
    }

    let mut messages: Vec<Message> = records
        .into_iter()
        .filter_map(|record| match record_to_message(record, context) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Skipping archived record: {}", e);
                None
            }
        })
        .collect();

    if !super::reconcile::is_chronological(&messages) {
        warn!("History page for {} was not in the announced order", context.conversation_id);
        messages.sort_by_key(|m| m.timestamp);
    }
    messages
}
