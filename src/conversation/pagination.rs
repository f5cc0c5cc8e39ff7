// Backward pagination over the message archive

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::models::ConversationContext;
use super::history::{HistoryError, HistoryPage, HistoryProvider, PageRequest};
use super::EngineEvent;

/// Which slot a fetch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// The next page further back in time (the first one is the newest page).
    Older,
    /// The newest page again, fetched to close a gap after reconnecting.
    Latest,
}

pub struct PaginationLoader {
    provider: Arc<dyn HistoryProvider>,
    conversation_id: String,
    page_size: usize,
    next_page: u32,
    has_more: bool,
    older: Option<JoinHandle<()>>,
    latest: Option<JoinHandle<()>>,
    generation: u64,
}

impl PaginationLoader {
    pub fn new(provider: Arc<dyn HistoryProvider>, context: &ConversationContext) -> Self {
        PaginationLoader {
            provider,
            conversation_id: context.conversation_id.clone(),
            page_size: context.page_size.max(1),
            next_page: 0,
            has_more: true,
            older: None,
            latest: None,
            generation: 0,
        }
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading_older(&self) -> bool {
        self.older.is_some()
    }

    pub fn is_loading_latest(&self) -> bool {
        self.latest.is_some()
    }

    /// Index of the page the next older load will ask for.
    pub fn next_page(&self) -> u32 {
        self.next_page
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start fetching the next older page. Returns false when nothing was
    /// started: no more history, or a load is already running.
    pub fn load_older(&mut self, events: &mpsc::UnboundedSender<EngineEvent>) -> bool {
        if !self.has_more {
            debug!("No older history for {}", self.conversation_id);
            return false;
        }
        if self.older.is_some() {
            debug!("Older page already loading for {}", self.conversation_id);
            return false;
        }
        let page = self.next_page;
        self.older = Some(self.spawn_fetch(PageKind::Older, page, events));
        true
    }

    /// Start fetching the newest page without moving the cursor.
    pub fn load_latest(&mut self, events: &mpsc::UnboundedSender<EngineEvent>) -> bool {
        if self.latest.is_some() {
            debug!("Latest page already loading for {}", self.conversation_id);
            return false;
        }
        self.latest = Some(self.spawn_fetch(PageKind::Latest, 0, events));
        true
    }

    /// Settle a finished fetch. Returns false for completions that belong to
    /// a cancelled generation; their pages must be discarded.
    pub fn complete(
        &mut self,
        kind: PageKind,
        generation: u64,
        result: &Result<HistoryPage, HistoryError>,
    ) -> bool {
        if generation != self.generation {
            debug!("Discarding stale {:?} page (generation {})", kind, generation);
            return false;
        }
        match kind {
            PageKind::Older => self.older = None,
            PageKind::Latest => self.latest = None,
        }

        match (kind, result) {
            (PageKind::Older, Ok(page)) => {
                self.has_more = page.has_more(self.page_size);
                self.next_page += 1;
                info!(
                    "Loaded history page {} for {} ({} records, more: {})",
                    self.next_page - 1,
                    self.conversation_id,
                    page.records.len(),
                    self.has_more
                );
            }
            (PageKind::Latest, Ok(page)) => {
                info!(
                    "Refreshed latest history for {} ({} records)",
                    self.conversation_id,
                    page.records.len()
                );
            }
            (_, Err(e)) => {
                // Left as is so the next trigger retries the same page.
                warn!("Failed to load {:?} history for {}: {}", kind, self.conversation_id, e);
            }
        }
        true
    }

    /// Abort running fetches; anything they still deliver is ignored.
    pub fn cancel(&mut self) {
        for handle in [self.older.take(), self.latest.take()].into_iter().flatten() {
            handle.abort();
        }
        self.generation += 1;
    }

    fn spawn_fetch(
        &self,
        kind: PageKind,
        page: u32,
        events: &mpsc::UnboundedSender<EngineEvent>,
    ) -> JoinHandle<()> {
        let provider = self.provider.clone();
        let events = events.clone();
        let generation = self.generation;
        let request = PageRequest {
            conversation_id: self.conversation_id.clone(),
            limit: self.page_size,
            page,
        };
        debug!("Requesting {:?} history page {} for {}", kind, page, self.conversation_id);

        tokio::spawn(async move {
            let result = provider.fetch_page(request).await;
            if events
                .send(EngineEvent::PageFetched { kind, generation, result })
                .is_err()
            {
                debug!("Conversation closed before {:?} page arrived", kind);
            }
        })
    }
}
