// Common test utilities for integration tests
// In-memory stand-ins for the chat socket and the history service, plus
// helpers to drive a conversation's event queue from a test.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use log::{debug, LevelFilter};
use tokio::sync::mpsc;
use tokio::time::timeout;

use parley::config::EngineSettings;
use parley::conversation::{
    Channel, ChannelError, ChannelEvent, HistoryError, HistoryPage, HistoryProvider, HistoryRecord,
    InboundFrame, LifecycleEvent, OutboundPayload, PageOrder, PageRequest,
};
use parley::models::ConversationContext;
use parley::{Conversation, EngineEvent};

pub const LOCAL: &str = "alice";
pub const REMOTE: &str = "bob";
pub const CONVERSATION: &str = "post-42";

static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub fn context() -> ConversationContext {
    ConversationContext::new(LOCAL, REMOTE, CONVERSATION, 20)
}

/// Fixed point in time the scripted archives are laid out around.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

pub fn record(id: &str, sender: &str, text: &str, at: DateTime<Utc>) -> HistoryRecord {
    HistoryRecord {
        id: id.to_string(),
        sender_id: sender.to_string(),
        text: text.to_string(),
        created_at: at.to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

/// `count` alternating records, one minute apart, starting `first_minute`
/// minutes after `base_time()`. Oldest first.
pub fn records(prefix: &str, first_minute: i64, count: usize) -> Vec<HistoryRecord> {
    (0..count)
        .map(|n| {
            let sender = if n % 2 == 0 { REMOTE } else { LOCAL };
            let at = base_time() + chrono::Duration::minutes(first_minute + n as i64);
            record(&format!("{}-{}", prefix, n), sender, &format!("{} message {}", prefix, n), at)
        })
        .collect()
}

pub fn newest_first(mut records: Vec<HistoryRecord>, has_more: bool) -> HistoryPage {
    records.reverse();
    HistoryPage {
        records,
        order: PageOrder::NewestFirst,
        has_more: Some(has_more),
    }
}

pub fn success(sender: &str, text: &str) -> InboundFrame {
    InboundFrame::Success {
        sender_id: sender.to_string(),
        message: text.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        client_message_id: None,
        message_id: None,
    }
}

pub fn ack(text: &str, client_id: Option<&str>, server_id: Option<&str>) -> InboundFrame {
    InboundFrame::Success {
        sender_id: LOCAL.to_string(),
        message: text.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        client_message_id: client_id.map(str::to_string),
        message_id: server_id.map(str::to_string),
    }
}

/// Channel that records what was transmitted instead of sending it.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<OutboundPayload>>,
    failing: AtomicBool,
    reconnects: AtomicUsize,
}

impl RecordingChannel {
    pub fn sent(&self) -> Vec<OutboundPayload> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Make every following transmit fail at the transport level.
    pub fn fail_transmits(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    async fn transmit(&self, payload: OutboundPayload) -> Result<(), ChannelError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChannelError::Transport("socket write failed".to_string()));
        }
        debug!("Recorded transmit {}", payload.to_json()?);
        self.sent.lock().expect("sent lock").push(payload);
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), ChannelError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// History service answering from a fixed set of pages.
#[derive(Default)]
pub struct ScriptedHistory {
    pages: Mutex<HashMap<u32, HistoryPage>>,
    failures: AtomicUsize,
    requests: Mutex<Vec<PageRequest>>,
}

impl ScriptedHistory {
    pub fn with_pages(pages: Vec<HistoryPage>) -> Self {
        let history = ScriptedHistory::default();
        for (index, page) in pages.into_iter().enumerate() {
            history.set_page(index as u32, page);
        }
        history
    }

    pub fn set_page(&self, index: u32, page: HistoryPage) {
        self.pages.lock().expect("pages lock").insert(index, page);
    }

    /// Fail the next `count` fetches.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl HistoryProvider for ScriptedHistory {
    async fn fetch_page(&self, request: PageRequest) -> Result<HistoryPage, HistoryError> {
        self.requests.lock().expect("requests lock").push(request.clone());

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(HistoryError::Unavailable("service returned 503".to_string()));
        }

        let page = self.pages.lock().expect("pages lock").get(&request.page).cloned();
        Ok(page.unwrap_or(HistoryPage {
            records: Vec::new(),
            order: PageOrder::NewestFirst,
            has_more: Some(false),
        }))
    }
}

/// A conversation wired to recording collaborators.
pub struct Harness {
    pub conversation: Conversation,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
    pub channel: Arc<RecordingChannel>,
    pub history: Arc<ScriptedHistory>,
}

impl Harness {
    pub fn new(history: ScriptedHistory) -> Self {
        Self::with_settings(history, &EngineSettings::default())
    }

    pub fn with_settings(history: ScriptedHistory, settings: &EngineSettings) -> Self {
        setup_logging();
        let channel = Arc::new(RecordingChannel::default());
        let history = Arc::new(history);
        let (conversation, events) = Conversation::new(
            context(),
            channel.clone(),
            history.clone(),
            settings,
        );
        Harness {
            conversation,
            events,
            channel,
            history,
        }
    }

    /// A conversation whose channel already reported `Open`.
    pub fn connected(history: ScriptedHistory) -> Self {
        let mut harness = Self::new(history);
        harness.lifecycle(LifecycleEvent::Open);
        harness
    }

    pub fn lifecycle(&mut self, event: LifecycleEvent) {
        self.conversation.handle_channel_event(ChannelEvent::Lifecycle(event));
    }

    pub fn frame(&mut self, frame: InboundFrame) {
        self.conversation.handle_channel_event(ChannelEvent::Frame(frame));
    }

    /// Feed queued engine events back in until the queue stays quiet.
    /// Returns how many events were handled.
    pub async fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(Some(event)) = timeout(Duration::from_millis(100), self.events.recv()).await {
            self.conversation.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Wait until `condition` holds, pumping events meanwhile.
    pub async fn pump_until<F>(&mut self, mut condition: F) -> Result<()>
    where
        F: FnMut(&Harness) -> bool,
    {
        for _ in 0..40 {
            if condition(&*self) {
                return Ok(());
            }
            self.pump().await;
        }
        Err(anyhow!("Condition not reached"))
    }

    pub fn ids(&self) -> Vec<String> {
        self.conversation.messages().iter().map(|m| m.id.clone()).collect()
    }
}
