// In-process stand-ins for the chat socket and the history endpoint
// Both share one archive, so messages confirmed by the loopback channel show
// up in later history pages the same way a real server would archive them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use parley::conversation::{
    Channel, ChannelError, ChannelEvent, HistoryError, HistoryPage, HistoryProvider, HistoryRecord,
    InboundFrame, LifecycleEvent, OutboundPayload, PageOrder, PageRequest, TokenSource,
};
use parley::models::ConversationContext;

/// Archived records, oldest first.
pub type Archive = Arc<Mutex<Vec<HistoryRecord>>>;

const SEED_LINES: &[&str] = &[
    "Hi, I think I found your water bottle in the library",
    "Oh nice! Is it the blue one with stickers?",
    "Yes, it has a sticker of a cat on it",
    "That's mine! Where can I pick it up?",
    "I'm at the student center most afternoons",
    "Would tomorrow around 3 work?",
    "Sure, I'll be by the front desk",
    "Thanks so much, I thought it was gone for good",
];

const REPLIES: &[&str] = &[
    "Sounds good",
    "Thanks!",
    "Can you send a photo first?",
    "I'm running a few minutes late",
    "See you there",
    "Is it still available?",
];

#[derive(Debug, Clone, Copy)]
pub struct DemoSettings {
    pub latency: Duration,
    pub failure_rate: f64,
}

/// Build an archive of `size` alternating messages ending a minute ago.
pub fn seed_archive(context: &ConversationContext, size: usize) -> Archive {
    let now = Utc::now();
    let records = (0..size)
        .map(|n| {
            let sender = if n % 2 == 0 {
                &context.remote_user_id
            } else {
                &context.local_user_id
            };
            let minutes_ago = (size - n) as i64;
            HistoryRecord {
                id: format!("seed-{}", n),
                sender_id: sender.clone(),
                text: format!("{} (#{})", SEED_LINES[n % SEED_LINES.len()], n + 1),
                created_at: (now - chrono::Duration::minutes(minutes_ago))
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            }
        })
        .collect();
    info!("Seeded archive with {} messages", size);
    Arc::new(Mutex::new(records))
}

fn archive_record(archive: &Archive, record: HistoryRecord) {
    match archive.lock() {
        Ok(mut records) => records.push(record),
        Err(_) => warn!("Archive lock poisoned, record {} not archived", record.id),
    }
}

/// Loopback chat socket. Confirms sends after a delay, fails some of them,
/// and has the other participant answer now and then.
pub struct LoopbackChannel {
    context: ConversationContext,
    token: Arc<dyn TokenSource>,
    archive: Archive,
    settings: DemoSettings,
    events: mpsc::UnboundedSender<ChannelEvent>,
    online: Arc<AtomicBool>,
}

impl LoopbackChannel {
    pub fn new(
        context: ConversationContext,
        token: Arc<dyn TokenSource>,
        archive: Archive,
        settings: DemoSettings,
    ) -> (Self, UnboundedReceiverStream<ChannelEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let channel = LoopbackChannel {
            context,
            token,
            archive,
            settings,
            events,
            online: Arc::new(AtomicBool::new(false)),
        };
        (channel, UnboundedReceiverStream::new(events_rx))
    }

    /// Perform the initial handshake.
    pub fn open(&self) {
        self.connect();
    }

    /// Simulate the socket dropping underneath the conversation.
    pub fn drop_connection(&self) {
        if self.online.swap(false, Ordering::SeqCst) {
            warn!("Loopback connection dropped");
            let _ = self.events.send(LifecycleEvent::Close.into());
        }
    }

    fn connect(&self) {
        match self.token.bearer_token() {
            Some(token) if !token.is_empty() => {
                self.online.store(true, Ordering::SeqCst);
                info!("Loopback connected for {}", self.context.local_user_id);
                let _ = self.events.send(LifecycleEvent::Open.into());
            }
            _ => {
                let _ = self
                    .events
                    .send(LifecycleEvent::Error("no bearer token available".to_string()).into());
            }
        }
    }

    fn emit_frame(events: &mpsc::UnboundedSender<ChannelEvent>, frame: &InboundFrame) {
        // Round-trip through JSON so the demo exercises the same decoding a
        // socket would.
        let raw = match serde_json::to_string(frame) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Could not encode loopback frame: {}", e);
                return;
            }
        };
        if let Some(event) = ChannelEvent::from_text(&raw) {
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl Channel for LoopbackChannel {
    async fn transmit(&self, payload: OutboundPayload) -> Result<(), ChannelError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        debug!("Loopback transmit {}", payload.to_json()?);

        let (client_id, text) = match &payload {
            OutboundPayload::SendMessage {
                client_message_id,
                message,
                ..
            } => (client_message_id.clone(), message.clone()),
        };
        let context = self.context.clone();
        let archive = self.archive.clone();
        let events = self.events.clone();
        let online = self.online.clone();
        let settings = self.settings;
        let fail = rand::thread_rng().gen_bool(settings.failure_rate.clamp(0.0, 1.0));
        let reply = rand::thread_rng().gen_bool(0.4);

        tokio::spawn(async move {
            tokio::time::sleep(settings.latency).await;
            if !online.load(Ordering::SeqCst) {
                return;
            }
            if fail {
                Self::emit_frame(
                    &events,
                    &InboundFrame::Error {
                        error: Some("message rejected by server".to_string()),
                    },
                );
                return;
            }

            let server_id = format!("srv-{}", Uuid::new_v4());
            let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            archive_record(
                &archive,
                HistoryRecord {
                    id: server_id.clone(),
                    sender_id: context.local_user_id.clone(),
                    text: text.clone(),
                    created_at: timestamp.clone(),
                },
            );
            Self::emit_frame(
                &events,
                &InboundFrame::Success {
                    sender_id: context.local_user_id.clone(),
                    message: text,
                    timestamp,
                    client_message_id: Some(client_id),
                    message_id: Some(server_id),
                },
            );

            if !reply {
                return;
            }
            tokio::time::sleep(settings.latency * 3).await;
            if !online.load(Ordering::SeqCst) {
                return;
            }
            let line = REPLIES.choose(&mut rand::thread_rng()).copied().unwrap_or("Ok");
            let reply_id = format!("srv-{}", Uuid::new_v4());
            let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            archive_record(
                &archive,
                HistoryRecord {
                    id: reply_id.clone(),
                    sender_id: context.remote_user_id.clone(),
                    text: line.to_string(),
                    created_at: timestamp.clone(),
                },
            );
            Self::emit_frame(
                &events,
                &InboundFrame::Success {
                    sender_id: context.remote_user_id.clone(),
                    message: line.to_string(),
                    timestamp,
                    client_message_id: None,
                    message_id: Some(reply_id),
                },
            );
        });
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), ChannelError> {
        if self.online.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.events.send(LifecycleEvent::ReconnectAttempt.into());
        tokio::time::sleep(self.settings.latency).await;
        self.connect();
        Ok(())
    }
}

/// History endpoint backed by the shared archive. Serves newest-first pages.
pub struct ArchiveHistory {
    archive: Archive,
    latency: Duration,
}

impl ArchiveHistory {
    pub fn new(archive: Archive, latency: Duration) -> Self {
        ArchiveHistory { archive, latency }
    }
}

#[async_trait]
impl HistoryProvider for ArchiveHistory {
    async fn fetch_page(&self, request: PageRequest) -> Result<HistoryPage, HistoryError> {
        tokio::time::sleep(self.latency).await;

        let records = self
            .archive
            .lock()
            .map_err(|_| HistoryError::Unavailable("archive lock poisoned".to_string()))?;
        let skip = request.page as usize * request.limit;
        let page: Vec<HistoryRecord> = records
            .iter()
            .rev()
            .skip(skip)
            .take(request.limit)
            .cloned()
            .collect();
        let has_more = records.len() > skip + page.len();
        debug!(
            "Serving page {} of {} with {} records",
            request.page,
            request.conversation_id,
            page.len()
        );

        Ok(HistoryPage {
            records: page,
            order: PageOrder::NewestFirst,
            has_more: Some(has_more),
        })
    }
}
