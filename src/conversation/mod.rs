// Conversation engine
// Entry point for one chat view: owns the message store, the connection state
// and the viewport state, and is the only place any of them change.
//
// Work that has to wait on the network (history fetches, transmits, the
// channel listener) runs on spawned tasks. Those tasks never touch state;
// they post an `EngineEvent` to the queue returned by `Conversation::new`,
// and the host hands each event back to `handle_event` on its own loop.

use std::sync::Arc;
use std::time::Instant;

use futures_util::{Stream, StreamExt};
use log::{debug, error, info};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod connection;
pub mod history;
pub mod pagination;
pub mod reconcile;
pub mod send;
pub mod store;
pub mod transport;
pub mod viewport;

pub use connection::{ConnectionManager, ConnectionState, LifecycleEvent, Transition};
pub use history::{HistoryError, HistoryPage, HistoryProvider, HistoryRecord, PageOrder, PageRequest};
pub use pagination::{PageKind, PaginationLoader};
pub use send::{Inbound, SendPipeline};
pub use store::{MessageStore, StoreError};
pub use transport::{Channel, ChannelError, ChannelEvent, InboundFrame, OutboundPayload, TokenSource};
pub use viewport::{ScrollCommand, ViewportController, ViewportMetrics, ViewportSettings};

use crate::config::EngineSettings;
use crate::models::{ConversationContext, Message, Sender};

/// Completions and commands queued for the owning conversation.
#[derive(Debug)]
pub enum EngineEvent {
    Channel(ChannelEvent),
    PageFetched {
        kind: PageKind,
        generation: u64,
        result: Result<HistoryPage, HistoryError>,
    },
    TransmitFailed {
        message_id: String,
        error: String,
    },
    Retry {
        message_id: String,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConversationError {
    #[error("Reconnect is only possible while disconnected (currently {0:?})")]
    NotDisconnected(ConnectionState),

    #[error("Conversation has been closed")]
    Disposed,
}

pub struct Conversation {
    context: ConversationContext,
    store: MessageStore,
    connection: ConnectionManager,
    pipeline: SendPipeline,
    loader: PaginationLoader,
    viewport: ViewportController,
    channel: Arc<dyn Channel>,
    events: mpsc::UnboundedSender<EngineEvent>,
    listener: Option<JoinHandle<()>>,
    /// First message before an older page was prepended, until the host lays
    /// the new content out.
    anchor_message: Option<String>,
    echo_window: chrono::Duration,
    disposed: bool,
}

impl Conversation {
    pub fn new(
        context: ConversationContext,
        channel: Arc<dyn Channel>,
        history: Arc<dyn HistoryProvider>,
        settings: &EngineSettings,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();

        (Self {
            store: MessageStore::new(),
            connection: ConnectionManager::new(),
            pipeline: SendPipeline::new(context.clone(), channel.clone(), events.clone()),
            loader: PaginationLoader::new(history, &context),
            viewport: ViewportController::new(settings.viewport()),
            channel,
            events,
            listener: None,
            anchor_message: None,
            echo_window: settings.echo_window(),
            disposed: false,
            context,
        }, events_rx)
    }

    /// Load the newest history page. Call once after mounting the view.
    pub fn start(&mut self) -> bool {
        info!("Opening conversation {}", self.context.conversation_id);
        self.load_older()
    }

    /// Forward a stream of channel events into this conversation's queue.
    /// Replaces any previously attached stream.
    pub fn attach<S>(&mut self, stream: S)
    where
        S: Stream<Item = ChannelEvent> + Send + Unpin + 'static,
    {
        if let Some(previous) = self.listener.take() {
            previous.abort();
        }
        let events = self.events.clone();
        self.listener = Some(tokio::spawn(async move {
            let mut stream = stream;
            while let Some(event) = stream.next().await {
                if events.send(EngineEvent::Channel(event)).is_err() {
                    break;
                }
            }
            debug!("Channel event stream ended");
        }));
    }

    pub fn handle_event(&mut self, event: EngineEvent) {
        if self.disposed {
            debug!("Conversation closed, dropping {:?}", event);
            return;
        }
        match event {
            EngineEvent::Channel(event) => self.handle_channel_event(event),
            EngineEvent::PageFetched { kind, generation, result } => {
                self.apply_page(kind, generation, result)
            }
            EngineEvent::TransmitFailed { message_id, error } => {
                self.pipeline.transmit_failed(&mut self.store, &message_id, &error);
            }
            EngineEvent::Retry { message_id } => {
                self.retry(&message_id);
            }
        }
    }

    pub fn handle_channel_event(&mut self, event: ChannelEvent) {
        if self.disposed {
            return;
        }
        match event {
            ChannelEvent::Lifecycle(lifecycle) => self.apply_lifecycle(&lifecycle),
            ChannelEvent::Frame(frame) => {
                if let Inbound::Received(_) = self.pipeline.receive(&mut self.store, frame) {
                    self.viewport.on_new_message();
                }
            }
        }
    }

    /// Send `text` optimistically. Returns the id of the pending message, or
    /// `None` if nothing was sent (blank text, not connected, closed).
    pub fn send(&mut self, text: &str) -> Option<String> {
        if self.disposed {
            return None;
        }
        let id = self.pipeline.send(&mut self.store, self.connection.state(), text)?;
        self.viewport.on_scroll_to_bottom_requested();
        Some(id)
    }

    pub fn retry(&mut self, message_id: &str) -> bool {
        if self.disposed {
            return false;
        }
        self.pipeline.retry(&mut self.store, self.connection.state(), message_id)
    }

    /// Ask the channel to reconnect. Only allowed while disconnected; the
    /// outcome arrives later as lifecycle events.
    pub fn reconnect(&mut self) -> Result<(), ConversationError> {
        if self.disposed {
            return Err(ConversationError::Disposed);
        }
        if !self.connection.can_reconnect() {
            return Err(ConversationError::NotDisconnected(self.connection.state()));
        }
        info!("Manual reconnect requested for {}", self.context.conversation_id);
        let channel = self.channel.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.reconnect().await {
                error!("Reconnect request failed: {}", e);
            }
        });
        Ok(())
    }

    /// Request the next older page, subject to the loader's guards.
    pub fn load_older(&mut self) -> bool {
        if self.disposed {
            return false;
        }
        self.loader.load_older(&self.events)
    }

    pub fn on_scroll(&mut self, metrics: ViewportMetrics, now: Instant) {
        if self.disposed {
            return;
        }
        if self.viewport.on_scroll(metrics, now) && self.loader.has_more() {
            if self.connection.is_connected() {
                self.load_older();
            } else {
                debug!("Top reached while {:?}, loading after recovery", self.connection.state());
                self.viewport.defer_top_load();
            }
        }
    }

    /// Call after the host laid out new content and before it paints.
    /// While `anchor_message` is set, hosts that can measure it should report
    /// the height above that message through `prepended_height`.
    pub fn on_layout(&mut self, metrics: ViewportMetrics) -> ScrollCommand {
        self.anchor_message = None;
        self.viewport.on_layout(metrics)
    }

    /// Id of the message the reader's position is anchored to while an older
    /// page waits for layout.
    pub fn anchor_message(&self) -> Option<&str> {
        self.anchor_message.as_deref()
    }

    pub fn poll_viewport(&mut self, now: Instant) -> bool {
        self.viewport.poll(now)
    }

    pub fn next_viewport_deadline(&self) -> Option<Instant> {
        self.viewport.next_deadline()
    }

    pub fn scroll_to_bottom(&mut self) {
        self.viewport.on_scroll_to_bottom_requested();
    }

    /// Stop all background work. Late completions are discarded.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        info!("Closing conversation {}", self.context.conversation_id);
        self.loader.cancel();
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        self.disposed = true;
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    pub fn revision(&self) -> u64 {
        self.store.revision()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn can_send(&self) -> bool {
        !self.disposed && self.connection.is_connected()
    }

    pub fn unread_count(&self) -> u32 {
        self.viewport.unread_count()
    }

    pub fn jump_to_bottom_visible(&self) -> bool {
        self.viewport.jump_to_bottom_visible()
    }

    pub fn has_more_history(&self) -> bool {
        self.loader.has_more()
    }

    pub fn is_loading_older(&self) -> bool {
        self.loader.is_loading_older()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn apply_lifecycle(&mut self, event: &LifecycleEvent) {
        let transition = match self.connection.apply(event) {
            Some(transition) => transition,
            None => return,
        };
        if transition.to == ConnectionState::Disconnected {
            self.pipeline.fail_outstanding(&mut self.store);
        }
        if transition.backfill {
            self.loader.load_latest(&self.events);
        }
        if transition.to == ConnectionState::Connected && self.viewport.take_deferred_top_load() {
            self.load_older();
        }
    }

    fn apply_page(&mut self, kind: PageKind, generation: u64, result: Result<HistoryPage, HistoryError>) {
        if !self.loader.complete(kind, generation, &result) {
            return;
        }
        let page = match result {
            Ok(page) => page,
            Err(_) => return,
        };
        let messages = history::ingest(page, &self.context);

        match kind {
            PageKind::Older => {
                if self.store.is_empty() {
                    self.viewport.pin_to_bottom();
                } else if let Some(before) = self.viewport.last_metrics() {
                    if !self.viewport.has_pending_anchor() {
                        self.anchor_message = self.store.messages().first().map(|m| m.id.clone());
                    }
                    self.viewport.on_older_page_loaded(before);
                }
                let added = self.store.prepend_history(messages);
                debug!("Older page added {} messages", added);
            }
            PageKind::Latest => {
                let fresh = self.store.extend_history(messages, self.echo_window);
                debug!("Latest page added {} messages", fresh.len());
                // Our own archived sends are not something to catch up on.
                for _ in fresh.iter().filter(|m| m.sender == Sender::RemoteUser) {
                    self.viewport.on_new_message();
                }
            }
        }
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        self.dispose();
    }
}
