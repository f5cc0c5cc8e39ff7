// Scroll anchoring and unread tracking
//
// The controller never touches a real scroll container. Hosts report metrics
// (pixels for a web view, rows for a terminal) and apply the offsets that
// `on_layout` hands back before they paint.

use std::time::{Duration, Instant};

use log::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportSettings {
    /// Distance from the bottom edge that still counts as "at the bottom".
    pub near_bottom_threshold: f64,
    /// Distance from the top edge that triggers loading older history.
    pub top_threshold: f64,
    /// Quiet period before a burst of scroll events is evaluated.
    pub debounce: Duration,
}

impl Default for ViewportSettings {
    fn default() -> Self {
        ViewportSettings {
            near_bottom_threshold: 80.0,
            top_threshold: 40.0,
            debounce: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ViewportMetrics {
    pub scroll_top: f64,
    pub viewport_height: f64,
    pub content_height: f64,
    /// Height of the content laid out above the message that was first
    /// before an older page came in. Only meaningful while an anchor is
    /// pending; without it the whole content growth is taken as prepended.
    pub prepended_height: Option<f64>,
}

impl ViewportMetrics {
    pub fn new(scroll_top: f64, viewport_height: f64, content_height: f64) -> Self {
        ViewportMetrics {
            scroll_top,
            viewport_height,
            content_height,
            prepended_height: None,
        }
    }

    pub fn with_prepended_height(self, height: f64) -> Self {
        ViewportMetrics {
            prepended_height: Some(height),
            ..self
        }
    }

    /// Largest valid scroll offset.
    pub fn max_scroll_top(&self) -> f64 {
        (self.content_height - self.viewport_height).max(0.0)
    }

    pub fn distance_from_bottom(&self) -> f64 {
        (self.max_scroll_top() - self.scroll_top).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScrollCommand {
    /// Leave the scroll position alone.
    Keep,
    /// Move the scroll position to this offset.
    ScrollTo(f64),
}

#[derive(Debug)]
pub struct ViewportController {
    settings: ViewportSettings,
    near_bottom: bool,
    unread: u32,
    jump_visible: bool,
    pin_to_bottom: bool,
    anchor: Option<ViewportMetrics>,
    pending_scroll: Option<(ViewportMetrics, Instant)>,
    /// Messages appended while an anchor was waiting for layout.
    appended_during_anchor: u32,
    deferred_top_load: bool,
    last_metrics: Option<ViewportMetrics>,
}

impl ViewportController {
    pub fn new(settings: ViewportSettings) -> Self {
        ViewportController {
            settings,
            near_bottom: true,
            unread: 0,
            jump_visible: false,
            pin_to_bottom: false,
            anchor: None,
            pending_scroll: None,
            appended_during_anchor: 0,
            deferred_top_load: false,
            last_metrics: None,
        }
    }

    pub fn is_near_bottom(&self) -> bool {
        self.near_bottom
    }

    pub fn unread_count(&self) -> u32 {
        self.unread
    }

    pub fn jump_to_bottom_visible(&self) -> bool {
        self.jump_visible
    }

    pub fn last_metrics(&self) -> Option<ViewportMetrics> {
        self.last_metrics
    }

    /// When the debounced near-bottom check is due, if one is waiting.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending_scroll.map(|(_, due)| due)
    }

    /// A user scroll happened. The near-bottom check is debounced; the return
    /// value says whether the top threshold was reached and is not.
    pub fn on_scroll(&mut self, metrics: ViewportMetrics, now: Instant) -> bool {
        self.last_metrics = Some(metrics);
        self.pending_scroll = Some((metrics, now + self.settings.debounce));
        metrics.scroll_top <= self.settings.top_threshold
    }

    /// Evaluate a debounced scroll once its quiet period is over.
    /// Returns true when the near-bottom state was re-evaluated.
    pub fn poll(&mut self, now: Instant) -> bool {
        let (metrics, due) = match self.pending_scroll {
            Some(pending) => pending,
            None => return false,
        };
        if now < due {
            return false;
        }
        self.pending_scroll = None;
        self.near_bottom = metrics.distance_from_bottom() <= self.settings.near_bottom_threshold;
        if self.near_bottom && self.unread > 0 {
            debug!("Reader reached the bottom, clearing {} unread", self.unread);
        }
        if self.near_bottom {
            self.unread = 0;
            self.jump_visible = false;
        }
        true
    }

    /// A new message arrived at the bottom. Returns true if the view will
    /// follow it, false if it was counted as unread instead.
    pub fn on_new_message(&mut self) -> bool {
        if self.anchor.is_some() {
            self.appended_during_anchor += 1;
        }
        if self.near_bottom {
            self.pin_to_bottom = true;
            true
        } else {
            self.unread += 1;
            self.jump_visible = true;
            false
        }
    }

    /// Older messages are about to be inserted above `before`. The offset
    /// correction is produced by the next `on_layout`.
    pub fn on_older_page_loaded(&mut self, before: ViewportMetrics) {
        // A second prepend before layout keeps the first snapshot; the delta
        // is measured against the content the reader actually saw.
        if self.anchor.is_none() {
            self.anchor = Some(before);
        }
    }

    /// The reader asked to go to the newest message.
    pub fn on_scroll_to_bottom_requested(&mut self) {
        self.pin_to_bottom = true;
        self.near_bottom = true;
        self.unread = 0;
        self.jump_visible = false;
        self.pending_scroll = None;
    }

    /// Follow the bottom on the next layout without touching unread state.
    pub fn pin_to_bottom(&mut self) {
        self.pin_to_bottom = true;
    }

    pub fn has_pending_anchor(&self) -> bool {
        self.anchor.is_some()
    }

    /// Content or size changed and the host is about to paint. Resolves any
    /// anchor or pin into a concrete offset.
    pub fn on_layout(&mut self, metrics: ViewportMetrics) -> ScrollCommand {
        let command = if let Some(before) = self.anchor.take() {
            let appended = std::mem::take(&mut self.appended_during_anchor);
            let delta = match metrics.prepended_height {
                Some(height) => height,
                None => {
                    if appended > 0 {
                        warn!(
                            "{} messages appended during a prepend and no prepended height reported; anchor may drift",
                            appended
                        );
                    }
                    metrics.content_height - before.content_height
                }
            };
            let target = (before.scroll_top + delta).clamp(0.0, metrics.max_scroll_top());
            self.pin_to_bottom = false;
            ScrollCommand::ScrollTo(target)
        } else if self.pin_to_bottom {
            self.pin_to_bottom = false;
            self.near_bottom = true;
            ScrollCommand::ScrollTo(metrics.max_scroll_top())
        } else {
            ScrollCommand::Keep
        };

        let scroll_top = match command {
            ScrollCommand::ScrollTo(offset) => offset,
            ScrollCommand::Keep => metrics.scroll_top,
        };
        let settled = ViewportMetrics {
            scroll_top,
            prepended_height: None,
            ..metrics
        };
        // A scroll still in its quiet period describes the view before this
        // offset was applied; evaluate it against where the view is now.
        if let (ScrollCommand::ScrollTo(_), Some((_, due))) = (command, self.pending_scroll) {
            self.pending_scroll = Some((settled, due));
        }
        self.last_metrics = Some(settled);
        command
    }

    /// Remember that the top was reached while loading was not allowed.
    pub fn defer_top_load(&mut self) {
        self.deferred_top_load = true;
    }

    pub fn take_deferred_top_load(&mut self) -> bool {
        std::mem::take(&mut self.deferred_top_load)
    }
}
