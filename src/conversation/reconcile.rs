// Reconciliation of paged history with live traffic
// Everything here is pure: callers own the message lists.

use std::collections::HashSet;

use chrono::Duration;
use log::debug;

use crate::models::Message;

/// Merge a historical batch with the live messages seen since the view opened.
///
/// Historical entries win when both sides carry the same id, and repeated ids
/// within one side collapse to their first occurrence. Both inputs are
/// expected oldest-first, so concatenation normally keeps the result ordered;
/// if it does not, a stable sort by timestamp restores the order.
///
/// Applying the same historical batch again is a no-op:
/// `merge(h, &merge(h, l)) == merge(h, l)`.
pub fn merge(historical: &[Message], live: &[Message]) -> Vec<Message> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(historical.len() + live.len());
    let mut merged = Vec::with_capacity(historical.len() + live.len());

    for message in historical.iter().chain(live.iter()) {
        if seen.insert(message.id.as_str()) {
            merged.push(message.clone());
        }
    }

    if !is_chronological(&merged) {
        debug!("Merged {} messages out of order, re-sorting by timestamp", merged.len());
        merged.sort_by_key(|m| m.timestamp);
    }
    merged
}

pub fn is_chronological(messages: &[Message]) -> bool {
    messages.windows(2).all(|pair| pair[0].timestamp <= pair[1].timestamp)
}

/// Drop settled live messages that reappear in history under a different id.
///
/// When the channel does not echo server ids, a message we saw live and the
/// same message fetched later from the archive cannot be matched by id. A
/// live entry is considered a copy of a historical one when sender and text
/// are equal and the timestamps lie within `window`. Each historical record
/// absorbs at most one live entry, so two identical short replies stay two.
/// Pending and failed messages are never dropped.
///
/// Returns the kept live messages and the ids of the historical records that
/// absorbed a live copy.
pub fn prune_echoed(
    live: Vec<Message>,
    history: &[Message],
    window: Duration,
) -> (Vec<Message>, Vec<String>) {
    let live_ids: HashSet<&str> = live.iter().map(|m| m.id.as_str()).collect();
    let mut claimed: HashSet<usize> = HashSet::new();
    let mut absorbed = Vec::new();

    let kept: Vec<Message> = live
        .iter()
        .filter(|candidate| {
            if !candidate.status.is_settled() {
                return true;
            }
            let twin = (0..history.len()).find(|&idx| {
                let archived = &history[idx];
                !claimed.contains(&idx)
                    && !live_ids.contains(archived.id.as_str())
                    && archived.sender == candidate.sender
                    && archived.text == candidate.text
                    && (archived.timestamp - candidate.timestamp).num_milliseconds().abs()
                        <= window.num_milliseconds()
            });
            match twin {
                Some(idx) => {
                    claimed.insert(idx);
                    absorbed.push(history[idx].id.clone());
                    false
                }
                None => true,
            }
        })
        .cloned()
        .collect();

    if !absorbed.is_empty() {
        debug!("Dropped {} live messages already present in history", absorbed.len());
    }
    (kept, absorbed)
}
