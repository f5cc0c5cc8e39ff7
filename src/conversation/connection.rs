// Channel lifecycle tracking for a conversation
// Contains the connection state machine and the transitions it accepts

use log::{debug, info};

/// Enum for representing channel health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

/// Lifecycle notifications coming from the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Open,
    Close,
    Error(String),
    ReconnectAttempt,
}

/// A state change produced by a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// Set when history may have been missed and the newest page should be
    /// fetched again.
    pub backfill: bool,
}

#[derive(Debug)]
pub struct ConnectionManager {
    state: ConnectionState,
    recoveries: u32,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        ConnectionManager {
            state: ConnectionState::Connecting,
            recoveries: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Manual reconnects are only offered once the channel has given up.
    pub fn can_reconnect(&self) -> bool {
        self.state == ConnectionState::Disconnected
    }

    /// Number of times the channel came back after being lost.
    pub fn recoveries(&self) -> u32 {
        self.recoveries
    }

    /// Feed a lifecycle event. Returns the transition it caused, if any.
    pub fn apply(&mut self, event: &LifecycleEvent) -> Option<Transition> {
        use ConnectionState::*;

        let next = match (self.state, event) {
            (Connecting, LifecycleEvent::Open) => Connected,
            (Disconnected, LifecycleEvent::Open) => Connected,
            (Reconnecting, LifecycleEvent::Open) => Connected,
            (Connecting, LifecycleEvent::Close | LifecycleEvent::Error(_)) => Disconnected,
            (Connected, LifecycleEvent::Close | LifecycleEvent::Error(_)) => Disconnected,
            (Reconnecting, LifecycleEvent::Close | LifecycleEvent::Error(_)) => Disconnected,
            (Disconnected, LifecycleEvent::ReconnectAttempt) => Reconnecting,
            (state, event) => {
                debug!("Ignoring {:?} while {:?}", event, state);
                return None;
            }
        };

        let transition = Transition {
            from: self.state,
            to: next,
            backfill: next == Connected && self.state != Connecting,
        };
        if transition.backfill {
            self.recoveries += 1;
        }
        if let LifecycleEvent::Error(reason) = event {
            info!("Channel error while {:?}: {}", self.state, reason);
        }
        info!("Connection state {:?} -> {:?}", transition.from, transition.to);
        self.state = next;
        Some(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_open_does_not_backfill() {
        let mut manager = ConnectionManager::new();
        assert_eq!(manager.state(), ConnectionState::Connecting);

        let transition = manager.apply(&LifecycleEvent::Open).unwrap();
        assert_eq!(transition.to, ConnectionState::Connected);
        assert!(!transition.backfill);
        assert!(manager.is_connected());
    }

    #[test]
    fn test_reconnect_cycle_backfills_once() {
        let mut manager = ConnectionManager::new();
        manager.apply(&LifecycleEvent::Open);
        manager.apply(&LifecycleEvent::Close);
        assert!(manager.can_reconnect());

        let attempt = manager.apply(&LifecycleEvent::ReconnectAttempt).unwrap();
        assert_eq!(attempt.to, ConnectionState::Reconnecting);
        assert!(!attempt.backfill);

        let back = manager.apply(&LifecycleEvent::Open).unwrap();
        assert_eq!(back.from, ConnectionState::Reconnecting);
        assert!(back.backfill);

        // A duplicate open while connected changes nothing.
        assert!(manager.apply(&LifecycleEvent::Open).is_none());
        assert_eq!(manager.recoveries(), 1);
    }

    #[test]
    fn test_failed_attempt_returns_to_disconnected() {
        let mut manager = ConnectionManager::new();
        manager.apply(&LifecycleEvent::Error("refused".to_string()));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.apply(&LifecycleEvent::ReconnectAttempt);
        let failed = manager
            .apply(&LifecycleEvent::Error("401 unauthorized".to_string()))
            .unwrap();
        assert_eq!(failed.from, ConnectionState::Reconnecting);
        assert_eq!(failed.to, ConnectionState::Disconnected);
    }

    #[test]
    fn test_direct_open_after_drop_backfills() {
        let mut manager = ConnectionManager::new();
        manager.apply(&LifecycleEvent::Open);
        manager.apply(&LifecycleEvent::Close);
        let back = manager.apply(&LifecycleEvent::Open).unwrap();
        assert!(back.backfill);
    }

    #[test]
    fn test_reconnect_attempt_ignored_while_connected() {
        let mut manager = ConnectionManager::new();
        manager.apply(&LifecycleEvent::Open);
        assert!(manager.apply(&LifecycleEvent::ReconnectAttempt).is_none());
        assert!(!manager.can_reconnect());
    }
}
