//! Per-session event fan-out.
//!
//! The broadcaster is a side channel over the session resource: every event
//! carries a full snapshot that can be reconstructed by re-reading the
//! session, so a client that never subscribes loses nothing but latency.
//! The subscriber registry is purely in-process; a multi-instance deployment
//! needs sticky routing of event streams or an external fan-out on top.

use std::fmt;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

use vmbroker_model::{SessionEvent, SessionId};

const CHANNEL_CAPACITY: usize = 100;

/// Fans out lifecycle events to zero or more live subscribers per session.
///
/// Publication order is the order the lifecycle manager applied transitions:
/// the lifecycle manager publishes while still holding the per-session lock,
/// and a broadcast channel preserves send order per receiver.
#[derive(Default)]
pub struct SessionEventBus {
    channels: DashMap<SessionId, broadcast::Sender<SessionEvent>>,
}

impl fmt::Debug for SessionEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEventBus")
            .field("sessions", &self.channels.len())
            .finish()
    }
}

impl SessionEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a session's event stream. Slow subscribers that fall
    /// more than the channel capacity behind skip ahead rather than stall
    /// publication.
    pub fn subscribe(
        &self,
        session_id: SessionId,
    ) -> broadcast::Receiver<SessionEvent> {
        self.channels
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish one event. After a terminal status event the session's
    /// channel is dropped, which closes every live subscription once it has
    /// drained the final event.
    pub fn publish(&self, event: SessionEvent) {
        let session_id = event.session_id();
        let terminal = event.is_terminal();

        if let Some(sender) = self.channels.get(&session_id) {
            // Send fails only when no subscriber is connected, which is fine.
            let delivered = sender.send(event).unwrap_or(0);
            trace!(%session_id, delivered, "published session event");
        }

        if terminal {
            self.channels.remove(&session_id);
        }
    }

    /// Drop a session's channel, closing its live subscriptions. Used when a
    /// subscriber discovers the session is already terminal: its entry from
    /// `subscribe` would otherwise outlive the terminal publish.
    pub fn close(&self, session_id: SessionId) {
        self.channels.remove(&session_id);
    }

    /// Number of sessions with an open channel, for diagnostics.
    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;
    use vmbroker_model::{SessionStatus, SessionEvent};

    fn status_event(
        session_id: SessionId,
        status: SessionStatus,
    ) -> SessionEvent {
        SessionEvent::StatusUpdate {
            session_id,
            status,
            result: None,
        }
    }

    #[tokio::test]
    async fn delivers_events_in_publication_order() {
        let bus = SessionEventBus::new();
        let id = SessionId::new();
        let mut rx = bus.subscribe(id);

        bus.publish(status_event(id, SessionStatus::Pending));
        bus.publish(status_event(id, SessionStatus::Provisioning));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            first,
            SessionEvent::StatusUpdate { status: SessionStatus::Pending, .. }
        ));
        assert!(matches!(
            second,
            SessionEvent::StatusUpdate {
                status: SessionStatus::Provisioning,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn terminal_event_closes_subscriptions() {
        let bus = SessionEventBus::new();
        let id = SessionId::new();
        let mut rx = bus.subscribe(id);

        bus.publish(status_event(id, SessionStatus::Deleted));

        let last = rx.recv().await.unwrap();
        assert!(last.is_terminal());
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
        assert_eq!(bus.open_channels(), 0);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let bus = SessionEventBus::new();
        bus.publish(status_event(SessionId::new(), SessionStatus::Ready));
        assert_eq!(bus.open_channels(), 0);
    }
}
