//! Per-session subscriber registry and fan-out

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use mdxai_protocol::{SessionState, WebSocketMessage};

/// Longest a single subscriber may hold up delivery before it is dropped.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub type SubscriberId = u64;

/// Sink handed over by a streaming connection
pub type Sink = mpsc::Sender<WebSocketMessage>;

/// Owns the set of live subscribers for one session.
///
/// A sink that fails a send is removed on the spot; sinks whose receiver
/// is gone are also swept by `prune_closed`.
pub struct Broadcaster {
    session_id: String,
    next_id: SubscriberId,
    subscribers: Vec<(SubscriberId, Sink)>,
}

impl Broadcaster {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            next_id: 1,
            subscribers: Vec::new(),
        }
    }

    /// Send `state` to `sink` alone, then register it for future events.
    ///
    /// Returns `None` if the sink is already gone.
    pub async fn attach(&mut self, sink: Sink, state: &SessionState) -> Option<SubscriberId> {
        let snapshot = WebSocketMessage::State {
            data: state.clone(),
        };
        if !deliver(&sink, snapshot).await {
            debug!(
                component = "broadcaster",
                event = "subscriber.attach_failed",
                session_id = %self.session_id,
                "Subscriber closed before initial state was delivered"
            );
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push((id, sink));

        debug!(
            component = "broadcaster",
            event = "subscriber.attached",
            session_id = %self.session_id,
            subscriber_id = id,
            subscribers = self.subscribers.len(),
        );
        Some(id)
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn detach(&mut self, id: SubscriberId) {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        if self.subscribers.len() != before {
            debug!(
                component = "broadcaster",
                event = "subscriber.detached",
                session_id = %self.session_id,
                subscriber_id = id,
                subscribers = self.subscribers.len(),
            );
        }
    }

    /// Deliver `msg` to every subscriber. Failed sinks are detached;
    /// the rest still receive the message.
    pub async fn notify(&mut self, msg: WebSocketMessage) {
        let mut failed = Vec::new();

        for (id, sink) in &self.subscribers {
            if !deliver(sink, msg.clone()).await {
                failed.push(*id);
            }
        }

        for id in failed {
            warn!(
                component = "broadcaster",
                event = "subscriber.dropped",
                session_id = %self.session_id,
                subscriber_id = id,
                "Subscriber send failed, detaching"
            );
            self.detach(id);
        }
    }

    /// Drop sinks whose receiving side has gone away without detaching.
    pub fn prune_closed(&mut self) {
        let before = self.subscribers.len();
        self.subscribers.retain(|(_, sink)| !sink.is_closed());
        let pruned = before - self.subscribers.len();
        if pruned > 0 {
            debug!(
                component = "broadcaster",
                event = "subscriber.pruned",
                session_id = %self.session_id,
                pruned,
                subscribers = self.subscribers.len(),
            );
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

async fn deliver(sink: &Sink, msg: WebSocketMessage) -> bool {
    matches!(
        tokio::time::timeout(SEND_TIMEOUT, sink.send(msg)).await,
        Ok(Ok(()))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::{create_initial_state, SessionInit};
    use chrono::Utc;
    use mdxai_protocol::StreamEvent;

    fn state() -> SessionState {
        create_initial_state("b-session", &SessionInit::default(), Utc::now())
    }

    fn event_msg(content: &str) -> WebSocketMessage {
        WebSocketMessage::Event {
            event: StreamEvent::Assistant {
                content: content.into(),
                timestamp: None,
            },
            state: state(),
        }
    }

    #[tokio::test]
    async fn attach_sends_snapshot_only_to_new_subscriber() {
        let mut broadcaster = Broadcaster::new("b-session");
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);

        broadcaster.attach(tx1, &state()).await.unwrap();
        assert!(matches!(rx1.recv().await, Some(WebSocketMessage::State { .. })));

        broadcaster.attach(tx2, &state()).await.unwrap();
        assert!(matches!(rx2.recv().await, Some(WebSocketMessage::State { .. })));
        assert!(rx1.try_recv().is_err());
        assert_eq!(broadcaster.len(), 2);
    }

    #[tokio::test]
    async fn notify_reaches_every_subscriber_once() {
        let mut broadcaster = Broadcaster::new("b-session");
        let mut receivers = Vec::new();
        for _ in 0..4 {
            let (tx, mut rx) = mpsc::channel(8);
            broadcaster.attach(tx, &state()).await.unwrap();
            rx.recv().await.unwrap();
            receivers.push(rx);
        }

        broadcaster.notify(event_msg("hello")).await;

        for rx in &mut receivers {
            assert!(matches!(rx.recv().await, Some(WebSocketMessage::Event { .. })));
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn closed_subscriber_is_detached_without_affecting_others() {
        let mut broadcaster = Broadcaster::new("b-session");
        let (live_tx, mut live_rx) = mpsc::channel(8);
        let (dead_tx, dead_rx) = mpsc::channel(8);

        broadcaster.attach(dead_tx, &state()).await.unwrap();
        broadcaster.attach(live_tx, &state()).await.unwrap();
        live_rx.recv().await.unwrap();
        drop(dead_rx);

        broadcaster.notify(event_msg("one")).await;
        broadcaster.notify(event_msg("two")).await;

        assert_eq!(broadcaster.len(), 1);
        for expected in ["one", "two"] {
            match live_rx.recv().await {
                Some(WebSocketMessage::Event {
                    event: StreamEvent::Assistant { content, .. },
                    ..
                }) => assert_eq!(content, expected),
                other => panic!("expected event, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn attach_of_closed_sink_is_rejected() {
        let mut broadcaster = Broadcaster::new("b-session");
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        assert!(broadcaster.attach(tx, &state()).await.is_none());
        assert!(broadcaster.is_empty());
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let mut broadcaster = Broadcaster::new("b-session");
        let (tx, _rx) = mpsc::channel(8);
        let id = broadcaster.attach(tx, &state()).await.unwrap();

        broadcaster.detach(id);
        broadcaster.detach(id);
        broadcaster.detach(999);
        assert!(broadcaster.is_empty());
    }

    #[tokio::test]
    async fn prune_removes_only_abandoned_sinks() {
        let mut broadcaster = Broadcaster::new("b-session");
        let (kept_tx, _kept_rx) = mpsc::channel(8);
        let (gone_tx, gone_rx) = mpsc::channel(8);
        broadcaster.attach(kept_tx, &state()).await.unwrap();
        broadcaster.attach(gone_tx, &state()).await.unwrap();

        drop(gone_rx);
        broadcaster.prune_closed();

        assert_eq!(broadcaster.len(), 1);
    }
}
