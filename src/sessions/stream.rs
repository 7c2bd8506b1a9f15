//! Stream fan-out: bounded per-subscriber queues over session events.

use super::log::AgentSessionEvent;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

/// Chunk kinds; `session_ready` is always the first emission of a stream,
/// `end_of_stream` and `lagging` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    SessionReady,
    Event,
    EndOfStream,
    Lagging,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::SessionReady => "session_ready",
            StreamKind::Event => "event",
            StreamKind::EndOfStream => "end_of_stream",
            StreamKind::Lagging => "lagging",
        }
    }
}

/// One stream chunk.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamUpdate {
    pub kind: StreamKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<AgentSessionEvent>,
}

impl StreamUpdate {
    pub fn sentinel(kind: StreamKind) -> Self {
        Self { kind, event: None }
    }

    pub fn event(event: AgentSessionEvent) -> Self {
        Self {
            kind: StreamKind::Event,
            event: Some(event),
        }
    }
}

/// Pushes session events to every subscriber. Each subscriber has an
/// independent bounded queue; a full queue drops that subscriber with a
/// terminal `lagging` chunk.
pub struct StreamFanout {
    subscribers: Mutex<Vec<mpsc::Sender<StreamUpdate>>>,
    queue_depth: usize,
}

impl StreamFanout {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            queue_depth: queue_depth.max(2),
        }
    }

    /// Attach a subscriber. The first chunk is always `session_ready`; it
    /// then observes events from the session's current tail onward.
    pub async fn subscribe(&self) -> mpsc::Receiver<StreamUpdate> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        // Freshly created with capacity >= 2: this cannot fail.
        let _ = tx.try_send(StreamUpdate::sentinel(StreamKind::SessionReady));
        self.subscribers.lock().await.push(tx);
        rx
    }

    /// Deliver one event to all subscribers.
    pub async fn publish(&self, event: &AgentSessionEvent) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| {
            match tx.try_send(StreamUpdate::event(event.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Best effort terminal chunk; the queue may be too full
                    // even for that.
                    let _ = tx.try_send(StreamUpdate::sentinel(StreamKind::Lagging));
                    tracing::warn!("dropping lagging session stream subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Terminate all subscribers (session deleted).
    pub async fn close(&self) {
        let mut subscribers = self.subscribers.lock().await;
        for tx in subscribers.drain(..) {
            let _ = tx.try_send(StreamUpdate::sentinel(StreamKind::EndOfStream));
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::log::SessionEventBody;

    fn event(seq: u64) -> AgentSessionEvent {
        AgentSessionEvent {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: "s-1".into(),
            seq,
            ts: chrono::Utc::now(),
            body: SessionEventBody::Message {
                role: "user".into(),
                content: format!("message {seq}"),
                attachments: vec![],
            },
        }
    }

    #[tokio::test]
    async fn first_chunk_is_session_ready_exactly_once() {
        let fanout = StreamFanout::new(8);
        let mut rx = fanout.subscribe().await;

        fanout.publish(&event(1)).await;
        fanout.publish(&event(2)).await;

        let first = rx.recv().await.expect("chunk");
        assert_eq!(first.kind, StreamKind::SessionReady);
        let second = rx.recv().await.expect("chunk");
        assert_eq!(second.kind, StreamKind::Event);
        let third = rx.recv().await.expect("chunk");
        assert_eq!(third.kind, StreamKind::Event);
        assert!(
            [second, third]
                .iter()
                .all(|chunk| chunk.kind != StreamKind::SessionReady),
            "session_ready must never repeat"
        );
    }

    #[tokio::test]
    async fn subscribers_get_independent_views() {
        let fanout = StreamFanout::new(8);
        let mut a = fanout.subscribe().await;
        fanout.publish(&event(1)).await;
        let mut b = fanout.subscribe().await;
        fanout.publish(&event(2)).await;

        assert_eq!(a.recv().await.unwrap().kind, StreamKind::SessionReady);
        assert_eq!(a.recv().await.unwrap().event.unwrap().seq, 1);
        assert_eq!(a.recv().await.unwrap().event.unwrap().seq, 2);

        // B joined at the tail: it sees only the second event.
        assert_eq!(b.recv().await.unwrap().kind, StreamKind::SessionReady);
        assert_eq!(b.recv().await.unwrap().event.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_with_lagging() {
        let fanout = StreamFanout::new(2);
        let mut rx = fanout.subscribe().await;

        // Queue depth 2, one slot taken by session_ready. Two publishes
        // overflow it.
        fanout.publish(&event(1)).await;
        fanout.publish(&event(2)).await;
        assert_eq!(fanout.subscriber_count().await, 0);

        assert_eq!(rx.recv().await.unwrap().kind, StreamKind::SessionReady);
        assert_eq!(rx.recv().await.unwrap().kind, StreamKind::Event);
        // Terminal lagging chunk may or may not fit; the stream must end.
        match rx.recv().await {
            Some(chunk) => assert_eq!(chunk.kind, StreamKind::Lagging),
            None => {}
        }
    }

    #[tokio::test]
    async fn close_sends_end_of_stream() {
        let fanout = StreamFanout::new(8);
        let mut rx = fanout.subscribe().await;
        fanout.close().await;

        assert_eq!(rx.recv().await.unwrap().kind, StreamKind::SessionReady);
        assert_eq!(rx.recv().await.unwrap().kind, StreamKind::EndOfStream);
        assert!(rx.recv().await.is_none());
    }
}
