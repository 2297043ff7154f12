//! Live fan-out of execution-log lines and status changes.
//!
//! The durable copy of every log line lives in the `execution_logs` table; this
//! broadcaster only serves attached subscribers. Delivery is fire-and-forget:
//! a subscriber that falls behind the ring buffer loses its oldest events, and
//! publishing with no subscribers at all is fine. Events for a single
//! conversation are published in append order, so each subscriber observes
//! them FIFO per conversation; there is no ordering across conversations.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

/// Per-subscriber ring buffer capacity.
const CHANNEL_CAPACITY: usize = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogEventKind {
    Log,
    Status,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEvent {
    pub conversation_id: Uuid,
    pub content: String,
    pub kind: LogEventKind,
}

pub struct LogBroadcaster {
    sender: broadcast::Sender<LogEvent>,
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn broadcast_log(&self, conversation_id: Uuid, content: &str) {
        let _ = self.sender.send(LogEvent {
            conversation_id,
            content: content.to_string(),
            kind: LogEventKind::Log,
        });
    }

    pub fn broadcast_status(&self, conversation_id: Uuid, status: &str) {
        let _ = self.sender.send(LogEvent {
            conversation_id,
            content: status.to_string(),
            kind: LogEventKind::Status,
        });
    }

    /// Subscribe to all conversations.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.sender.subscribe()
    }

    /// Stream of events for one conversation, lag drops filtered out.
    pub fn subscribe_conversation(
        &self,
        conversation_id: Uuid,
    ) -> futures::stream::BoxStream<'static, LogEvent> {
        let rx = self.sender.subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(move |res| async move {
            res.ok().filter(|ev| ev.conversation_id == conversation_id)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order_to_subscriber() {
        let broadcaster = LogBroadcaster::new();
        let mut rx = broadcaster.subscribe();
        let id = Uuid::new_v4();

        broadcaster.broadcast_log(id, "line one\n");
        broadcaster.broadcast_status(id, "running");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, LogEventKind::Log);
        assert_eq!(first.content, "line one\n");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, LogEventKind::Status);
        assert_eq!(second.content, "running");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let broadcaster = LogBroadcaster::new();
        broadcaster.broadcast_log(Uuid::new_v4(), "nobody listening\n");
    }

    #[tokio::test]
    async fn conversation_stream_filters_other_conversations() {
        let broadcaster = LogBroadcaster::new();
        let mine = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut stream = broadcaster.subscribe_conversation(mine);

        broadcaster.broadcast_log(other, "not for us\n");
        broadcaster.broadcast_log(mine, "ours\n");

        let ev = stream.next().await.unwrap();
        assert_eq!(ev.conversation_id, mine);
        assert_eq!(ev.content, "ours\n");
    }
}
