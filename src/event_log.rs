use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::events::AgentEvent;

/// Ordered, replayable event distribution for exactly one run.
///
/// Every subscriber observes the same total order: the backlog snapshotted
/// at subscribe time, then every later append, then a single `done`.
pub struct EventLog {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    backlog: Vec<AgentEvent>,
    subscribers: Vec<mpsc::UnboundedSender<AgentEvent>>,
    closed: bool,
}

impl EventLog {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }

    /// Append and fan out to all live subscribers. Ignored after close.
    pub fn append(&self, event: AgentEvent) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.backlog.push(event.clone());
        // Disconnected subscribers drop out here, silently.
        inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Snapshot the backlog and register for live delivery, atomically.
    /// Subscribing after close yields the backlog plus an immediate `done`.
    pub fn subscribe(&self) -> (Vec<AgentEvent>, mpsc::UnboundedReceiver<AgentEvent>) {
        let mut inner = self.inner.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = inner.backlog.clone();
        if inner.closed {
            let _ = tx.send(AgentEvent::Done);
        } else {
            inner.subscribers.push(tx);
        }
        (backlog, rx)
    }

    /// Deliver `done` to every subscriber and seal the log.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        for tx in inner.subscribers.drain(..) {
            let _ = tx.send(AgentEvent::Done);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> AgentEvent {
        AgentEvent::assistant_text(s)
    }

    fn content_of(e: &AgentEvent) -> Option<&str> {
        match e {
            AgentEvent::AssistantText { content, .. } => Some(content),
            _ => None,
        }
    }

    #[tokio::test]
    async fn early_subscriber_sees_everything_in_order() {
        let log = EventLog::new();
        let (backlog, mut rx) = log.subscribe();
        assert!(backlog.is_empty());

        log.append(text("a"));
        log.append(text("b"));
        assert_eq!(content_of(&rx.recv().await.unwrap()), Some("a"));
        assert_eq!(content_of(&rx.recv().await.unwrap()), Some("b"));
    }

    #[tokio::test]
    async fn late_subscriber_gets_backlog_then_live() {
        let log = EventLog::new();
        log.append(text("a"));
        log.append(text("b"));

        let (backlog, mut rx) = log.subscribe();
        assert_eq!(backlog.len(), 2);
        assert_eq!(content_of(&backlog[0]), Some("a"));
        assert_eq!(content_of(&backlog[1]), Some("b"));

        log.append(text("c"));
        assert_eq!(content_of(&rx.recv().await.unwrap()), Some("c"));
    }

    #[tokio::test]
    async fn close_delivers_done_and_ends_the_stream() {
        let log = EventLog::new();
        let (_, mut rx) = log.subscribe();
        log.append(text("a"));
        log.close();

        assert!(matches!(rx.recv().await, Some(AgentEvent::AssistantText { .. })));
        assert!(matches!(rx.recv().await, Some(AgentEvent::Done)));
        assert!(rx.recv().await.is_none());
        assert!(log.is_closed());
    }

    #[tokio::test]
    async fn subscribe_after_close_yields_backlog_and_done() {
        let log = EventLog::new();
        log.append(text("a"));
        log.close();

        let (backlog, mut rx) = log.subscribe();
        assert_eq!(backlog.len(), 1);
        assert!(matches!(rx.recv().await, Some(AgentEvent::Done)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn appends_after_close_are_ignored() {
        let log = EventLog::new();
        log.close();
        log.append(text("late"));

        let (backlog, _rx) = log.subscribe();
        assert!(backlog.is_empty());
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned_silently() {
        let log = EventLog::new();
        let (_, rx) = log.subscribe();
        drop(rx);

        log.append(text("a"));
        let (backlog, _rx) = log.subscribe();
        assert_eq!(backlog.len(), 1);
    }
}
