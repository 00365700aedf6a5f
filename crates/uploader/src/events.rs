//! Typed lifecycle notifications and their synchronous bus.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chunkup_protocol::{FailInfo, ProgressSnapshot};
use tokio::sync::mpsc;

/// Notification published during an upload attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    /// A new progress snapshot replacing the previous one.
    Progress(ProgressSnapshot),
    /// A request is about to be retried. `status` is `None` when the previous
    /// attempt failed before a response arrived.
    Retry {
        status: Option<u16>,
        url: String,
        attempt: u32,
    },
    Success,
    Fail(FailInfo),
    /// Last event of every attempt that ran to an end.
    Complete,
}

/// Discriminant of [`UploadEvent`], used to filter subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Progress,
    Retry,
    Success,
    Fail,
    Complete,
}

impl UploadEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            UploadEvent::Progress(_) => EventKind::Progress,
            UploadEvent::Retry { .. } => EventKind::Retry,
            UploadEvent::Success => EventKind::Success,
            UploadEvent::Fail(_) => EventKind::Fail,
            UploadEvent::Complete => EventKind::Complete,
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&UploadEvent) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    kind: Option<EventKind>,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Ordered, synchronous event delivery.
///
/// `publish` calls every matching handler in subscription order before it
/// returns. Handlers run outside the bus lock, so they may subscribe or
/// unsubscribe themselves.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events of one kind.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.add(Some(kind), Arc::new(handler))
    }

    /// Registers `handler` for every event.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.add(None, Arc::new(handler))
    }

    /// Forwards every event into an unbounded channel.
    ///
    /// The subscription stays alive until unsubscribed; sends to a dropped
    /// receiver are ignored.
    pub fn channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<UploadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe_all(move |event| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != id);
        inner.subscribers.len() != before
    }

    /// Delivers `event` to every matching subscriber.
    pub fn publish(&self, event: &UploadEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner
                .subscribers
                .iter()
                .filter(|s| s.kind.is_none_or(|k| k == kind))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };
        for handler in handlers {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .len()
    }

    fn add(&self, kind: Option<EventKind>, handler: Handler) -> SubscriptionId {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.subscribers.push(Subscriber { id, kind, handler });
        id
    }
}
