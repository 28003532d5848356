use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::broadcast;

use quorum_ledger::{Ledger, LedgerResult, MessageFilter};
use quorum_types::{Message, MessageDraft};

pub type Subscriber = Arc<dyn Fn(&Message) + Send + Sync>;

struct TopicSubscriber {
    id: u64,
    /// `None` subscribes to every topic.
    topic: Option<String>,
    callback: Subscriber,
}

struct BusInner {
    subscribers: RwLock<Vec<TopicSubscriber>>,
    next_id: AtomicU64,
}

/// Publish/subscribe layered over the ledger. Publishing appends first,
/// then notifies matching in-process subscribers synchronously; callbacks
/// must be short-running and dispatch long work elsewhere. Subscriptions
/// are not durable; crash recovery replays nothing, it resumes from the
/// ledger (see orchestrator resume).
#[derive(Clone)]
pub struct MessageBus {
    cluster_id: String,
    ledger: Arc<Ledger>,
    inner: Arc<BusInner>,
    feed: broadcast::Sender<Message>,
}

/// Removes its subscription when dropped.
pub struct SubscriptionGuard {
    inner: Weak<BusInner>,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut subs = inner.subscribers.write().expect("bus subscribers poisoned");
            subs.retain(|s| s.id != self.id);
        }
    }
}

impl MessageBus {
    pub fn new(cluster_id: impl Into<String>, ledger: Arc<Ledger>) -> Self {
        let (feed, _) = broadcast::channel(2048);
        Self {
            cluster_id: cluster_id.into(),
            ledger,
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
            feed,
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Append one message and notify subscribers. Defaults are filled by
    /// the ledger (`receiver = broadcast`, id/seq/timestamp assigned).
    pub fn publish(&self, draft: MessageDraft) -> LedgerResult<Message> {
        let stored = self.ledger.append(draft)?;
        self.notify(&stored);
        Ok(stored)
    }

    /// Append a batch in one ledger transaction, then notify for each in
    /// order. Readers observe all of the records or none of them.
    pub fn publish_all(&self, drafts: Vec<MessageDraft>) -> LedgerResult<Vec<Message>> {
        let stored = self.ledger.append_all(drafts)?;
        for message in &stored {
            self.notify(message);
        }
        Ok(stored)
    }

    fn notify(&self, message: &Message) {
        let _ = self.feed.send(message.clone());
        // Snapshot under the read lock so a callback can subscribe or drop
        // guards without deadlocking.
        let callbacks: Vec<Subscriber> = {
            let subs = self
                .inner
                .subscribers
                .read()
                .expect("bus subscribers poisoned");
            subs.iter()
                .filter(|s| s.topic.as_deref().map_or(true, |t| t == message.topic))
                .map(|s| s.callback.clone())
                .collect()
        };
        for callback in callbacks {
            callback(message);
        }
    }

    pub fn subscribe_topic(
        &self,
        topic: impl Into<String>,
        callback: Subscriber,
    ) -> SubscriptionGuard {
        self.subscribe_inner(Some(topic.into()), callback)
    }

    pub fn subscribe_all(&self, callback: Subscriber) -> SubscriptionGuard {
        self.subscribe_inner(None, callback)
    }

    fn subscribe_inner(&self, topic: Option<String>, callback: Subscriber) -> SubscriptionGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .expect("bus subscribers poisoned")
            .push(TopicSubscriber {
                id,
                topic,
                callback,
            });
        SubscriptionGuard {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Live feed of appended records, for `logs --follow`.
    pub fn feed(&self) -> broadcast::Receiver<Message> {
        self.feed.subscribe()
    }

    pub fn query(&self, filter: &MessageFilter) -> LedgerResult<Vec<Message>> {
        self.ledger.query(filter)
    }

    pub fn find_last(&self, filter: &MessageFilter) -> LedgerResult<Option<Message>> {
        self.ledger.find_last(filter)
    }

    pub fn count(&self, filter: &MessageFilter) -> LedgerResult<u64> {
        self.ledger.count(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_types::topics;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn bus(dir: &TempDir) -> MessageBus {
        let ledger = Arc::new(Ledger::open(dir.path(), "c-1").unwrap());
        MessageBus::new("c-1", ledger)
    }

    #[test]
    fn publish_defaults_receiver_to_broadcast() {
        let dir = TempDir::new().unwrap();
        let bus = bus(&dir);
        let stored = bus
            .publish(MessageDraft::new("c-1", topics::ISSUE_OPENED, "user"))
            .unwrap();
        assert_eq!(stored.receiver, "broadcast");
    }

    #[test]
    fn topic_subscribers_fire_after_append() {
        let dir = TempDir::new().unwrap();
        let bus = bus(&dir);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in = hits.clone();
        let bus_in = bus.clone();
        let _guard = bus.subscribe_topic(
            topics::ISSUE_OPENED,
            Arc::new(move |msg| {
                // The record is durable before subscribers run.
                let seen = bus_in
                    .count(&MessageFilter::topic(&msg.topic))
                    .unwrap();
                assert!(seen >= 1);
                hits_in.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish(MessageDraft::new("c-1", topics::ISSUE_OPENED, "user"))
            .unwrap();
        bus.publish(MessageDraft::new("c-1", topics::TASK_STARTED, "worker"))
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_the_guard_unsubscribes() {
        let dir = TempDir::new().unwrap();
        let bus = bus(&dir);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in = hits.clone();
        let guard = bus.subscribe_all(Arc::new(move |_| {
            hits_in.fetch_add(1, Ordering::SeqCst);
        }));
        bus.publish(MessageDraft::new("c-1", topics::ISSUE_OPENED, "user"))
            .unwrap();
        drop(guard);
        bus.publish(MessageDraft::new("c-1", topics::ISSUE_OPENED, "user"))
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_all_notifies_in_order() {
        let dir = TempDir::new().unwrap();
        let bus = bus(&dir);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        let _guard = bus.subscribe_all(Arc::new(move |msg| {
            seen_in.lock().unwrap().push(msg.topic.clone());
        }));
        bus.publish_all(vec![
            MessageDraft::new("c-1", topics::CLUSTER_OPERATIONS, "conductor"),
            MessageDraft::new("c-1", topics::ISSUE_OPENED, "system"),
        ])
        .unwrap();
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[
                topics::CLUSTER_OPERATIONS.to_string(),
                topics::ISSUE_OPENED.to_string()
            ]
        );
    }
}
