use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    task::{Context, Poll},
};

use futures::Stream;
use shared::domain::{ConversationKey, Message};
use tokio::sync::mpsc;
use tracing::debug;

type SnapshotSender = mpsc::UnboundedSender<Vec<Message>>;

#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    next_id: AtomicU64,
    by_key: Mutex<HashMap<ConversationKey, HashMap<u64, SnapshotSender>>>,
}

impl SubscriberRegistry {
    pub(crate) fn register(
        self: &Arc<Self>,
        key: ConversationKey,
    ) -> (Subscription, SnapshotSender) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .entry(key.clone())
            .or_default()
            .insert(id, tx.clone());
        debug!(conversation = %key, subscriber_id = id, "store: subscriber registered");
        let subscription = Subscription {
            key,
            id,
            receiver: rx,
            registry: Arc::downgrade(self),
            active: true,
        };
        (subscription, tx)
    }

    pub(crate) fn has_subscribers(&self, key: &ConversationKey) -> bool {
        self.lock().get(key).is_some_and(|subs| !subs.is_empty())
    }

    pub(crate) fn count(&self, key: &ConversationKey) -> usize {
        self.lock().get(key).map_or(0, HashMap::len)
    }

    /// Sends `snapshot` to every live subscriber of `key`, pruning closed ones.
    pub(crate) fn publish(&self, key: &ConversationKey, snapshot: &[Message]) {
        let mut guard = self.lock();
        let Some(subscribers) = guard.get_mut(key) else {
            return;
        };
        subscribers.retain(|_, tx| tx.send(snapshot.to_vec()).is_ok());
        if subscribers.is_empty() {
            guard.remove(key);
        }
    }

    fn remove(&self, key: &ConversationKey, id: u64) {
        let mut guard = self.lock();
        if let Some(subscribers) = guard.get_mut(key) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                guard.remove(key);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConversationKey, HashMap<u64, SnapshotSender>>> {
        self.by_key.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Live, ordered snapshots of one conversation.
///
/// The first item is the state at subscribe time; every later item follows a
/// mutation of the same conversation. After [`Subscription::unsubscribe`] (or
/// drop) nothing more is yielded, including snapshots already in flight.
pub struct Subscription {
    key: ConversationKey,
    id: u64,
    receiver: mpsc::UnboundedReceiver<Vec<Message>>,
    registry: Weak<SubscriberRegistry>,
    active: bool,
}

impl Subscription {
    pub fn conversation_key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub async fn next_snapshot(&mut self) -> Option<Vec<Message>> {
        if !self.active {
            return None;
        }
        let snapshot = self.receiver.recv().await;
        if self.active {
            snapshot
        } else {
            None
        }
    }

    /// Most recent buffered snapshot, skipping older ones, without waiting.
    pub fn latest_buffered(&mut self) -> Option<Vec<Message>> {
        if !self.active {
            return None;
        }
        let mut latest = None;
        while let Ok(snapshot) = self.receiver.try_recv() {
            latest = Some(snapshot);
        }
        latest
    }

    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.key, self.id);
        }
        self.receiver.close();
        while self.receiver.try_recv().is_ok() {}
        debug!(conversation = %self.key, subscriber_id = self.id, "store: subscriber removed");
    }
}

impl Stream for Subscription {
    type Item = Vec<Message>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if !this.active {
            return Poll::Ready(None);
        }
        this.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
