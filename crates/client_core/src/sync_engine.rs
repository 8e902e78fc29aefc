use std::{
    collections::HashSet,
    sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, Weak},
    time::Duration,
};

use serde_json::Value;
use shared::{
    domain::{ConversationKey, DeliveryState, Message, MessageId, NewMessage, ParticipantId},
    error::{ErrorCode, SyncError},
    protocol::{events, IncomingPrivateMessage, OutgoingPrivateMessage, SearchResults},
};
use storage::{InsertOutcome, MessageStore, StoreError, Subscription};
use tokio::{
    sync::{broadcast, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    channel::RealtimeChannel,
    clock::Clock,
    config::Settings,
    retry::{retry_async, RetryPolicy},
    session::{SessionCoordinator, SessionEvent},
    view::LiveConversationView,
};

const SYNC_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: ParticipantId,
    pub message: String,
}

impl From<IncomingPrivateMessage> for InboundMessage {
    fn from(payload: IncomingPrivateMessage) -> Self {
        Self {
            from: ParticipantId::new(payload.from),
            message: payload.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Stored(Message),
    /// A retransmit of a message already stored within the dedup window.
    DuplicateSuppressed,
    /// No authenticated identity to key the message by; nothing was stored.
    SessionNotReady,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundReceipt {
    pub message: Message,
    pub delivery: DeliveryState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    MessageStored(Message),
    Delivered(MessageId),
    DuplicateSuppressed { from: ParticipantId },
    InboundRejected { from: ParticipantId },
    InboundFailed { from: ParticipantId, error: SyncError },
    ResendCompleted { resent: usize, remaining: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    pub dedup_window: Duration,
    pub storage_retry: RetryPolicy,
    pub search_timeout: Duration,
    pub resend_pending_on_reconnect: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for SyncConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            dedup_window: settings.dedup_window(),
            storage_retry: settings.storage_retry_policy(),
            search_timeout: settings.search_timeout(),
            resend_pending_on_reconnect: settings.resend_pending_on_reconnect,
        }
    }
}

/// Moves messages between the relay and the local store.
pub struct SyncEngine {
    store: MessageStore,
    channel: Arc<RealtimeChannel>,
    session: Arc<SessionCoordinator>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    events: broadcast::Sender<SyncEvent>,
    pending_search: Mutex<Option<oneshot::Sender<SearchResults>>>,
    search_in_flight: Mutex<()>,
    outbox_lock: Mutex<()>,
    /// Submitted messages whose `Delivered` state could not be written yet.
    unrecorded: StdMutex<HashSet<MessageId>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(
        store: MessageStore,
        channel: Arc<RealtimeChannel>,
        session: Arc<SessionCoordinator>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(SYNC_EVENT_CAPACITY);
        Arc::new(Self {
            store,
            channel,
            session,
            clock,
            config,
            events,
            pending_search: Mutex::new(None),
            search_in_flight: Mutex::new(()),
            outbox_lock: Mutex::new(()),
            unrecorded: StdMutex::new(HashSet::new()),
            tasks: StdMutex::new(Vec::new()),
        })
    }

    /// Installs the `private_message` and `search_results` handlers and, when
    /// enabled, the outbox flush that runs each time the session authenticates.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.channel.on(events::PRIVATE_MESSAGE, move |payload: Value| {
            let engine = Weak::clone(&weak);
            async move {
                if let Some(engine) = engine.upgrade() {
                    engine.on_private_message(payload).await;
                }
            }
        });

        let weak = Arc::downgrade(self);
        self.channel.on(events::SEARCH_RESULTS, move |payload: Value| {
            let engine = Weak::clone(&weak);
            async move {
                if let Some(engine) = engine.upgrade() {
                    engine.on_search_results(payload).await;
                }
            }
        });

        if self.config.resend_pending_on_reconnect {
            let mut session_events = self.session.events();
            let weak = Arc::downgrade(self);
            let task = tokio::spawn(async move {
                loop {
                    match session_events.recv().await {
                        Ok(SessionEvent::Authenticated(_)) => {}
                        Ok(_) => continue,
                        // A missed event may have been an authentication.
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "sync: session events lagged, flushing outbox");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                    let Some(engine) = weak.upgrade() else {
                        break;
                    };
                    if let Err(err) = engine.resend_pending().await {
                        warn!(error = %err, "sync: outbox flush failed");
                    }
                }
            });
            self.lock_tasks().push(task);
        }
    }

    pub fn stop(&self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        self.channel.off(events::PRIVATE_MESSAGE);
        self.channel.off(events::SEARCH_RESULTS);
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub async fn handle_inbound(&self, inbound: InboundMessage) -> Result<InboundOutcome, SyncError> {
        let state = self.session.state();
        let Some(me) = state.authenticated_identity().cloned() else {
            warn!(from = %inbound.from, "sync: inbound message before authentication, not stored");
            let _ = self.events.send(SyncEvent::InboundRejected { from: inbound.from });
            return Ok(InboundOutcome::SessionNotReady);
        };

        let from = inbound.from.clone();
        let message = NewMessage::inbound(inbound.from, me, inbound.message, self.clock.now_ms());
        match self
            .store
            .insert_unless_duplicate(message, self.config.dedup_window)
            .await
            .map_err(store_error)?
        {
            InsertOutcome::Inserted(stored) => {
                debug!(from = %from, message_id = stored.id.0, "sync: inbound stored");
                let _ = self.events.send(SyncEvent::MessageStored(stored.clone()));
                Ok(InboundOutcome::Stored(stored))
            }
            InsertOutcome::Duplicate => {
                debug!(from = %from, "sync: inbound duplicate suppressed");
                let _ = self.events.send(SyncEvent::DuplicateSuppressed { from });
                Ok(InboundOutcome::DuplicateSuppressed)
            }
        }
    }

    /// Persists first, then submits. A message that cannot be submitted stays
    /// `Pending` for the outbox.
    pub async fn send(&self, to: &ParticipantId, content: &str) -> Result<OutboundReceipt, SyncError> {
        if content.trim().is_empty() {
            return Err(SyncError::validation("message content must not be blank"));
        }
        let me = self.require_identity()?;

        // Held until submission so an outbox flush never sees this message half-sent.
        let _outbox = self.outbox_lock.lock().await;
        let stored = self
            .store
            .insert(NewMessage::outbound(me, to.clone(), content, self.clock.now_ms()))
            .await
            .map_err(store_error)?;
        let _ = self.events.send(SyncEvent::MessageStored(stored.clone()));

        let message = match self.deliver(&stored).await {
            Ok(delivered) => delivered,
            Err(err) if err.code == ErrorCode::NotConnected => {
                info!(to = %to, message_id = stored.id.0, reason = %err.message, "sync: message queued");
                stored
            }
            Err(err) => return Err(err),
        };
        Ok(OutboundReceipt {
            delivery: message.delivery,
            message,
        })
    }

    /// Re-submits every pending outbound message once, oldest first, stopping
    /// at the first transport failure. Returns how many were delivered.
    pub async fn resend_pending(&self) -> Result<usize, SyncError> {
        let _outbox = self.outbox_lock.lock().await;
        let me = self.require_identity()?;
        let pending = self
            .store
            .pending_outbound(&me)
            .await
            .map_err(store_error)?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut resent = 0;
        for message in &pending {
            match self.deliver(message).await {
                Ok(_) => resent += 1,
                Err(err) if err.code == ErrorCode::NotConnected => {
                    debug!(reason = %err.message, "sync: outbox flush interrupted");
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        let remaining = pending.len() - resent;
        info!(resent, remaining, "sync: outbox flushed");
        let _ = self
            .events
            .send(SyncEvent::ResendCompleted { resent, remaining });
        Ok(resent)
    }

    pub async fn update_label(&self, id: MessageId, label: Option<&str>) -> Result<Message, SyncError> {
        self.store.update_label(id, label).await.map_err(store_error)
    }

    pub async fn conversation(&self, peer: &ParticipantId) -> Result<Vec<Message>, SyncError> {
        let key = self.conversation_key(peer)?;
        self.store.query(&key).await.map_err(store_error)
    }

    pub async fn subscribe(&self, peer: &ParticipantId) -> Result<Subscription, SyncError> {
        let key = self.conversation_key(peer)?;
        self.store.subscribe(&key).await.map_err(store_error)
    }

    pub async fn view(&self, peer: &ParticipantId) -> Result<LiveConversationView, SyncError> {
        Ok(LiveConversationView::new(self.subscribe(peer).await?))
    }

    pub async fn conversation_partners(&self) -> Result<Vec<ParticipantId>, SyncError> {
        let me = self.require_identity()?;
        self.store
            .conversation_partners(&me)
            .await
            .map_err(store_error)
    }

    /// Local partners for a blank query, otherwise asks the relay's directory.
    pub async fn search_peers(&self, query: &str) -> Result<Vec<ParticipantId>, SyncError> {
        let query = query.trim();
        if query.is_empty() {
            return self.conversation_partners().await;
        }
        if !self.session.is_authenticated() {
            return Err(SyncError::not_authenticated("search requires a signed-in session"));
        }

        let _in_flight = self.search_in_flight.lock().await;
        let (tx, rx) = oneshot::channel();
        *self.pending_search.lock().await = Some(tx);

        if let Err(err) = self.channel.send(events::SEARCH_USERS, &query) {
            self.pending_search.lock().await.take();
            return Err(err.into());
        }

        let results = match tokio::time::timeout(self.config.search_timeout, rx).await {
            Ok(Ok(results)) => results,
            Ok(Err(_)) => return Err(SyncError::not_connected("search was cancelled")),
            Err(_) => {
                self.pending_search.lock().await.take();
                return Err(SyncError::not_connected("relay did not answer the search in time"));
            }
        };

        let me = self.session.identity();
        Ok(results
            .into_iter()
            .map(ParticipantId::new)
            .filter(|peer| Some(peer) != me.as_ref())
            .collect())
    }

    async fn on_private_message(&self, payload: Value) {
        let inbound: InboundMessage = match serde_json::from_value::<IncomingPrivateMessage>(payload) {
            Ok(payload) => payload.into(),
            Err(err) => {
                warn!(error = %err, "sync: malformed private_message ignored");
                return;
            }
        };

        let from = inbound.from.clone();
        let outcome = retry_async(
            &self.config.storage_retry,
            "store inbound message",
            |err: &SyncError| err.code == ErrorCode::StorageFault,
            || self.handle_inbound(inbound.clone()),
        )
        .await;
        if let Err(err) = outcome {
            error!(from = %from, error = %err, "sync: inbound message could not be stored");
            let _ = self.events.send(SyncEvent::InboundFailed { from, error: err });
        }
    }

    async fn on_search_results(&self, payload: Value) {
        let results = match serde_json::from_value::<SearchResults>(payload) {
            Ok(results) => results,
            Err(err) => {
                warn!(error = %err, "sync: malformed search_results ignored");
                return;
            }
        };
        match self.pending_search.lock().await.take() {
            Some(waiter) => {
                let _ = waiter.send(results);
            }
            None => debug!("sync: search_results without a pending search"),
        }
    }

    async fn deliver(&self, message: &Message) -> Result<Message, SyncError> {
        if !self.session.is_authenticated() {
            return Err(SyncError::not_connected("session is not authenticated"));
        }
        if !self.lock_unrecorded().contains(&message.id) {
            self.channel
                .send(
                    events::PRIVATE_MESSAGE,
                    &OutgoingPrivateMessage {
                        to: message.receiver.to_string(),
                        message: message.content.clone(),
                    },
                )
                .map_err(SyncError::from)?;
            debug!(message_id = message.id.0, to = %message.receiver, "sync: message submitted");
        }
        Ok(self.record_delivered(message).await)
    }

    /// The frame is already queued on the channel, so a storage failure here is
    /// not a send failure. The id is kept in memory and the write is retried by
    /// the next outbox flush instead of submitting the message again.
    async fn record_delivered(&self, message: &Message) -> Message {
        let recorded = retry_async(
            &self.config.storage_retry,
            "record delivery",
            |err: &StoreError| matches!(err, StoreError::StorageFault(_)),
            || self.store.mark_delivered(message.id),
        )
        .await;
        match recorded {
            Ok(delivered) => {
                self.lock_unrecorded().remove(&message.id);
                let _ = self.events.send(SyncEvent::Delivered(message.id));
                delivered
            }
            Err(err) => {
                error!(
                    message_id = message.id.0,
                    error = %err,
                    "sync: message submitted but delivery could not be recorded"
                );
                self.lock_unrecorded().insert(message.id);
                Message {
                    delivery: DeliveryState::Delivered,
                    ..message.clone()
                }
            }
        }
    }

    fn require_identity(&self) -> Result<ParticipantId, SyncError> {
        self.session
            .identity()
            .ok_or_else(|| SyncError::not_authenticated("no signed-in identity"))
    }

    fn conversation_key(&self, peer: &ParticipantId) -> Result<ConversationKey, SyncError> {
        Ok(ConversationKey::new(self.require_identity()?, peer.clone()))
    }

    fn lock_unrecorded(&self) -> StdMutexGuard<'_, HashSet<MessageId>> {
        self.unrecorded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_tasks(&self) -> StdMutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}

fn store_error(err: StoreError) -> SyncError {
    match err {
        StoreError::NotFound(id) => SyncError::not_found(format!("message {id} not found")),
        StoreError::StorageFault(_) | StoreError::CorruptRow { .. } => {
            SyncError::storage_fault(err.to_string())
        }
    }
}

#[cfg(test)]
#[path = "tests/sync_engine_tests.rs"]
mod tests;
