use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, RwLock},
};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use shared::{error::SyncError, protocol::RelayFrame};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    retry::RetryPolicy,
    transport::{RelayConnector, RelayLink},
};

const LIFECYCLE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connection transitions, broadcast to every lifecycle listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLifecycle {
    /// Emitted once per physical connection. `generation` increases by one for
    /// every connection; `reconnect` is false only for the first one.
    Connected { generation: u64, reconnect: bool },
    /// Emitted once when the connection of `generation` is lost or closed.
    Disconnected { generation: u64 },
    /// The reconnect budget is spent; `connect` must be called again.
    GaveUp { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("not connected to relay")]
    NotConnected,
    #[error("failed to encode payload for '{event}': {source}")]
    Encode {
        event: String,
        source: serde_json::Error,
    },
}

impl From<ChannelError> for SyncError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::NotConnected => SyncError::not_connected(err.to_string()),
            ChannelError::Encode { .. } => SyncError::validation(err.to_string()),
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, payload: Value);
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, payload: Value) {
        self(payload).await
    }
}

/// The single logical connection to the relay.
///
/// Frames are dispatched to handlers on the driver task, one at a time and in
/// receipt order. Lost connections are re-established with exponential backoff.
pub struct RealtimeChannel {
    connector: Arc<dyn RelayConnector>,
    policy: RetryPolicy,
    state: watch::Sender<ChannelState>,
    lifecycle: broadcast::Sender<ChannelLifecycle>,
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
    inner: Mutex<ChannelInner>,
}

#[derive(Default)]
struct ChannelInner {
    outbound: Option<mpsc::UnboundedSender<RelayFrame>>,
    driver: Option<JoinHandle<()>>,
    generation: u64,
}

impl RealtimeChannel {
    pub fn new(connector: Arc<dyn RelayConnector>, policy: RetryPolicy) -> Arc<Self> {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        Arc::new(Self {
            connector,
            policy,
            state,
            lifecycle,
            handlers: RwLock::new(HashMap::new()),
            inner: Mutex::new(ChannelInner::default()),
        })
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    pub fn lifecycle(&self) -> broadcast::Receiver<ChannelLifecycle> {
        self.lifecycle.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.lock_inner().outbound.is_some()
    }

    /// Generation of the current or most recent connection; zero before the first.
    pub fn generation(&self) -> u64 {
        self.lock_inner().generation
    }

    /// Starts the connection driver. A no-op while one is already running.
    pub fn connect(self: &Arc<Self>, endpoint: impl Into<String>) {
        let mut inner = self.lock_inner();
        if inner.driver.as_ref().is_some_and(|driver| !driver.is_finished()) {
            debug!("channel: connect ignored, driver already running");
            return;
        }
        let endpoint = endpoint.into();
        self.state.send_replace(ChannelState::Connecting);
        let channel = Arc::clone(self);
        inner.driver = Some(tokio::spawn(channel.drive(endpoint)));
    }

    /// Stops reconnecting and closes the current connection. Idempotent.
    pub fn disconnect(&self) {
        let driver = {
            let mut inner = self.lock_inner();
            self.detach_locked(&mut inner);
            inner.driver.take()
        };
        if let Some(driver) = driver {
            driver.abort();
            info!("channel: disconnected by request");
        }
        self.state.send_replace(ChannelState::Disconnected);
    }

    pub fn send<T: Serialize>(&self, event: &str, payload: &T) -> Result<(), ChannelError> {
        let frame = RelayFrame::encode(event, payload).map_err(|source| ChannelError::Encode {
            event: event.to_string(),
            source,
        })?;
        let inner = self.lock_inner();
        let outbound = inner.outbound.as_ref().ok_or(ChannelError::NotConnected)?;
        outbound
            .send(frame)
            .map_err(|_| ChannelError::NotConnected)?;
        debug!(event, generation = inner.generation, "channel: frame sent");
        Ok(())
    }

    /// Registers the handler for `event`, replacing any previous one.
    pub fn on(&self, event: impl Into<String>, handler: impl EventHandler + 'static) {
        let event = event.into();
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(event.clone(), Arc::new(handler))
            .is_some();
        debug!(%event, replaced, "channel: handler registered");
    }

    pub fn off(&self, event: &str) {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(event);
    }

    async fn drive(self: Arc<Self>, endpoint: String) {
        let mut failures = 0_u32;
        let mut connected_before = false;
        loop {
            self.state.send_replace(ChannelState::Connecting);
            match self.connector.connect(&endpoint).await {
                Ok(RelayLink { outbound, inbound }) => {
                    failures = 0;
                    let generation = self.attach(outbound);
                    info!(%endpoint, generation, reconnect = connected_before, "channel: connected");
                    let _ = self.lifecycle.send(ChannelLifecycle::Connected {
                        generation,
                        reconnect: connected_before,
                    });
                    connected_before = true;

                    self.pump(inbound).await;

                    {
                        let mut inner = self.lock_inner();
                        if inner.generation == generation {
                            self.detach_locked(&mut inner);
                        }
                    }
                    warn!(%endpoint, generation, "channel: connection lost");
                }
                Err(err) => {
                    failures += 1;
                    warn!(%endpoint, attempt = failures, error = %err, "channel: connect failed");
                    if !self.policy.allows_retry(failures) {
                        self.state.send_replace(ChannelState::Disconnected);
                        let _ = self
                            .lifecycle
                            .send(ChannelLifecycle::GaveUp { attempts: failures });
                        warn!(%endpoint, attempts = failures, "channel: giving up on relay");
                        return;
                    }
                    self.state.send_replace(ChannelState::Disconnected);
                }
            }
            let delay = self.policy.delay_for_attempt(failures.saturating_sub(1));
            debug!(delay_ms = delay.as_millis() as u64, "channel: reconnect scheduled");
            tokio::time::sleep(delay).await;
        }
    }

    async fn pump(&self, mut inbound: mpsc::UnboundedReceiver<RelayFrame>) {
        while let Some(frame) = inbound.recv().await {
            let handler = self
                .handlers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(&frame.event)
                .cloned();
            match handler {
                Some(handler) => handler.handle(frame.payload).await,
                None => debug!(event = %frame.event, "channel: no handler for frame"),
            }
        }
    }

    fn attach(&self, outbound: mpsc::UnboundedSender<RelayFrame>) -> u64 {
        let mut inner = self.lock_inner();
        inner.generation += 1;
        inner.outbound = Some(outbound);
        self.state.send_replace(ChannelState::Connected);
        inner.generation
    }

    /// Drops the outbound queue and announces the loss, at most once per generation.
    fn detach_locked(&self, inner: &mut ChannelInner) {
        if inner.outbound.take().is_some() {
            self.state.send_replace(ChannelState::Disconnected);
            let _ = self.lifecycle.send(ChannelLifecycle::Disconnected {
                generation: inner.generation,
            });
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
