use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use shared::domain::ParticipantId;
use storage::MessageStore;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

pub mod channel;
pub mod clock;
pub mod config;
pub mod retry;
pub mod session;
pub mod sync_engine;
pub mod transport;
pub mod view;

pub use channel::{ChannelError, ChannelLifecycle, ChannelState, RealtimeChannel};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_settings, prepare_database_url, Settings};
pub use retry::RetryPolicy;
pub use session::{
    AuthProvider, Credentials, SessionCoordinator, SessionEvent, SessionState, StaticAuthProvider,
};
pub use sync_engine::{
    InboundMessage, InboundOutcome, OutboundReceipt, SyncConfig, SyncEngine, SyncEvent,
};
pub use transport::{RelayConnector, RelayLink, WebSocketConnector};
pub use view::{ConversationView, LiveConversationView, MessageGroup, ViewSnapshot};

/// Store, channel, session and engine wired together for one signed-in device.
pub struct SyncClient {
    pub store: MessageStore,
    pub channel: Arc<RealtimeChannel>,
    pub session: Arc<SessionCoordinator>,
    pub engine: Arc<SyncEngine>,
    relay_url: String,
}

impl SyncClient {
    pub async fn open(settings: &Settings, auth: Arc<dyn AuthProvider>) -> Result<Self> {
        Self::with_parts(
            settings,
            auth,
            Arc::new(WebSocketConnector),
            Arc::new(SystemClock::new()),
        )
        .await
    }

    pub async fn with_parts(
        settings: &Settings,
        auth: Arc<dyn AuthProvider>,
        connector: Arc<dyn RelayConnector>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let database_url = prepare_database_url(&settings.database_url)?;
        let store = MessageStore::new(&database_url)
            .await
            .with_context(|| format!("failed to open message store at '{database_url}'"))?;

        let channel = RealtimeChannel::new(connector, settings.reconnect_policy());
        let session = SessionCoordinator::new(Arc::clone(&channel), auth);
        let engine = SyncEngine::new(
            store.clone(),
            Arc::clone(&channel),
            Arc::clone(&session),
            clock,
            SyncConfig::from(settings),
        );
        session.start();
        engine.start();

        Ok(Self {
            store,
            channel,
            session,
            engine,
            relay_url: settings.relay_url.clone(),
        })
    }

    pub fn connect(&self) {
        info!(relay_url = %self.relay_url, "client: connecting to relay");
        self.channel.connect(self.relay_url.clone());
    }

    /// Connects and waits for the relay to accept the registration. Fails on
    /// `login_error` or once the channel gives up reconnecting.
    pub async fn connect_and_sign_in(&self) -> Result<ParticipantId> {
        let mut session_events = self.session.events();
        let mut lifecycle = self.channel.lifecycle();
        self.connect();
        loop {
            tokio::select! {
                event = session_events.recv() => match event {
                    Ok(SessionEvent::Authenticated(identity)) => return Ok(identity),
                    Ok(SessionEvent::RegistrationRejected(reason)) => {
                        return Err(anyhow!("sign-in rejected: {reason}"));
                    }
                    Ok(SessionEvent::SignedOut) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "client: session events lagged during sign-in");
                    }
                    Err(RecvError::Closed) => return Err(anyhow!("session closed before sign-in")),
                },
                event = lifecycle.recv() => match event {
                    Ok(ChannelLifecycle::GaveUp { attempts }) => {
                        return Err(anyhow!("relay unreachable after {attempts} attempts"));
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return Err(anyhow!("relay channel closed before sign-in")),
                },
            }
        }
    }

    pub fn shutdown(&self) {
        self.engine.stop();
        self.session.stop();
        self.channel.disconnect();
        info!("client: shut down");
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
