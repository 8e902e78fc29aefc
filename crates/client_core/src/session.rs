use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, RwLock, Weak},
};

use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::ParticipantId,
    protocol::{events, reason_from_payload, RegisterRequest},
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::channel::{ChannelLifecycle, RealtimeChannel};

const SESSION_EVENT_CAPACITY: usize = 64;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Source of the signed-in user's credentials.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn credentials(&self) -> Option<Credentials>;
}

/// Holds credentials in memory; `set` followed by
/// [`SessionCoordinator::credentials_changed`] signs in or out.
#[derive(Debug, Default)]
pub struct StaticAuthProvider {
    credentials: RwLock<Option<Credentials>>,
}

impl StaticAuthProvider {
    pub fn new(credentials: Option<Credentials>) -> Self {
        Self {
            credentials: RwLock::new(credentials),
        }
    }

    pub fn set(&self, credentials: Option<Credentials>) {
        *self
            .credentials
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = credentials;
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn credentials(&self) -> Option<Credentials> {
        self.credentials
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub identity: Option<ParticipantId>,
    pub authenticated: bool,
}

impl SessionState {
    /// The identity, only while authenticated.
    pub fn authenticated_identity(&self) -> Option<&ParticipantId> {
        self.identity.as_ref().filter(|_| self.authenticated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Authenticated(ParticipantId),
    RegistrationRejected(String),
    SignedOut,
}

#[derive(Debug, Default)]
struct Registration {
    connected_generation: Option<u64>,
    registered_generation: Option<u64>,
    pending_identity: Option<ParticipantId>,
}

/// Binds the relay connection to the signed-in identity.
///
/// Sends exactly one `register` per physical connection and tracks the
/// resulting authentication state.
pub struct SessionCoordinator {
    channel: Arc<RealtimeChannel>,
    auth: Arc<dyn AuthProvider>,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    registration: Mutex<Registration>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SessionCoordinator {
    pub fn new(channel: Arc<RealtimeChannel>, auth: Arc<dyn AuthProvider>) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::default());
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Arc::new(Self {
            channel,
            auth,
            state,
            events,
            registration: Mutex::new(Registration::default()),
            listener: Mutex::new(None),
        })
    }

    /// Installs relay handlers and starts following the channel lifecycle.
    /// Call before `RealtimeChannel::connect` so the first connection is seen.
    pub fn start(self: &Arc<Self>) {
        let mut listener = self.listener.lock().unwrap_or_else(|p| p.into_inner());
        if listener.is_some() {
            return;
        }

        let weak = Arc::downgrade(self);
        self.channel.on(events::LOGIN_SUCCESS, move |_payload: Value| {
            let session = Weak::clone(&weak);
            async move {
                if let Some(session) = session.upgrade() {
                    session.on_login_success();
                }
            }
        });

        let weak = Arc::downgrade(self);
        self.channel.on(events::LOGIN_ERROR, move |payload: Value| {
            let session = Weak::clone(&weak);
            async move {
                if let Some(session) = session.upgrade() {
                    session.on_login_error(&payload);
                }
            }
        });

        let mut lifecycle = self.channel.lifecycle();
        let weak = Arc::downgrade(self);
        *listener = Some(tokio::spawn(async move {
            loop {
                let event = match lifecycle.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session: lifecycle listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.on_lifecycle(event).await;
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            listener.abort();
        }
        self.channel.off(events::LOGIN_SUCCESS);
        self.channel.off(events::LOGIN_ERROR);
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn identity(&self) -> Option<ParticipantId> {
        self.state.borrow().identity.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().authenticated
    }

    /// Re-reads credentials after the auth collaborator signals a change.
    pub async fn credentials_changed(&self) {
        match self.auth.credentials().await {
            Some(credentials) => {
                let generation = {
                    let registration = self.lock_registration();
                    registration.connected_generation
                };
                match generation {
                    Some(generation) => self.register_with(generation, credentials),
                    None => debug!("session: credentials updated while offline"),
                }
            }
            None => {
                {
                    // The relay session of the old identity ends here; a later
                    // sign-in on this connection registers again.
                    let mut registration = self.lock_registration();
                    registration.pending_identity = None;
                    registration.registered_generation = None;
                }
                self.state.send_replace(SessionState::default());
                let _ = self.events.send(SessionEvent::SignedOut);
                info!("session: signed out");
            }
        }
    }

    async fn on_lifecycle(&self, event: ChannelLifecycle) {
        match event {
            ChannelLifecycle::Connected { generation, reconnect } => {
                {
                    let mut registration = self.lock_registration();
                    registration.connected_generation = Some(generation);
                    registration.registered_generation = None;
                }
                debug!(generation, reconnect, "session: channel connected");
                match self.auth.credentials().await {
                    Some(credentials) => self.register_with(generation, credentials),
                    None => debug!(generation, "session: no credentials, skipping registration"),
                }
            }
            ChannelLifecycle::Disconnected { generation } => {
                {
                    let mut registration = self.lock_registration();
                    if registration.connected_generation == Some(generation) {
                        registration.connected_generation = None;
                        registration.registered_generation = None;
                    }
                }
                self.state.send_if_modified(|state| {
                    let was_authenticated = state.authenticated;
                    state.authenticated = false;
                    was_authenticated
                });
                debug!(generation, "session: channel disconnected");
            }
            ChannelLifecycle::GaveUp { attempts } => {
                warn!(attempts, "session: relay unreachable, session stays offline");
            }
        }
    }

    /// Sends `register` unless this connection already carried one for the
    /// same identity.
    fn register_with(&self, generation: u64, credentials: Credentials) {
        let identity = ParticipantId::new(credentials.username.clone());
        {
            let mut registration = self.lock_registration();
            if registration.connected_generation != Some(generation) {
                return;
            }
            if registration.registered_generation == Some(generation)
                && registration.pending_identity.as_ref() == Some(&identity)
            {
                return;
            }
            registration.registered_generation = Some(generation);
            registration.pending_identity = Some(identity.clone());
        }

        let switched = self.state.send_if_modified(|state| {
            if state.identity.as_ref().is_some_and(|current| current != &identity) {
                *state = SessionState::default();
                true
            } else {
                false
            }
        });
        if switched {
            info!(identity = %identity, "session: switching account");
        }

        let request = RegisterRequest {
            username: credentials.username,
            password: credentials.password,
        };
        match self.channel.send(events::REGISTER, &request) {
            Ok(()) => info!(generation, username = %request.username, "session: registration sent"),
            Err(err) => {
                let mut registration = self.lock_registration();
                if registration.registered_generation == Some(generation) {
                    registration.registered_generation = None;
                }
                warn!(generation, error = %err, "session: registration not sent");
            }
        }
    }

    fn on_login_success(&self) {
        let Some(identity) = self.lock_registration().pending_identity.clone() else {
            warn!("session: login_success without a pending registration");
            return;
        };
        self.state.send_replace(SessionState {
            identity: Some(identity.clone()),
            authenticated: true,
        });
        info!(identity = %identity, "session: authenticated");
        let _ = self.events.send(SessionEvent::Authenticated(identity));
    }

    fn on_login_error(&self, payload: &Value) {
        let reason = reason_from_payload(payload);
        {
            // A rejected registration may be retried on this connection with new credentials.
            let mut registration = self.lock_registration();
            registration.registered_generation = None;
        }
        self.state.send_modify(|state| state.authenticated = false);
        warn!(%reason, "session: registration rejected");
        let _ = self.events.send(SessionEvent::RegistrationRejected(reason));
    }

    fn lock_registration(&self) -> MutexGuard<'_, Registration> {
        self.registration
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
