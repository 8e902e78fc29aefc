use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// Relay event names.
pub mod events {
    pub const PRIVATE_MESSAGE: &str = "private_message";
    pub const REGISTER: &str = "register";
    pub const LOGIN_SUCCESS: &str = "login_success";
    pub const LOGIN_ERROR: &str = "login_error";
    pub const SEARCH_USERS: &str = "search_users";
    pub const SEARCH_RESULTS: &str = "search_results";
}

/// One relay message: `{"event": "<name>", "payload": <json>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayFrame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl RelayFrame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    pub fn encode<T: Serialize>(event: impl Into<String>, payload: &T) -> serde_json::Result<Self> {
        Ok(Self::new(event, serde_json::to_value(payload)?))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingPrivateMessage {
    pub to: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingPrivateMessage {
    pub from: String,
    pub message: String,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for RegisterRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// `search_results` carries a bare array of identifiers.
pub type SearchResults = Vec<String>;

/// Relay error payloads are either a bare string or an arbitrary JSON value.
pub fn reason_from_payload(payload: &Value) -> String {
    match payload {
        Value::String(reason) => reason.clone(),
        Value::Null => "login failed".to_string(),
        other => other.to_string(),
    }
}
