use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i64);

/// Opaque participant identifier. Validity is owned by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Unordered pair of participants partitioning message storage.
///
/// Stored in canonical order, so `new(a, b) == new(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    low: ParticipantId,
    high: ParticipantId,
}

impl ConversationKey {
    pub fn new(a: ParticipantId, b: ParticipantId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn low(&self) -> &ParticipantId {
        &self.low
    }

    pub fn high(&self) -> &ParticipantId {
        &self.high
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        &self.low == participant || &self.high == participant
    }

    /// The other side of the pair. A self-conversation returns the same participant.
    pub fn peer_of(&self, participant: &ParticipantId) -> Option<&ParticipantId> {
        if &self.low == participant {
            Some(&self.high)
        } else if &self.high == participant {
            Some(&self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.low, self.high)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "outbound" => Some(Direction::Outbound),
            "inbound" => Some(Direction::Inbound),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Persisted locally, not yet accepted by the relay.
    Pending,
    Delivered,
}

impl DeliveryState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Delivered => "delivered",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DeliveryState::Pending),
            "delivered" => Some(DeliveryState::Delivered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_key: ConversationKey,
    pub sender: ParticipantId,
    pub receiver: ParticipantId,
    pub content: String,
    pub direction: Direction,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub delivery: DeliveryState,
}

impl Message {
    pub fn is_pending_delivery(&self) -> bool {
        self.delivery == DeliveryState::Pending
    }
}

/// A message before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender: ParticipantId,
    pub receiver: ParticipantId,
    pub content: String,
    pub direction: Direction,
    pub timestamp_ms: i64,
    pub delivery: DeliveryState,
}

impl NewMessage {
    /// Locally authored message, persisted before the relay confirms it.
    pub fn outbound(
        sender: ParticipantId,
        receiver: ParticipantId,
        content: impl Into<String>,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            sender,
            receiver,
            content: content.into(),
            direction: Direction::Outbound,
            timestamp_ms,
            delivery: DeliveryState::Pending,
        }
    }

    pub fn inbound(
        sender: ParticipantId,
        receiver: ParticipantId,
        content: impl Into<String>,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            sender,
            receiver,
            content: content.into(),
            direction: Direction::Inbound,
            timestamp_ms,
            delivery: DeliveryState::Delivered,
        }
    }

    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(self.sender.clone(), self.receiver.clone())
    }
}

/// Blank labels mean "no label".
pub fn normalize_label(label: Option<&str>) -> Option<String> {
    label
        .filter(|value| !value.trim().is_empty())
        .map(str::to_string)
}
