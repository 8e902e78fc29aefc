use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use shared::domain::{
    normalize_label, ConversationKey, DeliveryState, Direction, Message, MessageId, NewMessage,
    ParticipantId,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

mod subscription;

pub use subscription::Subscription;
use subscription::SubscriberRegistry;

const MESSAGE_COLUMNS: &str = "id, participant_low, participant_high, sender, receiver, content, direction, timestamp_ms, label, delivery";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage fault: {0}")]
    StorageFault(#[from] sqlx::Error),
    #[error("message {0} not found")]
    NotFound(i64),
    #[error("corrupt row for message {id}: {reason}")]
    CorruptRow { id: i64, reason: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

type KeyLocks = Arc<Mutex<HashMap<ConversationKey, Arc<tokio::sync::Mutex<()>>>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Message),
    /// An equivalent row already exists within the dedup window.
    Duplicate,
}

/// Durable, per-conversation ordered message storage with live subscriptions.
#[derive(Clone)]
pub struct MessageStore {
    pool: Pool<Sqlite>,
    key_locks: KeyLocks,
    subscribers: Arc<SubscriberRegistry>,
}

impl MessageStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_max_connections(database_url, 5).await
    }

    pub async fn with_max_connections(database_url: &str, max_connections: u32) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let mut connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite database url '{database_url}'"))?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        // In-memory databases live in a shared cache that reports table locks
        // instead of waiting on them, so they get a single connection.
        let max_connections = if sqlite_path(database_url).is_some() {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
            max_connections.max(1)
        } else {
            1
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open sqlite database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to apply message store migrations")?;
        info!(%database_url, "store: opened message store");

        Ok(Self {
            pool,
            key_locks: Arc::new(Mutex::new(HashMap::new())),
            subscribers: Arc::new(SubscriberRegistry::default()),
        })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn insert(&self, message: NewMessage) -> StoreResult<Message> {
        let key = message.conversation_key();
        let _guard = self.lock_key(&key).await;

        let stored = self.insert_locked(&key, message).await?;
        self.publish_locked(&key).await;
        Ok(stored)
    }

    /// Dedup check and insert as one step with respect to other writers of the
    /// same conversation.
    pub async fn insert_unless_duplicate(
        &self,
        message: NewMessage,
        window: Duration,
    ) -> StoreResult<InsertOutcome> {
        let key = message.conversation_key();
        let _guard = self.lock_key(&key).await;

        if self
            .exists_duplicate(
                &key,
                &message.sender,
                &message.content,
                message.timestamp_ms,
                window,
            )
            .await?
        {
            debug!(
                conversation = %key,
                sender = %message.sender,
                timestamp_ms = message.timestamp_ms,
                "store: duplicate suppressed"
            );
            return Ok(InsertOutcome::Duplicate);
        }

        let stored = self.insert_locked(&key, message).await?;
        self.publish_locked(&key).await;
        Ok(InsertOutcome::Inserted(stored))
    }

    pub async fn update_label(&self, id: MessageId, label: Option<&str>) -> StoreResult<Message> {
        let label = normalize_label(label);
        let key = self.locate(id).await?;
        let _guard = self.lock_key(&key).await;

        let updated = sqlx::query("UPDATE messages SET label = ? WHERE id = ?")
            .bind(label.as_deref())
            .bind(id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(id.0));
        }
        let message = self.get(id).await?.ok_or(StoreError::NotFound(id.0))?;
        debug!(message_id = id.0, has_label = label.is_some(), "store: label updated");
        self.publish_locked(&key).await;
        Ok(message)
    }

    pub async fn mark_delivered(&self, id: MessageId) -> StoreResult<Message> {
        let key = self.locate(id).await?;
        let _guard = self.lock_key(&key).await;

        let updated = sqlx::query("UPDATE messages SET delivery = ? WHERE id = ? AND delivery <> ?")
            .bind(DeliveryState::Delivered.as_str())
            .bind(id.0)
            .bind(DeliveryState::Delivered.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        let message = self.get(id).await?.ok_or(StoreError::NotFound(id.0))?;
        if updated > 0 {
            self.publish_locked(&key).await;
        }
        Ok(message)
    }

    pub async fn get(&self, id: MessageId) -> StoreResult<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    /// All messages of `key`, ordered by `(timestamp_ms, id)`.
    pub async fn query(&self, key: &ConversationKey) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE participant_low = ? AND participant_high = ?
             ORDER BY timestamp_ms ASC, id ASC"
        ))
        .bind(key.low().as_str())
        .bind(key.high().as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    pub async fn subscribe(&self, key: &ConversationKey) -> StoreResult<Subscription> {
        let _guard = self.lock_key(key).await;

        let snapshot = self.query(key).await?;
        let (subscription, tx) = self.subscribers.register(key.clone());
        let _ = tx.send(snapshot);
        Ok(subscription)
    }

    pub fn subscriber_count(&self, key: &ConversationKey) -> usize {
        self.subscribers.count(key)
    }

    /// True when a message with the same sender, receiver and content exists with a
    /// timestamp within `window` of `timestamp_ms`.
    pub async fn exists_duplicate(
        &self,
        key: &ConversationKey,
        sender: &ParticipantId,
        content: &str,
        timestamp_ms: i64,
        window: Duration,
    ) -> StoreResult<bool> {
        let Some(receiver) = key.peer_of(sender) else {
            return Ok(false);
        };
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let found: i64 = sqlx::query_scalar(
            "SELECT EXISTS(
                 SELECT 1 FROM messages
                 WHERE participant_low = ? AND participant_high = ?
                   AND sender = ? AND receiver = ? AND content = ?
                   AND timestamp_ms BETWEEN ? AND ?
             )",
        )
        .bind(key.low().as_str())
        .bind(key.high().as_str())
        .bind(sender.as_str())
        .bind(receiver.as_str())
        .bind(content)
        .bind(timestamp_ms.saturating_sub(window_ms))
        .bind(timestamp_ms.saturating_add(window_ms))
        .fetch_one(&self.pool)
        .await?;
        Ok(found != 0)
    }

    /// Outbound messages of `sender` the relay has not accepted yet, oldest first.
    pub async fn pending_outbound(&self, sender: &ParticipantId) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE sender = ? AND direction = ? AND delivery = ?
             ORDER BY timestamp_ms ASC, id ASC"
        ))
        .bind(sender.as_str())
        .bind(Direction::Outbound.as_str())
        .bind(DeliveryState::Pending.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Peers `participant` has exchanged messages with, most recently active first.
    pub async fn conversation_partners(
        &self,
        participant: &ParticipantId,
    ) -> StoreResult<Vec<ParticipantId>> {
        let rows = sqlx::query(
            "SELECT CASE WHEN sender = ? THEN receiver ELSE sender END AS peer,
                    MAX(timestamp_ms) AS last_activity
             FROM messages
             WHERE sender = ? OR receiver = ?
             GROUP BY peer
             ORDER BY last_activity DESC, peer ASC",
        )
        .bind(participant.as_str())
        .bind(participant.as_str())
        .bind(participant.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ParticipantId(r.get::<String, _>(0)))
            .collect())
    }

    async fn insert_locked(&self, key: &ConversationKey, message: NewMessage) -> StoreResult<Message> {
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO messages (participant_low, participant_high, sender, receiver, content, direction, timestamp_ms, label, delivery)
             VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?)
             RETURNING id",
        )
        .bind(key.low().as_str())
        .bind(key.high().as_str())
        .bind(message.sender.as_str())
        .bind(message.receiver.as_str())
        .bind(message.content.as_str())
        .bind(message.direction.as_str())
        .bind(message.timestamp_ms)
        .bind(message.delivery.as_str())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        let id = MessageId(rec.get::<i64, _>(0));
        debug!(
            conversation = %key,
            message_id = id.0,
            direction = message.direction.as_str(),
            "store: message inserted"
        );
        Ok(Message {
            id,
            conversation_key: key.clone(),
            sender: message.sender,
            receiver: message.receiver,
            content: message.content,
            direction: message.direction,
            timestamp_ms: message.timestamp_ms,
            label: None,
            delivery: message.delivery,
        })
    }

    /// Must be called with the key lock held so snapshots go out in commit order.
    /// The mutation is already committed, so a failed snapshot read is only logged.
    async fn publish_locked(&self, key: &ConversationKey) {
        if !self.subscribers.has_subscribers(key) {
            return;
        }
        match self.query(key).await {
            Ok(snapshot) => self.subscribers.publish(key, &snapshot),
            Err(error) => warn!(conversation = %key, %error, "store: failed to read snapshot for subscribers"),
        }
    }

    async fn locate(&self, id: MessageId) -> StoreResult<ConversationKey> {
        let row = sqlx::query("SELECT participant_low, participant_high FROM messages WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id.0))?;
        Ok(ConversationKey::new(
            ParticipantId(row.get::<String, _>(0)),
            ParticipantId(row.get::<String, _>(1)),
        ))
    }

    async fn lock_key(&self, key: &ConversationKey) -> KeyGuard {
        let lock = {
            let mut locks = self
                .key_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        KeyGuard {
            key: key.clone(),
            guard: Some(lock.lock_owned().await),
            locks: Arc::clone(&self.key_locks),
        }
    }
}

/// Write lock for one conversation. The map entry is removed on release when
/// no other writer holds or awaits it.
struct KeyGuard {
    key: ConversationKey,
    guard: Option<OwnedMutexGuard<()>>,
    locks: KeyLocks,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

fn message_from_row(row: &SqliteRow) -> StoreResult<Message> {
    let id = row.try_get::<i64, _>("id")?;
    let direction_raw = row.try_get::<String, _>("direction")?;
    let direction = Direction::parse(&direction_raw).ok_or_else(|| StoreError::CorruptRow {
        id,
        reason: format!("unknown direction '{direction_raw}'"),
    })?;
    let delivery_raw = row.try_get::<String, _>("delivery")?;
    let delivery = DeliveryState::parse(&delivery_raw).ok_or_else(|| StoreError::CorruptRow {
        id,
        reason: format!("unknown delivery state '{delivery_raw}'"),
    })?;

    Ok(Message {
        id: MessageId(id),
        conversation_key: ConversationKey::new(
            ParticipantId(row.try_get::<String, _>("participant_low")?),
            ParticipantId(row.try_get::<String, _>("participant_high")?),
        ),
        sender: ParticipantId(row.try_get::<String, _>("sender")?),
        receiver: ParticipantId(row.try_get::<String, _>("receiver")?),
        content: row.try_get::<String, _>("content")?,
        direction,
        timestamp_ms: row.try_get::<i64, _>("timestamp_ms")?,
        label: row.try_get::<Option<String>, _>("label")?,
        delivery,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
