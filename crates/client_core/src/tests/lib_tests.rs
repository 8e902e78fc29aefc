use std::time::Duration;

use serde_json::json;
use shared::{
    domain::{DeliveryState, ParticipantId},
    protocol::events,
};
use tokio::time::timeout;

use super::*;
use crate::test_support::memory_relay;

fn settings_for(database_url: String) -> Settings {
    Settings {
        relay_url: "memory://relay".into(),
        database_url,
        reconnect_base_delay_ms: 5,
        reconnect_max_delay_ms: 20,
        ..Settings::default()
    }
}

#[tokio::test]
async fn client_wires_store_channel_session_and_engine() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("client").join("messages.db");
    let settings = settings_for(db_path.to_string_lossy().to_string());
    let (connector, mut relay) = memory_relay();
    let auth = Arc::new(StaticAuthProvider::new(Some(Credentials::new("alice", "pw"))));

    let client = SyncClient::with_parts(&settings, auth, connector, Arc::new(ManualClock::new(42)))
        .await
        .expect("client");
    assert!(db_path.exists());

    client.connect();
    let mut peer = relay.accept().await;
    peer.next_event(events::REGISTER).await;
    peer.push(events::LOGIN_SUCCESS, &json!(null));
    let mut state = client.session.watch_state();
    timeout(Duration::from_secs(2), state.wait_for(|s| s.authenticated))
        .await
        .expect("authenticated in time")
        .expect("session alive");

    let receipt = client
        .engine
        .send(&ParticipantId::from("bob"), "hello")
        .await
        .expect("send");
    assert_eq!(receipt.delivery, DeliveryState::Delivered);
    assert_eq!(receipt.message.timestamp_ms, 42);
    peer.next_event(events::PRIVATE_MESSAGE).await;

    client.shutdown();
    assert_eq!(client.channel.state(), ChannelState::Disconnected);
    let queued = client
        .engine
        .send(&ParticipantId::from("bob"), "after shutdown")
        .await
        .expect("queued after shutdown");
    assert_eq!(queued.delivery, DeliveryState::Pending);
}

#[tokio::test]
async fn client_open_rejects_unusable_database_location() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let blocker = temp_root.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").expect("blocker file");
    let settings = settings_for(blocker.join("messages.db").to_string_lossy().to_string());
    let (connector, _relay) = memory_relay();

    let result = SyncClient::with_parts(
        &settings,
        Arc::new(StaticAuthProvider::default()),
        connector,
        Arc::new(SystemClock::new()),
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn sign_in_resolves_with_the_accepted_identity() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let settings = settings_for(temp_root.path().join("a.db").to_string_lossy().to_string());
    let (connector, mut relay) = memory_relay();
    let auth = Arc::new(StaticAuthProvider::new(Some(Credentials::new("alice", "pw"))));
    let client = SyncClient::with_parts(&settings, auth, connector, Arc::new(ManualClock::new(1)))
        .await
        .expect("client");

    let relay_side = tokio::spawn(async move {
        let mut peer = relay.accept().await;
        peer.next_event(events::REGISTER).await;
        peer.push(events::LOGIN_SUCCESS, &json!(null));
        peer
    });
    let identity = timeout(Duration::from_secs(2), client.connect_and_sign_in())
        .await
        .expect("signed in in time")
        .expect("signed in");
    assert_eq!(identity, ParticipantId::from("alice"));
    let _peer = relay_side.await.expect("relay side");
}

#[tokio::test]
async fn sign_in_fails_on_rejected_registration() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let settings = settings_for(temp_root.path().join("a.db").to_string_lossy().to_string());
    let (connector, mut relay) = memory_relay();
    let auth = Arc::new(StaticAuthProvider::new(Some(Credentials::new("alice", "wrong"))));
    let client = SyncClient::with_parts(&settings, auth, connector, Arc::new(ManualClock::new(1)))
        .await
        .expect("client");

    let relay_side = tokio::spawn(async move {
        let mut peer = relay.accept().await;
        peer.next_event(events::REGISTER).await;
        peer.push(events::LOGIN_ERROR, &json!("invalid password"));
        peer
    });
    let err = timeout(Duration::from_secs(2), client.connect_and_sign_in())
        .await
        .expect("sign-in settled in time")
        .expect_err("rejected");
    assert!(err.to_string().contains("invalid password"));
    let _peer = relay_side.await.expect("relay side");
}

#[tokio::test]
async fn sign_in_fails_when_the_relay_stays_unreachable() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let settings = Settings {
        reconnect_max_attempts: 2,
        ..settings_for(temp_root.path().join("a.db").to_string_lossy().to_string())
    };
    let (connector, _relay) = memory_relay();
    connector.refuse_next(2);
    let auth = Arc::new(StaticAuthProvider::new(Some(Credentials::new("alice", "pw"))));
    let client = SyncClient::with_parts(&settings, auth, connector, Arc::new(ManualClock::new(1)))
        .await
        .expect("client");

    let err = timeout(Duration::from_secs(2), client.connect_and_sign_in())
        .await
        .expect("sign-in settled in time")
        .expect_err("unreachable");
    assert!(err.to_string().contains("unreachable"));
}
