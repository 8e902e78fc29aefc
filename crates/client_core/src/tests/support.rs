use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use shared::protocol::RelayFrame;
use tokio::{sync::mpsc, time::timeout};

use crate::{
    retry::RetryPolicy,
    transport::{RelayConnector, RelayLink},
};

pub(crate) const TEST_ENDPOINT: &str = "memory://relay";
const WAIT: Duration = Duration::from_secs(2);

pub(crate) fn fast_policy() -> RetryPolicy {
    RetryPolicy::new(5, 20, 3)
}

/// Relay transport living in the test process. Every successful `connect`
/// hands the relay side of the link to [`MemoryRelay::accept`].
pub(crate) struct MemoryConnector {
    accepted: mpsc::UnboundedSender<RelayPeer>,
    refusals: AtomicU32,
    attempts: AtomicU32,
}

pub(crate) struct MemoryRelay {
    accepted: mpsc::UnboundedReceiver<RelayPeer>,
}

pub(crate) fn memory_relay() -> (Arc<MemoryConnector>, MemoryRelay) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(MemoryConnector {
            accepted: tx,
            refusals: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        }),
        MemoryRelay { accepted: rx },
    )
}

impl MemoryConnector {
    pub(crate) fn refuse_next(&self, count: u32) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayConnector for MemoryConnector {
    async fn connect(&self, _endpoint: &str) -> Result<RelayLink> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            bail!("connection refused");
        }
        let (client_tx, from_client) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();
        if self
            .accepted
            .send(RelayPeer {
                from_client,
                to_client,
            })
            .is_err()
        {
            bail!("relay is gone");
        }
        Ok(RelayLink {
            outbound: client_tx,
            inbound: client_rx,
        })
    }
}

impl MemoryRelay {
    pub(crate) async fn accept(&mut self) -> RelayPeer {
        timeout(WAIT, self.accepted.recv())
            .await
            .expect("client connected in time")
            .expect("connector alive")
    }

    pub(crate) async fn expect_no_connection(&mut self, within: Duration) {
        assert!(
            timeout(within, self.accepted.recv()).await.is_err(),
            "unexpected connection"
        );
    }
}

/// Relay side of one physical connection. Dropping it drops the connection.
pub(crate) struct RelayPeer {
    from_client: mpsc::UnboundedReceiver<RelayFrame>,
    to_client: mpsc::UnboundedSender<RelayFrame>,
}

impl RelayPeer {
    pub(crate) async fn next_frame(&mut self) -> RelayFrame {
        timeout(WAIT, self.from_client.recv())
            .await
            .expect("frame in time")
            .expect("client link open")
    }

    /// Next frame named `event`, skipping others.
    pub(crate) async fn next_event(&mut self, event: &str) -> RelayFrame {
        loop {
            let frame = self.next_frame().await;
            if frame.event == event {
                return frame;
            }
        }
    }

    pub(crate) async fn expect_silence(&mut self, within: Duration) {
        if let Ok(Some(frame)) = timeout(within, self.from_client.recv()).await {
            panic!("unexpected frame from client: {frame:?}");
        }
    }

    pub(crate) fn push<T: Serialize>(&self, event: &str, payload: &T) {
        self.to_client
            .send(RelayFrame::encode(event, payload).expect("encode"))
            .expect("client still connected");
    }
}
