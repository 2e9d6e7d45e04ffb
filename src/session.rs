use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::signaling::{Outbound, PeerName, PeerSummary, ServerEvent};

/// One live, upgraded connection: resolved identity, durable peer token,
/// user-agent-derived names, and the liveness state its keepalive loop
/// watches. Outbound writes go through an unbounded channel consumed by a
/// single writer task, which serializes all sends to this peer.
pub struct Peer {
    pub id: String,
    pub ip: String,
    pub rtc_supported: bool,
    pub name: PeerName,
    board: Mutex<String>,
    last_beat: Mutex<Instant>,
    tx: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
}

impl Peer {
    /// Build a peer and hand back the receiving end of its outbound queue
    /// for the connection's writer task.
    pub fn new(
        id: String,
        ip: String,
        rtc_supported: bool,
        name: PeerName,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            id,
            ip,
            rtc_supported,
            name,
            board: Mutex::new(String::new()),
            last_beat: Mutex::new(Instant::now()),
            tx,
            cancel: CancellationToken::new(),
        });
        (peer, rx)
    }

    pub fn send_event(&self, event: ServerEvent) {
        self.send(Outbound::Event(event));
    }

    pub fn send_relay(&self, frame: Value) {
        self.send(Outbound::Relay(frame));
    }

    /// Ask the writer task to run the close handshake and stop.
    pub fn close(&self) {
        self.send(Outbound::Close);
    }

    fn send(&self, out: Outbound) {
        // Best effort: a closed channel means the writer task is already
        // gone, which only happens once the connection is down.
        if self.tx.send(out).is_err() {
            debug!(peer = %self.id, "dropping send to closed connection");
        }
    }

    pub fn board(&self) -> String {
        self.board.lock().clone()
    }

    pub fn set_board(&self, board: &str) {
        *self.board.lock() = board.to_string();
    }

    /// Record a liveness reply.
    pub fn beat(&self) {
        *self.last_beat.lock() = Instant::now();
    }

    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_beat.lock().elapsed() > timeout
    }

    /// Fires the one-shot cancellation for this peer's keepalive loop.
    /// Idempotent: cancelling an already-cancelled token is a no-op.
    pub fn cancel_keepalive(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            id: self.id.clone(),
            rtc_supported: self.rtc_supported,
            name: self.name.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Peer with a fabricated identity for registry tests.
    pub fn peer(id: &str, ip: &str) -> (Arc<Peer>, mpsc::UnboundedReceiver<Outbound>) {
        Peer::new(
            id.to_string(),
            ip.to_string(),
            true,
            PeerName {
                model: String::new(),
                os: "Linux".into(),
                browser: "Firefox".into(),
                device_type: "Other".into(),
                device_name: "Linux Firefox".into(),
                display_name: crate::identity::display_name(id),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_idempotent() {
        let (peer, _rx) = testing::peer("p1", "192.0.2.1");
        assert!(!peer.cancellation().is_cancelled());
        peer.cancel_keepalive();
        peer.cancel_keepalive();
        assert!(peer.cancellation().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn beat_refreshes_staleness() {
        let (peer, _rx) = testing::peer("p1", "192.0.2.1");
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(peer.is_stale(Duration::from_secs(60)));
        peer.beat();
        assert!(!peer.is_stale(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn sends_queue_in_order_for_one_peer() {
        let (peer, mut rx) = testing::peer("p1", "192.0.2.1");
        peer.send_event(ServerEvent::Ping { board: "a".into() });
        peer.send_event(ServerEvent::Ping { board: "b".into() });
        for expected in ["a", "b"] {
            match rx.recv().await {
                Some(Outbound::Event(ServerEvent::Ping { board })) => {
                    assert_eq!(board, expected)
                }
                other => panic!("unexpected outbound: {:?}", other),
            }
        }
    }
}
