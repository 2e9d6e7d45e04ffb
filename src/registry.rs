use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::session::Peer;
use crate::signaling::ServerEvent;

/// Liveness tuning for the per-peer keepalive loops. Probe period must stay
/// below the timeout so a peer survives at least one missed reply cycle.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub ping_interval: Duration,
    pub liveness_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(60),
        }
    }
}

/// Room and board bookkeeping for all live peers.
///
/// Rooms group peers by resolved network identity and scope both the roster
/// broadcasts and direct relay. The board index is a secondary, cross-room
/// view keyed by the board label a peer last reported; it exists only to fan
/// out change notifications.
///
/// Each map sits behind its own lock, and the two locks are never held at
/// once. Join/leave mutations and the broadcasts they trigger happen under
/// the room lock, so a joiner's roster snapshot is always consistent with the
/// joined/left events its roommates observe. Sends under the lock are
/// non-blocking channel pushes.
pub struct PeerRegistry {
    rooms: Mutex<HashMap<String, HashMap<String, Arc<Peer>>>>,
    boards: Mutex<HashMap<String, HashMap<String, HashSet<String>>>>,
    config: RegistryConfig,
}

impl PeerRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            boards: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Admit a peer into its identity's room, announce it to the other
    /// members, and reply to the peer with the current roster (excluding
    /// itself).
    pub fn join(&self, peer: &Arc<Peer>) {
        let mut rooms = self.rooms.lock();
        let room = rooms.entry(peer.ip.clone()).or_default();
        room.insert(peer.id.clone(), peer.clone());
        info!(ip = %peer.ip, id = %peer.id, "peer joined");

        let mut roster = Vec::with_capacity(room.len() - 1);
        for other in room.values() {
            if other.id != peer.id {
                other.send_event(ServerEvent::PeerJoined {
                    peer: peer.summary(),
                });
                roster.push(other.summary());
            }
        }
        peer.send_event(ServerEvent::Peers { peers: roster });
    }

    /// Evict a peer: stop its keepalive, close its connection, drop it from
    /// its room (and the room itself when emptied), tell the remaining
    /// members, and clear its board index entry. Idempotent — every
    /// disconnect path converges here, and only the first call acts.
    pub fn leave(&self, peer: &Arc<Peer>) {
        {
            let mut rooms = self.rooms.lock();
            let Some(room) = rooms.get_mut(&peer.ip) else {
                return;
            };
            // Membership is by session, not just id: a reconnect that reused
            // the id must not be evicted by its predecessor's cleanup.
            if !room
                .get(&peer.id)
                .is_some_and(|member| Arc::ptr_eq(member, peer))
            {
                return;
            }

            peer.cancel_keepalive();
            peer.close();
            room.remove(&peer.id);
            info!(ip = %peer.ip, id = %peer.id, "peer left");

            if room.is_empty() {
                rooms.remove(&peer.ip);
            } else {
                for other in room.values() {
                    other.send_event(ServerEvent::PeerLeft {
                        peer_id: peer.id.clone(),
                    });
                }
            }
        }

        let board = peer.board();
        if !board.is_empty() {
            let mut boards = self.boards.lock();
            Self::remove_board_entry(&mut boards, &board, &peer.ip, &peer.id);
        }
    }

    /// Record which board a peer is watching, reported via its liveness
    /// replies. A peer belongs to at most one board: switching labels removes
    /// the old index entry in the same critical section that adds the new
    /// one.
    pub fn record_board_presence(&self, peer: &Arc<Peer>, board: &str) {
        if board.is_empty() {
            return;
        }

        let mut boards = self.boards.lock();
        let previous = peer.board();
        if previous != board && !previous.is_empty() {
            Self::remove_board_entry(&mut boards, &previous, &peer.ip, &peer.id);
        }
        boards
            .entry(board.to_string())
            .or_default()
            .entry(peer.ip.clone())
            .or_default()
            .insert(peer.id.clone());
        peer.set_board(board);
        debug!(board = %board, ip = %peer.ip, id = %peer.id, "board presence recorded");
    }

    /// Notify every watcher of `board` except `exclude` that its content
    /// changed. Board membership intentionally spans rooms; the notification
    /// carries only the label and receivers re-fetch content themselves.
    pub fn fan_out_board_update(&self, board: &str, exclude: &str) {
        let watchers: Vec<(String, String)> = {
            let boards = self.boards.lock();
            let Some(members) = boards.get(board) else {
                return;
            };
            members
                .iter()
                .flat_map(|(ip, ids)| {
                    ids.iter()
                        .filter(|id| id.as_str() != exclude)
                        .map(move |id| (ip.clone(), id.clone()))
                })
                .collect()
        };
        if watchers.is_empty() {
            return;
        }

        let rooms = self.rooms.lock();
        for (ip, id) in watchers {
            if let Some(watcher) = rooms.get(&ip).and_then(|room| room.get(&id)) {
                watcher.send_event(ServerEvent::BoardUpdate {
                    board: board.to_string(),
                });
            }
        }
    }

    /// Forward an already-rewritten frame to a peer in the sender's own room.
    /// Unknown targets (including peers in other rooms) drop silently.
    pub fn relay(&self, from: &Arc<Peer>, to: &str, frame: Value) {
        let rooms = self.rooms.lock();
        match rooms.get(&from.ip).and_then(|room| room.get(to)) {
            Some(target) => target.send_relay(frame),
            None => debug!(from = %from.id, to = %to, "relay target not in sender's room"),
        }
    }

    /// Per-peer liveness loop: probe immediately, then each interval either
    /// evict the peer if its last reply is older than the timeout or probe
    /// again. The peer's cancellation token ends the loop at once.
    pub async fn keep_alive(self: Arc<Self>, peer: Arc<Peer>) {
        let cancelled = peer.cancellation();
        peer.send_event(ServerEvent::Ping { board: peer.board() });

        let mut ticker = tokio::time::interval(self.config.ping_interval);
        ticker.tick().await; // the first tick resolves immediately

        loop {
            tokio::select! {
                _ = cancelled.cancelled() => return,
                _ = ticker.tick() => {
                    if peer.is_stale(self.config.liveness_timeout) {
                        warn!(ip = %peer.ip, id = %peer.id, "liveness timeout, evicting peer");
                        self.leave(&peer);
                        return;
                    }
                    peer.send_event(ServerEvent::Ping { board: peer.board() });
                }
            }
        }
    }

    fn remove_board_entry(
        boards: &mut HashMap<String, HashMap<String, HashSet<String>>>,
        board: &str,
        ip: &str,
        id: &str,
    ) {
        let Some(members) = boards.get_mut(board) else {
            return;
        };
        if let Some(ids) = members.get_mut(ip) {
            ids.remove(id);
            if ids.is_empty() {
                members.remove(ip);
            }
        }
        if members.is_empty() {
            boards.remove(board);
        }
    }
}

#[cfg(test)]
impl PeerRegistry {
    /// Ids currently in the room for `ip`, if the room exists.
    pub fn room_ids(&self, ip: &str) -> Option<Vec<String>> {
        self.rooms
            .lock()
            .get(ip)
            .map(|room| room.keys().cloned().collect())
    }

    /// Number of (ip, id) pairs indexed under `board`.
    pub fn board_watchers(&self, board: &str) -> usize {
        self.boards
            .lock()
            .get(board)
            .map(|members| members.values().map(HashSet::len).sum())
            .unwrap_or(0)
    }
}
