use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Frame vocabulary of the signaling channel. Inbound frames are decoded into
/// this closed set exactly once; anything outside it is only meaningful as
/// relay payload (a frame carrying a `to` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Disconnect,
    Pong,
    BoardUpdate,
    Ping,
    Peers,
    PeerJoined,
    PeerLeft,
    DisplayName,
    Other,
}

impl FrameKind {
    pub fn from_wire(kind: &str) -> Self {
        match kind {
            "disconnect" => FrameKind::Disconnect,
            "pong" => FrameKind::Pong,
            "board-update" => FrameKind::BoardUpdate,
            "ping" => FrameKind::Ping,
            "peers" => FrameKind::Peers,
            "peer-joined" => FrameKind::PeerJoined,
            "peer-left" => FrameKind::PeerLeft,
            "display-name" => FrameKind::DisplayName,
            _ => FrameKind::Other,
        }
    }
}

/// The fields of an inbound frame the router acts on. The rest of the frame
/// stays in the raw JSON value and is forwarded untouched on relay.
#[derive(Debug)]
pub struct Envelope {
    pub kind: Option<FrameKind>,
    pub board: Option<String>,
    pub to: Option<String>,
}

impl Envelope {
    pub fn of(frame: &Value) -> Self {
        let field = |name: &str| {
            frame
                .get(name)
                .and_then(Value::as_str)
                .map(|s| s.to_string())
        };
        Self {
            kind: frame
                .get("type")
                .and_then(Value::as_str)
                .map(FrameKind::from_wire),
            board: field("board"),
            to: field("to"),
        }
    }
}

/// Peer metadata derived from the user agent at connection time.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerName {
    pub model: String,
    pub os: String,
    pub browser: String,
    pub device_type: String,
    pub device_name: String,
    pub display_name: String,
}

/// Public view of a peer, safe to broadcast to roommates. Never carries the
/// socket handle or the network identity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub id: String,
    pub rtc_supported: bool,
    pub name: PeerName,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayNameInfo {
    pub display_name: String,
    pub device_name: String,
}

/// Server-originated frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    DisplayName {
        message: DisplayNameInfo,
    },
    Peers {
        peers: Vec<PeerSummary>,
    },
    PeerJoined {
        peer: PeerSummary,
    },
    PeerLeft {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    BoardUpdate {
        board: String,
    },
    Ping {
        board: String,
    },
}

/// One queued outbound write for a peer. `Close` asks the writer task to
/// perform the close handshake and stop.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(ServerEvent),
    Relay(Value),
    Close,
}

impl Outbound {
    /// Wire text for the frame; `Close` carries no payload.
    pub fn to_text(&self) -> Option<serde_json::Result<String>> {
        match self {
            Outbound::Event(event) => Some(serde_json::to_string(event)),
            Outbound::Relay(frame) => Some(serde_json::to_string(frame)),
            Outbound::Close => None,
        }
    }
}

/// Generate a durable peer id for clients that do not present one.
pub fn generate_peer_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_reads_named_type_and_target_together() {
        let frame = json!({"type": "offer", "to": "peer-b", "sdp": "v=0"});
        let envelope = Envelope::of(&frame);
        assert_eq!(envelope.kind, Some(FrameKind::Other));
        assert_eq!(envelope.to.as_deref(), Some("peer-b"));
    }

    #[test]
    fn envelope_tolerates_missing_and_mistyped_fields() {
        let envelope = Envelope::of(&json!({"board": 7}));
        assert!(envelope.kind.is_none());
        assert!(envelope.board.is_none());
        assert!(envelope.to.is_none());
    }

    #[test]
    fn envelope_extracts_pong_board() {
        let envelope = Envelope::of(&json!({"type": "pong", "board": "abc123"}));
        assert_eq!(envelope.kind, Some(FrameKind::Pong));
        assert_eq!(envelope.board.as_deref(), Some("abc123"));
    }

    #[test]
    fn server_events_serialize_with_wire_tags() {
        let text = serde_json::to_string(&ServerEvent::PeerLeft {
            peer_id: "p1".into(),
        })
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "peer-left");
        assert_eq!(value["peerId"], "p1");

        let text = serde_json::to_string(&ServerEvent::BoardUpdate {
            board: "abc".into(),
        })
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "board-update");
        assert_eq!(value["board"], "abc");
    }

    #[test]
    fn peer_ids_are_unique() {
        assert_ne!(generate_peer_id(), generate_peer_id());
        assert_eq!(generate_peer_id().len(), 36);
    }
}
