use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{
        header::{COOKIE, SET_COOKIE, USER_AGENT},
        HeaderMap, HeaderValue, Uri,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::identity;
use crate::registry::PeerRegistry;
use crate::session::Peer;
use crate::signaling::{
    generate_peer_id, DisplayNameInfo, Envelope, FrameKind, Outbound, PeerName, ServerEvent,
};

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        if let Some(value) = pair
            .trim()
            .strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('='))
        {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Upgrade handler for `/server/webrtc`. The durable peer id comes from the
/// `peerid` cookie when the client presents one; otherwise a fresh id is
/// minted and set on the upgrade response so reconnects keep their identity.
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    uri: Uri,
    headers: HeaderMap,
    State(registry): State<Arc<PeerRegistry>>,
) -> Response {
    let (peer_id, minted) = match cookie_value(&headers, "peerid") {
        Some(id) => (id, false),
        None => (generate_peer_id(), true),
    };

    let ip = identity::resolve_ip(&headers, remote_addr);
    let rtc_supported = uri.to_string().contains("webrtc");
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let name = identity::peer_name(user_agent, &peer_id);

    let cookie = minted
        .then(|| {
            HeaderValue::from_str(&format!("peerid={};SameSite=Strict;Secure", peer_id)).ok()
        })
        .flatten();

    let mut response =
        ws.on_upgrade(move |socket| handle_socket(socket, registry, peer_id, ip, rtc_supported, name));
    if let Some(cookie) = cookie {
        response.headers_mut().append(SET_COOKIE, cookie);
    }
    response
}

/// Drive one connection for its lifetime: a writer task serializing this
/// peer's outbound frames, a keepalive loop, and the inbound read loop. Every
/// exit path converges on the registry's idempotent `leave`.
async fn handle_socket(
    socket: WebSocket,
    registry: Arc<PeerRegistry>,
    id: String,
    ip: String,
    rtc_supported: bool,
    name: PeerName,
) {
    let (mut sink, mut stream) = socket.split();
    let (peer, mut rx) = Peer::new(id, ip, rtc_supported, name);

    let writer_id = peer.id.clone();
    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out.to_text() {
                Some(Ok(text)) => {
                    // Best effort: a failed write drops this one frame, the
                    // session stays up until its keepalive gives up on it.
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        warn!(peer = %writer_id, %err, "websocket send failed");
                    }
                }
                Some(Err(err)) => {
                    warn!(peer = %writer_id, %err, "failed to encode outbound frame");
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    registry.join(&peer);
    peer.send_event(ServerEvent::DisplayName {
        message: DisplayNameInfo {
            display_name: peer.name.display_name.clone(),
            device_name: peer.name.device_name.clone(),
        },
    });
    tokio::spawn(registry.clone().keep_alive(peer.clone()));

    let cancelled = peer.cancellation();
    loop {
        tokio::select! {
            _ = cancelled.cancelled() => break,
            frame = stream.next() => {
                // Read failure and stream end are implicit disconnects.
                let Some(Ok(message)) = frame else { break };
                match message {
                    Message::Text(text) => {
                        if handle_frame(&registry, &peer, &text).is_break() {
                            break;
                        }
                    }
                    Message::Binary(data) => {
                        if let Ok(text) = String::from_utf8(data) {
                            if handle_frame(&registry, &peer, &text).is_break() {
                                break;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    registry.leave(&peer);
    // leave() is a no-op for a session already evicted (or replaced by a
    // reconnect), so close explicitly to let the writer task finish.
    peer.close();
    debug!(peer = %peer.id, "websocket disconnected");
    let _ = writer.await;
}

/// Dispatch one inbound frame. Named types act on the registries; any frame
/// carrying a `to` field additionally relays to the addressed peer in the
/// sender's room, restamped with `sender` in place of `to`.
fn handle_frame(
    registry: &Arc<PeerRegistry>,
    peer: &Arc<Peer>,
    text: &str,
) -> ControlFlow<()> {
    let frame: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            warn!(peer = %peer.id, %err, "dropping malformed frame");
            return ControlFlow::Continue(());
        }
    };
    let envelope = Envelope::of(&frame);

    let mut close = false;
    match envelope.kind {
        Some(FrameKind::Disconnect) => {
            registry.leave(peer);
            close = true;
        }
        Some(FrameKind::Pong) => {
            peer.beat();
            if let Some(board) = envelope.board.as_deref().filter(|board| !board.is_empty()) {
                registry.record_board_presence(peer, board);
            }
        }
        Some(FrameKind::BoardUpdate) => {
            peer.beat();
            let board = peer.board();
            if !board.is_empty() {
                registry.fan_out_board_update(&board, &peer.id);
            }
        }
        Some(
            FrameKind::Ping
            | FrameKind::Peers
            | FrameKind::PeerJoined
            | FrameKind::PeerLeft
            | FrameKind::DisplayName,
        ) => {
            debug!(peer = %peer.id, "ignoring server-originated frame type from client");
        }
        Some(FrameKind::Other) | None => {}
    }

    if let Some(to) = envelope.to {
        let mut frame = frame;
        if let Some(object) = frame.as_object_mut() {
            object.remove("to");
            object.insert("sender".to_string(), Value::String(peer.id.clone()));
        }
        registry.relay(peer, &to, frame);
    }

    if close {
        ControlFlow::Break(())
    } else {
        ControlFlow::Continue(())
    }
}
