use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Local, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::cache::{BoardCache, BoardMessage, CacheError};
use crate::identity::resolve_ip;

pub type SharedCache = Arc<BoardCache>;

/// Most snippets kept per board; older ones roll off.
const MAX_BOARD_MESSAGES: usize = 5;
/// Cap on concurrently live boards; the public board is exempt.
const MAX_BOARDS: usize = 30;
const PUBLIC_BOARD: &str = "public";

const ACTIVE_BOARD_TTL: Duration = Duration::from_secs(6 * 60 * 60);
const EMPTY_BOARD_TTL: Duration = Duration::from_secs(10 * 60);
const IP_BOARD_TTL: Duration = Duration::from_secs(48 * 60 * 60);

/// Uniform response envelope; failures ride in `code`/`message` with an
/// HTTP 200, infrastructure errors become a bare 500.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: u16,
    pub message: String,
    pub data: Option<T>,
}

fn success<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        code: 200,
        message: "success".to_string(),
        data: Some(data),
    })
}

fn failure<T: Serialize>(code: StatusCode, message: &str) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        code: code.as_u16(),
        message: message.to_string(),
        data: None,
    })
}

fn internal_error(err: CacheError) -> StatusCode {
    error!(%err, "cache operation failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardInfo {
    pub board: String,
    pub expire_at: String,
    pub messages: Vec<BoardMessage>,
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct DefaultBoard {
    pub board: String,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
}

/// GET /health
pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}

/// File snippets are uploaded as `<name>#data:<mime>;base64,<payload>`.
/// Returns (is_file, file_name, file_type, stored_content).
fn split_file_marker(content: &str) -> (bool, String, String, String) {
    if let Some((name, rest)) = content.rsplit_once("#data:") {
        if let Some((mime, payload)) = rest.rsplit_once(";base64,") {
            return (
                true,
                name.to_string(),
                mime.to_string(),
                payload.to_string(),
            );
        }
    }
    (
        false,
        String::new(),
        "text/plain".to_string(),
        content.to_string(),
    )
}

/// Listing view of a snippet: file payloads are withheld until downloaded.
fn redacted(message: &BoardMessage) -> BoardMessage {
    let mut copy = message.clone();
    if copy.is_file {
        copy.content = String::new();
    }
    copy
}

fn redacted_all(messages: &[BoardMessage]) -> Vec<BoardMessage> {
    messages.iter().map(redacted).collect()
}

fn generate_board_name() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

async fn board_info(
    cache: &BoardCache,
    board: &str,
    messages: Vec<BoardMessage>,
) -> Result<BoardInfo, CacheError> {
    Ok(BoardInfo {
        board: board.to_string(),
        expire_at: cache.expire_at(board).await?.unwrap_or_default(),
        messages,
    })
}

/// GET /boardapi — the caller's default board: the one its network last
/// used, else a fresh random name. Either way the mapping is refreshed.
pub async fn default_board(
    State(cache): State<SharedCache>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<DefaultBoard>>, StatusCode> {
    let ip = resolve_ip(&headers, remote_addr);
    let board = match cache.board_for_ip(&ip).await.map_err(internal_error)? {
        Some(board) => board,
        None => generate_board_name(),
    };
    cache
        .set_board_for_ip(&ip, &board, IP_BOARD_TTL)
        .await
        .map_err(internal_error)?;
    Ok(success(DefaultBoard { board }))
}

/// GET /boardapi/{board}
pub async fn fetch_board(
    State(cache): State<SharedCache>,
    Path(board): Path<String>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<BoardInfo>>, StatusCode> {
    let ip = resolve_ip(&headers, remote_addr);
    debug!(%board, %ip, "fetch board");
    cache
        .set_board_for_ip(&ip, &board, IP_BOARD_TTL)
        .await
        .map_err(internal_error)?;

    match cache.board(&board).await.map_err(internal_error)? {
        Some(messages) => {
            let info = board_info(&cache, &board, redacted_all(&messages))
                .await
                .map_err(internal_error)?;
            Ok(success(info))
        }
        None => {
            if board != PUBLIC_BOARD
                && cache.board_count().await.map_err(internal_error)? >= MAX_BOARDS
            {
                return Ok(failure(
                    StatusCode::BAD_REQUEST,
                    "board limit reached, please use the public board",
                ));
            }
            cache
                .set_board(&board, Vec::new(), EMPTY_BOARD_TTL)
                .await
                .map_err(internal_error)?;
            let info = board_info(&cache, &board, Vec::new())
                .await
                .map_err(internal_error)?;
            Ok(success(info))
        }
    }
}

/// POST /boardapi/{board}
pub async fn add_message(
    State(cache): State<SharedCache>,
    Path(board): Path<String>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<MessageRequest>,
) -> Result<Json<ApiResponse<BoardInfo>>, StatusCode> {
    let ip = resolve_ip(&headers, remote_addr);
    debug!(%board, %ip, "add message");

    if request.content.is_empty() {
        return Ok(failure(StatusCode::BAD_REQUEST, "content must not be empty"));
    }

    let Some(mut messages) = cache.board(&board).await.map_err(internal_error)? else {
        return Ok(failure(
            StatusCode::BAD_REQUEST,
            "board not found or expired",
        ));
    };

    let (is_file, file_name, file_type, content) = split_file_marker(&request.content);
    let message = BoardMessage {
        id: Utc::now().timestamp_nanos_opt().unwrap_or_default().to_string(),
        content,
        time: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        ip,
        is_file,
        file_type,
        file_name,
    };
    let reply = redacted(&message);

    messages.push(message);
    messages.sort_by(|a, b| b.id.cmp(&a.id));
    messages.truncate(MAX_BOARD_MESSAGES);

    cache
        .set_board(&board, messages, ACTIVE_BOARD_TTL)
        .await
        .map_err(internal_error)?;

    let info = board_info(&cache, &board, vec![reply])
        .await
        .map_err(internal_error)?;
    Ok(success(info))
}

/// DELETE /boardapi/{board}/{id}
pub async fn delete_message(
    State(cache): State<SharedCache>,
    Path((board, id)): Path<(String, String)>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<BoardInfo>>, StatusCode> {
    let ip = resolve_ip(&headers, remote_addr);
    debug!(%board, %id, %ip, "delete message");

    let Some(mut messages) = cache.board(&board).await.map_err(internal_error)? else {
        return Ok(failure(StatusCode::NOT_FOUND, "board not found"));
    };

    let before = messages.len();
    messages.retain(|message| message.id != id);
    if messages.len() != before {
        let ttl = if messages.is_empty() {
            EMPTY_BOARD_TTL
        } else {
            ACTIVE_BOARD_TTL
        };
        cache
            .set_board(&board, messages.clone(), ttl)
            .await
            .map_err(internal_error)?;
    }

    let info = board_info(&cache, &board, redacted_all(&messages))
        .await
        .map_err(internal_error)?;
    Ok(success(info))
}

/// GET /boardapi/{board}/{id} — download one snippet: text as text/plain,
/// files decoded from base64 under their stored MIME type.
pub async fn get_message(
    State(cache): State<SharedCache>,
    Path((board, id)): Path<(String, String)>,
) -> Result<Response, StatusCode> {
    let Some(messages) = cache.board(&board).await.map_err(internal_error)? else {
        return Ok(failure::<BoardInfo>(StatusCode::NOT_FOUND, "board not found").into_response());
    };

    let Some(message) = messages.iter().find(|message| message.id == id) else {
        return Ok(failure::<BoardInfo>(StatusCode::NOT_FOUND, "message not found").into_response());
    };

    if message.is_file {
        let Ok(bytes) = STANDARD.decode(&message.content) else {
            return Ok(
                failure::<BoardInfo>(StatusCode::NOT_FOUND, "failed to decode file content")
                    .into_response(),
            );
        };
        Ok(([(CONTENT_TYPE, message.file_type.clone())], bytes).into_response())
    } else {
        Ok((
            [(CONTENT_TYPE, "text/plain; charset=utf-8".to_string())],
            message.content.clone(),
        )
            .into_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> SharedCache {
        Arc::new(BoardCache::memory())
    }

    fn addr() -> ConnectInfo<SocketAddr> {
        ConnectInfo("192.0.2.1:443".parse().unwrap())
    }

    #[test]
    fn file_marker_splits_name_mime_and_payload() {
        let (is_file, name, mime, payload) =
            split_file_marker("notes.pdf#data:application/pdf;base64,AAAA");
        assert!(is_file);
        assert_eq!(name, "notes.pdf");
        assert_eq!(mime, "application/pdf");
        assert_eq!(payload, "AAAA");
    }

    #[test]
    fn plain_text_is_not_a_file() {
        let (is_file, name, mime, payload) = split_file_marker("just some text");
        assert!(!is_file);
        assert!(name.is_empty());
        assert_eq!(mime, "text/plain");
        assert_eq!(payload, "just some text");
    }

    #[test]
    fn generated_board_names_are_short_lowercase() {
        for _ in 0..20 {
            let name = generate_board_name();
            assert_eq!(name.len(), 6);
            assert!(name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn redaction_withholds_file_payloads_only() {
        let file = BoardMessage {
            id: "1".into(),
            content: "AAAA".into(),
            time: String::new(),
            ip: String::new(),
            is_file: true,
            file_type: "application/pdf".into(),
            file_name: "notes.pdf".into(),
        };
        assert!(redacted(&file).content.is_empty());

        let text = BoardMessage {
            is_file: false,
            content: "hello".into(),
            ..file
        };
        assert_eq!(redacted(&text).content, "hello");
    }

    #[tokio::test]
    async fn fetch_creates_an_empty_board() {
        let cache = shared();
        let response = fetch_board(
            State(cache.clone()),
            Path("abc123".to_string()),
            addr(),
            HeaderMap::new(),
        )
        .await
        .unwrap();
        assert_eq!(response.0.code, 200);
        let info = response.0.data.unwrap();
        assert_eq!(info.board, "abc123");
        assert!(info.messages.is_empty());
        assert_eq!(cache.board_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn add_then_delete_round_trips() {
        let cache = shared();
        fetch_board(
            State(cache.clone()),
            Path("abc123".to_string()),
            addr(),
            HeaderMap::new(),
        )
        .await
        .unwrap();

        let response = add_message(
            State(cache.clone()),
            Path("abc123".to_string()),
            addr(),
            HeaderMap::new(),
            Json(MessageRequest {
                content: "hello".to_string(),
            }),
        )
        .await
        .unwrap();
        let info = response.0.data.unwrap();
        let added = &info.messages[0];
        assert_eq!(added.content, "hello");

        let response = delete_message(
            State(cache.clone()),
            Path(("abc123".to_string(), added.id.clone())),
            addr(),
            HeaderMap::new(),
        )
        .await
        .unwrap();
        assert!(response.0.data.unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn board_cap_redirects_to_public() {
        let cache = shared();
        for i in 0..MAX_BOARDS {
            fetch_board(
                State(cache.clone()),
                Path(format!("board{}", i)),
                addr(),
                HeaderMap::new(),
            )
            .await
            .unwrap();
        }

        let response = fetch_board(
            State(cache.clone()),
            Path("one-too-many".to_string()),
            addr(),
            HeaderMap::new(),
        )
        .await
        .unwrap();
        assert_eq!(response.0.code, StatusCode::BAD_REQUEST.as_u16());

        // The public board is exempt from the cap.
        let response = fetch_board(
            State(cache.clone()),
            Path(PUBLIC_BOARD.to_string()),
            addr(),
            HeaderMap::new(),
        )
        .await
        .unwrap();
        assert_eq!(response.0.code, 200);
    }

    #[tokio::test]
    async fn newest_messages_win_when_the_board_is_full() {
        let cache = shared();
        fetch_board(
            State(cache.clone()),
            Path("abc123".to_string()),
            addr(),
            HeaderMap::new(),
        )
        .await
        .unwrap();

        for i in 0..(MAX_BOARD_MESSAGES + 2) {
            add_message(
                State(cache.clone()),
                Path("abc123".to_string()),
                addr(),
                HeaderMap::new(),
                Json(MessageRequest {
                    content: format!("snippet {}", i),
                }),
            )
            .await
            .unwrap();
        }

        let messages = cache.board("abc123").await.unwrap().unwrap();
        assert_eq!(messages.len(), MAX_BOARD_MESSAGES);
        assert_eq!(messages[0].content, "snippet 6");
    }

    #[tokio::test]
    async fn default_board_is_sticky_per_network() {
        let cache = shared();
        let first = default_board(State(cache.clone()), addr(), HeaderMap::new())
            .await
            .unwrap()
            .0
            .data
            .unwrap()
            .board;
        let second = default_board(State(cache.clone()), addr(), HeaderMap::new())
            .await
            .unwrap()
            .0
            .data
            .unwrap()
            .board;
        assert_eq!(first, second);
    }
}
