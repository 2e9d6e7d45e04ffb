use chrono::{DateTime, Local};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{info, warn};

const BOARD_KEY_PREFIX: &str = "sync-board.";
const IP_KEY_PREFIX: &str = "ip:";
const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// One shared snippet on a board. File snippets keep their payload as base64
/// in `content` and carry the original name and MIME type alongside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardMessage {
    pub id: String,
    pub content: String,
    pub time: String,
    pub ip: String,
    pub is_file: bool,
    pub file_type: String,
    pub file_name: String,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// TTL'd storage for board snippets plus the `ip -> board name` mapping that
/// sends devices on one network to the same default board. Backend picked at
/// startup; the memory backend is the default, Redis survives restarts and
/// fans out across replicas.
pub enum BoardCache {
    Memory(MemoryCache),
    Redis(RedisCache),
}

impl BoardCache {
    pub fn memory() -> Self {
        BoardCache::Memory(MemoryCache::new())
    }

    pub async fn redis(url: &str) -> Result<Self, CacheError> {
        Ok(BoardCache::Redis(RedisCache::connect(url).await?))
    }

    pub async fn board(&self, board: &str) -> Result<Option<Vec<BoardMessage>>, CacheError> {
        match self {
            BoardCache::Memory(cache) => Ok(cache.board(board)),
            BoardCache::Redis(cache) => cache.board(board).await,
        }
    }

    pub async fn set_board(
        &self,
        board: &str,
        messages: Vec<BoardMessage>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        match self {
            BoardCache::Memory(cache) => {
                cache.set_board(board, messages, ttl);
                Ok(())
            }
            BoardCache::Redis(cache) => cache.set_board(board, messages, ttl).await,
        }
    }

    /// Human-readable expiry of a board, if it exists and expires.
    pub async fn expire_at(&self, board: &str) -> Result<Option<String>, CacheError> {
        match self {
            BoardCache::Memory(cache) => Ok(cache.expire_at(board)),
            BoardCache::Redis(cache) => cache.expire_at(board).await,
        }
    }

    pub async fn board_count(&self) -> Result<usize, CacheError> {
        match self {
            BoardCache::Memory(cache) => Ok(cache.board_count()),
            BoardCache::Redis(cache) => cache.board_count().await,
        }
    }

    pub async fn board_for_ip(&self, ip: &str) -> Result<Option<String>, CacheError> {
        match self {
            BoardCache::Memory(cache) => Ok(cache.board_for_ip(ip)),
            BoardCache::Redis(cache) => cache.board_for_ip(ip).await,
        }
    }

    pub async fn set_board_for_ip(
        &self,
        ip: &str,
        board: &str,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        match self {
            BoardCache::Memory(cache) => {
                cache.set_board_for_ip(ip, board, ttl);
                Ok(())
            }
            BoardCache::Redis(cache) => cache.set_board_for_ip(ip, board, ttl).await,
        }
    }

    /// Drop expired entries and report how many boards remain. Redis expires
    /// keys itself, so its sweep is just the count.
    pub async fn sweep(&self) -> Result<usize, CacheError> {
        match self {
            BoardCache::Memory(cache) => Ok(cache.sweep()),
            BoardCache::Redis(cache) => cache.board_count().await,
        }
    }

    /// Periodic sweep task, one per process.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match cache.sweep().await {
                    Ok(size) => info!(boards = size, "swept expired cache entries"),
                    Err(err) => warn!(%err, "cache sweep failed"),
                }
            }
        });
    }
}

struct TimedEntry<T> {
    value: T,
    expires_at: SystemTime,
}

impl<T> TimedEntry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: SystemTime::now() + ttl,
        }
    }

    fn live(&self) -> bool {
        self.expires_at > SystemTime::now()
    }
}

fn format_deadline(deadline: SystemTime) -> String {
    DateTime::<Local>::from(deadline)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// In-process backend: entries expire lazily on read plus eagerly during the
/// periodic sweep.
pub struct MemoryCache {
    boards: DashMap<String, TimedEntry<Vec<BoardMessage>>>,
    names: DashMap<String, TimedEntry<String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            boards: DashMap::new(),
            names: DashMap::new(),
        }
    }

    pub fn board(&self, board: &str) -> Option<Vec<BoardMessage>> {
        {
            let entry = self.boards.get(board)?;
            if entry.live() {
                return Some(entry.value.clone());
            }
        }
        self.boards.remove(board);
        None
    }

    pub fn set_board(&self, board: &str, messages: Vec<BoardMessage>, ttl: Duration) {
        self.boards
            .insert(board.to_string(), TimedEntry::new(messages, ttl));
    }

    pub fn expire_at(&self, board: &str) -> Option<String> {
        {
            let entry = self.boards.get(board)?;
            if entry.live() {
                return Some(format_deadline(entry.expires_at));
            }
        }
        self.boards.remove(board);
        None
    }

    pub fn board_count(&self) -> usize {
        self.boards.len()
    }

    pub fn board_for_ip(&self, ip: &str) -> Option<String> {
        {
            let entry = self.names.get(ip)?;
            if entry.live() {
                return Some(entry.value.clone());
            }
        }
        self.names.remove(ip);
        None
    }

    pub fn set_board_for_ip(&self, ip: &str, board: &str, ttl: Duration) {
        self.names
            .insert(ip.to_string(), TimedEntry::new(board.to_string(), ttl));
    }

    pub fn sweep(&self) -> usize {
        self.boards.retain(|_, entry| entry.live());
        self.names.retain(|_, entry| entry.live());
        self.boards.len()
    }
}

/// Redis backend. Boards live under `sync-board.<name>`, the ip mapping under
/// `ip:<addr>`; TTLs ride on the keys themselves.
#[derive(Clone)]
pub struct RedisCache {
    redis: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }

    fn board_key(board: &str) -> String {
        format!("{}{}", BOARD_KEY_PREFIX, board)
    }

    fn ip_key(ip: &str) -> String {
        format!("{}{}", IP_KEY_PREFIX, ip)
    }

    pub async fn board(&self, board: &str) -> Result<Option<Vec<BoardMessage>>, CacheError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(Self::board_key(board)).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn set_board(
        &self,
        board: &str,
        messages: Vec<BoardMessage>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(&messages)?;
        conn.set_ex::<_, _, ()>(Self::board_key(board), value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    pub async fn expire_at(&self, board: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.redis.clone();
        let ttl: i64 = conn.ttl(Self::board_key(board)).await?;
        // -2 is a missing key, -1 a key without expiry.
        if ttl < 0 {
            return Ok(None);
        }
        let deadline = SystemTime::now() + Duration::from_secs(ttl as u64);
        Ok(Some(format_deadline(deadline)))
    }

    pub async fn board_count(&self) -> Result<usize, CacheError> {
        let mut conn = self.redis.clone();
        let pattern = Self::board_key("*");
        let mut cursor: u64 = 0;
        let mut count = 0usize;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(1000u32)
                .query_async(&mut conn)
                .await?;
            cursor = next_cursor;
            count += keys.len();
            if cursor == 0 {
                break;
            }
        }
        Ok(count)
    }

    pub async fn board_for_ip(&self, ip: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.redis.clone();
        Ok(conn.get(Self::ip_key(ip)).await?)
    }

    pub async fn set_board_for_ip(
        &self,
        ip: &str,
        board: &str,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(Self::ip_key(ip), board, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn message(id: &str) -> BoardMessage {
        BoardMessage {
            id: id.to_string(),
            content: "hello".to_string(),
            time: "2026-01-01 00:00:00".to_string(),
            ip: "1.2.3.4".to_string(),
            is_file: false,
            file_type: "text/plain".to_string(),
            file_name: String::new(),
        }
    }

    #[test]
    fn entries_expire_lazily_on_read() {
        let cache = MemoryCache::new();
        cache.set_board("abc", vec![message("1")], Duration::from_millis(10));
        assert!(cache.board("abc").is_some());
        sleep(Duration::from_millis(20));
        assert!(cache.board("abc").is_none());
        assert_eq!(cache.board_count(), 0);
    }

    #[test]
    fn sweep_drops_only_expired_entries() {
        let cache = MemoryCache::new();
        cache.set_board("old", vec![message("1")], Duration::from_millis(5));
        cache.set_board("fresh", vec![message("2")], Duration::from_secs(60));
        cache.set_board_for_ip("1.2.3.4", "old", Duration::from_millis(5));
        sleep(Duration::from_millis(10));

        assert_eq!(cache.sweep(), 1);
        assert!(cache.board("fresh").is_some());
        assert!(cache.board_for_ip("1.2.3.4").is_none());
    }

    #[test]
    fn ip_mapping_round_trips() {
        let cache = MemoryCache::new();
        assert!(cache.board_for_ip("1.2.3.4").is_none());
        cache.set_board_for_ip("1.2.3.4", "abc123", Duration::from_secs(60));
        assert_eq!(cache.board_for_ip("1.2.3.4").as_deref(), Some("abc123"));
    }

    #[test]
    fn expire_at_formats_a_timestamp() {
        let cache = MemoryCache::new();
        cache.set_board("abc", vec![], Duration::from_secs(3600));
        let formatted = cache.expire_at("abc").unwrap();
        // "YYYY-MM-DD HH:MM:SS"
        assert_eq!(formatted.len(), 19);
        assert!(cache.expire_at("missing").is_none());
    }

    #[test]
    fn board_messages_serialize_with_wire_field_names() {
        let text = serde_json::to_string(&message("1")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(value.get("isFile").is_some());
        assert!(value.get("fileType").is_some());
        assert!(value.get("fileName").is_some());
    }
}
