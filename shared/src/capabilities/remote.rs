//! Client seam for the hosted realtime tree database.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use crate::model::{ChildCode, UnixTimeMs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transient,
    Permanent,
}

impl ErrorCategory {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("remote call timed out")]
    Timeout,

    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl RemoteError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout => ErrorCategory::Transient,
            RemoteError::Rejected(_) | RemoteError::PermissionDenied(_) => {
                ErrorCategory::Permanent
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RemoteError::Network(_) => "NETWORK_ERROR",
            RemoteError::Timeout => "TIMEOUT",
            RemoteError::Rejected(_) => "REJECTED",
            RemoteError::PermissionDenied(_) => "PERMISSION_DENIED",
        }
    }
}

/// Slash-separated location in the remote tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemotePath(String);

impl RemotePath {
    pub fn child(code: &ChildCode) -> Self {
        Self(format!("children/{code}"))
    }

    pub fn location_history(code: &ChildCode) -> Self {
        Self(format!("children/{code}/locationHistory"))
    }

    pub fn child_status(code: &ChildCode) -> Self {
        Self(format!("children/{code}/status"))
    }

    pub fn child_ping(code: &ChildCode) -> Self {
        Self(format!("children/{code}/ping"))
    }

    pub fn chat_messages(code: &ChildCode) -> Self {
        Self(format!("chats/{code}/messages"))
    }

    pub fn sos_alerts() -> Self {
        Self("sosAlerts".to_string())
    }

    /// Parent uids come from the auth provider and are not `ChildCode`s, but
    /// the same reserved characters apply.
    pub fn parent_safe_zone(parent_uid: &str, code: &ChildCode) -> Option<Self> {
        let valid = !parent_uid.is_empty()
            && !parent_uid
                .chars()
                .any(|c| matches!(c, '/' | '.' | '#' | '$' | '[' | ']') || c.is_control());
        valid.then(|| Self(format!("parents/{parent_uid}/safeZones/{code}")))
    }

    pub fn child_safe_zone(code: &ChildCode) -> Self {
        Self(format!("children/{code}/safeZone"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Last-writer-wins replace of the node at `path`.
    async fn set(&self, path: &RemotePath, value: Value) -> Result<(), RemoteError>;

    /// Appends under a server-generated, time-ordered key and returns the key.
    async fn push(&self, path: &RemotePath, value: Value) -> Result<String, RemoteError>;

    /// Merges `fields` into the node at `path`, leaving other children alone.
    async fn update(&self, path: &RemotePath, fields: Map<String, Value>)
        -> Result<(), RemoteError>;

    async fn get(&self, path: &RemotePath) -> Result<Option<Value>, RemoteError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Set,
    Push,
    Update,
}

/// One accepted write, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub op: WriteOp,
    pub path: String,
    pub value: Value,
}

/// In-memory tree store with a write journal. Used by hosts that run without
/// a backend and by tests; reachability, failure injection and latency can
/// be switched at runtime.
#[derive(Debug)]
pub struct MemoryRemote {
    root: Mutex<Value>,
    journal: Mutex<Vec<JournalEntry>>,
    reachable: AtomicBool,
    fail_next: AtomicU32,
    latency_ms: AtomicU64,
    push_seq: AtomicU64,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            root: Mutex::new(Value::Object(Map::new())),
            journal: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
            push_seq: AtomicU64::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// The next `n` calls fail with a network error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        lock(&self.journal).clone()
    }

    pub fn write_count(&self) -> usize {
        lock(&self.journal).len()
    }

    /// Synchronous read for assertions.
    pub fn snapshot(&self, path: &str) -> Option<Value> {
        let root = lock(&self.root);
        let mut node = &*root;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            node = node.get(segment)?;
        }
        Some(node.clone())
    }

    async fn enter(&self) -> Result<(), RemoteError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("backend unreachable".into()));
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RemoteError::Network("injected failure".into()));
        }
        Ok(())
    }

    fn record(&self, op: WriteOp, path: &RemotePath, value: Value) {
        lock(&self.journal).push(JournalEntry {
            op,
            path: path.as_str().to_string(),
            value,
        });
    }

    /// Walks to `path`, creating intermediate objects. Scalars in the way are
    /// replaced, as a set on a deeper path would do server side.
    fn node_mut<'a>(root: &'a mut Value, path: &RemotePath) -> &'a mut Value {
        let mut node = root;
        for segment in path.segments() {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            node = &mut node[segment];
        }
        node
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn set(&self, path: &RemotePath, value: Value) -> Result<(), RemoteError> {
        self.enter().await?;
        {
            let mut root = lock(&self.root);
            *Self::node_mut(&mut root, path) = value.clone();
        }
        self.record(WriteOp::Set, path, value);
        Ok(())
    }

    async fn push(&self, path: &RemotePath, value: Value) -> Result<String, RemoteError> {
        self.enter().await?;
        let seq = self.push_seq.fetch_add(1, Ordering::SeqCst);
        // zero-padded so lexical key order is arrival order
        let key = format!("{:013}-{:08}", UnixTimeMs::now().0, seq);
        {
            let mut root = lock(&self.root);
            let node = Self::node_mut(&mut root, path);
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            if let Value::Object(map) = node {
                map.insert(key.clone(), value.clone());
            }
        }
        self.record(WriteOp::Push, path, value);
        Ok(key)
    }

    async fn update(
        &self,
        path: &RemotePath,
        fields: Map<String, Value>,
    ) -> Result<(), RemoteError> {
        self.enter().await?;
        {
            let mut root = lock(&self.root);
            let node = Self::node_mut(&mut root, path);
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            if let Value::Object(map) = node {
                for (k, v) in &fields {
                    map.insert(k.clone(), v.clone());
                }
            }
        }
        self.record(WriteOp::Update, path, Value::Object(fields));
        Ok(())
    }

    async fn get(&self, path: &RemotePath) -> Result<Option<Value>, RemoteError> {
        self.enter().await?;
        Ok(self.snapshot(path.as_str()).filter(|v| !v.is_null()))
    }
}
