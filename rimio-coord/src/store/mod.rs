//! Store transport abstraction
//!
//! The coordination client talks to a hierarchical, strongly-consistent key-value
//! store through the `Store` trait. Backends (etcd, in-memory) translate their
//! native behavior into directory/file nodes, TTL keys, ordered creation and
//! index-based watches.

pub mod etcd;
pub mod factory;
pub mod memory;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use etcd::EtcdStore;
pub use factory::StoreBuilder;
pub use memory::MemoryStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Trait for store transport implementations
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a node. Directories carry their immediate children.
    async fn get(&self, path: &str, options: ReadOptions) -> StoreResult<StoreResponse>;

    /// Write a file or directory node, subject to the existence precondition.
    async fn set(&self, path: &str, options: SetOptions) -> StoreResult<StoreResponse>;

    /// Create a file under `dir` whose name sorts after every sibling created before it.
    async fn create_in_order(
        &self,
        dir: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StoreResult<StoreResponse>;

    /// Delete a file node.
    async fn delete(&self, path: &str) -> StoreResult<StoreResponse>;

    /// Block until the next change at or below `path` with an index greater than `after_index`.
    async fn watch_next(&self, path: &str, after_index: u64) -> StoreResult<WatchEvent>;
}

/// Type alias for dynamic store
pub type DynStore = dyn Store;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub sorted: bool,
}

impl ReadOptions {
    pub fn sorted() -> Self {
        Self { sorted: true }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PrevExist {
    #[default]
    Any,
    MustExist,
    MustNotExist,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub value: Vec<u8>,
    pub dir: bool,
    pub prev_exist: PrevExist,
    pub ttl: Option<Duration>,
    /// Reset the TTL of an existing file without touching its value.
    pub refresh: bool,
}

impl SetOptions {
    pub fn value(value: Vec<u8>) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }

    pub fn dir() -> Self {
        Self {
            dir: true,
            ..Self::default()
        }
    }

    pub fn refresh(ttl: Duration) -> Self {
        Self {
            prev_exist: PrevExist::MustExist,
            ttl: Some(ttl),
            refresh: true,
            ..Self::default()
        }
    }

    pub fn prev_exist(mut self, prev_exist: PrevExist) -> Self {
        self.prev_exist = prev_exist;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAction {
    Get,
    Set,
    Create,
    Update,
    Delete,
    Expire,
}

impl StoreAction {
    /// Anything but a read changes the watched tree.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, StoreAction::Get)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreNode {
    pub key: String,
    pub value: Vec<u8>,
    pub dir: bool,
    /// Immediate children, only populated for directories.
    pub nodes: Vec<StoreNode>,
    pub ttl: Option<Duration>,
    pub modified_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreResponse {
    pub action: StoreAction,
    pub node: StoreNode,
    /// Store-wide logical index at the time the response was produced.
    pub index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub action: StoreAction,
    pub key: String,
    pub index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorCode {
    KeyNotFound = 100,
    TestFailed = 101,
    NotFile = 102,
    NotDir = 104,
    NodeExist = 105,
    EventIndexCleared = 401,
    Transport = 500,
}

impl fmt::Display for StoreErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u16)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} ({code}) [{key}]")]
pub struct StoreError {
    pub code: StoreErrorCode,
    pub key: String,
    pub message: String,
}

impl StoreError {
    pub fn new(code: StoreErrorCode, key: impl Into<String>) -> Self {
        let message = match code {
            StoreErrorCode::KeyNotFound => "Key not found",
            StoreErrorCode::TestFailed => "Compare failed",
            StoreErrorCode::NotFile => "Not a file",
            StoreErrorCode::NotDir => "Not a directory",
            StoreErrorCode::NodeExist => "Key already exists",
            StoreErrorCode::EventIndexCleared => "The event in requested index is outdated and cleared",
            StoreErrorCode::Transport => "Transport failure",
        };

        Self {
            code,
            key: key.into(),
            message: message.to_string(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            code: StoreErrorCode::Transport,
            key: String::new(),
            message: message.into(),
        }
    }
}

/// Normalizes a path to `/a/b` form: a single leading slash, no trailing slash.
pub fn normalize_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

/// Ancestors of a normalized path, outermost first, excluding the root.
pub fn parent_dirs(path: &str) -> Vec<String> {
    let mut parents = Vec::new();
    let mut current = String::new();
    let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
    if parts.len() < 2 {
        return parents;
    }

    for part in &parts[..parts.len() - 1] {
        current.push('/');
        current.push_str(part);
        parents.push(current.clone());
    }
    parents
}

/// Returns the child name when `key` is an immediate child of `dir`.
pub fn immediate_child<'a>(dir: &str, key: &'a str) -> Option<&'a str> {
    let rest = if dir == "/" {
        key.strip_prefix('/')?
    } else {
        key.strip_prefix(dir)?.strip_prefix('/')?
    };

    if rest.is_empty() || rest.contains('/') {
        None
    } else {
        Some(rest)
    }
}

pub fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Name assigned to an in-order entry, zero-padded so lexical order matches numeric order.
pub fn in_order_name(seq: u64) -> String {
    format!("{:020}", seq)
}
