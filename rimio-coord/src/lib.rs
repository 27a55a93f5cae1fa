//! Rimio Coord - coordination primitives on top of a hierarchical consistent key-value store
//!
//! Provides:
//! - durable node CRUD with directory/file semantics
//! - ephemeral keys kept alive by a background renewal loop
//! - ordered ephemeral entries and directory watches for queues and elections

pub mod client;
pub mod config;
pub mod ephemeral;
pub mod error;
pub mod ordered;
pub mod signal;
pub mod store;

pub use client::Client;
pub use config::{CoordConfig, StoreBackend, parse_auth, parse_endpoints};
pub use error::{CoordError, Result, classify};
pub use signal::{OwnershipSignal, SignalEnd};
pub use store::{
    DynStore, EtcdStore, MemoryStore, PrevExist, ReadOptions, SetOptions, Store, StoreAction,
    StoreBuilder, StoreError, StoreErrorCode, StoreNode, StoreResponse, StoreResult, WatchEvent,
};
