use super::{
    PrevExist, ReadOptions, SetOptions, Store, StoreAction, StoreError, StoreErrorCode, StoreNode,
    StoreResponse, StoreResult, WatchEvent, immediate_child, in_order_name, join_path,
    normalize_path, parent_dirs,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Number of events kept for watchers that start from an older index.
const HISTORY_CAPACITY: usize = 1000;

static SHARED_MEMORY_STORES: OnceLock<StdMutex<HashMap<String, MemoryStore>>> = OnceLock::new();

/// In-process hierarchical store with TTL expiry, ordered creation and watch history.
///
/// Clones share the same tree, so several clients built on clones contend on the
/// same keys exactly like clients of a real store would.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<StdMutex<MemoryState>>,
    index_tx: Arc<watch::Sender<u64>>,
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Vec<u8>,
    dir: bool,
    expires_at: Option<Instant>,
    modified_index: u64,
}

impl MemoryEntry {
    fn to_node(&self, key: &str, now: Instant) -> StoreNode {
        StoreNode {
            key: key.to_string(),
            value: self.value.clone(),
            dir: self.dir,
            nodes: Vec::new(),
            ttl: self
                .expires_at
                .map(|deadline| deadline.saturating_duration_since(now)),
            modified_index: self.modified_index,
        }
    }
}

#[derive(Default)]
struct MemoryState {
    nodes: BTreeMap<String, MemoryEntry>,
    index: u64,
    history: VecDeque<WatchEvent>,
    cleared_through: u64,
}

impl MemoryState {
    fn record(&mut self, action: StoreAction, key: &str) -> u64 {
        self.index += 1;
        self.history.push_back(WatchEvent {
            action,
            key: key.to_string(),
            index: self.index,
        });
        while self.history.len() > HISTORY_CAPACITY {
            if let Some(dropped) = self.history.pop_front() {
                self.cleared_through = dropped.index;
            }
        }
        self.index
    }

    /// Removes every file whose TTL has elapsed. Returns true if anything expired.
    fn expire(&mut self, now: Instant) -> bool {
        let expired: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, entry)| entry.expires_at.is_some_and(|deadline| deadline <= now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.nodes.remove(key);
            self.record(StoreAction::Expire, key);
            tracing::debug!("memory store expired key {}", key);
        }

        !expired.is_empty()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.nodes.values().filter_map(|entry| entry.expires_at).min()
    }

    fn ensure_parents(&mut self, path: &str) -> StoreResult<()> {
        let modified_index = self.index + 1;
        for parent in parent_dirs(path) {
            match self.nodes.get(&parent) {
                Some(entry) if !entry.dir => {
                    return Err(StoreError::new(StoreErrorCode::NotDir, parent));
                }
                Some(_) => {}
                None => {
                    self.nodes.insert(
                        parent,
                        MemoryEntry {
                            value: Vec::new(),
                            dir: true,
                            expires_at: None,
                            modified_index,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    fn children(&self, dir: &str, now: Instant) -> Vec<StoreNode> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir)
        };

        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| immediate_child(dir, key).is_some())
            .map(|(key, entry)| entry.to_node(key, now))
            .collect()
    }
}

fn within(dir: &str, key: &str) -> bool {
    dir == "/" || key == dir || key.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (index_tx, _) = watch::channel(0);
        Self {
            state: Arc::new(StdMutex::new(MemoryState::default())),
            index_tx: Arc::new(index_tx),
        }
    }

    /// Returns the process-wide store registered under `namespace`, creating it on first use.
    pub fn shared(namespace: &str) -> Self {
        let stores = SHARED_MEMORY_STORES.get_or_init(|| StdMutex::new(HashMap::new()));
        let mut guard = stores.lock().unwrap_or_else(PoisonError::into_inner);

        guard
            .entry(namespace.to_string())
            .or_insert_with(MemoryStore::new)
            .clone()
    }

    /// Current store-wide index.
    pub fn index(&self) -> u64 {
        self.lock().index
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &MemoryState) {
        self.index_tx.send_replace(state.index);
    }

    fn expire_locked(&self, state: &mut MemoryState, now: Instant) {
        if state.expire(now) {
            self.publish(state);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, path: &str, _options: ReadOptions) -> StoreResult<StoreResponse> {
        let path = normalize_path(path);
        let now = Instant::now();
        let mut state = self.lock();
        self.expire_locked(&mut state, now);

        let mut node = if path == "/" {
            StoreNode {
                key: path.clone(),
                dir: true,
                ..StoreNode::default()
            }
        } else {
            state
                .nodes
                .get(&path)
                .map(|entry| entry.to_node(&path, now))
                .ok_or_else(|| StoreError::new(StoreErrorCode::KeyNotFound, path.as_str()))?
        };

        // Children come out of the BTreeMap in key order regardless of `sorted`.
        if node.dir {
            node.nodes = state.children(&path, now);
        }

        Ok(StoreResponse {
            action: StoreAction::Get,
            node,
            index: state.index,
        })
    }

    async fn set(&self, path: &str, options: SetOptions) -> StoreResult<StoreResponse> {
        let path = normalize_path(path);
        if path == "/" {
            let code = if options.dir {
                StoreErrorCode::NodeExist
            } else {
                StoreErrorCode::NotFile
            };
            return Err(StoreError::new(code, path));
        }

        let now = Instant::now();
        let mut state = self.lock();
        self.expire_locked(&mut state, now);

        let existing = state.nodes.get(&path).cloned();
        match (options.prev_exist, &existing) {
            (PrevExist::MustNotExist, Some(_)) => {
                return Err(StoreError::new(StoreErrorCode::NodeExist, path));
            }
            (PrevExist::MustExist, None) => {
                return Err(StoreError::new(StoreErrorCode::KeyNotFound, path));
            }
            _ => {}
        }

        if let Some(entry) = &existing {
            if entry.dir && options.dir {
                return Err(StoreError::new(StoreErrorCode::NodeExist, path));
            }
            if entry.dir {
                return Err(StoreError::new(StoreErrorCode::NotFile, path));
            }
            if options.dir {
                return Err(StoreError::new(StoreErrorCode::NotDir, path));
            }
        }

        if options.refresh {
            state.index += 1;
            let index = state.index;
            let entry = state
                .nodes
                .get_mut(&path)
                .ok_or_else(|| StoreError::new(StoreErrorCode::KeyNotFound, path.as_str()))?;
            entry.expires_at = options.ttl.map(|ttl| now + ttl);
            entry.modified_index = index;
            let node = entry.to_node(&path, now);

            // Refreshes are invisible to watchers; only wake them to recompute deadlines.
            self.publish(&state);
            return Ok(StoreResponse {
                action: StoreAction::Update,
                node,
                index,
            });
        }

        state.ensure_parents(&path)?;

        let action = match (options.prev_exist, existing.is_some()) {
            (PrevExist::MustNotExist, _) => StoreAction::Create,
            (PrevExist::MustExist, _) => StoreAction::Update,
            (PrevExist::Any, false) => StoreAction::Create,
            (PrevExist::Any, true) => StoreAction::Set,
        };
        let index = state.record(action, &path);

        let entry = MemoryEntry {
            value: if options.dir { Vec::new() } else { options.value },
            dir: options.dir,
            expires_at: options.ttl.map(|ttl| now + ttl),
            modified_index: index,
        };
        let node = entry.to_node(&path, now);
        state.nodes.insert(path, entry);
        self.publish(&state);

        Ok(StoreResponse {
            action,
            node,
            index,
        })
    }

    async fn create_in_order(
        &self,
        dir: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StoreResult<StoreResponse> {
        let dir = normalize_path(dir);
        let now = Instant::now();
        let mut state = self.lock();
        self.expire_locked(&mut state, now);

        match state.nodes.get(&dir) {
            Some(entry) if !entry.dir => {
                return Err(StoreError::new(StoreErrorCode::NotDir, dir));
            }
            Some(_) => {}
            None if dir == "/" => {}
            None => {
                state.ensure_parents(&dir)?;
                let modified_index = state.index + 1;
                state.nodes.insert(
                    dir.clone(),
                    MemoryEntry {
                        value: Vec::new(),
                        dir: true,
                        expires_at: None,
                        modified_index,
                    },
                );
            }
        }

        let key = join_path(&dir, &in_order_name(state.index + 1));
        let index = state.record(StoreAction::Create, &key);

        let entry = MemoryEntry {
            value,
            dir: false,
            expires_at: ttl.map(|ttl| now + ttl),
            modified_index: index,
        };
        let node = entry.to_node(&key, now);
        state.nodes.insert(key, entry);
        self.publish(&state);

        Ok(StoreResponse {
            action: StoreAction::Create,
            node,
            index,
        })
    }

    async fn delete(&self, path: &str) -> StoreResult<StoreResponse> {
        let path = normalize_path(path);
        if path == "/" {
            return Err(StoreError::new(StoreErrorCode::NotFile, path));
        }

        let now = Instant::now();
        let mut state = self.lock();
        self.expire_locked(&mut state, now);

        let node = match state.nodes.get(&path) {
            None => return Err(StoreError::new(StoreErrorCode::KeyNotFound, path)),
            Some(entry) if entry.dir => {
                return Err(StoreError::new(StoreErrorCode::NotFile, path));
            }
            Some(entry) => entry.to_node(&path, now),
        };

        state.nodes.remove(&path);
        let index = state.record(StoreAction::Delete, &path);
        self.publish(&state);

        Ok(StoreResponse {
            action: StoreAction::Delete,
            node,
            index,
        })
    }

    async fn watch_next(&self, path: &str, after_index: u64) -> StoreResult<WatchEvent> {
        let path = normalize_path(path);

        loop {
            let (mut index_rx, deadline) = {
                let mut state = self.lock();
                self.expire_locked(&mut state, Instant::now());

                if after_index < state.cleared_through {
                    return Err(StoreError::new(StoreErrorCode::EventIndexCleared, path));
                }

                if let Some(event) = state
                    .history
                    .iter()
                    .find(|event| event.index > after_index && within(&path, &event.key))
                {
                    return Ok(event.clone());
                }

                // Subscribing under the lock guarantees no publish is missed.
                (self.index_tx.subscribe(), state.next_deadline())
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        changed = index_rx.changed() => {
                            if changed.is_err() {
                                return Err(StoreError::transport("memory store dropped"));
                            }
                        }
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => {
                    if index_rx.changed().await.is_err() {
                        return Err(StoreError::transport("memory store dropped"));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_respects_existence_preconditions() {
        let store = MemoryStore::new();

        let err = store
            .set("/a", SetOptions::value(b"x".to_vec()).prev_exist(PrevExist::MustExist))
            .await
            .expect_err("must exist");
        assert_eq!(err.code, StoreErrorCode::KeyNotFound);

        let resp = store
            .set("/a", SetOptions::value(b"x".to_vec()).prev_exist(PrevExist::MustNotExist))
            .await
            .expect("create");
        assert_eq!(resp.action, StoreAction::Create);

        let err = store
            .set("/a", SetOptions::value(b"y".to_vec()).prev_exist(PrevExist::MustNotExist))
            .await
            .expect_err("exists");
        assert_eq!(err.code, StoreErrorCode::NodeExist);

        let resp = store
            .set("/a", SetOptions::value(b"y".to_vec()).prev_exist(PrevExist::MustExist))
            .await
            .expect("update");
        assert_eq!(resp.action, StoreAction::Update);
        assert_eq!(resp.node.value, b"y".to_vec());
    }

    #[tokio::test]
    async fn parents_are_created_implicitly() {
        let store = MemoryStore::new();
        store
            .set("/a/b/c", SetOptions::value(b"v".to_vec()))
            .await
            .expect("set");

        let resp = store.get("/a", ReadOptions::default()).await.expect("get");
        assert!(resp.node.dir);
        assert_eq!(resp.node.nodes.len(), 1);
        assert_eq!(resp.node.nodes[0].key, "/a/b");
        assert!(resp.node.nodes[0].dir);

        let err = store
            .set("/a/b/c/d", SetOptions::value(b"v".to_vec()))
            .await
            .expect_err("file parent");
        assert_eq!(err.code, StoreErrorCode::NotDir);
    }

    #[tokio::test]
    async fn delete_rejects_directories() {
        let store = MemoryStore::new();
        store.set("/d", SetOptions::dir()).await.expect("mkdir");

        let err = store.delete("/d").await.expect_err("dir");
        assert_eq!(err.code, StoreErrorCode::NotFile);

        let err = store.delete("/missing").await.expect_err("missing");
        assert_eq!(err.code, StoreErrorCode::KeyNotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_keys_expire_unless_refreshed() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(2);
        store
            .set("/e", SetOptions::value(b"v".to_vec()).ttl(ttl))
            .await
            .expect("set");

        tokio::time::sleep(Duration::from_millis(1500)).await;
        store
            .set("/e", SetOptions::refresh(ttl))
            .await
            .expect("refresh");

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let resp = store.get("/e", ReadOptions::default()).await.expect("alive");
        assert_eq!(resp.node.value, b"v".to_vec());

        tokio::time::sleep(Duration::from_millis(600)).await;
        let err = store
            .get("/e", ReadOptions::default())
            .await
            .expect_err("expired");
        assert_eq!(err.code, StoreErrorCode::KeyNotFound);

        let err = store
            .set("/e", SetOptions::refresh(ttl))
            .await
            .expect_err("refresh after expiry");
        assert_eq!(err.code, StoreErrorCode::KeyNotFound);
    }

    #[tokio::test]
    async fn in_order_keys_increase() {
        let store = MemoryStore::new();
        let first = store
            .create_in_order("/q", b"1".to_vec(), None)
            .await
            .expect("first");
        store.set("/other", SetOptions::value(Vec::new())).await.expect("other");
        let second = store
            .create_in_order("/q", b"2".to_vec(), None)
            .await
            .expect("second");

        assert!(first.node.key.starts_with("/q/"));
        assert!(first.node.key < second.node.key);

        let listing = store.get("/q", ReadOptions::sorted()).await.expect("list");
        let keys: Vec<_> = listing.node.nodes.iter().map(|n| n.key.clone()).collect();
        assert_eq!(keys, vec![first.node.key, second.node.key]);
    }

    #[tokio::test]
    async fn watch_returns_first_event_after_index() {
        let store = MemoryStore::new();
        store.set("/w", SetOptions::dir()).await.expect("mkdir");
        let index = store.index();

        let watcher = {
            let store = store.clone();
            tokio::spawn(async move { store.watch_next("/w", index).await })
        };

        store.set("/elsewhere", SetOptions::value(Vec::new())).await.expect("unrelated");
        let created = store
            .create_in_order("/w", b"x".to_vec(), None)
            .await
            .expect("create");

        let event = watcher.await.expect("join").expect("event");
        assert_eq!(event.action, StoreAction::Create);
        assert_eq!(event.key, created.node.key);
        assert_eq!(event.index, created.index);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_observes_expiry() {
        let store = MemoryStore::new();
        let resp = store
            .create_in_order("/w", Vec::new(), Some(Duration::from_secs(1)))
            .await
            .expect("create");

        let event = store.watch_next("/w", resp.index).await.expect("expire");
        assert_eq!(event.action, StoreAction::Expire);
        assert_eq!(event.key, resp.node.key);
    }

    #[tokio::test]
    async fn watch_from_cleared_index_fails() {
        let store = MemoryStore::new();
        for i in 0..(HISTORY_CAPACITY + 5) {
            store
                .set(&format!("/h/{}", i), SetOptions::value(Vec::new()))
                .await
                .expect("set");
        }

        let err = store.watch_next("/h", 1).await.expect_err("cleared");
        assert_eq!(err.code, StoreErrorCode::EventIndexCleared);
    }

    #[test]
    fn shared_stores_are_keyed_by_namespace() {
        let a = MemoryStore::shared("memory-store-test-ns");
        let b = MemoryStore::shared("memory-store-test-ns");
        assert!(Arc::ptr_eq(&a.state, &b.state));

        let c = MemoryStore::shared("memory-store-test-other");
        assert!(!Arc::ptr_eq(&a.state, &c.state));
    }
}
