use crate::config::{CoordConfig, effective_timeout, parse_endpoints};
use crate::error::{CoordError, Result};
use crate::store::{PrevExist, ReadOptions, SetOptions, Store, StoreBuilder, StoreResult};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Coordination client bound to one store session.
///
/// Cloning is cheap and every clone shares the same lifecycle: closing any clone
/// closes them all. The lifecycle lock only guards the closed flag and the root
/// cancellation token; store calls run outside it, so unrelated operations never
/// serialize behind each other. Once `close` returns, no new store call can start,
/// and calls already in flight are canceled.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// Handle held by background tasks; it does not keep the client alive.
///
/// Dropping the last [`Client`] cancels the root token, which ends every renewal
/// and watch task as if the client had been closed.
#[derive(Clone)]
pub(crate) struct WeakClient {
    inner: Weak<ClientInner>,
}

impl WeakClient {
    pub(crate) fn upgrade(&self) -> Option<Client> {
        self.inner.upgrade().map(|inner| Client { inner })
    }

    /// Derives a call token from a live, open client.
    pub(crate) fn begin(&self) -> Result<CancellationToken> {
        self.upgrade().ok_or(CoordError::ClosedClient)?.begin()
    }
}

struct ClientInner {
    store: Arc<dyn Store>,
    timeout: Duration,
    lifecycle: StdMutex<Lifecycle>,
}

struct Lifecycle {
    closed: bool,
    root: CancellationToken,
}

impl Client {
    /// Connects to etcd.
    ///
    /// `endpoints` is a comma-separated list; `auth` is an optional `user:password`;
    /// a zero `timeout` falls back to five seconds.
    pub async fn new(endpoints: &str, auth: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut builder = StoreBuilder::new()
            .backend("etcd")
            .endpoints(parse_endpoints(endpoints));
        if let Some(auth) = auth.filter(|auth| !auth.is_empty()) {
            builder = builder.auth(auth);
        }

        let store = builder.build().await?;
        Ok(Self::with_store(store, timeout))
    }

    pub async fn from_config(config: &CoordConfig) -> Result<Self> {
        let store = StoreBuilder::from_config(config).build().await?;
        Ok(Self::with_store(store, config.timeout()))
    }

    pub fn with_store(store: Arc<dyn Store>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                store,
                timeout: effective_timeout(timeout),
                lifecycle: StdMutex::new(Lifecycle {
                    closed: false,
                    root: CancellationToken::new(),
                }),
            }),
        }
    }

    /// Per-request timeout, also used as the TTL of ephemeral keys.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    /// Cancels every in-flight and background operation. Idempotent.
    pub fn close(&self) {
        let mut lifecycle = self
            .inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if lifecycle.closed {
            return;
        }

        lifecycle.closed = true;
        lifecycle.root.cancel();
        tracing::debug!("coordination client closed");
    }

    pub(crate) fn downgrade(&self) -> WeakClient {
        WeakClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Checks the closed flag and derives a token canceled when the client closes.
    pub(crate) fn begin(&self) -> Result<CancellationToken> {
        let lifecycle = self
            .inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if lifecycle.closed {
            return Err(CoordError::ClosedClient);
        }
        Ok(lifecycle.root.child_token())
    }

    /// Runs one store call bounded by the client timeout and the client's cancellation.
    pub(crate) async fn call<T, F>(&self, path: &str, fut: F) -> Result<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let token = self.begin()?;
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(CoordError::Canceled),
            result = tokio::time::timeout(self.inner.timeout, fut) => match result {
                Ok(result) => result.map_err(CoordError::from),
                Err(_) => Err(CoordError::Timeout(path.to_string())),
            },
        }
    }

    /// Creates a directory. An existing node at `path` counts as success.
    pub async fn mkdir(&self, path: &str) -> Result<()> {
        tracing::debug!("coord mkdir node {}", path);
        let options = SetOptions::dir().prev_exist(PrevExist::MustNotExist);
        match self.call(path, self.store().set(path, options)).await {
            Ok(_) => {}
            Err(CoordError::NodeExists(_)) => {}
            Err(error) => {
                tracing::debug!("coord mkdir node {} failed: {}", path, error);
                return Err(error);
            }
        }

        tracing::debug!("coord mkdir OK");
        Ok(())
    }

    /// Sets the value of an existing registration point.
    pub async fn create(&self, path: &str, data: &[u8]) -> Result<()> {
        if let Err(error) = self.set_existing(path, data).await {
            tracing::debug!("coord create node {} failed: {}", path, error);
            return Err(error);
        }
        tracing::debug!("coord create OK");
        Ok(())
    }

    pub async fn update(&self, path: &str, data: &[u8]) -> Result<()> {
        if let Err(error) = self.set_existing(path, data).await {
            tracing::debug!("coord update node {} failed: {}", path, error);
            return Err(error);
        }
        tracing::debug!("coord update OK");
        Ok(())
    }

    async fn set_existing(&self, path: &str, data: &[u8]) -> Result<()> {
        let options = SetOptions::value(data.to_vec()).prev_exist(PrevExist::MustExist);
        self.call(path, self.store().set(path, options)).await?;
        Ok(())
    }

    /// Deletes a file. A missing key counts as success.
    pub async fn delete(&self, path: &str) -> Result<()> {
        match self.call(path, self.store().delete(path)).await {
            Ok(_) => {}
            Err(CoordError::NotFound(_)) => {}
            Err(error) => {
                tracing::debug!("coord delete node {} failed: {}", path, error);
                return Err(error);
            }
        }
        tracing::debug!("coord delete OK");
        Ok(())
    }

    /// Reads a file with quorum consistency.
    ///
    /// A missing key yields `Ok(None)` unless `must` is set.
    pub async fn read(&self, path: &str, must: bool) -> Result<Option<Vec<u8>>> {
        let resp = match self
            .call(path, self.store().get(path, ReadOptions::default()))
            .await
        {
            Ok(resp) => resp,
            Err(CoordError::NotFound(_)) if !must => return Ok(None),
            Err(error) => {
                tracing::debug!("coord read node {} failed: {}", path, error);
                return Err(error);
            }
        };

        if resp.node.dir {
            tracing::debug!("coord read node {} failed: not a file", path);
            return Err(CoordError::NotFile(path.to_string()));
        }
        Ok(Some(resp.node.value))
    }

    /// Lists the full keys of a directory's immediate children.
    ///
    /// A missing directory yields `Ok(None)` unless `must` is set.
    pub async fn list(&self, path: &str, must: bool) -> Result<Option<Vec<String>>> {
        let resp = match self
            .call(path, self.store().get(path, ReadOptions::default()))
            .await
        {
            Ok(resp) => resp,
            Err(CoordError::NotFound(_)) if !must => return Ok(None),
            Err(error) => {
                tracing::debug!("coord list node {} failed: {}", path, error);
                return Err(error);
            }
        };

        if !resp.node.dir {
            tracing::debug!("coord list node {} failed: not a dir", path);
            return Err(CoordError::NotDir(path.to_string()));
        }
        Ok(Some(resp.node.nodes.into_iter().map(|node| node.key).collect()))
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let lifecycle = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        lifecycle.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreAction, StoreError, StoreNode, StoreResponse, WatchEvent};
    use async_trait::async_trait;

    fn memory_client() -> Client {
        Client::with_store(Arc::new(MemoryStore::new()), Duration::from_secs(2))
    }

    #[test]
    fn zero_timeout_uses_default() {
        let client = Client::with_store(Arc::new(MemoryStore::new()), Duration::ZERO);
        assert_eq!(client.timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn new_rejects_malformed_auth() {
        let err = Client::new("127.0.0.1:2379", Some("user-without-password"), Duration::ZERO)
            .await
            .err()
            .expect("invalid auth");
        assert!(matches!(err, CoordError::InvalidAuth));
    }

    #[tokio::test]
    async fn mkdir_is_idempotent() {
        let client = memory_client();
        client.mkdir("/slots").await.expect("first");
        client.mkdir("/slots").await.expect("second");

        let children = client.list("/slots", true).await.expect("list");
        assert_eq!(children, Some(Vec::new()));
    }

    #[tokio::test]
    async fn create_and_update_require_existing_node() {
        let client = memory_client();
        let err = client.create("/cfg", b"v1").await.expect_err("missing");
        assert!(err.is_not_found());

        client
            .store()
            .set("/cfg", SetOptions::value(Vec::new()))
            .await
            .expect("seed");
        client.create("/cfg", b"v1").await.expect("create");
        assert_eq!(client.read("/cfg", true).await.expect("read"), Some(b"v1".to_vec()));

        client.update("/cfg", b"v2").await.expect("update");
        assert_eq!(client.read("/cfg", true).await.expect("read"), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn read_distinguishes_optional_and_required() {
        let client = memory_client();
        assert_eq!(client.read("/absent", false).await.expect("optional"), None);
        let err = client.read("/absent", true).await.expect_err("required");
        assert!(err.is_not_found());

        client.mkdir("/dir").await.expect("mkdir");
        let err = client.read("/dir", false).await.expect_err("dir");
        assert!(matches!(err, CoordError::NotFile(_)));
    }

    #[tokio::test]
    async fn list_returns_immediate_children_only() {
        let client = memory_client();
        let store = client.store().clone();
        store
            .set("/groups/1/master", SetOptions::value(b"m".to_vec()))
            .await
            .expect("nested");
        store
            .set("/groups/2", SetOptions::value(b"g".to_vec()))
            .await
            .expect("leaf");

        let children = client.list("/groups", true).await.expect("list");
        assert_eq!(
            children,
            Some(vec!["/groups/1".to_string(), "/groups/2".to_string()])
        );

        let err = client.list("/groups/2", false).await.expect_err("leaf");
        assert!(matches!(err, CoordError::NotDir(_)));

        assert_eq!(client.list("/nothing", false).await.expect("optional"), None);
        assert!(client.list("/nothing", true).await.expect_err("must").is_not_found());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let client = memory_client();
        client.delete("/never").await.expect("absent");

        client
            .store()
            .set("/k", SetOptions::value(b"v".to_vec()))
            .await
            .expect("seed");
        client.delete("/k").await.expect("delete");
        client.delete("/k").await.expect("again");
        assert!(client.read("/k", true).await.expect_err("gone").is_not_found());
    }

    #[tokio::test]
    async fn operations_fail_after_close() {
        let client = memory_client();
        client.close();
        client.close();
        assert!(client.is_closed());

        assert!(matches!(client.mkdir("/a").await, Err(CoordError::ClosedClient)));
        assert!(matches!(client.read("/a", false).await, Err(CoordError::ClosedClient)));
        assert!(matches!(client.list("/a", false).await, Err(CoordError::ClosedClient)));
        assert!(matches!(client.delete("/a").await, Err(CoordError::ClosedClient)));
        assert!(matches!(client.update("/a", b"x").await, Err(CoordError::ClosedClient)));
    }

    /// Store whose reads never complete.
    struct StalledStore;

    #[async_trait]
    impl Store for StalledStore {
        async fn get(&self, _path: &str, _options: ReadOptions) -> StoreResult<StoreResponse> {
            std::future::pending().await
        }

        async fn set(&self, path: &str, _options: SetOptions) -> StoreResult<StoreResponse> {
            Err(StoreError::transport(format!("set {} unsupported", path)))
        }

        async fn create_in_order(
            &self,
            dir: &str,
            _value: Vec<u8>,
            _ttl: Option<Duration>,
        ) -> StoreResult<StoreResponse> {
            Err(StoreError::transport(format!("create {} unsupported", dir)))
        }

        async fn delete(&self, path: &str) -> StoreResult<StoreResponse> {
            Err(StoreError::transport(format!("delete {} unsupported", path)))
        }

        async fn watch_next(&self, _path: &str, _after_index: u64) -> StoreResult<WatchEvent> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_call_times_out() {
        let client = Client::with_store(Arc::new(StalledStore), Duration::from_secs(1));
        let err = client.read("/slow", false).await.expect_err("timeout");
        assert!(matches!(err, CoordError::Timeout(path) if path == "/slow"));
    }

    #[tokio::test]
    async fn close_cancels_in_flight_call() {
        let client = Client::with_store(Arc::new(StalledStore), Duration::from_secs(3600));
        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.read("/slow", false).await })
        };

        tokio::task::yield_now().await;
        client.close();

        let err = pending.await.expect("join").expect_err("canceled");
        assert!(err.is_closed());
    }

    /// Store that closes its client while a read is in flight, then completes the read.
    struct ClosingStore {
        client: std::sync::OnceLock<WeakClient>,
    }

    #[async_trait]
    impl Store for ClosingStore {
        async fn get(&self, path: &str, _options: ReadOptions) -> StoreResult<StoreResponse> {
            if let Some(client) = self.client.get().and_then(WeakClient::upgrade) {
                client.close();
            }
            tokio::task::yield_now().await;
            Ok(StoreResponse {
                action: StoreAction::Get,
                node: StoreNode {
                    key: path.to_string(),
                    value: b"late".to_vec(),
                    ..StoreNode::default()
                },
                index: 1,
            })
        }

        async fn set(&self, path: &str, _options: SetOptions) -> StoreResult<StoreResponse> {
            Err(StoreError::transport(format!("set {} unsupported", path)))
        }

        async fn create_in_order(
            &self,
            dir: &str,
            _value: Vec<u8>,
            _ttl: Option<Duration>,
        ) -> StoreResult<StoreResponse> {
            Err(StoreError::transport(format!("create {} unsupported", dir)))
        }

        async fn delete(&self, path: &str) -> StoreResult<StoreResponse> {
            Err(StoreError::transport(format!("delete {} unsupported", path)))
        }

        async fn watch_next(&self, _path: &str, _after_index: u64) -> StoreResult<WatchEvent> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn call_racing_close_reports_canceled() {
        let store = Arc::new(ClosingStore {
            client: std::sync::OnceLock::new(),
        });
        let client = Client::with_store(store.clone(), Duration::from_secs(5));
        assert!(store.client.set(client.downgrade()).is_ok());

        let err = client.read("/racing", false).await.expect_err("canceled");
        assert!(matches!(err, CoordError::Canceled));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn weak_handle_does_not_keep_client_alive() {
        let client = memory_client();
        let weak = client.downgrade();
        assert!(weak.begin().is_ok());

        let token = weak.begin().expect("token");
        drop(client);

        assert!(weak.upgrade().is_none());
        assert!(matches!(weak.begin(), Err(CoordError::ClosedClient)));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn transport_errors_propagate() {
        let client = Client::with_store(Arc::new(StalledStore), Duration::from_secs(1));
        let err = client.mkdir("/x").await.expect_err("transport");
        assert!(matches!(err, CoordError::Store(_)));
    }
}
