use super::{
    PrevExist, ReadOptions, SetOptions, Store, StoreAction, StoreError, StoreErrorCode, StoreNode,
    StoreResponse, StoreResult, WatchEvent, immediate_child, in_order_name, join_path,
    normalize_path, parent_dirs,
};
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, KeyValue, PutOptions,
    SortOrder, SortTarget, Txn, TxnOp, TxnOpResponse, WatchOptions,
};
use std::time::Duration;

/// Tag byte stored in front of every value to tell directories from files.
const DIR_TAG: u8 = b'd';
const FILE_TAG: u8 = b'f';

/// Attempts at an optimistic transaction before reporting a conflict.
const MAX_TXN_ATTEMPTS: usize = 8;

/// etcd v3 backend emulating the hierarchical directory model.
///
/// Every node lives at its own path (under an optional prefix) with a one-byte
/// kind tag. TTL files are attached to a dedicated lease, ordered names come
/// from the parent directory marker's version, and watches are prefix watches
/// on the directory.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    prefix: String,
}

fn encode_file(value: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(value.len() + 1);
    encoded.push(FILE_TAG);
    encoded.extend_from_slice(value);
    encoded
}

fn is_dir(kv: &KeyValue) -> bool {
    kv.value().first() == Some(&DIR_TAG)
}

fn file_value(kv: &KeyValue) -> Vec<u8> {
    kv.value().get(1..).map(<[u8]>::to_vec).unwrap_or_default()
}

fn ttl_seconds(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1) as i64
}

fn revision(header: Option<&etcd_client::ResponseHeader>) -> u64 {
    header.map(|header| header.revision().max(0) as u64).unwrap_or(0)
}

impl From<etcd_client::Error> for StoreError {
    fn from(err: etcd_client::Error) -> Self {
        StoreError::transport(err.to_string())
    }
}

impl EtcdStore {
    pub async fn connect(
        endpoints: &[String],
        auth: Option<(String, String)>,
        namespace: Option<&str>,
    ) -> StoreResult<Self> {
        let options = auth.map(|(user, password)| ConnectOptions::new().with_user(user, password));
        let client = Client::connect(endpoints, options).await?;

        let prefix = namespace
            .map(str::trim)
            .filter(|namespace| !namespace.is_empty())
            .map(normalize_path)
            .unwrap_or_default();

        tracing::info!(
            "connected to etcd endpoints={:?} prefix={:?}",
            endpoints,
            prefix
        );

        Ok(Self { client, prefix })
    }

    fn etcd_key(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path)
    }

    fn child_prefix(&self, path: &str) -> String {
        if path == "/" {
            format!("{}/", self.prefix)
        } else {
            format!("{}{}/", self.prefix, path)
        }
    }

    fn node_path(&self, key: &[u8]) -> String {
        let key = String::from_utf8_lossy(key).into_owned();
        match key.strip_prefix(self.prefix.as_str()) {
            Some(path) => path.to_string(),
            None => key,
        }
    }

    fn to_node(&self, kv: &KeyValue) -> StoreNode {
        let dir = is_dir(kv);
        StoreNode {
            key: self.node_path(kv.key()),
            value: if dir { Vec::new() } else { file_value(kv) },
            dir,
            nodes: Vec::new(),
            ttl: None,
            modified_index: kv.mod_revision().max(0) as u64,
        }
    }

    async fn get_kv(&self, path: &str) -> StoreResult<(Option<KeyValue>, u64)> {
        let mut client = self.client.clone();
        let mut resp = client.get(self.etcd_key(path), None).await?;
        let index = revision(resp.header());
        Ok((resp.take_kvs().into_iter().next(), index))
    }

    /// Creates missing ancestor directories of `path`, failing if one of them is a file.
    async fn ensure_parents(&self, path: &str) -> StoreResult<()> {
        for parent in parent_dirs(path) {
            self.ensure_dir(&parent).await?;
        }
        Ok(())
    }

    async fn ensure_dir(&self, dir: &str) -> StoreResult<()> {
        if dir == "/" {
            return Ok(());
        }

        let key = self.etcd_key(dir);
        let txn = Txn::new()
            .when(vec![Compare::version(key.clone(), CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key.clone(), vec![DIR_TAG], None)])
            .or_else(vec![TxnOp::get(key, None)]);

        let mut client = self.client.clone();
        let resp = client.txn(txn).await?;
        if resp.succeeded() {
            return Ok(());
        }

        for op in resp.op_responses() {
            if let TxnOpResponse::Get(get) = op {
                if let Some(kv) = get.kvs().first() {
                    if !is_dir(kv) {
                        return Err(StoreError::new(StoreErrorCode::NotDir, dir));
                    }
                }
            }
        }
        Ok(())
    }

    async fn grant_lease(&self, ttl: Option<Duration>) -> StoreResult<Option<i64>> {
        let Some(ttl) = ttl else {
            return Ok(None);
        };
        let mut client = self.client.clone();
        let lease = client.lease_grant(ttl_seconds(ttl), None).await?;
        Ok(Some(lease.id()))
    }

    async fn revoke_lease(&self, lease: Option<i64>) {
        if let Some(id) = lease {
            let mut client = self.client.clone();
            if let Err(error) = client.lease_revoke(id).await {
                tracing::debug!("etcd revoke lease {} failed: {}", id, error);
            }
        }
    }

    async fn refresh(&self, path: &str, ttl: Option<Duration>) -> StoreResult<StoreResponse> {
        let (kv, _) = self.get_kv(path).await?;
        let kv = kv.ok_or_else(|| StoreError::new(StoreErrorCode::KeyNotFound, path))?;
        if is_dir(&kv) {
            return Err(StoreError::new(StoreErrorCode::NotFile, path));
        }

        if kv.lease() != 0 {
            let mut client = self.client.clone();
            let (mut keeper, mut stream) = client.lease_keep_alive(kv.lease()).await?;
            keeper.keep_alive().await?;
            return match stream.message().await? {
                Some(resp) if resp.ttl() > 0 => {
                    let mut node = self.to_node(&kv);
                    node.ttl = Some(Duration::from_secs(resp.ttl() as u64));
                    Ok(StoreResponse {
                        action: StoreAction::Update,
                        node,
                        index: revision(resp.header()),
                    })
                }
                _ => Err(StoreError::new(StoreErrorCode::KeyNotFound, path)),
            };
        }

        // A durable file gains a TTL: rewrite it under a fresh lease.
        let lease = self.grant_lease(ttl).await?;
        let key = self.etcd_key(path);
        let put_options = lease.map(|id| PutOptions::new().with_lease(id));
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(
                key.clone(),
                CompareOp::Equal,
                kv.mod_revision(),
            )])
            .and_then(vec![TxnOp::put(key, kv.value().to_vec(), put_options)]);

        let mut client = self.client.clone();
        let resp = client.txn(txn).await?;
        if !resp.succeeded() {
            self.revoke_lease(lease).await;
            return Err(StoreError::new(StoreErrorCode::TestFailed, path));
        }

        let mut node = self.to_node(&kv);
        node.ttl = ttl;
        Ok(StoreResponse {
            action: StoreAction::Update,
            node,
            index: revision(resp.header()),
        })
    }
}

#[async_trait]
impl Store for EtcdStore {
    async fn get(&self, path: &str, options: ReadOptions) -> StoreResult<StoreResponse> {
        let path = normalize_path(path);
        let (kv, index) = self.get_kv(&path).await?;

        let mut node = match kv {
            Some(kv) => self.to_node(&kv),
            None if path == "/" => StoreNode {
                key: path.clone(),
                dir: true,
                ..StoreNode::default()
            },
            None => return Err(StoreError::new(StoreErrorCode::KeyNotFound, path)),
        };

        if node.dir {
            let prefix = self.child_prefix(&path);
            let mut get_options = GetOptions::new()
                .with_prefix()
                .with_revision(index as i64);
            if options.sorted {
                get_options = get_options.with_sort(SortTarget::Key, SortOrder::Ascend);
            }

            let mut client = self.client.clone();
            let resp = client.get(prefix, Some(get_options)).await?;
            node.nodes = resp
                .kvs()
                .iter()
                .map(|kv| self.to_node(kv))
                .filter(|child| immediate_child(&path, &child.key).is_some())
                .collect();
        }

        Ok(StoreResponse {
            action: StoreAction::Get,
            node,
            index,
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

        if options.refresh {
            return self.refresh(&path, options.ttl).await;
        }

        let key = self.etcd_key(&path);
        let encoded = if options.dir {
            vec![DIR_TAG]
        } else {
            encode_file(&options.value)
        };
        let lease = self.grant_lease(options.ttl).await?;

        for _ in 0..MAX_TXN_ATTEMPTS {
            let (existing, _) = match self.get_kv(&path).await {
                Ok(found) => found,
                Err(error) => {
                    self.revoke_lease(lease).await;
                    return Err(error);
                }
            };

            let rejected = match (options.prev_exist, &existing) {
                (PrevExist::MustNotExist, Some(_)) => Some(StoreErrorCode::NodeExist),
                (PrevExist::MustExist, None) => Some(StoreErrorCode::KeyNotFound),
                (_, Some(kv)) if is_dir(kv) && options.dir => Some(StoreErrorCode::NodeExist),
                (_, Some(kv)) if is_dir(kv) => Some(StoreErrorCode::NotFile),
                (_, Some(_)) if options.dir => Some(StoreErrorCode::NotDir),
                _ => None,
            };
            if let Some(code) = rejected {
                self.revoke_lease(lease).await;
                return Err(StoreError::new(code, path));
            }

            if existing.is_none() {
                if let Err(error) = self.ensure_parents(&path).await {
                    self.revoke_lease(lease).await;
                    return Err(error);
                }
            }

            let compare = match &existing {
                Some(kv) => Compare::mod_revision(key.clone(), CompareOp::Equal, kv.mod_revision()),
                None => Compare::version(key.clone(), CompareOp::Equal, 0),
            };
            let put_options = lease.map(|id| PutOptions::new().with_lease(id));
            let txn = Txn::new()
                .when(vec![compare])
                .and_then(vec![TxnOp::put(key.clone(), encoded.clone(), put_options)]);

            let mut client = self.client.clone();
            let resp = match client.txn(txn).await {
                Ok(resp) => resp,
                Err(error) => {
                    self.revoke_lease(lease).await;
                    return Err(error.into());
                }
            };
            if !resp.succeeded() {
                tracing::debug!("etcd set {} raced with another writer, retrying", path);
                continue;
            }

            let action = match (options.prev_exist, existing.is_some()) {
                (PrevExist::MustNotExist, _) | (PrevExist::Any, false) => StoreAction::Create,
                (PrevExist::MustExist, _) => StoreAction::Update,
                (PrevExist::Any, true) => StoreAction::Set,
            };
            let index = revision(resp.header());
            return Ok(StoreResponse {
                action,
                node: StoreNode {
                    key: path,
                    value: if options.dir { Vec::new() } else { options.value },
                    dir: options.dir,
                    nodes: Vec::new(),
                    ttl: options.ttl,
                    modified_index: index,
                },
                index,
            });
        }

        self.revoke_lease(lease).await;
        Err(StoreError::new(StoreErrorCode::TestFailed, path))
    }

    async fn create_in_order(
        &self,
        dir: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StoreResult<StoreResponse> {
        let dir = normalize_path(dir);
        self.ensure_parents(&dir).await?;
        self.ensure_dir(&dir).await?;

        let dir_key = self.etcd_key(&dir);
        let encoded = encode_file(&value);
        let lease = self.grant_lease(ttl).await?;

        for _ in 0..MAX_TXN_ATTEMPTS {
            let (marker, _) = match self.get_kv(&dir).await {
                Ok(found) => found,
                Err(error) => {
                    self.revoke_lease(lease).await;
                    return Err(error);
                }
            };
            // The root has no marker; its children are ordered by a hidden sequence key.
            let (seq_key, version) = match marker {
                Some(kv) => (dir_key.clone(), kv.version()),
                None => (format!("{}/", self.prefix), 0),
            };

            let key = join_path(&dir, &in_order_name(version as u64 + 1));
            let put_options = lease.map(|id| PutOptions::new().with_lease(id));
            let txn = Txn::new()
                .when(vec![Compare::version(
                    seq_key.clone(),
                    CompareOp::Equal,
                    version,
                )])
                .and_then(vec![
                    TxnOp::put(seq_key, vec![DIR_TAG], None),
                    TxnOp::put(self.etcd_key(&key), encoded.clone(), put_options),
                ]);

            let mut client = self.client.clone();
            let resp = match client.txn(txn).await {
                Ok(resp) => resp,
                Err(error) => {
                    self.revoke_lease(lease).await;
                    return Err(error.into());
                }
            };
            if !resp.succeeded() {
                tracing::debug!("etcd create-in-order under {} raced, retrying", dir);
                continue;
            }

            let index = revision(resp.header());
            return Ok(StoreResponse {
                action: StoreAction::Create,
                node: StoreNode {
                    key,
                    value,
                    dir: false,
                    nodes: Vec::new(),
                    ttl,
                    modified_index: index,
                },
                index,
            });
        }

        self.revoke_lease(lease).await;
        Err(StoreError::new(StoreErrorCode::TestFailed, dir))
    }

    async fn delete(&self, path: &str) -> StoreResult<StoreResponse> {
        let path = normalize_path(path);
        if path == "/" {
            return Err(StoreError::new(StoreErrorCode::NotFile, path));
        }

        let key = self.etcd_key(&path);
        for _ in 0..MAX_TXN_ATTEMPTS {
            // Re-read on every attempt: a concurrent delete turns into KeyNotFound.
            let (kv, _) = self.get_kv(&path).await?;
            let kv =
                kv.ok_or_else(|| StoreError::new(StoreErrorCode::KeyNotFound, path.as_str()))?;
            if is_dir(&kv) {
                return Err(StoreError::new(StoreErrorCode::NotFile, path));
            }

            let txn = Txn::new()
                .when(vec![Compare::mod_revision(
                    key.clone(),
                    CompareOp::Equal,
                    kv.mod_revision(),
                )])
                .and_then(vec![TxnOp::delete(key.clone(), None)]);

            let mut client = self.client.clone();
            let resp = client.txn(txn).await?;
            if !resp.succeeded() {
                tracing::debug!("etcd delete {} raced with another writer, retrying", path);
                continue;
            }

            return Ok(StoreResponse {
                action: StoreAction::Delete,
                node: self.to_node(&kv),
                index: revision(resp.header()),
            });
        }

        Err(StoreError::new(StoreErrorCode::TestFailed, path))
    }

    async fn watch_next(&self, path: &str, after_index: u64) -> StoreResult<WatchEvent> {
        let path = normalize_path(path);
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(after_index as i64 + 1);

        let mut client = self.client.clone();
        let (mut watcher, mut stream) = client.watch(self.child_prefix(&path), Some(options)).await?;

        let result = loop {
            let Some(resp) = stream.message().await? else {
                break Err(StoreError::transport("etcd watch stream closed"));
            };

            if resp.canceled() {
                let code = if resp.compact_revision() > 0 {
                    StoreErrorCode::EventIndexCleared
                } else {
                    StoreErrorCode::Transport
                };
                break Err(StoreError::new(code, path.as_str()));
            }

            if let Some(event) = resp.events().first() {
                let Some(kv) = event.kv() else {
                    continue;
                };
                let action = match event.event_type() {
                    EventType::Put if kv.version() == 1 => StoreAction::Create,
                    EventType::Put => StoreAction::Update,
                    EventType::Delete => StoreAction::Delete,
                };
                break Ok(WatchEvent {
                    action,
                    key: self.node_path(kv.key()),
                    index: kv.mod_revision().max(0) as u64,
                });
            }
        };

        if let Err(error) = watcher.cancel().await {
            tracing::debug!("etcd cancel watch on {} failed: {}", path, error);
        }
        result
    }
}
