use super::{EtcdStore, MemoryStore, Store};
use crate::config::{CoordConfig, parse_auth, parse_endpoints};
use crate::{CoordError, Result};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct StoreBuilder {
    backend: Option<String>,
    namespace: Option<String>,
    endpoints: Option<Vec<String>>,
    auth: Option<String>,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &CoordConfig) -> Self {
        let mut builder = Self::new()
            .backend(config.backend.as_str())
            .endpoints(config.endpoint_list());
        if let Some(auth) = &config.auth {
            builder = builder.auth(auth.clone());
        }
        if let Some(namespace) = &config.namespace {
            builder = builder.namespace(namespace.clone());
        }
        builder
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    /// Comma-separated endpoint list; bare `host:port` entries get an `http://` scheme.
    pub fn endpoint_list(self, addrlist: &str) -> Self {
        self.endpoints(parse_endpoints(addrlist))
    }

    pub fn auth(mut self, auth: impl Into<String>) -> Self {
        self.auth = Some(auth.into());
        self
    }

    fn resolve_namespace(&self) -> Option<String> {
        self.namespace
            .as_deref()
            .map(str::trim)
            .filter(|namespace| !namespace.is_empty())
            .map(str::to_string)
    }

    fn resolve_backend(&self) -> Result<String> {
        let backend = self
            .backend
            .as_deref()
            .unwrap_or("etcd")
            .trim()
            .to_ascii_lowercase();

        if backend.is_empty() {
            return Err(CoordError::Config("store backend cannot be empty".to_string()));
        }

        Ok(backend)
    }

    pub async fn build(&self) -> Result<Arc<dyn Store>> {
        let backend = self.resolve_backend()?;
        let namespace = self.resolve_namespace();
        let auth = parse_auth(self.auth.as_deref())?;

        match backend.as_str() {
            "etcd" => {
                let endpoints = self.endpoints.clone().ok_or_else(|| {
                    CoordError::Config("etcd endpoints are required for etcd backend".to_string())
                })?;

                if endpoints.is_empty() {
                    return Err(CoordError::Config(
                        "etcd endpoints cannot be empty for etcd backend".to_string(),
                    ));
                }

                let store = EtcdStore::connect(&endpoints, auth, namespace.as_deref()).await?;
                Ok(Arc::new(store))
            }
            "memory" => {
                let store = match namespace {
                    Some(namespace) => MemoryStore::shared(&namespace),
                    None => MemoryStore::new(),
                };
                Ok(Arc::new(store))
            }
            other => Err(CoordError::Config(format!(
                "unsupported store backend: {}",
                other
            ))),
        }
    }
}
