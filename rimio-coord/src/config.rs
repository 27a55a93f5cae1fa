use crate::error::{CoordError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Comma-separated endpoint list, e.g. `127.0.0.1:2379,127.0.0.1:22379`.
    #[serde(default)]
    pub endpoints: String,
    /// Optional `user:password`.
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Etcd,
    Memory,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Etcd => "etcd",
            StoreBackend::Memory => "memory",
        }
    }
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            endpoints: String::new(),
            auth: None,
            timeout_ms: default_timeout_ms(),
            namespace: None,
        }
    }
}

impl CoordConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("RIMIO_COORD"))
            .build()
            .map_err(|e| CoordError::Config(e.to_string()))?;

        let config: CoordConfig = settings
            .try_deserialize()
            .map_err(|e| CoordError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        effective_timeout(Duration::from_millis(self.timeout_ms))
    }

    pub fn endpoint_list(&self) -> Vec<String> {
        parse_endpoints(&self.endpoints)
    }
}

/// Splits a comma-separated endpoint list and prefixes bare `host:port` entries with `http://`.
pub fn parse_endpoints(addrlist: &str) -> Vec<String> {
    addrlist
        .split(',')
        .map(str::trim)
        .filter(|endpoint| !endpoint.is_empty())
        .map(|endpoint| {
            if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                endpoint.to_string()
            } else {
                format!("http://{}", endpoint)
            }
        })
        .collect()
}

/// Parses an optional `user:password` string. An empty string means no auth.
pub fn parse_auth(auth: Option<&str>) -> Result<Option<(String, String)>> {
    let auth = match auth {
        Some(auth) if !auth.is_empty() => auth,
        _ => return Ok(None),
    };

    match auth.split_once(':') {
        Some((user, password)) if !user.is_empty() => {
            Ok(Some((user.to_string(), password.to_string())))
        }
        _ => Err(CoordError::InvalidAuth),
    }
}

pub fn effective_timeout(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        DEFAULT_TIMEOUT
    } else {
        timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn endpoints_are_normalized() {
        assert_eq!(
            parse_endpoints("127.0.0.1:2379, http://10.0.0.2:2379,,https://etcd:2379"),
            vec![
                "http://127.0.0.1:2379".to_string(),
                "http://10.0.0.2:2379".to_string(),
                "https://etcd:2379".to_string(),
            ]
        );
        assert!(parse_endpoints("").is_empty());
    }

    #[test]
    fn auth_requires_user_and_separator() {
        assert!(parse_auth(None).expect("none").is_none());
        assert!(parse_auth(Some("")).expect("empty").is_none());
        assert_eq!(
            parse_auth(Some("root:pa:ss")).expect("auth"),
            Some(("root".to_string(), "pa:ss".to_string()))
        );
        assert_eq!(
            parse_auth(Some("root:")).expect("auth"),
            Some(("root".to_string(), String::new()))
        );
        assert!(matches!(parse_auth(Some("root")), Err(CoordError::InvalidAuth)));
        assert!(matches!(parse_auth(Some(":secret")), Err(CoordError::InvalidAuth)));
    }

    #[test]
    fn zero_timeout_falls_back_to_default() {
        assert_eq!(effective_timeout(Duration::ZERO), DEFAULT_TIMEOUT);
        assert_eq!(
            effective_timeout(Duration::from_millis(1500)),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn load_from_toml_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("coord.toml");
        let mut file = std::fs::File::create(&path).expect("create");
        writeln!(
            file,
            "backend = \"memory\"\nendpoints = \"127.0.0.1:2379,127.0.0.1:22379\"\ntimeout_ms = 0\nnamespace = \"proxy\""
        )
        .expect("write");

        let config = CoordConfig::from_file(path.to_str().expect("utf8 path")).expect("load");
        assert_eq!(config.backend, StoreBackend::Memory);
        assert_eq!(config.endpoint_list().len(), 2);
        assert_eq!(config.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(config.namespace.as_deref(), Some("proxy"));
        assert!(config.auth.is_none());
    }

    #[test]
    fn omitted_fields_take_defaults() {
        let config: CoordConfig =
            serde_json::from_str(r#"{"endpoints": "127.0.0.1:2379"}"#).expect("decode");
        assert_eq!(config.backend, StoreBackend::Etcd);
        assert_eq!(config.timeout_ms, 5000);
        assert!(config.namespace.is_none());

        let encoded = serde_json::to_value(&config).expect("encode");
        assert_eq!(encoded["backend"], "etcd");
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = CoordConfig::from_file("/nonexistent/rimio-coord.toml").expect_err("missing");
        assert!(matches!(err, CoordError::Config(_)));
    }
}
