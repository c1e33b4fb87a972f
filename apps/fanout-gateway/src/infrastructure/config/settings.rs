//! Gateway Configuration Settings
//!
//! Configuration types for the gateway, loaded from environment variables.
//! Socket keepalive deadlines and the mailbox size are fixed and not read
//! from the environment.

use std::time::Duration;

/// Subscription index backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// Redis, shared across gateway instances.
    #[default]
    Redis,
    /// Process-local sets.
    Memory,
}

impl StoreBackend {
    /// Parse a backend name, ignoring case.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "redis" => Some(Self::Redis),
            "memory" | "in-memory" | "inmemory" => Some(Self::Memory),
            _ => None,
        }
    }

    /// Backend name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::Memory => "memory",
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Port serving `/ws`, `/health`, `/healthz`, `/metrics` and `/`.
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

/// Highest `REDIS_NODE_{n}_HOST` index read.
const MAX_REDIS_NODES: usize = 6;

/// Subscription store settings.
#[derive(Clone)]
pub struct StoreSettings {
    /// Selected backend.
    pub backend: StoreBackend,
    /// Redis node URLs. More than one selects cluster mode.
    pub redis_nodes: Vec<String>,
    /// Deadline for each store operation.
    pub timeout: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_nodes: vec!["redis://127.0.0.1:6379".to_string()],
            timeout: Duration::from_millis(2000),
        }
    }
}

impl StoreSettings {
    /// Whether the nodes form a Redis Cluster.
    #[must_use]
    pub fn is_cluster(&self) -> bool {
        self.redis_nodes.len() > 1
    }

    /// Node URLs with any password replaced.
    #[must_use]
    pub fn redacted_nodes(&self) -> Vec<String> {
        self.redis_nodes.iter().map(|url| redact(url)).collect()
    }
}

impl std::fmt::Debug for StoreSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSettings")
            .field("backend", &self.backend)
            .field("redis_nodes", &self.redacted_nodes())
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn redact(url: &str) -> String {
    match (url.split_once("://"), url.rfind('@')) {
        (Some((scheme, _)), Some(at)) => format!("{scheme}://[REDACTED]{}", &url[at..]),
        _ => url.to_string(),
    }
}

/// Hub settings.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Capacity of the hub's intent channel.
    pub intent_capacity: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            intent_capacity: 1024,
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// HTTP listener settings.
    pub server: ServerSettings,
    /// Subscription store settings.
    pub store: StoreSettings,
    /// Hub settings.
    pub hub: HubSettings,
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable holds an unusable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable holds an unusable value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let port = lookup("GATEWAY_PORT")
            .or_else(|| lookup("PORT"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.server.port);

        let backend = match non_empty(&lookup, "SUBSCRIPTION_BACKEND") {
            Some(raw) => StoreBackend::from_str_case_insensitive(&raw).ok_or_else(|| {
                ConfigError::InvalidValue {
                    key: "SUBSCRIPTION_BACKEND".to_string(),
                    value: raw,
                }
            })?,
            None => defaults.store.backend,
        };

        let redis_nodes = match non_empty(&lookup, "REDIS_URL") {
            Some(url) => vec![url],
            None => {
                let nodes = redis_nodes_from_env(&lookup);
                if nodes.is_empty() {
                    defaults.store.redis_nodes
                } else {
                    nodes
                }
            }
        };

        let timeout = parse_env_duration_millis(
            &lookup,
            "SUBSCRIPTION_STORE_TIMEOUT_MS",
            defaults.store.timeout,
        );
        if timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "SUBSCRIPTION_STORE_TIMEOUT_MS".to_string(),
                value: "0".to_string(),
            });
        }

        let intent_capacity = parse_env_usize(
            &lookup,
            "HUB_INTENT_CAPACITY",
            defaults.hub.intent_capacity,
        )
        .max(1);

        Ok(Self {
            server: ServerSettings { port },
            store: StoreSettings {
                backend,
                redis_nodes,
                timeout,
            },
            hub: HubSettings { intent_capacity },
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable holds a value that cannot be used.
    #[error("invalid value {value:?} for environment variable {key}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}

/// URLs for `REDIS_NODE_1..6`, skipping slots without a host.
fn redis_nodes_from_env(lookup: &impl Fn(&str) -> Option<String>) -> Vec<String> {
    let password = non_empty(lookup, "REDIS_PASSWORD");
    (1..=MAX_REDIS_NODES)
        .filter_map(|n| {
            let host = non_empty(lookup, &format!("REDIS_NODE_{n}_HOST"))?;
            let port = non_empty(lookup, &format!("REDIS_NODE_{n}_PORT"))
                .unwrap_or_else(|| "6379".to_string());
            Some(match &password {
                Some(password) => format!("redis://:{password}@{host}:{port}"),
                None => format!("redis://{host}:{port}"),
            })
        })
        .collect()
}

fn parse_env_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
