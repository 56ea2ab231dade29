//! Configuration types
//!
//! Endpoints, credentials and on-chain addresses are injected at process
//! start from defaults, optional config files and `ECOHO__*` environment
//! variables. Nothing here is compiled in beyond protocol defaults.

use config::builder::{ConfigBuilder, DefaultState};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::{CoreError, CoreResult, ErrorDetail, DEFAULT_BLOCK_CAPACITY};

/// Default bound for a single outbound request
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Substrings marking a value that was never filled in
const PLACEHOLDER_MARKERS: &[&str] = &["placeholder", "your_", "replace_me", "changeme"];

/// True for values left at a template placeholder
pub fn is_placeholder(value: &str) -> bool {
    let lowered = value.to_ascii_lowercase();
    PLACEHOLDER_MARKERS.iter().any(|m| lowered.contains(m))
}

fn default_api_key_header() -> String {
    "X-API-KEY".to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

/// One network endpoint plus its credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    #[serde(default)]
    pub require_api_key: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            api_key_header: default_api_key_header(),
            require_api_key: false,
            timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl EndpointConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Check the endpoint is usable without touching the network
    pub fn validate(&self, component: &str, schemes: &[&str]) -> Result<ValidatedEndpoint, ErrorDetail> {
        let url = match self.url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url,
            _ => return Err(ErrorDetail::configuration(component, "endpoint URL is not configured")),
        };

        if is_placeholder(url) {
            return Err(ErrorDetail::configuration(component, "endpoint URL is a placeholder"));
        }

        let scheme_ok = schemes
            .iter()
            .any(|scheme| url.len() > scheme.len() + 3 && url.starts_with(&format!("{scheme}://")));
        if !scheme_ok {
            return Err(ErrorDetail::configuration(
                component,
                format!("endpoint URL must use one of {schemes:?}"),
            ));
        }

        let api_key = match self.api_key.as_deref().map(str::trim) {
            Some(key) if key.is_empty() => None,
            Some(key) if is_placeholder(key) => {
                return Err(ErrorDetail::configuration(component, "API key is a placeholder"));
            }
            Some(key) => Some(key.to_string()),
            None => None,
        };

        if self.require_api_key && api_key.is_none() {
            return Err(ErrorDetail::configuration(component, "API key is not configured"));
        }

        if self.timeout_ms == 0 {
            return Err(ErrorDetail::configuration(component, "timeout_ms must be positive"));
        }

        Ok(ValidatedEndpoint {
            url: url.to_string(),
            api_key,
            api_key_header: self.api_key_header.clone(),
            timeout: self.timeout(),
        })
    }
}

/// Endpoint that passed validation
#[derive(Clone, PartialEq, Eq)]
pub struct ValidatedEndpoint {
    pub url: String,
    pub api_key: Option<String>,
    pub api_key_header: String,
    pub timeout: Duration,
}

impl ValidatedEndpoint {
    /// URL with the API key appended as a query parameter, if one is set
    pub fn url_with_key_param(&self, param: &str) -> String {
        match &self.api_key {
            Some(key) => {
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}{}={}", self.url, sep, param, percent_encode(key))
            }
            None => self.url.clone(),
        }
    }
}

/// Query-component encoding: RFC 3986 unreserved bytes pass through
fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

impl std::fmt::Debug for ValidatedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatedEndpoint")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_key_header", &self.api_key_header)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Token and market the analytics queries target
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub token_mint: String,
    pub quote_mint: String,
    pub market_address: String,
}

/// GraphQL-backed source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphQlSourceConfig {
    #[serde(default)]
    pub endpoint: EndpointConfig,
}

fn default_ath_method() -> String {
    "GET".to_string()
}

fn default_ath_pointer() -> String {
    "/market_data/ath/usd".to_string()
}

/// REST source for the all-time-high price
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AthSourceConfig {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default = "default_ath_method")]
    pub method: String,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    /// JSON pointer to the USD value in the response
    #[serde(default = "default_ath_pointer")]
    pub value_pointer: String,
}

impl Default for AthSourceConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            method: default_ath_method(),
            body: None,
            value_pointer: default_ath_pointer(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub price_volume: GraphQlSourceConfig,
    #[serde(default)]
    pub liquidity: GraphQlSourceConfig,
    #[serde(default)]
    pub all_time_high: AthSourceConfig,
}

/// Aggregation configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Overall bound for one aggregation; pending sources become timeouts
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    /// Snapshot reuse window, 0 disables caching
    #[serde(default)]
    pub cache_ttl_ms: u64,
}

impl AggregationConfig {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

/// Block header subscription configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    pub subscribe_method: String,
    pub notification_method: String,
    pub event: String,
    pub request_id: u64,
    pub capacity: usize,
    pub connect_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            subscribe_method: "eth_subscribe".to_string(),
            notification_method: "eth_subscription".to_string(),
            event: "newHeads".to_string(),
            request_id: 1,
            capacity: DEFAULT_BLOCK_CAPACITY,
            connect_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl StreamConfig {
    pub fn with_endpoint(url: impl Into<String>) -> Self {
        Self {
            endpoint: EndpointConfig::with_url(url),
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Reconnect policy for the block feed supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            max_attempts: 10,
        }
    }
}

/// Complete data layer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataLayerConfig {
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub block_feed: StreamConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl DataLayerConfig {
    /// Load defaults, then `config/default`, `config/local`, then `ECOHO__*` env vars
    pub fn load() -> CoreResult<Self> {
        let config = Self::builder()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("ECOHO")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Self::from_config(config)
    }

    /// Builder seeded with protocol defaults; callers add their own sources
    pub fn builder() -> CoreResult<ConfigBuilder<DefaultState>> {
        let defaults = StreamConfig::default();
        let reconnect = ReconnectConfig::default();

        Ok(Config::builder()
            .set_default("aggregation.cache_ttl_ms", 0)?
            .set_default("block_feed.subscribe_method", defaults.subscribe_method)?
            .set_default("block_feed.notification_method", defaults.notification_method)?
            .set_default("block_feed.event", defaults.event)?
            .set_default("block_feed.request_id", defaults.request_id)?
            .set_default("block_feed.capacity", defaults.capacity as u64)?
            .set_default("block_feed.connect_timeout_ms", defaults.connect_timeout_ms)?
            .set_default("reconnect.enabled", reconnect.enabled)?
            .set_default("reconnect.initial_backoff_ms", reconnect.initial_backoff_ms)?
            .set_default("reconnect.max_backoff_ms", reconnect.max_backoff_ms)?
            .set_default("reconnect.max_attempts", reconnect.max_attempts as u64)?)
    }

    /// Deserialize and check a built configuration
    pub fn from_config(config: Config) -> CoreResult<Self> {
        let loaded: DataLayerConfig = config.try_deserialize()?;
        loaded.check()?;
        debug!("Loaded configuration: {}", loaded.digest());
        Ok(loaded)
    }

    /// Structural checks; per-endpoint credential checks happen in each component
    pub fn check(&self) -> CoreResult<()> {
        if self.block_feed.capacity == 0 {
            return Err(CoreError::InvalidConfig("block_feed.capacity must be positive".into()));
        }
        if self.block_feed.connect_timeout_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "block_feed.connect_timeout_ms must be positive".into(),
            ));
        }
        if self.reconnect.initial_backoff_ms > self.reconnect.max_backoff_ms {
            return Err(CoreError::InvalidConfig(
                "reconnect.initial_backoff_ms exceeds reconnect.max_backoff_ms".into(),
            ));
        }
        if self.aggregation.deadline_ms == Some(0) {
            return Err(CoreError::InvalidConfig("aggregation.deadline_ms must be positive".into()));
        }
        Ok(())
    }

    /// Secret-free one-line summary for logs
    pub fn digest(&self) -> String {
        let state = |e: &EndpointConfig| match e.url.as_deref() {
            None => "unset",
            Some(url) if is_placeholder(url) => "placeholder",
            Some(_) => "set",
        };
        format!(
            "price_volume={} liquidity={} all_time_high={} block_feed={} deadline_ms={:?} cache_ttl_ms={} reconnect={}",
            state(&self.sources.price_volume.endpoint),
            state(&self.sources.liquidity.endpoint),
            state(&self.sources.all_time_high.endpoint),
            state(&self.block_feed.endpoint),
            self.aggregation.deadline_ms,
            self.aggregation.cache_ttl_ms,
            self.reconnect.enabled,
        )
    }
}
