//! Configuration types for attn-relay.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tracing::Dispatch;

use crate::signer::Signer;
use crate::Error;

pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_PUBLISH_AUTH_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_MULTI_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// A relay URL and whether it expects NIP-42 authentication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelayEndpoint {
    url: String,
    requires_auth: bool,
}

impl RelayEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            requires_auth: false,
        }
    }

    pub fn with_auth(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            requires_auth: true,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn requires_auth(&self) -> bool {
        self.requires_auth
    }
}

/// Allow-lists used to build subscription filters. An empty list means no
/// restriction along that dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilters {
    /// Authors allowed to publish block events.
    pub node_pubkeys: Vec<String>,
    pub marketplace_pubkeys: Vec<String>,
    pub billboard_pubkeys: Vec<String>,
    pub advertiser_pubkeys: Vec<String>,
    /// Marketplace identifiers matched against `#d`.
    pub marketplace_d_tags: Vec<String>,
}

/// Everything one [`crate::Connection`] needs.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub endpoint: RelayEndpoint,
    pub signer: Arc<dyn Signer>,
    pub filters: SubscriptionFilters,
    pub subscription_since: Option<u64>,
    pub connection_timeout: Duration,
    pub auth_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub auto_reconnect: bool,
    /// Logger for this connection's task. `None` uses the process default;
    /// `Some(Dispatch::none())` silences it.
    pub dispatch: Option<Dispatch>,
}

impl ConnectionConfig {
    pub fn new(endpoint: RelayEndpoint, signer: Arc<dyn Signer>) -> Self {
        Self {
            endpoint,
            signer,
            filters: SubscriptionFilters::default(),
            subscription_since: None,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            auto_reconnect: true,
            dispatch: None,
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("endpoint", &self.endpoint)
            .field("filters", &self.filters)
            .field("subscription_since", &self.subscription_since)
            .field("connection_timeout", &self.connection_timeout)
            .field("auth_timeout", &self.auth_timeout)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("auto_reconnect", &self.auto_reconnect)
            .finish()
    }
}

/// Timeouts for one publish operation.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Bounds the connect phase and the wait for the event's OK.
    pub timeout: Duration,
    pub auth_timeout: Duration,
    pub requires_auth: bool,
    pub dispatch: Option<Dispatch>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PUBLISH_TIMEOUT,
            auth_timeout: DEFAULT_PUBLISH_AUTH_TIMEOUT,
            requires_auth: false,
            dispatch: None,
        }
    }
}

impl PublishOptions {
    /// Longer defaults used when fanning out to several relays.
    pub fn multi_relay() -> Self {
        Self {
            timeout: DEFAULT_MULTI_PUBLISH_TIMEOUT,
            auth_timeout: DEFAULT_MULTI_PUBLISH_TIMEOUT,
            ..Self::default()
        }
    }

    pub fn with_auth(mut self) -> Self {
        self.requires_auth = true;
        self
    }
}

/// Configuration for a multi-relay [`crate::Session`].
#[derive(Clone)]
pub struct SessionConfig {
    pub relays: Vec<RelayEndpoint>,
    /// Hex or `nsec1...` secret key used for signing AUTH and published events.
    pub secret_key: String,
    pub filters: SubscriptionFilters,
    pub subscription_since: Option<u64>,
    pub connection_timeout: Duration,
    pub auth_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub auto_reconnect: bool,
    /// Drop events already routed from another relay.
    pub deduplicate: bool,
}

impl SessionConfig {
    pub fn new(relays: Vec<RelayEndpoint>, secret_key: impl Into<String>) -> Self {
        Self {
            relays,
            secret_key: secret_key.into(),
            filters: SubscriptionFilters::default(),
            subscription_since: None,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            auto_reconnect: true,
            deduplicate: true,
        }
    }

    /// Build configuration from environment variables.
    ///
    /// Required:
    /// - `ATTN_RELAYS` - relay URLs, comma or whitespace separated
    /// - `ATTN_SECRET_KEY` - hex or nsec secret key
    ///
    /// Optional:
    /// - `ATTN_AUTH_RELAYS` - relays that require NIP-42 auth (added to the set)
    /// - `ATTN_NODE_PUBKEYS`, `ATTN_MARKETPLACE_PUBKEYS`, `ATTN_BILLBOARD_PUBKEYS`,
    ///   `ATTN_ADVERTISER_PUBKEYS`, `ATTN_MARKETPLACE_D_TAGS` - filter allow-lists
    /// - `ATTN_SINCE` - unix timestamp for the `since` filter
    /// - `ATTN_CONNECTION_TIMEOUT_MS` (default 30000)
    /// - `ATTN_AUTH_TIMEOUT_MS` (default 10000)
    /// - `ATTN_RECONNECT_DELAY_MS` (default 5000)
    /// - `ATTN_MAX_RECONNECT_ATTEMPTS` (default 10)
    /// - `ATTN_AUTO_RECONNECT` (default true)
    /// - `ATTN_DEDUPLICATE` (default true)
    pub fn from_env() -> Result<Self, Error> {
        let plain = env::var("ATTN_RELAYS")
            .map(|v| parse_list(&v))
            .unwrap_or_default();
        let with_auth = env::var("ATTN_AUTH_RELAYS")
            .map(|v| parse_list(&v))
            .unwrap_or_default();
        if plain.is_empty() && with_auth.is_empty() {
            return Err(Error::MissingEnv("ATTN_RELAYS"));
        }

        let mut relays: Vec<RelayEndpoint> = Vec::new();
        for url in with_auth {
            if !relays.iter().any(|r| r.url() == url) {
                relays.push(RelayEndpoint::with_auth(url));
            }
        }
        for url in plain {
            if !relays.iter().any(|r| r.url() == url) {
                relays.push(RelayEndpoint::new(url));
            }
        }

        let secret_key =
            env::var("ATTN_SECRET_KEY").map_err(|_| Error::MissingEnv("ATTN_SECRET_KEY"))?;

        let mut config = Self::new(relays, secret_key);
        config.filters = SubscriptionFilters {
            node_pubkeys: env_list("ATTN_NODE_PUBKEYS"),
            marketplace_pubkeys: env_list("ATTN_MARKETPLACE_PUBKEYS"),
            billboard_pubkeys: env_list("ATTN_BILLBOARD_PUBKEYS"),
            advertiser_pubkeys: env_list("ATTN_ADVERTISER_PUBKEYS"),
            marketplace_d_tags: env_list("ATTN_MARKETPLACE_D_TAGS"),
        };
        config.subscription_since = env::var("ATTN_SINCE").ok().and_then(|v| v.parse().ok());

        if let Some(ms) = env_u64("ATTN_CONNECTION_TIMEOUT_MS") {
            config.connection_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("ATTN_AUTH_TIMEOUT_MS") {
            config.auth_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("ATTN_RECONNECT_DELAY_MS") {
            config.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(max) = env::var("ATTN_MAX_RECONNECT_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.max_reconnect_attempts = max;
        }
        config.auto_reconnect = env_bool("ATTN_AUTO_RECONNECT").unwrap_or(true);
        config.deduplicate = env_bool("ATTN_DEDUPLICATE").unwrap_or(true);

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.relays.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one relay URL is required".to_string(),
            ));
        }
        if self.secret_key.trim().is_empty() {
            return Err(Error::InvalidConfig("secret key is required".to_string()));
        }
        Ok(())
    }

    /// Per-relay configuration sharing this session's knobs.
    pub fn connection_config(
        &self,
        endpoint: RelayEndpoint,
        signer: Arc<dyn Signer>,
    ) -> ConnectionConfig {
        ConnectionConfig {
            endpoint,
            signer,
            filters: self.filters.clone(),
            subscription_since: self.subscription_since,
            connection_timeout: self.connection_timeout,
            auth_timeout: self.auth_timeout,
            reconnect_delay: self.reconnect_delay,
            max_reconnect_attempts: self.max_reconnect_attempts,
            auto_reconnect: self.auto_reconnect,
            dispatch: None,
        }
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("relays", &self.relays)
            .field("secret_key", &"<redacted>")
            .field("filters", &self.filters)
            .field("subscription_since", &self.subscription_since)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("deduplicate", &self.deduplicate)
            .finish()
    }
}

/// Split a comma and/or whitespace separated list.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .flat_map(|chunk| chunk.split_whitespace())
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

fn env_list(name: &str) -> Vec<String> {
    env::var(name).map(|v| parse_list(&v)).unwrap_or_default()
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| v.trim().eq_ignore_ascii_case("true") || v.trim() == "1")
}
