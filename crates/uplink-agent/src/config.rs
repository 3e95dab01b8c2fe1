//! Agent configuration, loaded from a TOML file with per-field defaults.

use crate::acl::WhitelistEntry;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use uplink_core::{UplinkError, UplinkResult};

/// App keys of the paid tier start with this prefix; the tier picks the
/// default endpoint and the reconnect cadence.
pub const PREMIUM_KEY_PREFIX: &str = "@pro_";

const DEFAULT_URL: &str = "wss://relay.uplink.cloud:10555";
const DEFAULT_URL_PREMIUM: &str = "wss://relay-pro.uplink.cloud:10555";

/// Lower bound for the ping deadline; anything shorter flaps on normal
/// network jitter.
const MIN_PING_TIMEOUT_MS: u64 = 3000;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub access: AccessConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Relay endpoint; defaults to the tier endpoint for the app key.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub apikey: String,
    /// Installation uuid; read from the store when absent.
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_reconnect_premium_secs")]
    pub reconnect_premium_secs: u64,
    #[serde(default = "default_reconnect_standard_secs")]
    pub reconnect_standard_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_user")]
    pub default_user: String,
    /// Object id under which this agent instance is configured.
    #[serde(default = "default_instance")]
    pub instance: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    /// `sendTo` targets remote sessions may address; `["*"]` allows all,
    /// `["[]"]`/empty allows none.
    #[serde(default = "default_allowed_services")]
    pub allowed_services: Vec<String>,
    #[serde(default)]
    pub whitelist: HashMap<String, WhitelistEntry>,
}

fn default_connection_timeout_secs() -> u64 {
    10
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_ping_timeout_ms() -> u64 {
    5000
}

fn default_reconnect_premium_secs() -> u64 {
    30
}

fn default_reconnect_standard_secs() -> u64 {
    60
}

fn default_session_ttl_secs() -> u64 {
    3600
}

fn default_user() -> String {
    "system.user.admin".to_string()
}

fn default_instance() -> String {
    "system.adapter.uplink.0".to_string()
}

fn default_allowed_services() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: None,
            apikey: String::new(),
            uuid: None,
            connection_timeout_secs: default_connection_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            ping_timeout_ms: default_ping_timeout_ms(),
            reconnect_premium_secs: default_reconnect_premium_secs(),
            reconnect_standard_secs: default_reconnect_standard_secs(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            default_user: default_user(),
            instance: default_instance(),
        }
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            allowed_services: default_allowed_services(),
            whitelist: HashMap::new(),
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> UplinkResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config: AgentConfig = toml::from_str(&text)
            .map_err(|e| UplinkError::Other(format!("bad config {}: {e}", path.display())))?;
        config.normalize()?;
        Ok(config)
    }

    /// Validate and clamp field values.
    pub fn normalize(&mut self) -> UplinkResult<()> {
        if self.relay.apikey.trim().is_empty() {
            return Err(UplinkError::Other("relay.apikey is required".into()));
        }
        if self.relay.ping_timeout_ms < MIN_PING_TIMEOUT_MS {
            self.relay.ping_timeout_ms = MIN_PING_TIMEOUT_MS;
        }
        Ok(())
    }

    pub fn is_premium(&self) -> bool {
        self.relay.apikey.starts_with(PREMIUM_KEY_PREFIX)
    }

    pub fn endpoint(&self) -> String {
        match &self.relay.url {
            Some(url) => url.clone(),
            None if self.is_premium() => DEFAULT_URL_PREMIUM.to_string(),
            None => DEFAULT_URL.to_string(),
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        if self.is_premium() {
            Duration::from_secs(self.relay.reconnect_premium_secs)
        } else {
            Duration::from_secs(self.relay.reconnect_standard_secs)
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.relay.ping_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.relay.ping_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.relay.connection_timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session.ttl_secs)
    }

    /// Short namespace of this instance, e.g. `uplink.0`.
    pub fn namespace(&self) -> &str {
        self.session
            .instance
            .strip_prefix("system.adapter.")
            .unwrap_or(&self.session.instance)
    }
}
