//! Engine configuration.
//!
//! `EngineConfig` is the single struct `Engine::new` consumes; it carries
//! every relay-affecting parameter named in the invocation contract plus
//! the tunables the spec leaves as open questions (buffer sizes, timer
//! cadence, half-close policy, DNS table limits). The `demos/relay`
//! binary loads this from a `toml` file; the library itself never touches
//! the filesystem.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Default StreamBuffer capacity for both directions of a flow.
pub const DEFAULT_FLOW_BUFFER_SIZE: usize = 8192;
/// Default periodic stack-timer cadence.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 250;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Private address assigned to the virtual interface.
    pub vpn_ip: Ipv4Addr,
    /// Netmask for the virtual interface.
    pub vpn_netmask: Ipv4Addr,
    /// Upstream SOCKS4 proxy endpoint.
    pub socks: SocksConfig,
    /// Optional DNS relay; absent disables the extended variant.
    pub dns: Option<DnsConfig>,
    /// Per-flow StreamBuffer capacity in bytes.
    #[serde(default = "default_buffer_size")]
    pub flow_buffer_size: usize,
    /// Cadence at which `NetStackAdapter::tick()` is driven.
    #[serde(default = "default_tick_interval", with = "duration_ms")]
    pub tick_interval: Duration,
    /// Whether to drain buffered bytes before tearing down the other side
    /// of a flow on half-close. Default matches the source's existing
    /// behavior: no flush, both sides torn down together.
    #[serde(default)]
    pub flush_on_half_close: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocksConfig {
    pub addr: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    pub addr: Ipv4Addr,
    pub port: u16,
    #[serde(default = "default_max_pending_queries")]
    pub max_pending_queries: usize,
    #[serde(default = "default_query_timeout", with = "duration_ms")]
    pub query_timeout: Duration,
}

fn default_buffer_size() -> usize {
    DEFAULT_FLOW_BUFFER_SIZE
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(DEFAULT_TICK_INTERVAL_MS)
}

fn default_max_pending_queries() -> usize {
    256
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(5)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl EngineConfig {
    /// Load and validate configuration from a TOML file, with
    /// `RELAYCORE_`-prefixed environment variable overrides for the
    /// fields most often tuned at deploy time.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.as_ref().display())))?;
        let mut config: EngineConfig = toml::from_str(&text)
            .map_err(|e| Error::config(format!("failed to parse config: {e}")))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("RELAYCORE_SOCKS_PORT") {
            if let Ok(port) = port.parse() {
                self.socks.port = port;
            }
        }
        if let Ok(size) = std::env::var("RELAYCORE_FLOW_BUFFER_SIZE") {
            if let Ok(size) = size.parse() {
                self.flow_buffer_size = size;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.socks.port == 0 {
            return Err(Error::config("socks.port must be nonzero"));
        }
        if self.flow_buffer_size == 0 {
            return Err(Error::config("flow_buffer_size must be nonzero"));
        }
        if let Some(dns) = &self.dns {
            if dns.port == 0 {
                return Err(Error::config("dns.port must be nonzero"));
            }
            if dns.max_pending_queries == 0 {
                return Err(Error::config("dns.max_pending_queries must be nonzero"));
            }
        }
        Ok(())
    }
}
