use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Backend configuration authority endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the configuration authority, e.g. `http://backend:3000`.
    pub base_url: String,
    /// Value sent in the `x-api-key` header on every request.
    pub api_key: String,
    #[serde(default = "default_backend_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_backend_timeout_secs() -> u64 {
    5
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Network media-relay control endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Upper bound on a single offer/answer/delete exchange. An unbounded
    /// relay command would stall the whole call, so this is always enforced.
    #[serde(default = "default_relay_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_relay_timeout_secs() -> u64 {
    5
}

impl RelayConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Publicly reachable signaling address, used when building Contact URIs
/// towards registrars and the cloud endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicAddress {
    pub address: IpAddr,
    pub port: u16,
}

impl PublicAddress {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    /// How long a fetched SIP config snapshot stays fresh.
    pub config_ttl_secs: u64,
    /// Full-list refresh cadence for outbound trunk leases.
    pub trunk_refresh_secs: u64,
    /// Full-list refresh cadence for provider registrations.
    pub provider_poll_secs: u64,
    /// Renew a lease this many seconds before it expires.
    pub refresh_margin_secs: u64,
    /// Never renew more often than this, even for pathologically short leases.
    pub refresh_floor_secs: u64,
    /// Upper bound on the authoritative destination lookup before the
    /// deterministic fallback is used.
    pub destination_lookup_timeout_secs: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            config_ttl_secs: 300,
            trunk_refresh_secs: 25 * 60,
            provider_poll_secs: 300,
            refresh_margin_secs: 60,
            refresh_floor_secs: 60,
            destination_lookup_timeout_secs: 5,
        }
    }
}

impl TimerConfig {
    pub fn config_ttl(&self) -> Duration {
        Duration::from_secs(self.config_ttl_secs)
    }

    pub fn trunk_refresh(&self) -> Duration {
        Duration::from_secs(self.trunk_refresh_secs)
    }

    pub fn provider_poll(&self) -> Duration {
        Duration::from_secs(self.provider_poll_secs)
    }

    pub fn destination_lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.destination_lookup_timeout_secs)
    }
}

/// Fully-resolved gateway configuration. Environment/CLI parsing happens
/// outside this crate; the gateway only ever sees concrete values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub backend: BackendConfig,
    pub relay: RelayConfig,
    pub public: PublicAddress,
    #[serde(default)]
    pub timers: TimerConfig,
    /// Optional User-Agent value applied to outbound registration requests.
    pub user_agent: Option<String>,
}

impl GatewayConfig {
    pub fn resolved_user_agent(&self) -> String {
        self.user_agent
            .as_ref()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(|value| value.to_string())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }
}
