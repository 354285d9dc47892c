use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::backend::{ConfigAuthority, SipConfig};
use crate::config::TimerConfig;
use crate::error::{Error, Result};

struct CachedSnapshot {
    config: Arc<SipConfig>,
    fetched_at: Instant,
}

/// TTL cache over the backend's routing/trunk configuration.
///
/// The snapshot is replaced wholesale on refresh; readers hold `Arc` clones
/// and never observe a partially-updated value. When the backend is down the
/// cache serves the last-known-good snapshot past its TTL, trading freshness
/// for availability; `ConfigUnavailable` is returned only when no fetch has
/// ever succeeded.
pub struct ConfigCache {
    authority: Arc<dyn ConfigAuthority>,
    ttl: Duration,
    cached: RwLock<Option<CachedSnapshot>>,
}

impl ConfigCache {
    pub fn new(authority: Arc<dyn ConfigAuthority>, timers: &TimerConfig) -> Self {
        Self {
            authority,
            ttl: timers.config_ttl(),
            cached: RwLock::new(None),
        }
    }

    pub async fn get(&self) -> Result<Arc<SipConfig>> {
        {
            let guard = self.cached.read().await;
            if let Some(snapshot) = guard.as_ref() {
                if snapshot.fetched_at.elapsed() < self.ttl {
                    debug!("serving cached sip config");
                    return Ok(snapshot.config.clone());
                }
            }
        }

        match self.authority.fetch_sip_config().await {
            Ok(config) => {
                let config = Arc::new(config);
                let mut guard = self.cached.write().await;
                *guard = Some(CachedSnapshot {
                    config: config.clone(),
                    fetched_at: Instant::now(),
                });
                info!("sip config fetched from backend and cached");
                Ok(config)
            }
            Err(err) => {
                let guard = self.cached.read().await;
                match guard.as_ref() {
                    Some(snapshot) => {
                        warn!(error = %err, "backend unavailable, serving stale sip config");
                        Ok(snapshot.config.clone())
                    }
                    None => {
                        warn!(error = %err, "sip config unavailable: no backend and no cache");
                        Err(Error::ConfigUnavailable)
                    }
                }
            }
        }
    }
}

/// Maps a dialed number to the outbound target URI.
///
/// The deterministic default `sip:{number}@{domain}` is computed up front;
/// the authoritative backend answer overrides it when the lookup succeeds
/// within its timeout. Lookup failure is a degraded-mode event, never a call
/// failure.
pub struct DestinationResolver {
    authority: Arc<dyn ConfigAuthority>,
    lookup_timeout: Duration,
}

impl DestinationResolver {
    pub fn new(authority: Arc<dyn ConfigAuthority>, timers: &TimerConfig) -> Self {
        Self {
            authority,
            lookup_timeout: timers.destination_lookup_timeout(),
        }
    }

    pub async fn resolve(&self, dialed_number: &str, signaling_domain: &str) -> String {
        let fallback = format!("sip:{dialed_number}@{signaling_domain}");

        match timeout(
            self.lookup_timeout,
            self.authority.lookup_destination(dialed_number),
        )
        .await
        {
            Ok(Ok(uri)) => {
                debug!(dialed_number, destination = %uri, "authoritative destination from backend");
                uri
            }
            Ok(Err(err)) => {
                warn!(dialed_number, error = %err, fallback = %fallback, "destination lookup failed, using fallback");
                fallback
            }
            Err(_) => {
                warn!(dialed_number, fallback = %fallback, "destination lookup timed out, using fallback");
                fallback
            }
        }
    }
}
