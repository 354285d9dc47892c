use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::backend::{ConfigAuthority, RegistrationStatus};

/// Pushes lease outcomes back to the configuration authority.
///
/// Strictly best-effort: the lease exists independently of whether its status
/// was recorded, so a failed report is logged and forgotten. The next refresh
/// cycle reports again and corrects any gap.
pub struct StatusReporter {
    authority: Arc<dyn ConfigAuthority>,
}

impl StatusReporter {
    pub fn new(authority: Arc<dyn ConfigAuthority>) -> Self {
        Self { authority }
    }

    pub async fn report(
        &self,
        provider_id: &str,
        status: RegistrationStatus,
        error: Option<&str>,
    ) {
        match self
            .authority
            .update_registration_status(provider_id, status, error)
            .await
        {
            Ok(()) => {
                debug!(provider_id, ?status, "registration status recorded");
            }
            Err(err) => {
                warn!(provider_id, ?status, error = %err, "failed to record registration status");
            }
        }
    }
}

/// Delay until a lease should be renewed: the safety margin before expiry,
/// clamped to a floor so a pathologically short lease cannot cause a refresh
/// storm.
pub(super) fn refresh_delay(lease_expiry_secs: u64, margin_secs: u64, floor_secs: u64) -> Duration {
    let floor = floor_secs.max(60);
    Duration::from_secs(lease_expiry_secs.saturating_sub(margin_secs).max(floor))
}

/// Registration Call-ID in the `{prefix}-{key}-{millis}@{public_ip}` form the
/// upstream providers already see from this gateway.
pub(super) fn registration_call_id(prefix: &str, key: &str, public_ip: IpAddr) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("{prefix}-{key}-{millis}@{public_ip}")
}
