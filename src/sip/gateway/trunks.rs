use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{ConfigAuthority, TrunkRegistration};
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::sip::signaling::{Credentials, RegisterRequest, SignalingServer};

use super::registration::registration_call_id;

/// Maintains outbound trunk leases on a fixed full-list cadence.
///
/// Every cycle re-fetches the trunk list wholesale and re-registers each
/// active entry. There are no per-trunk timers: a failed trunk is simply
/// retried on the next cycle, which bounds worst-case recovery to one poll
/// interval instead of compounding retry loops during a provider outage.
pub struct TrunkRegistrar {
    authority: Arc<dyn ConfigAuthority>,
    signaling: Arc<dyn SignalingServer>,
    config: Arc<GatewayConfig>,
}

impl TrunkRegistrar {
    pub fn new(
        authority: Arc<dyn ConfigAuthority>,
        signaling: Arc<dyn SignalingServer>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            authority,
            signaling,
            config,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("starting outbound trunk registrar");

        loop {
            self.refresh_all().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.timers.trunk_refresh()) => {}
            }
        }

        info!("outbound trunk registrar stopped");
    }

    /// One full cycle. A backend fetch failure skips the cycle entirely; a
    /// single trunk's failure never aborts the loop over the rest.
    pub async fn refresh_all(&self) {
        let trunks = match self.authority.fetch_outbound_trunks().await {
            Ok(trunks) => trunks,
            Err(err) => {
                warn!(error = %err, "failed to fetch outbound trunks, skipping cycle");
                return;
            }
        };

        if trunks.is_empty() {
            debug!("no outbound trunks configured");
            return;
        }

        info!(count = trunks.len(), "outbound trunks fetched");

        for trunk in &trunks {
            if !trunk.is_active {
                debug!(trunk = %trunk.name, "skipping inactive trunk");
                continue;
            }

            if let Err(err) = self.register_trunk(trunk).await {
                warn!(trunk = %trunk.name, error = %err, "trunk registration failed");
            }
        }

        debug!("outbound trunk cycle completed");
    }

    async fn register_trunk(&self, trunk: &TrunkRegistration) -> Result<()> {
        let username = trunk.auth_username.as_deref().unwrap_or_default();
        let password = trunk.auth_password.as_deref().unwrap_or_default();
        if trunk.provider_address.is_empty() || username.is_empty() || password.is_empty() {
            warn!(trunk = %trunk.name, "trunk missing address or credentials, skipping");
            return Ok(());
        }

        let public = &self.config.public;
        let transport = trunk.transport.to_lowercase();
        let request = RegisterRequest {
            registrar_uri: format!("sip:{}", trunk.provider_address),
            address_of_record: format!("sip:{}@{}", username, trunk.provider_address),
            contact_uri: format!(
                "sip:{}@{}:{};transport={}",
                username, public.address, public.port, transport
            ),
            expires_seconds: trunk.lease_expiry_seconds,
            call_id: registration_call_id("reg", &trunk.name, public.address),
            transport,
            credentials: Some(Credentials {
                username: username.to_string(),
                password: password.to_string(),
            }),
            user_agent: self.config.resolved_user_agent(),
        };

        info!(trunk = %trunk.name, registrar = %request.registrar_uri, "sending trunk registration");
        let outcome = self.signaling.register(request).await?;
        info!(
            trunk = %trunk.name,
            expires = outcome.expires_seconds,
            "trunk registered"
        );
        Ok(())
    }
}
