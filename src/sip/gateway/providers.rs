use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{ConfigAuthority, ProviderRegistration, RegistrationStatus};
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::sip::signaling::{Credentials, RegisterOutcome, RegisterRequest, SignalingServer};

use super::registration::{refresh_delay, registration_call_id, StatusReporter};

/// One live provider lease with its pending refresh timer.
struct RegistrationHandle {
    name: String,
    host: String,
    cancel: CancellationToken,
}

/// Keeps provider registrations alive with per-lease refresh timers.
///
/// The poll loop discovers providers and registers new or changed ones; each
/// successful registration schedules its own refresh shortly before the
/// granted lease expires. Installing a refresh timer cancels any previous
/// timer for the same provider, so a provider rediscovered by the poll loop
/// never accumulates duplicate timers. A failed registration is reported and
/// left for the next poll cycle; there is no tight self-retry.
pub struct ProviderRegistrar {
    authority: Arc<dyn ConfigAuthority>,
    signaling: Arc<dyn SignalingServer>,
    config: Arc<GatewayConfig>,
    reporter: StatusReporter,
    registry: Mutex<HashMap<String, RegistrationHandle>>,
}

impl ProviderRegistrar {
    pub fn new(
        authority: Arc<dyn ConfigAuthority>,
        signaling: Arc<dyn SignalingServer>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        let reporter = StatusReporter::new(authority.clone());
        Self {
            authority,
            signaling,
            config,
            reporter,
            registry: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("starting provider registrar");

        loop {
            self.poll_once().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.timers.provider_poll()) => {}
            }
        }

        self.cancel_all().await;
        info!("provider registrar stopped");
    }

    /// One discovery pass over the provider list. Fetch failure skips the
    /// pass; any lease already scheduled keeps its own refresh timer running.
    pub async fn poll_once(self: &Arc<Self>) {
        let providers = match self.authority.fetch_provider_registrations().await {
            Ok(providers) => providers,
            Err(err) => {
                warn!(error = %err, "failed to fetch provider registrations, skipping pass");
                return;
            }
        };

        debug!(count = providers.len(), "provider registrations fetched");

        for provider in providers {
            if !provider.is_active {
                self.drop_lease(&provider.id, "provider deactivated").await;
                continue;
            }

            self.register_and_schedule(provider).await;
        }
    }

    /// Registers one provider and, on success, installs its refresh timer.
    /// Failure is recorded with the authority and retried on the next poll.
    async fn register_and_schedule(self: &Arc<Self>, provider: ProviderRegistration) {
        match self.register_provider(&provider).await {
            Ok(outcome) => {
                info!(
                    provider_id = %provider.id,
                    provider = %provider.name,
                    expires = outcome.expires_seconds,
                    "provider registered"
                );
                self.reporter
                    .report(&provider.id, RegistrationStatus::Registered, None)
                    .await;
                self.schedule_refresh(provider, outcome.expires_seconds).await;
            }
            Err(err) => {
                warn!(
                    provider_id = %provider.id,
                    provider = %provider.name,
                    error = %err,
                    "provider registration failed"
                );
                self.reporter
                    .report(
                        &provider.id,
                        RegistrationStatus::Failed,
                        Some(&err.to_string()),
                    )
                    .await;
            }
        }
    }

    async fn register_provider(&self, provider: &ProviderRegistration) -> Result<RegisterOutcome> {
        let (host, username, password) = required_fields(provider)?;

        let public = &self.config.public;
        let transport = provider.transport.to_lowercase();
        let request = RegisterRequest {
            registrar_uri: format!("sip:{}:{}", host, provider.port),
            address_of_record: format!("sip:{}@{}", username, host),
            contact_uri: format!(
                "sip:{}:{};transport={}",
                public.address, public.port, transport
            ),
            expires_seconds: provider.lease_expiry_seconds,
            call_id: registration_call_id("preg", &provider.id, public.address),
            transport,
            credentials: Some(Credentials {
                username: username.to_string(),
                password: password.to_string(),
            }),
            user_agent: self.config.resolved_user_agent(),
        };

        info!(
            provider_id = %provider.id,
            registrar = %request.registrar_uri,
            "sending provider registration"
        );
        self.signaling.register(request).await
    }

    /// Installs the refresh timer for a granted lease, cancelling any timer
    /// previously installed for the same provider.
    async fn schedule_refresh(self: &Arc<Self>, provider: ProviderRegistration, expires: u64) {
        let timers = &self.config.timers;
        let delay = refresh_delay(
            expires,
            timers.refresh_margin_secs,
            timers.refresh_floor_secs,
        );

        let cancel = CancellationToken::new();
        let handle = RegistrationHandle {
            name: provider.name.clone(),
            host: provider.host.clone().unwrap_or_default(),
            cancel: cancel.clone(),
        };

        if let Some(previous) = self.registry.lock().await.insert(provider.id.clone(), handle) {
            debug!(provider_id = %provider.id, "replacing pending refresh timer");
            previous.cancel.cancel();
        }

        debug!(
            provider_id = %provider.id,
            delay_secs = delay.as_secs(),
            "refresh scheduled"
        );

        let registrar = self.clone();
        let provider_id = provider.id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    registrar.refresh_lease(&provider_id).await;
                }
            }
        });
    }

    /// Lease refresh: re-fetches the provider so credential or host changes
    /// made since the last registration take effect, then re-registers.
    ///
    /// Returns a boxed future to break the async type recursion through
    /// schedule_refresh -> refresh_lease -> register_and_schedule.
    fn refresh_lease<'a>(
        self: &'a Arc<Self>,
        provider_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        let provider = match self.authority.fetch_provider_registration(provider_id).await {
            Ok(Some(provider)) => provider,
            Ok(None) => {
                self.drop_lease(provider_id, "provider removed").await;
                return;
            }
            Err(err) => {
                warn!(provider_id, error = %err, "lease refresh fetch failed, awaiting next poll");
                self.registry.lock().await.remove(provider_id);
                return;
            }
        };

        if !provider.is_active {
            self.drop_lease(provider_id, "provider deactivated").await;
            return;
        }

        self.register_and_schedule(provider).await;
        })
    }

    async fn drop_lease(&self, provider_id: &str, reason: &str) {
        if let Some(handle) = self.registry.lock().await.remove(provider_id) {
            info!(provider_id, provider = %handle.name, host = %handle.host, reason, "dropping provider lease");
            handle.cancel.cancel();
        }
    }

    async fn cancel_all(&self) {
        let mut registry = self.registry.lock().await;
        for (provider_id, handle) in registry.drain() {
            debug!(provider_id = %provider_id, "cancelling refresh timer on shutdown");
            handle.cancel.cancel();
        }
    }

    #[cfg(test)]
    async fn scheduled_count(&self) -> usize {
        self.registry.lock().await.len()
    }
}

fn required_fields(provider: &ProviderRegistration) -> Result<(&str, &str, &str)> {
    let mut missing = Vec::new();
    let host = provider.host.as_deref().filter(|s| !s.is_empty());
    let username = provider.username.as_deref().filter(|s| !s.is_empty());
    let password = provider.password.as_deref().filter(|s| !s.is_empty());
    if host.is_none() {
        missing.push("host");
    }
    if username.is_none() {
        missing.push("username");
    }
    if password.is_none() {
        missing.push("password");
    }

    match (host, username, password) {
        (Some(host), Some(username), Some(password)) => Ok((host, username, password)),
        _ => Err(Error::RegistrationRejected(format!(
            "missing required fields: {}",
            missing.join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, PublicAddress, RelayConfig, TimerConfig};
    use crate::sip::gateway::testutil::{sample_provider, FakeAuthority, FakeSignaling, Outcome};
    use std::time::Duration;

    fn gateway_config() -> Arc<GatewayConfig> {
        Arc::new(GatewayConfig {
            backend: BackendConfig {
                base_url: "http://backend:3000".to_string(),
                api_key: "test-key".to_string(),
                request_timeout_secs: 5,
            },
            relay: RelayConfig {
                host: "127.0.0.1".parse().unwrap(),
                port: 22222,
                command_timeout_secs: 5,
            },
            public: PublicAddress {
                address: "198.51.100.7".parse().unwrap(),
                port: 5060,
            },
            timers: TimerConfig::default(),
            user_agent: None,
        })
    }

    fn registrar(
        authority: Arc<FakeAuthority>,
        signaling: Arc<FakeSignaling>,
    ) -> Arc<ProviderRegistrar> {
        Arc::new(ProviderRegistrar::new(authority, signaling, gateway_config()))
    }

    async fn settle() {
        // Let spawned refresh tasks run to completion.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn poll_registers_active_providers_and_reports_status() {
        let authority = Arc::new(FakeAuthority::default());
        let signaling = Arc::new(FakeSignaling::default());
        signaling.fail_registrar("sip.c.example").await;
        authority
            .set_providers(Outcome::Ok(vec![
                sample_provider("a", true),
                sample_provider("b", false),
                sample_provider("c", true),
            ]))
            .await;

        let registrar = registrar(authority.clone(), signaling.clone());
        registrar.poll_once().await;

        // Only the two active providers were attempted.
        let requests = signaling.register_requests().await;
        assert_eq!(requests.len(), 2);
        assert!(requests[0].registrar_uri.contains("sip.a.example"));
        assert!(requests[1].registrar_uri.contains("sip.c.example"));

        let reports = authority.reports().await;
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].0, "a");
        assert!(matches!(reports[0].1, RegistrationStatus::Registered));
        assert!(reports[0].2.is_none());
        assert_eq!(reports[1].0, "c");
        assert!(matches!(reports[1].1, RegistrationStatus::Failed));
        assert!(reports[1].2.as_deref().unwrap().contains("403"));

        // Only the successful lease got a refresh timer.
        assert_eq!(registrar.scheduled_count().await, 1);
    }

    #[tokio::test]
    async fn missing_fields_are_rejected_before_any_request() {
        let authority = Arc::new(FakeAuthority::default());
        let signaling = Arc::new(FakeSignaling::default());
        let mut provider = sample_provider("a", true);
        provider.host = None;
        provider.password = Some(String::new());
        authority.set_providers(Outcome::Ok(vec![provider])).await;

        let registrar = registrar(authority.clone(), signaling.clone());
        registrar.poll_once().await;

        assert!(signaling.register_requests().await.is_empty());
        let reports = authority.reports().await;
        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0].1, RegistrationStatus::Failed));
        let error = reports[0].2.as_deref().unwrap();
        assert!(error.contains("host"));
        assert!(error.contains("password"));
        assert!(!error.contains("username"));
    }

    #[tokio::test]
    async fn rescheduling_replaces_the_previous_timer() {
        let authority = Arc::new(FakeAuthority::default());
        let signaling = Arc::new(FakeSignaling::default());
        authority
            .set_providers(Outcome::Ok(vec![sample_provider("a", true)]))
            .await;

        let registrar = registrar(authority.clone(), signaling.clone());
        registrar.poll_once().await;
        registrar.poll_once().await;

        // Re-discovering the same provider must not stack timers.
        assert_eq!(registrar.scheduled_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_timer_never_fires_a_duplicate_refresh() {
        let authority = Arc::new(FakeAuthority::default());
        let signaling = Arc::new(FakeSignaling::default());
        authority
            .set_providers(Outcome::Ok(vec![sample_provider("a", true)]))
            .await;
        authority.insert_provider(sample_provider("a", true)).await;

        let registrar = registrar(authority.clone(), signaling.clone());
        registrar.poll_once().await;
        registrar.poll_once().await;
        assert_eq!(signaling.register_requests().await.len(), 2);

        // Both polls installed a 3540 s timer at the same paused instant.
        // Only the surviving one may fire; a leaked first timer would
        // re-register a second time here.
        settle().await;
        tokio::time::advance(Duration::from_secs(3541)).await;
        settle().await;

        assert_eq!(signaling.register_requests().await.len(), 3);
        assert_eq!(registrar.scheduled_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expiry_triggers_a_refetch_and_reregistration() {
        let authority = Arc::new(FakeAuthority::default());
        let signaling = Arc::new(FakeSignaling::default());
        authority
            .set_providers(Outcome::Ok(vec![sample_provider("a", true)]))
            .await;
        authority.insert_provider(sample_provider("a", true)).await;

        let registrar = registrar(authority.clone(), signaling.clone());
        registrar.poll_once().await;
        assert_eq!(signaling.register_requests().await.len(), 1);

        // Default lease: 3600s, margin 60s, so the refresh fires at 3540s.
        settle().await;
        tokio::time::advance(Duration::from_secs(3541)).await;
        settle().await;

        let requests = signaling.register_requests().await;
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].registrar_uri, "sip:sip.a.example:5060");
        // The renewed lease installed its own follow-up timer.
        assert_eq!(registrar.scheduled_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_provider_is_dropped_at_refresh_time() {
        let authority = Arc::new(FakeAuthority::default());
        let signaling = Arc::new(FakeSignaling::default());
        authority
            .set_providers(Outcome::Ok(vec![sample_provider("a", true)]))
            .await;
        authority.insert_provider(sample_provider("a", true)).await;

        let registrar = registrar(authority.clone(), signaling.clone());
        registrar.poll_once().await;
        assert_eq!(registrar.scheduled_count().await, 1);

        // The provider disappears from the backend before the refresh fires.
        authority.remove_provider("a").await;

        settle().await;
        tokio::time::advance(Duration::from_secs(3541)).await;
        settle().await;

        assert_eq!(signaling.register_requests().await.len(), 1);
        assert_eq!(registrar.scheduled_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deactivated_provider_is_dropped_at_refresh_time() {
        let authority = Arc::new(FakeAuthority::default());
        let signaling = Arc::new(FakeSignaling::default());
        authority
            .set_providers(Outcome::Ok(vec![sample_provider("a", true)]))
            .await;
        authority.insert_provider(sample_provider("a", false)).await;

        let registrar = registrar(authority.clone(), signaling.clone());
        registrar.poll_once().await;

        settle().await;
        tokio::time::advance(Duration::from_secs(3541)).await;
        settle().await;

        assert_eq!(signaling.register_requests().await.len(), 1);
        assert_eq!(registrar.scheduled_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_registration_waits_for_the_next_poll() {
        let authority = Arc::new(FakeAuthority::default());
        let signaling = Arc::new(FakeSignaling::default());
        signaling.fail_registrar("sip.a.example").await;
        authority
            .set_providers(Outcome::Ok(vec![sample_provider("a", true)]))
            .await;

        let registrar = registrar(authority.clone(), signaling.clone());
        registrar.poll_once().await;
        assert_eq!(registrar.scheduled_count().await, 0);

        // No self-retry: nothing happens until the poll loop comes around.
        tokio::time::advance(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(signaling.register_requests().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn granted_expiry_overrides_the_requested_lease() {
        let authority = Arc::new(FakeAuthority::default());
        let signaling = Arc::new(FakeSignaling::default());
        signaling.grant_expires(300).await;
        authority
            .set_providers(Outcome::Ok(vec![sample_provider("a", true)]))
            .await;
        authority.insert_provider(sample_provider("a", true)).await;

        let registrar = registrar(authority.clone(), signaling.clone());
        registrar.poll_once().await;

        // Registrar granted 300s, so the refresh fires at 240s, not 3540s.
        settle().await;
        tokio::time::advance(Duration::from_secs(241)).await;
        settle().await;
        assert_eq!(signaling.register_requests().await.len(), 2);
    }

    #[tokio::test]
    async fn contact_has_no_user_part() {
        let authority = Arc::new(FakeAuthority::default());
        let signaling = Arc::new(FakeSignaling::default());
        authority
            .set_providers(Outcome::Ok(vec![sample_provider("a", true)]))
            .await;

        registrar(authority, signaling.clone()).poll_once().await;

        let requests = signaling.register_requests().await;
        assert_eq!(requests[0].contact_uri, "sip:198.51.100.7:5060;transport=udp");
        assert_eq!(requests[0].address_of_record, "sip:user@sip.a.example");
        assert!(requests[0].call_id.starts_with("preg-a-"));
    }
}
