//! In-process fakes for the external collaborators, shared by the gateway
//! unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::backend::{
    ConfigAuthority, ProviderRegistration, RegistrationStatus, SipConfig, TrunkRegistration,
};
use crate::error::{Error, Result};
use crate::sip::signaling::{
    AnswerInterceptor, BridgeRequest, BridgedDialogs, InboundInvite, IncomingCall,
    RegisterOutcome, RegisterRequest, SignalingServer,
};

/// Routes test logs through `RUST_LOG` filtering. Safe to call from every
/// test; only the first initialization wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scripted outcome for one fake backend operation.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Ok(T),
    Err(String),
    /// Never resolves; used to exercise caller-side timeouts.
    Hang,
}

impl<T: Clone> Outcome<T> {
    async fn resolve(&self) -> Result<T> {
        match self {
            Outcome::Ok(value) => Ok(value.clone()),
            Outcome::Err(message) => Err(Error::BackendUnreachable(message.clone())),
            Outcome::Hang => std::future::pending().await,
        }
    }
}

pub struct FakeAuthority {
    config: Mutex<Outcome<SipConfig>>,
    destination: Mutex<Outcome<String>>,
    trunks: Mutex<Outcome<Vec<TrunkRegistration>>>,
    providers: Mutex<Outcome<Vec<ProviderRegistration>>>,
    providers_by_id: Mutex<HashMap<String, ProviderRegistration>>,
    reports: Mutex<Vec<(String, RegistrationStatus, Option<String>)>>,
    config_fetches: AtomicUsize,
    list_fetches: AtomicUsize,
}

impl Default for FakeAuthority {
    fn default() -> Self {
        Self {
            config: Mutex::new(Outcome::Err("config not scripted".into())),
            destination: Mutex::new(Outcome::Err("destination not scripted".into())),
            trunks: Mutex::new(Outcome::Ok(Vec::new())),
            providers: Mutex::new(Outcome::Ok(Vec::new())),
            providers_by_id: Mutex::new(HashMap::new()),
            reports: Mutex::new(Vec::new()),
            config_fetches: AtomicUsize::new(0),
            list_fetches: AtomicUsize::new(0),
        }
    }
}

impl FakeAuthority {
    pub async fn set_config(&self, outcome: Outcome<SipConfig>) {
        *self.config.lock().await = outcome;
    }

    pub async fn set_destination(&self, outcome: Outcome<String>) {
        *self.destination.lock().await = outcome;
    }

    pub async fn set_trunks(&self, outcome: Outcome<Vec<TrunkRegistration>>) {
        *self.trunks.lock().await = outcome;
    }

    pub async fn set_providers(&self, outcome: Outcome<Vec<ProviderRegistration>>) {
        *self.providers.lock().await = outcome;
    }

    pub async fn insert_provider(&self, provider: ProviderRegistration) {
        self.providers_by_id
            .lock()
            .await
            .insert(provider.id.clone(), provider);
    }

    pub async fn remove_provider(&self, id: &str) {
        self.providers_by_id.lock().await.remove(id);
    }

    pub async fn reports(&self) -> Vec<(String, RegistrationStatus, Option<String>)> {
        self.reports.lock().await.clone()
    }

    pub fn config_fetches(&self) -> usize {
        self.config_fetches.load(Ordering::SeqCst)
    }

    pub fn list_fetches(&self) -> usize {
        self.list_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigAuthority for FakeAuthority {
    async fn fetch_sip_config(&self) -> Result<SipConfig> {
        self.config_fetches.fetch_add(1, Ordering::SeqCst);
        let outcome = self.config.lock().await.clone();
        outcome.resolve().await
    }

    async fn lookup_destination(&self, _dialed_number: &str) -> Result<String> {
        let outcome = self.destination.lock().await.clone();
        outcome.resolve().await
    }

    async fn fetch_outbound_trunks(&self) -> Result<Vec<TrunkRegistration>> {
        self.list_fetches.fetch_add(1, Ordering::SeqCst);
        let outcome = self.trunks.lock().await.clone();
        outcome.resolve().await
    }

    async fn fetch_provider_registrations(&self) -> Result<Vec<ProviderRegistration>> {
        self.list_fetches.fetch_add(1, Ordering::SeqCst);
        let outcome = self.providers.lock().await.clone();
        outcome.resolve().await
    }

    async fn fetch_provider_registration(&self, id: &str) -> Result<Option<ProviderRegistration>> {
        Ok(self.providers_by_id.lock().await.get(id).cloned())
    }

    async fn update_registration_status(
        &self,
        provider_id: &str,
        status: RegistrationStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.reports.lock().await.push((
            provider_id.to_string(),
            status,
            error.map(str::to_string),
        ));
        Ok(())
    }
}

/// Signaling fake focused on the registration primitive: records every
/// request and rejects registrars scripted to fail.
#[derive(Default)]
pub struct FakeSignaling {
    register_requests: Mutex<Vec<RegisterRequest>>,
    failing_registrars: Mutex<HashSet<String>>,
    granted_expires: Mutex<Option<u64>>,
}

impl FakeSignaling {
    pub async fn fail_registrar(&self, host_fragment: &str) {
        self.failing_registrars
            .lock()
            .await
            .insert(host_fragment.to_string());
    }

    pub async fn grant_expires(&self, seconds: u64) {
        *self.granted_expires.lock().await = Some(seconds);
    }

    pub async fn register_requests(&self) -> Vec<RegisterRequest> {
        self.register_requests.lock().await.clone()
    }
}

#[async_trait]
impl SignalingServer for FakeSignaling {
    async fn accept(&self) -> Result<IncomingCall> {
        std::future::pending().await
    }

    async fn bridge(
        &self,
        _invite: &InboundInvite,
        _request: BridgeRequest,
        _interceptor: Arc<dyn AnswerInterceptor>,
    ) -> Result<BridgedDialogs> {
        Err(Error::signaling("bridge not scripted"))
    }

    async fn register(&self, request: RegisterRequest) -> Result<RegisterOutcome> {
        self.register_requests.lock().await.push(request.clone());

        let failing = self.failing_registrars.lock().await;
        if failing
            .iter()
            .any(|fragment| request.registrar_uri.contains(fragment.as_str()))
        {
            return Err(Error::RegistrationRejected(format!(
                "403 Forbidden from {}",
                request.registrar_uri
            )));
        }

        let expires = self
            .granted_expires
            .lock()
            .await
            .unwrap_or(request.expires_seconds);
        Ok(RegisterOutcome {
            expires_seconds: expires,
        })
    }
}

pub fn sample_sip_config() -> SipConfig {
    SipConfig {
        signaling_domain: "sip.cloud.example.com".to_string(),
        public_address: "198.51.100.7".to_string(),
        public_port: 5060,
        transport: "udp".to_string(),
        trunk_id: "ST_test".to_string(),
        media_relay_port: Some(22222),
    }
}

pub fn sample_provider(id: &str, active: bool) -> ProviderRegistration {
    ProviderRegistration {
        id: id.to_string(),
        name: format!("provider-{id}"),
        host: Some(format!("sip.{id}.example")),
        username: Some("user".to_string()),
        password: Some("secret".to_string()),
        transport: "udp".to_string(),
        port: 5060,
        is_active: active,
        lease_expiry_seconds: 3600,
        next_refresh_at: None,
    }
}

pub fn sample_trunk(name: &str, active: bool) -> TrunkRegistration {
    TrunkRegistration {
        name: name.to_string(),
        provider_address: format!("sip.{name}.example"),
        auth_username: Some("trunk-user".to_string()),
        auth_password: Some("trunk-secret".to_string()),
        transport: "udp".to_string(),
        is_active: active,
        lease_expiry_seconds: 3600,
    }
}
