use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::error::{Error, Result};

/// Routing/trunk snapshot served by the configuration authority. Replaced
/// wholesale on every refresh and shared read-only across concurrent calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SipConfig {
    /// Domain of the cloud conferencing endpoint calls are bridged towards.
    pub signaling_domain: String,
    pub public_address: String,
    #[serde(default = "default_sip_port")]
    pub public_port: u16,
    #[serde(default = "default_transport")]
    pub transport: String,
    /// Trunk identifier forwarded on the outbound leg so the cloud endpoint
    /// can match the call to a dispatch rule.
    pub trunk_id: String,
    #[serde(default)]
    pub media_relay_port: Option<u16>,
}

/// One outbound trunk lease definition, re-fetched each refresh cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrunkRegistration {
    pub name: String,
    pub provider_address: String,
    #[serde(default)]
    pub auth_username: Option<String>,
    #[serde(default)]
    pub auth_password: Option<String>,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default = "default_lease_expiry")]
    pub lease_expiry_seconds: u64,
}

/// One inbound provider registration definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRegistration {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_sip_port")]
    pub port: u16,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default = "default_lease_expiry")]
    pub lease_expiry_seconds: u64,
    #[serde(default)]
    pub next_refresh_at: Option<String>,
}

fn default_sip_port() -> u16 {
    5060
}

fn default_transport() -> String {
    "udp".to_string()
}

fn default_lease_expiry() -> u64 {
    3600
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Registered,
    Failed,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DestinationLookup {
    destination_uri: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusUpdate<'a> {
    register_status: RegistrationStatus,
    register_error: Option<&'a str>,
    last_register_at: String,
}

/// Backend configuration authority, consumed over HTTP in production and
/// replaced with a fake in tests.
#[async_trait]
pub trait ConfigAuthority: Send + Sync + 'static {
    async fn fetch_sip_config(&self) -> Result<SipConfig>;

    /// Authoritative destination for a dialed number.
    async fn lookup_destination(&self, dialed_number: &str) -> Result<String>;

    async fn fetch_outbound_trunks(&self) -> Result<Vec<TrunkRegistration>>;

    async fn fetch_provider_registrations(&self) -> Result<Vec<ProviderRegistration>>;

    /// Fresh data for a single provider; `Ok(None)` when it no longer exists.
    async fn fetch_provider_registration(&self, id: &str) -> Result<Option<ProviderRegistration>>;

    async fn update_registration_status(
        &self,
        provider_id: &str,
        status: RegistrationStatus,
        error: Option<&str>,
    ) -> Result<()>;
}

/// reqwest-backed authority client. Every request carries the API key and the
/// fixed backend timeout; failures map to `BackendUnreachable` so callers can
/// degrade instead of crashing.
pub struct HttpConfigAuthority {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpConfigAuthority {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(Error::backend)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(Error::backend)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::BackendUnreachable(format!(
                "GET {} returned {}",
                path, status
            )));
        }

        response.json::<T>().await.map_err(Error::backend)
    }
}

#[async_trait]
impl ConfigAuthority for HttpConfigAuthority {
    async fn fetch_sip_config(&self) -> Result<SipConfig> {
        self.get_json("/sip/config").await
    }

    async fn lookup_destination(&self, dialed_number: &str) -> Result<String> {
        let lookup: DestinationLookup = self
            .get_json(&format!("/sip/destination/{dialed_number}"))
            .await?;
        Ok(lookup.destination_uri)
    }

    async fn fetch_outbound_trunks(&self) -> Result<Vec<TrunkRegistration>> {
        self.get_json("/sip/trunk/outbound").await
    }

    async fn fetch_provider_registrations(&self) -> Result<Vec<ProviderRegistration>> {
        self.get_json("/sip/provider-registration").await
    }

    async fn fetch_provider_registration(&self, id: &str) -> Result<Option<ProviderRegistration>> {
        let path = format!("/sip/provider-registration/{id}");
        let response = self
            .client
            .get(self.url(&path))
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(Error::backend)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::BackendUnreachable(format!(
                "GET {} returned {}",
                path,
                response.status()
            )));
        }

        response
            .json::<ProviderRegistration>()
            .await
            .map(Some)
            .map_err(Error::backend)
    }

    async fn update_registration_status(
        &self,
        provider_id: &str,
        status: RegistrationStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let path = format!("/sip/provider-registration/{provider_id}");
        let body = StatusUpdate {
            register_status: status,
            register_error: error,
            last_register_at: Utc::now().to_rfc3339(),
        };

        let response = self
            .client
            .patch(self.url(&path))
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(Error::backend)?;

        if !response.status().is_success() {
            return Err(Error::BackendUnreachable(format!(
                "PATCH {} returned {}",
                path,
                response.status()
            )));
        }

        Ok(())
    }
}
