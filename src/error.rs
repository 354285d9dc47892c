use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure taxonomy for the gateway.
///
/// Call-scoped variants (`ConfigUnavailable`, `MissingMediaOffer`,
/// `RelayNegotiationFailed`, `BridgeEstablishFailed`) reject exactly one call.
/// Lease-scoped variants (`RegistrationRejected`) fail exactly one lease and
/// are retried on the next refresh cycle. `BackendUnreachable` degrades to
/// cached data or skips one action; it never terminates the process.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("sip configuration unavailable")]
    ConfigUnavailable,

    #[error("call-setup request carries no media offer")]
    MissingMediaOffer,

    #[error("media relay negotiation failed: {0}")]
    RelayNegotiationFailed(String),

    #[error("media relay error: {0}")]
    Relay(String),

    #[error("bridge establishment failed: {0}")]
    BridgeEstablishFailed(String),

    #[error("registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("signaling error: {0}")]
    Signaling(String),
}

impl Error {
    pub fn configuration<E: std::fmt::Display>(err: E) -> Self {
        Self::Configuration(err.to_string())
    }

    pub fn relay<E: std::fmt::Display>(err: E) -> Self {
        Self::Relay(err.to_string())
    }

    pub fn backend<E: std::fmt::Display>(err: E) -> Self {
        Self::BackendUnreachable(err.to_string())
    }

    pub fn signaling<E: std::fmt::Display>(err: E) -> Self {
        Self::Signaling(err.to_string())
    }
}
