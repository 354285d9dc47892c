//! Trunk gateway: per-call bridging sessions plus the registration
//! lifecycle loops that keep upstream leases alive.

mod builder;
mod providers;
mod registration;
mod routing;
mod session;
#[cfg(test)]
pub(crate) mod testutil;
mod trunks;

pub use builder::{GatewayHandle, GatewayRuntime, ShutdownSignal, TrunkGatewayBuilder};
pub use providers::ProviderRegistrar;
pub use registration::StatusReporter;
pub use routing::{ConfigCache, DestinationResolver};
pub use session::CallSession;
pub use trunks::TrunkRegistrar;
