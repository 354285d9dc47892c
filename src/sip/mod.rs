pub mod gateway;
pub mod signaling;

pub use gateway::{GatewayHandle, GatewayRuntime, TrunkGatewayBuilder};
