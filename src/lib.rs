//! SIP trunk gateway between on-premises providers and a cloud telephony
//! endpoint. This crate exposes a high-level builder that wires the backend
//! configuration authority, the network media relay, and the signaling-plane
//! primitives into per-call bridging sessions and registration lifecycle
//! loops.

pub mod backend;
pub mod config;
pub mod error;
pub mod media;
pub mod sip;

pub use config::GatewayConfig;
pub use error::{Error, Result};
pub use sip::{GatewayHandle, GatewayRuntime, TrunkGatewayBuilder};
