pub mod ng;
mod relay;

pub use relay::{AnswerParams, MediaAnswer, MediaRelay, OfferParams, UdpRelayClient};
