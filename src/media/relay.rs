use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::config::RelayConfig;
use crate::error::{Error, Result};

use super::ng::{decode_reply, NgCommand, NgReply, NgValue};

const MAX_REPLY_BYTES: usize = 65_536;

/// Parameters for the initial offer towards the relay. Keyed by the call
/// identifier and the inbound leg's tag.
#[derive(Debug, Clone)]
pub struct OfferParams {
    pub call_id: String,
    pub from_tag: String,
    pub sdp: String,
}

/// Parameters for the answer leg. `to_tag` is mandatory here: an answer
/// cannot exist before the remote leg has answered and minted its tag.
#[derive(Debug, Clone)]
pub struct AnswerParams {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
    pub sdp: String,
}

/// Media description negotiated by the relay.
#[derive(Debug, Clone)]
pub struct MediaAnswer {
    pub sdp: String,
}

/// Client-side view of the network media-relay service.
///
/// `offer` and `answer` fail with `RelayNegotiationFailed` when the relay
/// reports an error *or* returns an empty media description; an empty
/// description silently breaks audio, which is worse than an explicit error.
/// `delete` failures are surfaced so callers can log them, but callers treat
/// the operation as best-effort and must still attempt it for calls that
/// failed before negotiation completed.
#[async_trait]
pub trait MediaRelay: Send + Sync + 'static {
    async fn offer(&self, params: OfferParams) -> Result<MediaAnswer>;

    async fn answer(&self, params: AnswerParams) -> Result<MediaAnswer>;

    async fn delete(&self, call_id: &str) -> Result<()>;
}

/// UDP control-channel client for the relay daemon.
pub struct UdpRelayClient {
    target: SocketAddr,
    command_timeout: Duration,
}

impl UdpRelayClient {
    pub fn new(config: &RelayConfig) -> Result<Self> {
        if config.command_timeout_secs == 0 {
            return Err(Error::configuration(
                "relay command timeout must be non-zero",
            ));
        }

        Ok(Self {
            target: config.socket_addr(),
            command_timeout: config.command_timeout(),
        })
    }

    /// One command, one fresh socket, one reply. Binding per exchange keeps
    /// reply correlation trivial under concurrent calls.
    async fn exchange(&self, command: NgCommand) -> Result<NgReply> {
        let bind_addr: SocketAddr = match self.target.ip() {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind_addr).await?;

        let cookie = generate_cookie();
        let frame = command.encode(&cookie);
        socket.send_to(&frame, self.target).await?;

        let mut buf = vec![0u8; MAX_REPLY_BYTES];
        let (len, _) = timeout(self.command_timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| Error::relay("relay command timed out"))??;

        let (reply_cookie, reply) = decode_reply(&buf[..len])?;
        if reply_cookie != cookie {
            return Err(Error::relay("relay reply cookie mismatch"));
        }

        Ok(reply)
    }

    fn negotiate_reply(reply: NgReply) -> Result<MediaAnswer> {
        if reply.result != "ok" {
            return Err(Error::RelayNegotiationFailed(
                reply
                    .error_reason
                    .unwrap_or_else(|| format!("relay result {}", reply.result)),
            ));
        }

        match reply.sdp {
            Some(sdp) if !sdp.is_empty() => Ok(MediaAnswer { sdp }),
            _ => Err(Error::RelayNegotiationFailed(
                "relay returned empty media description".to_string(),
            )),
        }
    }
}

fn base_command(name: &str, call_id: &str, from_tag: &str) -> NgCommand {
    NgCommand::new(name)
        .set_str("call-id", call_id)
        .set_str("from-tag", from_tag)
        .set_str("ICE", "remove")
        .set_str("record call", "no")
        .set(
            "direction",
            NgValue::List(vec![NgValue::str("public"), NgValue::str("public")]),
        )
}

fn generate_cookie() -> String {
    let value: u64 = rand::thread_rng().gen();
    format!("{value:016x}")
}

#[async_trait]
impl MediaRelay for UdpRelayClient {
    async fn offer(&self, params: OfferParams) -> Result<MediaAnswer> {
        let command =
            base_command("offer", &params.call_id, &params.from_tag).set_str("sdp", params.sdp);
        Self::negotiate_reply(self.exchange(command).await?)
    }

    async fn answer(&self, params: AnswerParams) -> Result<MediaAnswer> {
        let command = base_command("answer", &params.call_id, &params.from_tag)
            .set_str("to-tag", params.to_tag)
            .set_str("sdp", params.sdp);
        Self::negotiate_reply(self.exchange(command).await?)
    }

    async fn delete(&self, call_id: &str) -> Result<()> {
        let command = NgCommand::new("delete").set_str("call-id", call_id);
        let reply = self.exchange(command).await?;
        if reply.result != "ok" {
            return Err(Error::Relay(
                reply
                    .error_reason
                    .unwrap_or_else(|| format!("relay result {}", reply.result)),
            ));
        }
        Ok(())
    }
}
