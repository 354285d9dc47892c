//! Seam towards the external signaling server. The protocol stack itself
//! (transaction matching, retransmission, dialog state, digest challenges)
//! lives in a separate daemon; the gateway drives it through the capabilities
//! declared here and tests against in-process fakes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// An inbound call-setup request as delivered by the signaling server.
#[derive(Debug, Clone)]
pub struct InboundInvite {
    /// Stable correlation key for the lifetime of the call.
    pub call_id: String,
    /// User part of the request URI.
    pub dialed_number: String,
    /// User part of the From URI, or `anonymous`.
    pub caller_number: String,
    /// Dialog tag of the inbound leg.
    pub from_tag: String,
    /// Media offer carried in the request body, if any.
    pub media_offer: Option<String>,
}

/// Capability to send the final response on the inbound leg. The session
/// controller owns the at-most-once guard; implementations only transmit.
#[async_trait]
pub trait InviteResponder: Send + Sync {
    async fn send_final(&self, status: u16, reason: &str) -> Result<()>;
}

/// One inbound call: the parsed request plus its response channel.
pub struct IncomingCall {
    pub invite: InboundInvite,
    pub responder: Box<dyn InviteResponder>,
}

/// The remote leg's answer, observed before anything is forwarded to the
/// inbound party. The tag only exists once the remote party has answered.
#[derive(Debug, Clone)]
pub struct RemoteAnswer {
    pub sdp: String,
    pub to_tag: String,
}

/// Rewrites the remote answer into the media description actually returned
/// to the inbound party. Failing here fails the bridge.
#[async_trait]
pub trait AnswerInterceptor: Send + Sync {
    async fn on_remote_answer(&self, answer: RemoteAnswer) -> Result<String>;
}

/// One half of a bridged call.
#[async_trait]
pub trait DialogLeg: Send + Sync {
    /// Resolves when the leg ends, whichever side hung up.
    async fn wait_terminated(&self);

    /// Ends the leg. Implementations must tolerate repeated calls; the
    /// controller hangs up both legs during cleanup without tracking which
    /// one already died.
    async fn hangup(&self);
}

/// Both legs of an established back-to-back call.
pub struct BridgedDialogs {
    pub inbound: Arc<dyn DialogLeg>,
    pub outbound: Arc<dyn DialogLeg>,
}

/// Parameters for the bridge primitive.
#[derive(Debug, Clone)]
pub struct BridgeRequest {
    pub target_uri: String,
    /// Media description presented on the outbound leg.
    pub media_offer: String,
    /// Extra headers set on the outbound request.
    pub headers: Vec<(String, String)>,
    /// Header names copied through from the inbound request.
    pub pass_headers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// An outbound registration request. Authentication challenges from the
/// registrar are absorbed by the signaling layer; callers observe only the
/// final outcome.
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    /// Registrar address, e.g. `sip:sip.provider.example:5060`.
    pub registrar_uri: String,
    /// Address-of-record placed in To/From.
    pub address_of_record: String,
    pub contact_uri: String,
    pub expires_seconds: u64,
    pub call_id: String,
    pub transport: String,
    pub credentials: Option<Credentials>,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    /// Lease duration granted by the registrar.
    pub expires_seconds: u64,
}

/// The signaling server's request-level capabilities.
#[async_trait]
pub trait SignalingServer: Send + Sync + 'static {
    /// Next inbound call-setup request. Pends until one arrives.
    async fn accept(&self) -> Result<IncomingCall>;

    /// Establish two linked dialog legs: the already-open inbound leg and a
    /// new outbound leg towards `request.target_uri`. The interceptor runs on
    /// the remote answer before anything reaches the inbound party, and the
    /// success final response on the inbound leg is sent by this primitive.
    async fn bridge(
        &self,
        invite: &InboundInvite,
        request: BridgeRequest,
        interceptor: Arc<dyn AnswerInterceptor>,
    ) -> Result<BridgedDialogs>;

    /// Authenticated registration; retries once internally on a challenge.
    /// Non-2xx final outcomes surface as `Error::RegistrationRejected`,
    /// network-level failures as `Error::Signaling`.
    async fn register(&self, request: RegisterRequest) -> Result<RegisterOutcome>;
}
