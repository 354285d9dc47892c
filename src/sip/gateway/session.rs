use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::backend::SipConfig;
use crate::error::{Error, Result};
use crate::media::{AnswerParams, MediaRelay, OfferParams};
use crate::sip::signaling::{
    AnswerInterceptor, BridgeRequest, BridgedDialogs, InboundInvite, InviteResponder,
    RemoteAnswer, SignalingServer,
};

use super::routing::{ConfigCache, DestinationResolver};

/// Correlation header names copied through to the outbound leg.
const PASS_HEADERS: [&str; 2] = ["X-Trunk-Id", "X-Correlation-Id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Received,
    ConfigLoaded,
    DestinationResolved,
    OfferNegotiated,
    Bridging,
    Established,
    TearingDown,
    Closed,
}

/// Per-call bridging controller.
///
/// Exactly one instance exists per inbound call; it owns the call context for
/// the call's lifetime and shares nothing mutable with sibling calls. The
/// sequence is fixed: config, destination, relay offer, bridge with answer
/// interception, then a single cleanup when either leg ends. Any failure
/// funnels into one teardown path that deletes the relay session best-effort
/// and sends at most one final failure response.
pub struct CallSession {
    invite: InboundInvite,
    responder: Box<dyn InviteResponder>,
    cache: Arc<ConfigCache>,
    resolver: Arc<DestinationResolver>,
    relay: Arc<dyn MediaRelay>,
    signaling: Arc<dyn SignalingServer>,
    state: SessionState,
    responded: bool,
}

impl CallSession {
    pub fn new(
        invite: InboundInvite,
        responder: Box<dyn InviteResponder>,
        cache: Arc<ConfigCache>,
        resolver: Arc<DestinationResolver>,
        relay: Arc<dyn MediaRelay>,
        signaling: Arc<dyn SignalingServer>,
    ) -> Self {
        Self {
            invite,
            responder,
            cache,
            resolver,
            relay,
            signaling,
            state: SessionState::Received,
            responded: false,
        }
    }

    pub async fn connect(mut self) {
        info!(
            call_id = %self.invite.call_id,
            dialed = %self.invite.dialed_number,
            caller = %self.invite.caller_number,
            "call-setup received"
        );

        if let Err(err) = self.run().await {
            self.teardown(err).await;
        }
    }

    async fn run(&mut self) -> Result<()> {
        // Config load is the only terminal failure without retry here; the
        // caller retries at the protocol layer.
        let sip_config = self.cache.get().await?;
        self.transition(SessionState::ConfigLoaded);

        let destination = self
            .resolver
            .resolve(&self.invite.dialed_number, &sip_config.signaling_domain)
            .await;
        self.transition(SessionState::DestinationResolved);

        let offer_sdp = self
            .invite
            .media_offer
            .clone()
            .filter(|sdp| !sdp.trim().is_empty())
            .ok_or(Error::MissingMediaOffer)?;

        let negotiated = self
            .relay
            .offer(OfferParams {
                call_id: self.invite.call_id.clone(),
                from_tag: self.invite.from_tag.clone(),
                sdp: offer_sdp,
            })
            .await?;
        self.transition(SessionState::OfferNegotiated);

        let request = self.bridge_request(&sip_config, destination, negotiated.sdp);
        let interceptor: Arc<dyn AnswerInterceptor> = Arc::new(AnswerRewriter {
            relay: self.relay.clone(),
            call_id: self.invite.call_id.clone(),
            from_tag: self.invite.from_tag.clone(),
        });

        self.transition(SessionState::Bridging);
        let dialogs = self
            .signaling
            .bridge(&self.invite, request, interceptor)
            .await
            .map_err(|err| match err {
                // An interceptor failure keeps its identity; everything else
                // failed to establish the legs.
                negotiation @ Error::RelayNegotiationFailed(_) => negotiation,
                other => Error::BridgeEstablishFailed(other.to_string()),
            })?;

        // The bridge primitive forwarded the rewritten answer and the success
        // final response to the inbound party.
        self.responded = true;
        self.transition(SessionState::Established);
        info!(call_id = %self.invite.call_id, "call bridged");

        spawn_cleanup_watch(self.invite.call_id.clone(), self.relay.clone(), dialogs);
        Ok(())
    }

    fn bridge_request(
        &self,
        sip_config: &SipConfig,
        destination: String,
        media_offer: String,
    ) -> BridgeRequest {
        let contact = format!(
            "<sip:{}@{}:{};transport={}>",
            self.invite.caller_number,
            sip_config.public_address,
            sip_config.public_port,
            sip_config.transport,
        );

        BridgeRequest {
            target_uri: destination,
            media_offer,
            headers: vec![
                ("X-Trunk-Id".to_string(), sip_config.trunk_id.clone()),
                ("Contact".to_string(), contact),
            ],
            pass_headers: PASS_HEADERS.iter().map(|name| name.to_string()).collect(),
        }
    }

    async fn teardown(&mut self, err: Error) {
        self.transition(SessionState::TearingDown);
        warn!(
            call_id = %self.invite.call_id,
            dialed = %self.invite.dialed_number,
            error = %err,
            "call failed"
        );

        // Always attempted, even for calls that never reached negotiation, so
        // no relay resources are left orphaned.
        if let Err(cleanup_err) = self.relay.delete(&self.invite.call_id).await {
            warn!(call_id = %self.invite.call_id, error = %cleanup_err, "relay cleanup failed");
        }

        if self.responded {
            debug!(call_id = %self.invite.call_id, "final response already sent, skipping");
        } else {
            let (status, reason) = failure_response(&err);
            if let Err(send_err) = self.responder.send_final(status, reason).await {
                warn!(call_id = %self.invite.call_id, error = %send_err, "failed to send final response");
            }
            self.responded = true;
        }

        self.transition(SessionState::Closed);
    }

    fn transition(&mut self, next: SessionState) {
        debug!(
            call_id = %self.invite.call_id,
            from = ?self.state,
            to = ?next,
            "session state"
        );
        self.state = next;
    }
}

fn failure_response(err: &Error) -> (u16, &'static str) {
    match err {
        Error::ConfigUnavailable => (503, "Service Unavailable"),
        Error::MissingMediaOffer => (400, "Missing Media Offer"),
        Error::RelayNegotiationFailed(_) => (500, "Media Negotiation Failed"),
        _ => (500, "Call Failed"),
    }
}

/// Single owner of post-establishment cleanup: whichever leg ends first wakes
/// the watcher, which deletes the relay session exactly once and hangs up
/// both legs. Hangup of an already-dead leg is a no-op by contract.
fn spawn_cleanup_watch(call_id: String, relay: Arc<dyn MediaRelay>, dialogs: BridgedDialogs) {
    tokio::spawn(async move {
        let BridgedDialogs { inbound, outbound } = dialogs;

        tokio::select! {
            _ = inbound.wait_terminated() => {
                info!(call_id = %call_id, "inbound leg ended");
            }
            _ = outbound.wait_terminated() => {
                info!(call_id = %call_id, "outbound leg ended");
            }
        }

        if let Err(err) = relay.delete(&call_id).await {
            warn!(call_id = %call_id, error = %err, "relay cleanup failed");
        }
        inbound.hangup().await;
        outbound.hangup().await;
        info!(call_id = %call_id, "call closed");
    });
}

/// Rewrites the remote leg's answer through the relay. The remote media
/// description is never handed to the inbound party directly; the relay's
/// negotiated description replaces it. Receiving the answer is also the first
/// moment the remote tag exists, which is why `AnswerParams` demands it.
struct AnswerRewriter {
    relay: Arc<dyn MediaRelay>,
    call_id: String,
    from_tag: String,
}

#[async_trait]
impl AnswerInterceptor for AnswerRewriter {
    async fn on_remote_answer(&self, answer: RemoteAnswer) -> Result<String> {
        debug!(
            call_id = %self.call_id,
            to_tag = %answer.to_tag,
            "remote answer received, negotiating with relay"
        );

        let negotiated = self
            .relay
            .answer(AnswerParams {
                call_id: self.call_id.clone(),
                from_tag: self.from_tag.clone(),
                to_tag: answer.to_tag,
                sdp: answer.sdp,
            })
            .await?;

        Ok(negotiated.sdp)
    }
}
