use std::any::Any;
use std::sync::Arc;

use tokio::runtime::Builder as RuntimeBuilder;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{ConfigAuthority, HttpConfigAuthority};
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::media::{MediaRelay, UdpRelayClient};
use crate::sip::signaling::SignalingServer;

use super::providers::ProviderRegistrar;
use super::routing::{ConfigCache, DestinationResolver};
use super::session::CallSession;
use super::trunks::TrunkRegistrar;

pub struct TrunkGatewayBuilder {
    config: GatewayConfig,
    authority: Option<Arc<dyn ConfigAuthority>>,
    relay: Option<Arc<dyn MediaRelay>>,
    signaling: Option<Arc<dyn SignalingServer>>,
}

impl TrunkGatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            authority: None,
            relay: None,
            signaling: None,
        }
    }

    pub fn with_authority(mut self, authority: Arc<dyn ConfigAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    pub fn with_relay(mut self, relay: Arc<dyn MediaRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn with_signaling(mut self, signaling: Arc<dyn SignalingServer>) -> Self {
        self.signaling = Some(signaling);
        self
    }

    pub fn build(self) -> Result<GatewayRuntime> {
        if self.config.backend.base_url.trim().is_empty() {
            return Err(Error::configuration("backend base_url is empty"));
        }
        if self.config.backend.api_key.trim().is_empty() {
            return Err(Error::configuration("backend api_key is empty"));
        }

        let signaling = self
            .signaling
            .ok_or_else(|| Error::configuration("no signaling server configured"))?;

        let authority = match self.authority {
            Some(authority) => authority,
            None => Arc::new(HttpConfigAuthority::new(&self.config.backend)?),
        };

        let relay = match self.relay {
            Some(relay) => relay,
            None => Arc::new(UdpRelayClient::new(&self.config.relay)?),
        };

        let config = Arc::new(self.config);
        let context = GatewayContext {
            cache: Arc::new(ConfigCache::new(authority.clone(), &config.timers)),
            resolver: Arc::new(DestinationResolver::new(authority.clone(), &config.timers)),
            trunks: Arc::new(TrunkRegistrar::new(
                authority.clone(),
                signaling.clone(),
                config.clone(),
            )),
            providers: Arc::new(ProviderRegistrar::new(
                authority.clone(),
                signaling.clone(),
                config.clone(),
            )),
            relay,
            signaling,
        };

        Ok(GatewayRuntime { context })
    }
}

/// Shared collaborators handed to every task the runtime spawns.
#[derive(Clone)]
struct GatewayContext {
    cache: Arc<ConfigCache>,
    resolver: Arc<DestinationResolver>,
    trunks: Arc<TrunkRegistrar>,
    providers: Arc<ProviderRegistrar>,
    relay: Arc<dyn MediaRelay>,
    signaling: Arc<dyn SignalingServer>,
}

pub struct GatewayRuntime {
    context: GatewayContext,
}

impl GatewayRuntime {
    /// Spawns the gateway on a dedicated worker thread with its own runtime,
    /// so the caller's runtime is never blocked by gateway work.
    pub fn start(self) -> Result<GatewayHandle> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let context = self.context;

        let worker: std::thread::JoinHandle<Result<()>> = std::thread::spawn(move || {
            let runtime = RuntimeBuilder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(Error::Transport)?;

            let mut shutdown = ShutdownSignal::new(shutdown_rx);
            runtime.block_on(run_gateway(context, &mut shutdown));
            Ok(())
        });

        Ok(GatewayHandle {
            shutdown_tx,
            worker,
        })
    }
}

async fn run_gateway(context: GatewayContext, shutdown: &mut ShutdownSignal) {
    let cancel = CancellationToken::new();

    let trunk_task = tokio::spawn(context.trunks.clone().run(cancel.clone()));
    let provider_task = tokio::spawn(context.providers.clone().run(cancel.clone()));
    let accept_task = tokio::spawn(accept_loop(context, cancel.clone()));

    shutdown.recv().await;
    info!("shutdown requested, stopping gateway tasks");
    cancel.cancel();

    let _ = trunk_task.await;
    let _ = provider_task.await;
    let _ = accept_task.await;
    info!("gateway stopped");
}

/// Accepts inbound calls and hands each one to its own session task.
async fn accept_loop(context: GatewayContext, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = context.signaling.accept() => accepted,
        };

        match accepted {
            Ok(call) => {
                let session = CallSession::new(
                    call.invite,
                    call.responder,
                    context.cache.clone(),
                    context.resolver.clone(),
                    context.relay.clone(),
                    context.signaling.clone(),
                );
                tokio::spawn(session.connect());
            }
            Err(err) => {
                warn!(error = %err, "failed to accept inbound call");
                // Avoid a hot loop if the signaling link is down.
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

pub struct GatewayHandle {
    shutdown_tx: watch::Sender<bool>,
    worker: std::thread::JoinHandle<Result<()>>,
}

impl GatewayHandle {
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn wait(self) -> Result<()> {
        let Self {
            shutdown_tx: _,
            worker,
        } = self;
        Self::join(worker).await
    }

    pub async fn shutdown(self) -> Result<()> {
        let Self {
            shutdown_tx,
            worker,
        } = self;
        let _ = shutdown_tx.send(true);
        Self::join(worker).await
    }

    async fn join(worker: std::thread::JoinHandle<Result<()>>) -> Result<()> {
        let handle = tokio::task::spawn_blocking(move || Self::join_worker(worker));
        match handle.await {
            Ok(result) => result,
            Err(join_error) => Err(Error::signaling(format!(
                "gateway task panicked: {join_error}"
            ))),
        }
    }

    fn join_worker(worker: std::thread::JoinHandle<Result<()>>) -> Result<()> {
        match worker.join() {
            Ok(result) => result,
            Err(panic) => Err(Error::signaling(format!(
                "gateway worker panicked: {}",
                Self::panic_message(panic),
            ))),
        }
    }

    fn panic_message(panic: Box<dyn Any + Send + 'static>) -> String {
        match panic.downcast::<String>() {
            Ok(msg) => *msg,
            Err(panic) => match panic.downcast::<&'static str>() {
                Ok(msg) => (*msg).to_string(),
                Err(_) => "unknown panic payload".to_string(),
            },
        }
    }
}

pub struct ShutdownSignal {
    inner: watch::Receiver<bool>,
}

impl ShutdownSignal {
    fn new(inner: watch::Receiver<bool>) -> Self {
        Self { inner }
    }

    pub async fn recv(&mut self) {
        if *self.inner.borrow() {
            return;
        }

        while self.inner.changed().await.is_ok() {
            if *self.inner.borrow() {
                break;
            }
        }
    }
}
