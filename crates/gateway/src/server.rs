//! Gateway assembly: wires ledgers, routers, notifier and channels together.

use std::sync::Arc;
use std::time::Duration;

use channels::ChannelFactory;
use futures_util::future::join_all;
use proto::{EndpointAddress, Envelope, GatewayError, LedgerError};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::bus::LocalBus;
use crate::channel_manager::ChannelManager;
use crate::endpoint_router::{DefaultEndpointRouter, EndpointRouter};
use crate::forwarder::{DEFAULT_SEND_TIMEOUT, ForwardOutcome, IdempotentForwarder};
use crate::ledger::Ledgers;
use crate::notifier::{MessageHandler, MessageNotifier, SubscriptionId};
use crate::receiver::IdempotentReceiver;
use crate::scheduler::sweep_once;
use crate::session::{OutboundPump, ReceiveSession};
use crate::site_router::{RoutingTable, SiteRouter};

/// Sub-scope of the endpoint queue where outbound envelopes are dropped.
pub const GATEWAY_SCOPE: &str = "gateway";

/// Resolved gateway settings.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// A disabled gateway runs no sessions.
    pub enabled: bool,
    /// Main input address of the local endpoint.
    pub endpoint: EndpointAddress,
    /// Name of this site; stamped as origin on outbound envelopes that lack one.
    pub local_site: String,
    /// Bound on each send attempt.
    pub send_timeout: Duration,
}

impl GatewaySettings {
    pub fn new(endpoint: impl Into<EndpointAddress>, local_site: impl Into<String>) -> Self {
        Self {
            enabled: true,
            endpoint: endpoint.into(),
            local_site: local_site.into(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

/// Shared handles an [`IdempotentForwarder`] is built from.
#[derive(Clone)]
pub struct ForwarderParts {
    router: SiteRouter,
    ledgers: Ledgers,
    factory: Arc<ChannelFactory>,
    local_site: String,
    send_timeout: Duration,
}

impl ForwarderParts {
    /// A fresh forwarder over the shared handles.
    pub fn forwarder(&self) -> IdempotentForwarder {
        IdempotentForwarder::new(
            self.router.clone(),
            self.ledgers.outbound.clone(),
            self.factory.clone(),
            self.local_site.clone(),
            self.send_timeout,
        )
    }
}

/// The site gateway
pub struct Gateway {
    settings: GatewaySettings,
    channels: ChannelManager,
    notifier: Arc<MessageNotifier>,
    endpoints: Arc<dyn EndpointRouter>,
    bus: Arc<dyn LocalBus>,
    parts: ForwarderParts,
}

impl Gateway {
    /// Assembles a gateway from already-opened ledgers and a frozen channel factory.
    pub fn new(
        settings: GatewaySettings,
        ledgers: Ledgers,
        factory: Arc<ChannelFactory>,
        routing: RoutingTable,
        channels: ChannelManager,
        bus: Arc<dyn LocalBus>,
    ) -> Self {
        let endpoints = Arc::new(DefaultEndpointRouter::new(settings.endpoint.clone()));
        let parts = ForwarderParts {
            router: SiteRouter::new(routing),
            ledgers,
            factory,
            local_site: settings.local_site.clone(),
            send_timeout: settings.send_timeout,
        };
        Self {
            settings,
            channels,
            notifier: Arc::new(MessageNotifier::new()),
            endpoints,
            bus,
            parts,
        }
    }

    /// Replaces the default endpoint router.
    pub fn with_endpoint_router(mut self, endpoints: Arc<dyn EndpointRouter>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Queue where the local bus drops envelopes destined for other sites.
    pub fn input_address(&self) -> EndpointAddress {
        self.settings.endpoint.sub_scope(GATEWAY_SCOPE)
    }

    pub fn channel_manager(&self) -> &ChannelManager {
        &self.channels
    }

    pub fn ledgers(&self) -> &Ledgers {
        &self.parts.ledgers
    }

    pub fn notifier(&self) -> Arc<MessageNotifier> {
        self.notifier.clone()
    }

    /// A per-call forwarder.
    pub fn forwarder(&self) -> IdempotentForwarder {
        self.parts.forwarder()
    }

    /// Forwards one envelope to its destination site(s).
    pub async fn forward(&self, envelope: &Envelope) -> Result<ForwardOutcome, GatewayError> {
        self.forwarder().forward(envelope).await
    }

    pub fn subscribe<H>(&self, handler: H) -> SubscriptionId
    where
        H: MessageHandler + 'static,
    {
        self.notifier.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }

    /// The inbound pipeline shared by every receive session.
    pub fn receiver(&self) -> IdempotentReceiver {
        IdempotentReceiver::new(
            self.parts.ledgers.inbound.clone(),
            self.notifier.clone(),
            self.endpoints.clone(),
            self.bus.clone(),
        )
    }

    /// Purges expired records from both ledgers.
    pub async fn sweep(&self) -> Result<u64, LedgerError> {
        sweep_once(&self.parts.ledgers.all()).await
    }

    /// Builds one session per inbound channel, plus the outbound pump when the
    /// bus exposes an input channel.
    pub fn sessions(&self) -> Result<Vec<ReceiveSession>, GatewayError> {
        let receiver = Arc::new(self.receiver());
        let mut sessions = Vec::new();

        for channel in self.channels.channels() {
            let listener = self.parts.factory.resolve_receiver(&channel.address)?;
            sessions.push(ReceiveSession::new(listener, receiver.clone()));
        }

        if let Some(address) = self.bus.input_channel(&self.input_address()) {
            let listener = self.parts.factory.resolve_receiver(&address)?;
            sessions.push(ReceiveSession::new(
                listener,
                Arc::new(OutboundPump::new(self.parts.clone())),
            ));
        }
        Ok(sessions)
    }

    /// Runs every session until `shutdown` flips to `true`.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), GatewayError> {
        if !self.settings.enabled {
            warn!("Gateway is disabled; not starting receive sessions");
            return Ok(());
        }

        let sessions = self.sessions()?;
        info!(
            endpoint = %self.settings.endpoint,
            site = %self.settings.local_site,
            "Gateway running {} session(s)",
            sessions.len()
        );

        let results = join_all(
            sessions
                .into_iter()
                .map(|session| session.run(shutdown.clone())),
        )
        .await;

        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                error!("Session ended with error: {e}");
                first_error.get_or_insert(e);
            }
        }
        info!("Gateway stopped");
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use channels::TransportOptions;
    use proto::{ChannelAddress, Site, headers};

    use super::*;
    use crate::bus::{ChannelBus, InProcessBus};
    use crate::channel_manager::InboundChannel;
    use crate::ledger::LedgerKind;

    async fn gateway(bus: Arc<dyn LocalBus>, factory: Arc<ChannelFactory>) -> Gateway {
        let ledgers = Ledgers::open(&LedgerKind::InMemory, None)
            .await
            .expect("ledgers");
        let routing = RoutingTable::new()
            .with_site(Site::new(
                "SiteEurope",
                vec![ChannelAddress::new("memory", "europe")],
            ))
            .route_prefix("Billing.", "SiteEurope");
        let channels = ChannelManager::new(
            vec![InboundChannel::new(ChannelAddress::new("memory", "home-in"), true)],
            &EndpointAddress::from("Sales"),
        );
        Gateway::new(
            GatewaySettings::new("Sales", "SiteHome"),
            ledgers,
            factory,
            routing,
            channels,
            bus,
        )
    }

    fn factory() -> Arc<ChannelFactory> {
        Arc::new(
            ChannelFactory::with_builtin_transports(TransportOptions::default()).expect("factory"),
        )
    }

    #[tokio::test]
    async fn input_address_is_gateway_sub_scope() {
        let bus = InProcessBus::new(1);
        let gw = gateway(Arc::new(bus.handle()), factory()).await;
        assert_eq!(gw.input_address().as_str(), "Sales.gateway");
    }

    #[tokio::test]
    async fn in_process_bus_gets_no_outbound_pump() {
        let bus = InProcessBus::new(1);
        let gw = gateway(Arc::new(bus.handle()), factory()).await;
        let sessions = gw.sessions().expect("sessions");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].address().location(), "home-in");
    }

    #[tokio::test]
    async fn channel_bus_adds_outbound_pump() {
        let factory = factory();
        let bus = ChannelBus::new(&factory, "memory", "bus/{endpoint}").expect("bus");
        let gw = gateway(Arc::new(bus), factory).await;
        let sessions = gw.sessions().expect("sessions");
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[1].address().location(), "bus/Sales.gateway");
    }

    #[tokio::test]
    async fn disabled_gateway_returns_immediately() {
        let bus = InProcessBus::new(1);
        let mut gw = gateway(Arc::new(bus.handle()), factory()).await;
        gw.settings.enabled = false;
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::time::timeout(Duration::from_secs(1), gw.run(stop_rx))
            .await
            .expect("returns")
            .expect("ok");
    }

    #[tokio::test]
    async fn unresolved_forward_is_reported_to_caller() {
        let bus = InProcessBus::new(1);
        let gw = gateway(Arc::new(bus.handle()), factory()).await;
        let env = Envelope::new("SiteHome", b"x".to_vec())
            .with_header(headers::MESSAGE_TYPE, "Inventory.Counted");
        assert!(matches!(
            gw.forward(&env).await,
            Err(GatewayError::UnresolvedSite(_))
        ));
        assert_eq!(gw.ledgers().outbound.record_count().await.expect("count"), 0);
    }
}
