//! Site gateway: idempotent receive and forward between sites.

pub mod bus;
pub mod channel_manager;
pub mod endpoint_router;
pub mod forwarder;
pub mod ledger;
pub mod notifier;
pub mod receiver;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod site_router;
pub mod sqlite_ledger;

/// Local bus hand-off.
pub use bus::{BusDelivery, ChannelBus, InProcessBus, InProcessBusHandle, LocalBus};
/// Inbound channel selection.
pub use channel_manager::{ChannelManager, InboundChannel};
/// Inbound endpoint routing.
pub use endpoint_router::{DefaultEndpointRouter, EndpointRouter};
/// Claim-then-send forwarding.
pub use forwarder::{DEFAULT_SEND_TIMEOUT, ForwardOutcome, IdempotentForwarder};
/// Dedup ledgers.
pub use ledger::{InMemoryLedger, Ledger, LedgerKind, Ledgers};
/// Local publish/subscribe.
pub use notifier::{
    MessageHandler, MessageNotifier, PublishReport, SubscriberFailure, SubscriptionId,
};
/// Claim-then-deliver receiving.
pub use receiver::{IdempotentReceiver, ReceiveOutcome};
/// Scheduled ledger purge.
pub use scheduler::{DEFAULT_SWEEP_CRON, LedgerSweeper, sweep_once};
/// Gateway assembly.
pub use server::{ForwarderParts, Gateway, GatewaySettings};
/// Per-channel receive sessions.
pub use session::{DeliveryProcessor, OutboundPump, ReceiveSession};
/// Outbound site routing.
pub use site_router::{RoutingDecision, RoutingStrategy, RoutingTable, SiteRouter};
/// Durable ledger.
pub use sqlite_ledger::SqliteLedger;
