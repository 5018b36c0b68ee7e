//! Idempotent receiver: dedup before releasing an envelope locally.

use std::sync::Arc;

use proto::{EndpointAddress, Envelope, GatewayError, headers};
use tracing::{debug, error, info};

use crate::bus::LocalBus;
use crate::endpoint_router::EndpointRouter;
use crate::ledger::Ledger;
use crate::notifier::{MessageNotifier, PublishReport};

/// What happened to one received envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// First sighting: published to subscribers and handed to the local bus.
    Delivered {
        endpoint: EndpointAddress,
        report: PublishReport,
    },
    /// Already processed; discarded.
    Duplicate,
}

/// Claims each inbound envelope in the inbound ledger before local processing
#[derive(Clone)]
pub struct IdempotentReceiver {
    ledger: Arc<dyn Ledger>,
    notifier: Arc<MessageNotifier>,
    endpoints: Arc<dyn EndpointRouter>,
    bus: Arc<dyn LocalBus>,
}

impl IdempotentReceiver {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        notifier: Arc<MessageNotifier>,
        endpoints: Arc<dyn EndpointRouter>,
        bus: Arc<dyn LocalBus>,
    ) -> Self {
        Self {
            ledger,
            notifier,
            endpoints,
            bus,
        }
    }

    /// Claim, resolve the endpoint, deliver to the bus, then notify subscribers.
    ///
    /// When the bus refuses the envelope the claim is released so a
    /// redelivery is processed again; subscribers only see envelopes the bus
    /// accepted, so each identifier is published once.
    pub async fn receive(&self, mut envelope: Envelope) -> Result<ReceiveOutcome, GatewayError> {
        let id = envelope.id.clone();
        if !self.ledger.try_claim(&id).await?.is_claimed() {
            info!(message_id = %id, origin = %envelope.origin_site, "Duplicate envelope discarded");
            return Ok(ReceiveOutcome::Duplicate);
        }

        if !envelope.origin_site.trim().is_empty() {
            envelope
                .headers
                .insert(headers::ORIGINATING_SITE.to_string(), envelope.origin_site.clone());
        }

        let endpoint = self.endpoints.resolve(&envelope);

        if let Err(e) = self.bus.deliver(&endpoint, envelope.clone()).await {
            if let Err(release) = self.ledger.unclaim(&id).await {
                error!(message_id = %id, "Failed to release claim after delivery failure: {release}");
            }
            return Err(e);
        }

        let report = self.notifier.publish(&envelope);
        debug!(message_id = %id, %endpoint, "Envelope delivered");
        Ok(ReceiveOutcome::Delivered { endpoint, report })
    }
}
