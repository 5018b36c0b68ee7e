//! Idempotent forwarder: claim-then-send to the resolved sites.

use std::sync::Arc;
use std::time::Duration;

use channels::ChannelFactory;
use proto::{Envelope, GatewayError, Site};
use tracing::{debug, info, warn};

use crate::ledger::Ledger;
use crate::site_router::{RoutingStrategy, SiteRouter};

/// Default bound on a single send attempt.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a successful forward call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Transmitted to every resolved site.
    Sent {
        strategy: RoutingStrategy,
        sites: Vec<String>,
    },
    /// The identifier was already forwarded; nothing was sent.
    Duplicate,
}

/// Forwards one outbound envelope. Holds only shared handles, so one is built per call.
pub struct IdempotentForwarder {
    router: SiteRouter,
    ledger: Arc<dyn Ledger>,
    factory: Arc<ChannelFactory>,
    local_site: String,
    send_timeout: Duration,
}

impl IdempotentForwarder {
    pub fn new(
        router: SiteRouter,
        ledger: Arc<dyn Ledger>,
        factory: Arc<ChannelFactory>,
        local_site: impl Into<String>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            router,
            ledger,
            factory,
            local_site: local_site.into(),
            send_timeout,
        }
    }

    /// Route, claim in the outbound ledger, then transmit.
    ///
    /// Nothing is claimed when routing fails. A send failure after the claim
    /// leaves the claim in place: retrying with the same identifier is a
    /// no-op, the business message must be resent under a fresh identifier.
    pub async fn forward(&self, envelope: &Envelope) -> Result<ForwardOutcome, GatewayError> {
        let decision = self.router.resolve(envelope)?;

        if !self.ledger.try_claim(&envelope.id).await?.is_claimed() {
            info!(message_id = %envelope.id, "Envelope already forwarded, skipping");
            return Ok(ForwardOutcome::Duplicate);
        }

        let mut outgoing = envelope.clone();
        if outgoing.origin_site.trim().is_empty() {
            outgoing.origin_site = self.local_site.clone();
        }

        for site in &decision.sites {
            self.send_to_site(site, &outgoing).await?;
        }

        let sites = decision.site_names();
        info!(
            message_id = %envelope.id,
            strategy = %decision.strategy,
            "Envelope forwarded to {}",
            sites.join(", ")
        );
        Ok(ForwardOutcome::Sent {
            strategy: decision.strategy,
            sites,
        })
    }

    /// Tries the site's addresses in order until one accepts.
    async fn send_to_site(&self, site: &Site, envelope: &Envelope) -> Result<(), GatewayError> {
        let mut last_error = "site has no channel addresses".to_string();

        for address in &site.addresses {
            let sender = match self.factory.resolve_sender(address.tag()) {
                Ok(sender) => sender,
                Err(e) => {
                    warn!(site = %site.name, %address, "No sender for address: {e}");
                    last_error = e.to_string();
                    continue;
                }
            };

            match tokio::time::timeout(self.send_timeout, sender.send(address, envelope)).await {
                Ok(Ok(())) => {
                    debug!(message_id = %envelope.id, site = %site.name, %address, "Sent");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(message_id = %envelope.id, site = %site.name, %address, "Send failed: {e}");
                    last_error = format!("{address}: {e}");
                }
                Err(_) => {
                    warn!(message_id = %envelope.id, site = %site.name, %address, "Send timed out");
                    last_error = format!("{address}: timed out after {:?}", self.send_timeout);
                }
            }
        }

        Err(GatewayError::TransportSendFailure {
            site: site.name.clone(),
            reason: last_error,
        })
    }
}
