//! Per-channel receive sessions.

use std::sync::Arc;

use async_trait::async_trait;
use channels::{Acknowledgement, ChannelReceiver, wait_for_stop};
use proto::{ChannelAddress, Envelope, GatewayError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::forwarder::ForwardOutcome;
use crate::receiver::{IdempotentReceiver, ReceiveOutcome};
use crate::server::ForwarderParts;

/// Turns one delivered envelope into a transport verdict.
#[async_trait]
pub trait DeliveryProcessor: Send + Sync {
    async fn process(&self, envelope: Envelope) -> Acknowledgement;
}

#[async_trait]
impl DeliveryProcessor for IdempotentReceiver {
    async fn process(&self, envelope: Envelope) -> Acknowledgement {
        let id = envelope.id.clone();
        match self.receive(envelope).await {
            Ok(ReceiveOutcome::Delivered { report, .. }) => {
                if !report.is_clean() {
                    warn!(
                        message_id = %id,
                        "{} subscriber(s) failed",
                        report.failures.len()
                    );
                }
                Acknowledgement::Accepted
            }
            Ok(ReceiveOutcome::Duplicate) => Acknowledgement::Accepted,
            Err(e) => {
                warn!(message_id = %id, "Receive failed, rejecting for redelivery: {e}");
                Acknowledgement::Rejected(e.to_string())
            }
        }
    }
}

/// Forwards envelopes the local bus dropped at the gateway input address.
///
/// A new forwarder is built for every envelope.
pub struct OutboundPump {
    parts: ForwarderParts,
}

impl OutboundPump {
    pub fn new(parts: ForwarderParts) -> Self {
        Self { parts }
    }
}

#[async_trait]
impl DeliveryProcessor for OutboundPump {
    async fn process(&self, envelope: Envelope) -> Acknowledgement {
        let forwarder = self.parts.forwarder();
        match forwarder.forward(&envelope).await {
            Ok(ForwardOutcome::Sent { sites, .. }) => {
                debug!(message_id = %envelope.id, "Pumped to {}", sites.join(", "));
                Acknowledgement::Accepted
            }
            Ok(ForwardOutcome::Duplicate) => Acknowledgement::Accepted,
            Err(GatewayError::LedgerUnavailable(reason)) => {
                warn!(message_id = %envelope.id, "Ledger unavailable, will retry: {reason}");
                Acknowledgement::Rejected(reason)
            }
            // The claim is kept on send failure, so redelivery could never succeed.
            Err(e) => {
                error!(message_id = %envelope.id, "Outbound envelope dropped: {e}");
                Acknowledgement::Accepted
            }
        }
    }
}

/// Runs one channel receiver and processes its deliveries one at a time
pub struct ReceiveSession {
    receiver: Box<dyn ChannelReceiver>,
    processor: Arc<dyn DeliveryProcessor>,
    buffer: usize,
}

impl ReceiveSession {
    /// Creates a session for a receiver and processor.
    pub fn new(receiver: Box<dyn ChannelReceiver>, processor: Arc<dyn DeliveryProcessor>) -> Self {
        Self {
            receiver,
            processor,
            buffer: 16,
        }
    }

    /// Address the session listens on.
    pub fn address(&self) -> &ChannelAddress {
        self.receiver.address()
    }

    /// Run the session until `shutdown` flips to `true` or the receiver stops.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), GatewayError> {
        let address = self.receiver.address().clone();
        info!("ReceiveSession started for {address}");

        let (tx, mut rx) = mpsc::channel(self.buffer);
        let listener = tokio::spawn(self.receiver.run(tx, shutdown.clone()));

        loop {
            tokio::select! {
                _ = wait_for_stop(&mut shutdown) => break,
                delivery = rx.recv() => {
                    let Some(delivery) = delivery else {
                        debug!("Receiver for {address} stopped");
                        break;
                    };
                    let verdict = self.processor.process(delivery.envelope).await;
                    match verdict {
                        Acknowledgement::Accepted => delivery.ack.accept(),
                        Acknowledgement::Rejected(reason) => delivery.ack.reject(reason),
                    }
                }
            }
        }
        drop(rx);

        let result = match listener.await {
            Ok(result) => result.map_err(GatewayError::from),
            Err(e) => Err(GatewayError::Delivery(format!("receiver task for {address}: {e}"))),
        };
        match &result {
            Ok(()) => info!("ReceiveSession stopped for {address}"),
            Err(e) => error!("ReceiveSession for {address} failed: {e}"),
        }
        result
    }
}
