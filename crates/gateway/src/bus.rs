//! Hand-off from the gateway to the local message bus.

use std::sync::Arc;

use async_trait::async_trait;
use channels::{ChannelFactory, ChannelSender};
use proto::{ChannelAddress, ChannelError, EndpointAddress, Envelope, GatewayError};
use tokio::sync::mpsc;
use tracing::debug;

/// Placeholder replaced by the endpoint name in a [`ChannelBus`] location template.
pub const ENDPOINT_PLACEHOLDER: &str = "{endpoint}";

/// The local message bus as seen by the gateway.
#[async_trait]
pub trait LocalBus: Send + Sync {
    /// Deliver an envelope to a local endpoint queue.
    async fn deliver(
        &self,
        endpoint: &EndpointAddress,
        envelope: Envelope,
    ) -> Result<(), GatewayError>;

    /// Channel on which the bus drops envelopes addressed to `endpoint`, if it
    /// exposes one. The gateway listens there for outbound traffic.
    fn input_channel(&self, endpoint: &EndpointAddress) -> Option<ChannelAddress> {
        let _ = endpoint;
        None
    }
}

/// An envelope released to a local endpoint.
#[derive(Debug, Clone)]
pub struct BusDelivery {
    pub endpoint: EndpointAddress,
    pub envelope: Envelope,
}

/// Simple in-process bus using tokio channels (for embedding and tests)
pub struct InProcessBus {
    tx: mpsc::Sender<BusDelivery>,
    rx: mpsc::Receiver<BusDelivery>,
}

impl InProcessBus {
    /// Creates a bounded in-process bus.
    pub fn new(buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer);
        Self { tx, rx }
    }

    /// Returns a cloneable handle the gateway delivers through.
    pub fn handle(&self) -> InProcessBusHandle {
        InProcessBusHandle {
            tx: self.tx.clone(),
        }
    }

    /// Receives the next delivered envelope.
    pub async fn recv(&mut self) -> Option<BusDelivery> {
        self.rx.recv().await
    }

    /// Receives without waiting.
    pub fn try_recv(&mut self) -> Option<BusDelivery> {
        self.rx.try_recv().ok()
    }
}

/// Sending side of an [`InProcessBus`].
#[derive(Clone)]
pub struct InProcessBusHandle {
    tx: mpsc::Sender<BusDelivery>,
}

#[async_trait]
impl LocalBus for InProcessBusHandle {
    async fn deliver(
        &self,
        endpoint: &EndpointAddress,
        envelope: Envelope,
    ) -> Result<(), GatewayError> {
        debug!(message_id = %envelope.id, %endpoint, "Releasing envelope to in-process bus");
        self.tx
            .send(BusDelivery {
                endpoint: endpoint.clone(),
                envelope,
            })
            .await
            .map_err(|_| GatewayError::Delivery("in-process bus closed".to_string()))
    }
}

/// Bus reached through a channel transport; endpoint queues are channel addresses.
///
/// The location of an endpoint is the template with `{endpoint}` replaced,
/// e.g. `memory` + `{endpoint}` or `file` + `/var/spool/bus/{endpoint}`.
pub struct ChannelBus {
    sender: Arc<dyn ChannelSender>,
    transport: String,
    location_template: String,
}

impl ChannelBus {
    /// Resolves the sender for `transport` from the factory.
    pub fn new(
        factory: &ChannelFactory,
        transport: &str,
        location_template: impl Into<String>,
    ) -> Result<Self, ChannelError> {
        let sender = factory.resolve_sender(transport)?;
        Ok(Self {
            transport: sender.transport().to_string(),
            sender,
            location_template: location_template.into(),
        })
    }

    /// Channel address of an endpoint queue.
    pub fn address_for(&self, endpoint: &EndpointAddress) -> ChannelAddress {
        let location = self
            .location_template
            .replace(ENDPOINT_PLACEHOLDER, endpoint.as_str());
        ChannelAddress::new(&self.transport, location)
    }
}

#[async_trait]
impl LocalBus for ChannelBus {
    async fn deliver(
        &self,
        endpoint: &EndpointAddress,
        envelope: Envelope,
    ) -> Result<(), GatewayError> {
        let address = self.address_for(endpoint);
        debug!(message_id = %envelope.id, %address, "Releasing envelope to channel bus");
        self.sender
            .send(&address, &envelope)
            .await
            .map_err(|e| GatewayError::Delivery(format!("{address}: {e}")))
    }

    fn input_channel(&self, endpoint: &EndpointAddress) -> Option<ChannelAddress> {
        Some(self.address_for(endpoint))
    }
}

#[cfg(test)]
mod tests {
    use channels::TransportOptions;

    use super::*;

    #[tokio::test]
    async fn in_process_bus_receives_deliveries() {
        let mut bus = InProcessBus::new(4);
        let handle = bus.handle();
        handle
            .deliver(
                &EndpointAddress::from("Sales"),
                Envelope::with_id("m-1", "SiteA", b"x".to_vec()),
            )
            .await
            .expect("deliver");

        let delivery = bus.recv().await.expect("delivery");
        assert_eq!(delivery.endpoint.as_str(), "Sales");
        assert_eq!(delivery.envelope.id.as_str(), "m-1");
        assert!(handle.input_channel(&delivery.endpoint).is_none());
    }

    #[tokio::test]
    async fn in_process_bus_reports_closed_queue() {
        let bus = InProcessBus::new(1);
        let handle = bus.handle();
        drop(bus);
        let err = handle
            .deliver(
                &EndpointAddress::from("Sales"),
                Envelope::new("SiteA", b"x".to_vec()),
            )
            .await
            .expect_err("closed");
        assert!(matches!(err, GatewayError::Delivery(_)));
    }

    #[test]
    fn channel_bus_expands_location_template() {
        let factory =
            ChannelFactory::with_builtin_transports(TransportOptions::default()).expect("factory");
        let bus = ChannelBus::new(&factory, "file", "/var/spool/bus/{endpoint}").expect("bus");
        let input = bus
            .input_channel(&EndpointAddress::from("Sales").sub_scope("gateway"))
            .expect("input channel");
        assert_eq!(input.to_string(), "file:/var/spool/bus/Sales.gateway");
    }

    #[tokio::test]
    async fn channel_bus_without_listener_fails_delivery() {
        let factory =
            ChannelFactory::with_builtin_transports(TransportOptions::default()).expect("factory");
        let bus = ChannelBus::new(&factory, "memory", "{endpoint}").expect("bus");
        let err = bus
            .deliver(
                &EndpointAddress::from("Nobody"),
                Envelope::new("SiteA", b"x".to_vec()),
            )
            .await
            .expect_err("no listener");
        assert!(matches!(err, GatewayError::Delivery(_)));
    }
}
