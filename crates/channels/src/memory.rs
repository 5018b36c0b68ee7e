//! In-process transport: a hub of queues keyed by location.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use proto::{ChannelAddress, ChannelError, Envelope};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::adapter::{
    Acknowledgement, ChannelReceiver, ChannelSender, InboundDelivery, dispatch, wait_for_stop,
};

/// Transport tag of the in-process channel.
pub const MEMORY_TRANSPORT: &str = "memory";

/// Routes envelopes between in-process senders and receivers
#[derive(Clone, Default)]
pub struct MemoryHub {
    /// location -> delivery queue of the listening receiver
    queues: Arc<DashMap<String, mpsc::Sender<InboundDelivery>>>,
}

impl MemoryHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listening queue for a location
    pub fn register(&self, location: &str, tx: mpsc::Sender<InboundDelivery>) {
        debug!("Registering memory location: {location}");
        self.queues.insert(location.to_string(), tx);
    }

    /// Deregister a location
    pub fn deregister(&self, location: &str) {
        debug!("Deregistering memory location: {location}");
        self.queues.remove(location);
    }

    /// Whether a receiver currently listens on `location`.
    pub fn is_listening(&self, location: &str) -> bool {
        self.queues.contains_key(location)
    }

    /// Number of listening locations
    pub fn listener_count(&self) -> usize {
        self.queues.len()
    }

    fn queue_for(&self, location: &str) -> Option<mpsc::Sender<InboundDelivery>> {
        self.queues.get(location).map(|tx| tx.clone())
    }
}

/// Sender that waits for the receiving gateway's verdict.
pub struct MemorySender {
    hub: MemoryHub,
}

impl MemorySender {
    /// Creates a sender bound to `hub`.
    pub fn new(hub: MemoryHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl ChannelSender for MemorySender {
    fn transport(&self) -> &str {
        MEMORY_TRANSPORT
    }

    async fn send(
        &self,
        address: &ChannelAddress,
        envelope: &Envelope,
    ) -> Result<(), ChannelError> {
        let Some(queue) = self.hub.queue_for(address.location()) else {
            warn!("No memory receiver listening on {address}");
            return Err(ChannelError::ConnectionFailed(format!(
                "no receiver listening on {}",
                address.location()
            )));
        };

        match dispatch(&queue, address, envelope.clone()).await? {
            Acknowledgement::Accepted => Ok(()),
            Acknowledgement::Rejected(reason) => Err(ChannelError::Rejected(reason)),
        }
    }
}

/// Receiver that registers its location with the hub while running.
pub struct MemoryReceiver {
    hub: MemoryHub,
    address: ChannelAddress,
}

impl MemoryReceiver {
    /// Creates a receiver for `address` on `hub`.
    pub fn new(hub: MemoryHub, address: ChannelAddress) -> Self {
        Self { hub, address }
    }
}

#[async_trait]
impl ChannelReceiver for MemoryReceiver {
    fn address(&self) -> &ChannelAddress {
        &self.address
    }

    async fn run(
        self: Box<Self>,
        tx: mpsc::Sender<InboundDelivery>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ChannelError> {
        let location = self.address.location().to_string();
        self.hub.register(&location, tx);
        wait_for_stop(&mut shutdown).await;
        self.hub.deregister(&location);
        Ok(())
    }
}
