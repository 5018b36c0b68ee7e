//! Shared channel sender/receiver traits and delivery acknowledgement.

use async_trait::async_trait;
use proto::{ChannelAddress, ChannelError, Envelope};
use tokio::sync::{mpsc, oneshot, watch};

/// Processing verdict reported back to the transport for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Processed or recognised as a duplicate; the transport may forget it.
    Accepted,
    /// Not processed; the transport should redeliver later.
    Rejected(String),
}

/// One-shot acknowledgement handle attached to an inbound delivery.
///
/// Dropping the handle without a verdict rejects the delivery.
#[derive(Debug)]
pub struct AckHandle {
    tx: Option<oneshot::Sender<Acknowledgement>>,
}

impl AckHandle {
    /// Creates a handle and the receiver on which the transport awaits the verdict.
    pub fn channel() -> (Self, oneshot::Receiver<Acknowledgement>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Handle whose verdict nobody observes.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    /// Accept the delivery.
    pub fn accept(mut self) {
        self.finish(Acknowledgement::Accepted);
    }

    /// Reject the delivery so the transport redelivers it.
    pub fn reject(mut self, reason: impl Into<String>) {
        self.finish(Acknowledgement::Rejected(reason.into()));
    }

    fn finish(&mut self, ack: Acknowledgement) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(ack);
        }
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        self.finish(Acknowledgement::Rejected(
            "dropped without acknowledgement".to_string(),
        ));
    }
}

/// An envelope handed from a transport to the gateway.
#[derive(Debug)]
pub struct InboundDelivery {
    /// Address of the receiving channel.
    pub source: ChannelAddress,
    /// Decoded envelope.
    pub envelope: Envelope,
    /// Verdict handle; must be accepted or rejected exactly once.
    pub ack: AckHandle,
}

/// Transmits envelopes to a channel address of one transport kind.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Transport tag this sender serves.
    fn transport(&self) -> &str;

    /// Send one envelope; `Ok` means the remote side accepted it.
    async fn send(&self, address: &ChannelAddress, envelope: &Envelope)
    -> Result<(), ChannelError>;
}

/// Listens on one channel address and streams deliveries to the gateway.
#[async_trait]
pub trait ChannelReceiver: Send + Sync {
    /// Address this receiver listens on.
    fn address(&self) -> &ChannelAddress;

    /// Run until `shutdown` flips to `true`, publishing deliveries to `tx`.
    async fn run(
        self: Box<Self>,
        tx: mpsc::Sender<InboundDelivery>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ChannelError>;
}

/// Hands an envelope to the gateway and waits for its verdict.
pub async fn dispatch(
    tx: &mpsc::Sender<InboundDelivery>,
    source: &ChannelAddress,
    envelope: Envelope,
) -> Result<Acknowledgement, ChannelError> {
    let (ack, verdict) = AckHandle::channel();
    tx.send(InboundDelivery {
        source: source.clone(),
        envelope,
        ack,
    })
    .await
    .map_err(|_| ChannelError::Closed)?;
    verdict.await.map_err(|_| ChannelError::Closed)
}

/// Resolves once the shutdown flag is set or its sender is gone.
pub async fn wait_for_stop(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
