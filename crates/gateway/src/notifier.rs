//! Local publish/subscribe fan-out of received envelopes.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use proto::{Envelope, HandlerError};
use tracing::{debug, error};

/// A local consumer of received envelopes.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        self(envelope)
    }
}

/// Handle returned by [`MessageNotifier::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A subscriber that failed during one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberFailure {
    pub subscription: SubscriptionId,
    pub reason: String,
}

/// Outcome of one publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers that handled the envelope successfully.
    pub delivered: usize,
    pub failures: Vec<SubscriberFailure>,
}

impl PublishReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

type Subscribers = Vec<(SubscriptionId, Arc<dyn MessageHandler>)>;

/// Synchronous fan-out in registration order.
///
/// Publishing works on a snapshot of the subscriber list, so handlers may
/// subscribe or unsubscribe without deadlocking.
#[derive(Default)]
pub struct MessageNotifier {
    subscribers: RwLock<Arc<Subscribers>>,
    next_id: AtomicU64,
}

impl MessageNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler; it sees every envelope published afterwards.
    pub fn subscribe<H>(&self, handler: H) -> SubscriptionId
    where
        H: MessageHandler + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.subscribers.write();
        let mut next: Subscribers = guard.as_ref().clone();
        next.push((id, Arc::new(handler)));
        *guard = Arc::new(next);
        debug!("Subscribed handler {id}");
        id
    }

    /// Removes a handler. Returns false when the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self.subscribers.write();
        if !guard.iter().any(|(sub, _)| *sub == id) {
            return false;
        }
        let next: Subscribers = guard
            .iter()
            .filter(|(sub, _)| *sub != id)
            .cloned()
            .collect();
        *guard = Arc::new(next);
        debug!("Unsubscribed handler {id}");
        true
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Delivers `envelope` to every subscriber. Errors and panics are isolated per handler.
    pub fn publish(&self, envelope: &Envelope) -> PublishReport {
        let snapshot = self.subscribers.read().clone();
        let mut report = PublishReport::default();

        for (id, handler) in snapshot.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(envelope)));
            let reason = match outcome {
                Ok(Ok(())) => {
                    report.delivered += 1;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            error!(message_id = %envelope.id, subscription = %id, "Subscriber failed: {reason}");
            report.failures.push(SubscriberFailure {
                subscription: *id,
                reason,
            });
        }
        report
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
