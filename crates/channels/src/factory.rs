//! Transport registry resolving senders and receivers by tag.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use proto::{ChannelAddress, ChannelError};
use tracing::debug;

use crate::adapter::{ChannelReceiver, ChannelSender};
use crate::file::{DEFAULT_POLL_INTERVAL, FILE_TRANSPORT, FileReceiver, FileSender};
use crate::http::{DEFAULT_HTTP_TIMEOUT, HTTP_TRANSPORT, HttpReceiver, HttpSender};
use crate::memory::{MEMORY_TRANSPORT, MemoryHub, MemoryReceiver, MemorySender};

/// Builds the single sender instance for a tag.
pub type SenderConstructor =
    Box<dyn FnOnce() -> Result<Arc<dyn ChannelSender>, ChannelError> + Send>;

/// Builds a receiver listening on one address.
pub type ReceiverConstructor =
    Arc<dyn Fn(ChannelAddress) -> Result<Box<dyn ChannelReceiver>, ChannelError> + Send + Sync>;

/// Settings for the built-in `http`, `file` and `memory` transports.
#[derive(Clone)]
pub struct TransportOptions {
    /// Upper bound of one HTTP request.
    pub http_timeout: Duration,
    /// Interval between drop-directory scans.
    pub file_poll_interval: Duration,
    /// Hub shared by in-process senders and receivers.
    pub memory_hub: MemoryHub,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            file_poll_interval: DEFAULT_POLL_INTERVAL,
            memory_hub: MemoryHub::new(),
        }
    }
}

fn normalize(tag: &str) -> String {
    tag.trim().to_ascii_lowercase()
}

/// Collects transport registrations before the factory is frozen.
#[derive(Default)]
pub struct ChannelFactoryBuilder {
    senders: HashMap<String, SenderConstructor>,
    receivers: HashMap<String, ReceiverConstructor>,
}

impl ChannelFactoryBuilder {
    /// Register a sender constructor; a later registration for the same tag wins.
    pub fn register_sender<F>(mut self, tag: &str, ctor: F) -> Self
    where
        F: FnOnce() -> Result<Arc<dyn ChannelSender>, ChannelError> + Send + 'static,
    {
        self.senders.insert(normalize(tag), Box::new(ctor));
        self
    }

    /// Register a receiver constructor; a later registration for the same tag wins.
    pub fn register_receiver<F>(mut self, tag: &str, ctor: F) -> Self
    where
        F: Fn(ChannelAddress) -> Result<Box<dyn ChannelReceiver>, ChannelError>
            + Send
            + Sync
            + 'static,
    {
        self.receivers.insert(normalize(tag), Arc::new(ctor));
        self
    }

    /// Registers the `http`, `file` and `memory` transports.
    pub fn with_builtin_transports(self, options: TransportOptions) -> Self {
        let http_timeout = options.http_timeout;
        let poll = options.file_poll_interval;
        let send_hub = options.memory_hub.clone();
        let recv_hub = options.memory_hub;

        self.register_sender(HTTP_TRANSPORT, move || {
            Ok(Arc::new(HttpSender::new(http_timeout)?) as Arc<dyn ChannelSender>)
        })
        .register_receiver(HTTP_TRANSPORT, |address| {
            Ok(Box::new(HttpReceiver::new(address)?) as Box<dyn ChannelReceiver>)
        })
        .register_sender(FILE_TRANSPORT, || {
            Ok(Arc::new(FileSender::new()) as Arc<dyn ChannelSender>)
        })
        .register_receiver(FILE_TRANSPORT, move |address| {
            Ok(Box::new(FileReceiver::new(address, poll)) as Box<dyn ChannelReceiver>)
        })
        .register_sender(MEMORY_TRANSPORT, move || {
            Ok(Arc::new(MemorySender::new(send_hub)) as Arc<dyn ChannelSender>)
        })
        .register_receiver(MEMORY_TRANSPORT, move |address| {
            Ok(Box::new(MemoryReceiver::new(recv_hub.clone(), address))
                as Box<dyn ChannelReceiver>)
        })
    }

    /// Instantiates every sender and freezes the registry.
    pub fn build(self) -> Result<ChannelFactory, ChannelError> {
        let mut senders = HashMap::with_capacity(self.senders.len());
        for (tag, ctor) in self.senders {
            debug!("Registering sender for transport: {tag}");
            senders.insert(tag, ctor()?);
        }
        for tag in self.receivers.keys() {
            debug!("Registering receiver for transport: {tag}");
        }
        Ok(ChannelFactory {
            senders,
            receivers: self.receivers,
        })
    }
}

/// Immutable tag → transport lookup, shared read-only after startup
pub struct ChannelFactory {
    senders: HashMap<String, Arc<dyn ChannelSender>>,
    receivers: HashMap<String, ReceiverConstructor>,
}

impl ChannelFactory {
    /// Starts an empty registration.
    pub fn builder() -> ChannelFactoryBuilder {
        ChannelFactoryBuilder::default()
    }

    /// Factory with only the built-in transports.
    pub fn with_builtin_transports(options: TransportOptions) -> Result<Self, ChannelError> {
        Self::builder().with_builtin_transports(options).build()
    }

    /// Sender for a transport tag.
    pub fn resolve_sender(&self, tag: &str) -> Result<Arc<dyn ChannelSender>, ChannelError> {
        let tag = normalize(tag);
        self.senders
            .get(&tag)
            .cloned()
            .ok_or(ChannelError::NotFound(tag))
    }

    /// New receiver listening on `address`.
    pub fn resolve_receiver(
        &self,
        address: &ChannelAddress,
    ) -> Result<Box<dyn ChannelReceiver>, ChannelError> {
        let ctor = self
            .receivers
            .get(address.tag())
            .ok_or_else(|| ChannelError::NotFound(address.tag().to_string()))?;
        ctor(address.clone())
    }

    /// Whether a sender is registered for `tag`.
    pub fn has_sender(&self, tag: &str) -> bool {
        self.senders.contains_key(&normalize(tag))
    }

    /// Registered sender tags, sorted.
    pub fn sender_tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.senders.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Registered receiver tags, sorted.
    pub fn receiver_tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.receivers.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use proto::Envelope;

    use super::*;

    struct NullSender;

    #[async_trait]
    impl ChannelSender for NullSender {
        fn transport(&self) -> &str {
            "null"
        }

        async fn send(&self, _: &ChannelAddress, _: &Envelope) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[test]
    fn builtin_transports_are_registered() {
        let factory =
            ChannelFactory::with_builtin_transports(TransportOptions::default()).expect("factory");
        assert_eq!(factory.sender_tags(), vec!["file", "http", "memory"]);
        assert_eq!(factory.receiver_tags(), vec!["file", "http", "memory"]);
        assert_eq!(
            factory.resolve_sender("HTTP").expect("http sender").transport(),
            "http"
        );
    }

    #[test]
    fn unknown_tag_is_not_found() {
        let factory = ChannelFactory::builder().build().expect("factory");
        assert!(matches!(
            factory.resolve_sender("sqs"),
            Err(ChannelError::NotFound(ref tag)) if tag == "sqs"
        ));
        assert!(matches!(
            factory.resolve_receiver(&ChannelAddress::new("sqs", "queue")),
            Err(ChannelError::NotFound(_))
        ));
    }

    #[test]
    fn custom_sender_registration_overrides_builtin() {
        let factory = ChannelFactory::builder()
            .with_builtin_transports(TransportOptions::default())
            .register_sender("http", || Ok(Arc::new(NullSender) as Arc<dyn ChannelSender>))
            .build()
            .expect("factory");
        assert_eq!(
            factory.resolve_sender("http").expect("sender").transport(),
            "null"
        );
        assert!(factory.has_sender("file"));
    }

    #[test]
    fn failing_sender_constructor_fails_build() {
        let result = ChannelFactory::builder()
            .register_sender("broken", || {
                Err(ChannelError::ConnectionFailed("no credentials".to_string()))
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn receiver_resolution_validates_address() {
        let factory =
            ChannelFactory::with_builtin_transports(TransportOptions::default()).expect("factory");
        let receiver = factory
            .resolve_receiver(&ChannelAddress::new("file", "/tmp/sitegate-in"))
            .expect("file receiver");
        assert_eq!(receiver.address().location(), "/tmp/sitegate-in");
        assert!(matches!(
            factory.resolve_receiver(&ChannelAddress::new("http", "relative/path")),
            Err(ChannelError::InvalidAddress { .. })
        ));
    }
}
