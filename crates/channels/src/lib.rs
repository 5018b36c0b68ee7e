//! Channel transport interfaces and built-in transport implementations.

pub mod adapter;
pub mod factory;
pub mod file;
pub mod http;
pub mod memory;

/// Sender/receiver traits and delivery acknowledgement types.
pub use adapter::{
    AckHandle, Acknowledgement, ChannelReceiver, ChannelSender, InboundDelivery, dispatch,
    wait_for_stop,
};
/// Tag-keyed transport registry.
pub use factory::{ChannelFactory, ChannelFactoryBuilder, TransportOptions};
/// File-drop transport.
pub use file::{FILE_TRANSPORT, FileReceiver, FileSender};
/// HTTP transport.
pub use http::{HTTP_TRANSPORT, HttpReceiver, HttpSender, content_hash};
/// In-process transport.
pub use memory::{MEMORY_TRANSPORT, MemoryHub, MemoryReceiver, MemorySender};
