//! Decides which inbound channels the gateway listens on.

use proto::{ChannelAddress, ConfigError, EndpointAddress};

/// Base URL of the channel derived when none are configured.
pub const CONVENTION_HTTP_BASE: &str = "http://localhost:8090";

/// One inbound channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundChannel {
    pub address: ChannelAddress,
    /// The address advertised to remote sites for replies.
    pub default: bool,
}

impl InboundChannel {
    pub fn new(address: ChannelAddress, default: bool) -> Self {
        Self { address, default }
    }
}

/// Configuration-based when channels are enumerated, convention-based otherwise.
#[derive(Debug, Clone)]
pub enum ChannelManager {
    /// Channels listed in configuration, used verbatim.
    Configured(Vec<InboundChannel>),
    /// One HTTP channel at `{CONVENTION_HTTP_BASE}/{endpoint}/`.
    Convention { endpoint: EndpointAddress },
}

impl ChannelManager {
    /// Picks the variant: an empty list falls back to the convention.
    pub fn new(channels: Vec<InboundChannel>, endpoint: &EndpointAddress) -> Self {
        if channels.is_empty() {
            ChannelManager::Convention {
                endpoint: endpoint.clone(),
            }
        } else {
            ChannelManager::Configured(channels)
        }
    }

    /// At most one channel may be flagged as default.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let ChannelManager::Configured(channels) = self {
            let defaults = channels.iter().filter(|c| c.default).count();
            if defaults > 1 {
                return Err(ConfigError::InvalidValue {
                    field: "channels".to_string(),
                    reason: format!("{defaults} channels are marked default, expected one"),
                });
            }
        }
        Ok(())
    }

    /// Channels to listen on, in configuration order.
    pub fn channels(&self) -> Vec<InboundChannel> {
        match self {
            ChannelManager::Configured(channels) => channels.clone(),
            ChannelManager::Convention { endpoint } => vec![InboundChannel::new(
                ChannelAddress::new("http", format!("{CONVENTION_HTTP_BASE}/{endpoint}/")),
                true,
            )],
        }
    }

    /// The flagged default channel, else the first one.
    pub fn default_channel(&self) -> Option<InboundChannel> {
        let channels = self.channels();
        channels
            .iter()
            .find(|c| c.default)
            .or_else(|| channels.first())
            .cloned()
    }
}
