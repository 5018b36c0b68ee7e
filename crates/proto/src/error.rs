use thiserror::Error;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration loading/validation error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Routing, dedup or delivery failure inside the gateway pipeline.
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Deduplication ledger error.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Transport channel error.
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Internal protocol type error.
    #[error("Proto error: {0}")]
    Proto(#[from] ProtoError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field was not provided.
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// A field has an invalid value and reason.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Filesystem read error.
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(String),
}

/// Gateway pipeline errors.
///
/// Duplicates are deliberately absent: a duplicate is an outcome, not a failure.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No routing strategy produced a destination site.
    #[error("Unresolved site: {0}")]
    UnresolvedSite(String),

    /// The ledger could not answer a claim; nothing was claimed.
    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// Transmission failed after the identifier was claimed.
    ///
    /// Retrying with the same identifier is a no-op; callers must resend the
    /// business message under a fresh identifier.
    #[error("Transport send failure to site {site}: {reason}")]
    TransportSendFailure { site: String, reason: String },

    /// Hand-off to the local bus failed.
    #[error("Delivery to local bus failed: {0}")]
    Delivery(String),

    /// Channel resolution or setup failure.
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl From<LedgerError> for GatewayError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Unavailable(reason) => GatewayError::LedgerUnavailable(reason),
        }
    }
}

/// Deduplication ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Backing store could not be reached or the statement failed.
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

/// Channel transport errors
#[derive(Debug, Error)]
pub enum ChannelError {
    /// No implementation registered for a transport tag.
    #[error("No channel registered for transport: {0}")]
    NotFound(String),

    /// The address location cannot be used by this transport.
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Channel connection/bind failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Sending an envelope failed.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The remote side received the envelope but refused to accept it.
    #[error("Delivery rejected: {0}")]
    Rejected(String),

    /// Wire payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Channel has been closed.
    #[error("Channel closed")]
    Closed,
}

/// Subscriber handler failure, reported by the notifier.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Builds a handler error from any displayable value.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Internal proto errors
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Channel address text is not `tag:location`.
    #[error("Invalid channel address: {0}")]
    InvalidAddress(String),

    /// Generic serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_config_error_variant() {
        let err = ConfigError::MissingField("gateway.endpoint".to_string());
        assert!(err.to_string().contains("Missing required field"));
    }

    #[test]
    fn ledger_unavailable_maps_into_gateway_error() {
        let err: GatewayError = LedgerError::Unavailable("pool closed".to_string()).into();
        assert!(matches!(err, GatewayError::LedgerUnavailable(ref r) if r == "pool closed"));
    }

    #[test]
    fn transport_failure_names_site() {
        let err = GatewayError::TransportSendFailure {
            site: "SiteB".to_string(),
            reason: "timeout".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("SiteB"));
        assert!(text.contains("timeout"));
    }

    #[test]
    fn wraps_channel_and_proto_errors() {
        let channel_err: Error = ChannelError::Closed.into();
        assert!(channel_err.to_string().contains("Channel error"));

        let proto_err: Error = ProtoError::InvalidAddress("nocolon".to_string()).into();
        assert!(proto_err.to_string().contains("Proto error"));
    }

    #[test]
    fn wraps_gateway_error_into_top_level_error() {
        let err: Error = GatewayError::UnresolvedSite("no rule".to_string()).into();
        assert!(err.to_string().contains("Gateway error"));
    }
}
