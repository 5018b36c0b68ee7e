//! HTTP transport: axum receiver and reqwest sender.
//!
//! Envelopes travel as the JSON wire form in a `POST` to the address URL. The
//! receiver answers `200` once the gateway accepted the delivery, `503` when it
//! was rejected (the sender retries later) and `400` for payloads that can never
//! be processed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{Router, body::Bytes, extract::State, http::StatusCode, routing::post};
use proto::{ChannelAddress, ChannelError, Envelope, headers};
use reqwest::Url;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::adapter::{
    Acknowledgement, ChannelReceiver, ChannelSender, InboundDelivery, dispatch, wait_for_stop,
};

/// Transport tag of the HTTP channel.
pub const HTTP_TRANSPORT: &str = "http";

/// Default upper bound for one HTTP send.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Hex SHA-256 of an envelope body.
pub fn content_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Checks the `ContentHash` header when the sender provided one.
fn verify_content_hash(envelope: &Envelope) -> Result<(), String> {
    match envelope.header(headers::CONTENT_HASH) {
        Some(expected) => {
            let actual = content_hash(&envelope.body);
            if actual.eq_ignore_ascii_case(expected.trim()) {
                Ok(())
            } else {
                Err(format!("content hash mismatch (expected {expected}, got {actual})"))
            }
        }
        None => Ok(()),
    }
}

/// Parses and validates an HTTP channel location.
fn parse_location(address: &ChannelAddress) -> Result<Url, ChannelError> {
    let url = Url::parse(address.location()).map_err(|e| ChannelError::InvalidAddress {
        address: address.to_string(),
        reason: e.to_string(),
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ChannelError::InvalidAddress {
            address: address.to_string(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    if url.host_str().is_none() {
        return Err(ChannelError::InvalidAddress {
            address: address.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

/// Socket address string (`host:port`) to bind for a listening URL.
fn bind_target(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{host}:{port}"))
}

// ─── Sender ────────────────────────────────────────────────

/// Posts envelopes with a bounded request timeout.
pub struct HttpSender {
    client: reqwest::Client,
}

impl HttpSender {
    /// Creates a sender whose requests fail after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::ConnectionFailed(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ChannelSender for HttpSender {
    fn transport(&self) -> &str {
        HTTP_TRANSPORT
    }

    async fn send(
        &self,
        address: &ChannelAddress,
        envelope: &Envelope,
    ) -> Result<(), ChannelError> {
        let url = parse_location(address)?;

        let mut stamped = envelope.clone();
        stamped.headers.insert(
            headers::CONTENT_HASH.to_string(),
            content_hash(&envelope.body),
        );
        let payload = stamped
            .to_wire()
            .map_err(|e| ChannelError::Serialization(e.to_string()))?;

        let resp = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            debug!(message_id = %envelope.id, %address, "HTTP delivery accepted");
            Ok(())
        } else if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            Err(ChannelError::Rejected(format!("{address} answered {status}")))
        } else {
            Err(ChannelError::SendFailed(format!("{address} answered {status}")))
        }
    }
}

// ─── Receiver ──────────────────────────────────────────────

/// Shared state for the axum receive handler.
struct HttpState {
    source: ChannelAddress,
    tx: mpsc::Sender<InboundDelivery>,
}

/// Listens for envelope POSTs on the address URL.
pub struct HttpReceiver {
    address: ChannelAddress,
    url: Url,
}

impl HttpReceiver {
    /// Creates a receiver, validating the address URL.
    pub fn new(address: ChannelAddress) -> Result<Self, ChannelError> {
        let url = parse_location(&address)?;
        Ok(Self { address, url })
    }
}

#[async_trait]
impl ChannelReceiver for HttpReceiver {
    fn address(&self) -> &ChannelAddress {
        &self.address
    }

    async fn run(
        self: Box<Self>,
        tx: mpsc::Sender<InboundDelivery>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ChannelError> {
        let target = bind_target(&self.url).ok_or_else(|| ChannelError::InvalidAddress {
            address: self.address.to_string(),
            reason: "cannot derive host and port".to_string(),
        })?;

        let state = Arc::new(HttpState {
            source: self.address.clone(),
            tx,
        });
        let app = Router::new()
            .route(self.url.path(), post(receive_handler))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(&target)
            .await
            .map_err(|e| ChannelError::ConnectionFailed(format!("bind {target} failed: {e}")))?;

        info!(address = %self.address, "HTTP channel listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { wait_for_stop(&mut shutdown).await })
            .await
            .map_err(|e| ChannelError::ConnectionFailed(format!("server error: {e}")))?;

        info!(address = %self.address, "HTTP channel stopped");
        Ok(())
    }
}

/// Decodes one envelope and maps the gateway verdict to a status code.
async fn receive_handler(State(state): State<Arc<HttpState>>, body: Bytes) -> StatusCode {
    let envelope = match Envelope::from_wire(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(source = %state.source, "Malformed envelope: {e}");
            return StatusCode::BAD_REQUEST;
        }
    };

    if let Err(reason) = verify_content_hash(&envelope) {
        warn!(message_id = %envelope.id, "Rejecting corrupted envelope: {reason}");
        return StatusCode::BAD_REQUEST;
    }

    match dispatch(&state.tx, &state.source, envelope).await {
        Ok(Acknowledgement::Accepted) => StatusCode::OK,
        Ok(Acknowledgement::Rejected(reason)) => {
            debug!(source = %state.source, "Delivery rejected: {reason}");
            StatusCode::SERVICE_UNAVAILABLE
        }
        Err(e) => {
            warn!(source = %state.source, "Gateway not accepting deliveries: {e}");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_hex_sha256() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn verify_content_hash_accepts_missing_and_matching() {
        let env = Envelope::new("SiteA", b"abc".to_vec());
        assert!(verify_content_hash(&env).is_ok());

        let env = env.with_header(headers::CONTENT_HASH, content_hash(b"abc").to_uppercase());
        assert!(verify_content_hash(&env).is_ok());
    }

    #[test]
    fn verify_content_hash_rejects_mismatch() {
        let env = Envelope::new("SiteA", b"abc".to_vec())
            .with_header(headers::CONTENT_HASH, content_hash(b"abd"));
        let err = verify_content_hash(&env).expect_err("mismatch");
        assert!(err.contains("mismatch"));
    }

    #[test]
    fn parse_location_validates_scheme_and_host() {
        assert!(parse_location(&ChannelAddress::new("http", "http://127.0.0.1:8090/gw/")).is_ok());
        assert!(matches!(
            parse_location(&ChannelAddress::new("http", "ftp://host/x")),
            Err(ChannelError::InvalidAddress { .. })
        ));
        assert!(matches!(
            parse_location(&ChannelAddress::new("http", "not a url")),
            Err(ChannelError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn bind_target_uses_default_port() {
        let url = Url::parse("http://localhost/Sales/").expect("url");
        assert_eq!(bind_target(&url).as_deref(), Some("localhost:80"));

        let url = Url::parse("http://0.0.0.0:8090/gateway/").expect("url");
        assert_eq!(bind_target(&url).as_deref(), Some("0.0.0.0:8090"));
    }

    #[test]
    fn receiver_rejects_invalid_address() {
        assert!(HttpReceiver::new(ChannelAddress::new("http", "/var/spool")).is_err());
    }
}
