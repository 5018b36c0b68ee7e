use std::str::FromStr;

use proto::{ChannelAddress, Envelope, GatewayError, LedgerError, MessageId, headers};

#[test]
fn envelope_wire_contract_preserves_identity_and_headers() {
    let envelope = Envelope::with_id("invoice-7", "SiteA", b"{\"total\":12}".to_vec())
        .with_header(headers::MESSAGE_TYPE, "Billing.InvoiceCreated")
        .with_header(headers::DESTINATION_SITE, "SiteEurope");

    let wire = envelope.to_wire().expect("serialize envelope");
    let json: serde_json::Value = serde_json::from_slice(&wire).expect("wire is json");
    assert_eq!(json["origin_site"], "SiteA");
    assert_eq!(json["headers"]["MessageType"], "Billing.InvoiceCreated");

    let decoded = Envelope::from_wire(&wire).expect("deserialize envelope");
    assert_eq!(decoded.id, MessageId::from("invoice-7"));
    assert_eq!(decoded.body, b"{\"total\":12}");
    assert_eq!(decoded.header(headers::DESTINATION_SITE), Some("SiteEurope"));
    assert_eq!(decoded.created_at, envelope.created_at);
}

#[test]
fn envelope_without_headers_field_decodes() {
    let raw = br#"{"id":"m","origin_site":"SiteB","body":"aGk=","created_at":"2025-03-01T12:00:00Z"}"#;
    let decoded = Envelope::from_wire(raw).expect("headers default to empty");
    assert!(decoded.headers.is_empty());
    assert_eq!(decoded.body, b"hi");
}

#[test]
fn address_text_form_round_trips_through_display() {
    let addr = ChannelAddress::new("file", "/var/spool/sitegate/in");
    let parsed = ChannelAddress::from_str(&addr.to_string()).expect("parse display form");
    assert_eq!(parsed, addr);
}

#[test]
fn ledger_failure_is_never_a_duplicate() {
    let err: GatewayError = LedgerError::Unavailable("database is locked".to_string()).into();
    assert!(matches!(err, GatewayError::LedgerUnavailable(_)));
}
