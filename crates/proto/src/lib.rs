//! Shared protocol types for the site gateway.
//!
//! This crate defines the envelope, addressing and dedup-record types and the
//! strongly-typed error enums shared across the workspace.

pub mod address;
pub mod envelope;
pub mod error;
pub mod ledger;

/// Re-export of all protocol error types.
pub use error::*;
/// Re-export of channel, endpoint and site addressing types.
pub use address::{ChannelAddress, EndpointAddress, Site};
/// Re-export of envelope types and well-known header names.
pub use envelope::{Envelope, MessageId, headers};
/// Re-export of ledger claim types.
pub use ledger::{ClaimOutcome, ClaimScope, DedupRecord};
