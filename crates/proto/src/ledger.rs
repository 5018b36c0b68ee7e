use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::MessageId;

/// Result of an atomic claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller now owns the identifier.
    Claimed,
    /// Someone already processed the identifier.
    AlreadyClaimed,
}

impl ClaimOutcome {
    /// True for [`ClaimOutcome::Claimed`].
    pub fn is_claimed(self) -> bool {
        matches!(self, ClaimOutcome::Claimed)
    }
}

/// Ledger partition; inbound and outbound claims never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimScope {
    /// Claims taken by the idempotent receiver.
    Inbound,
    /// Claims taken by the idempotent forwarder.
    Outbound,
}

impl ClaimScope {
    /// Stable storage name of the scope.
    pub fn as_str(self) -> &'static str {
        match self {
            ClaimScope::Inbound => "inbound",
            ClaimScope::Outbound => "outbound",
        }
    }
}

impl std::fmt::Display for ClaimScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A processed identifier as stored by a ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub message_id: MessageId,
    pub processed_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl DedupRecord {
    /// Record processed at `now`, expiring after `ttl` when one is set.
    ///
    /// An expiry beyond the representable date range means the record never expires.
    pub fn new(message_id: MessageId, now: DateTime<Utc>, ttl: Option<Duration>) -> Self {
        Self {
            message_id,
            processed_at: now,
            expires_at: ttl.and_then(|ttl| now.checked_add_signed(ttl)),
        }
    }

    /// An expired record no longer blocks a claim.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_without_ttl_never_expires() {
        let now = Utc::now();
        let record = DedupRecord::new(MessageId::from("a"), now, None);
        assert_eq!(record.expires_at, None);
        assert!(!record.is_expired(now + Duration::days(3650)));
    }

    #[test]
    fn record_expires_at_ttl_boundary() {
        let now = Utc::now();
        let record = DedupRecord::new(MessageId::from("a"), now, Some(Duration::seconds(10)));
        assert!(!record.is_expired(now + Duration::seconds(9)));
        assert!(record.is_expired(now + Duration::seconds(10)));
    }

    #[test]
    fn overflowing_ttl_never_expires() {
        let now = Utc::now();
        let ttl = Duration::try_seconds(10_000_000_000_000).expect("in range");
        let record = DedupRecord::new(MessageId::from("a"), now, Some(ttl));
        assert_eq!(record.expires_at, None);
        assert!(!record.is_expired(now + Duration::days(3650)));
    }

    #[test]
    fn scope_names_are_stable() {
        assert_eq!(ClaimScope::Inbound.as_str(), "inbound");
        assert_eq!(ClaimScope::Outbound.to_string(), "outbound");
        assert!(ClaimOutcome::Claimed.is_claimed());
        assert!(!ClaimOutcome::AlreadyClaimed.is_claimed());
    }
}
