//! Deduplication ledger: the atomic claim primitive.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use proto::{ClaimOutcome, ClaimScope, DedupRecord, LedgerError, MessageId};
use tracing::debug;

use crate::sqlite_ledger::SqliteLedger;

/// Store of processed message identifiers.
///
/// `try_claim` must be atomic per identifier: of any number of concurrent
/// callers exactly one observes [`ClaimOutcome::Claimed`].
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Atomically marks `id` as processed unless an unexpired record exists.
    async fn try_claim(&self, id: &MessageId) -> Result<ClaimOutcome, LedgerError>;

    /// Removes the record for `id`, if any.
    async fn unclaim(&self, id: &MessageId) -> Result<(), LedgerError>;

    /// Deletes records expired at `now`; returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, LedgerError>;

    /// Number of stored records.
    async fn record_count(&self) -> Result<u64, LedgerError>;
}

/// Which ledger implementation backs the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerKind {
    /// Process-lifetime map; for tests and low-durability deployments.
    InMemory,
    /// SQLite database at `url` (a path, `~` expanded).
    Durable { url: String },
}

/// Inbound and outbound ledgers of one gateway.
#[derive(Clone)]
pub struct Ledgers {
    pub inbound: Arc<dyn Ledger>,
    pub outbound: Arc<dyn Ledger>,
}

impl Ledgers {
    /// Opens both scopes of the selected ledger kind.
    pub async fn open(kind: &LedgerKind, ttl: Option<Duration>) -> Result<Self, LedgerError> {
        match kind {
            LedgerKind::InMemory => Ok(Self {
                inbound: Arc::new(InMemoryLedger::new(ttl)),
                outbound: Arc::new(InMemoryLedger::new(ttl)),
            }),
            LedgerKind::Durable { url } => {
                let inbound = SqliteLedger::open(url, ClaimScope::Inbound, ttl).await?;
                let outbound = inbound.with_scope(ClaimScope::Outbound);
                Ok(Self {
                    inbound: Arc::new(inbound),
                    outbound: Arc::new(outbound),
                })
            }
        }
    }

    /// Both ledgers, inbound first.
    pub fn all(&self) -> Vec<Arc<dyn Ledger>> {
        vec![self.inbound.clone(), self.outbound.clone()]
    }
}

/// Sharded in-memory ledger
pub struct InMemoryLedger {
    records: DashMap<MessageId, DedupRecord>,
    ttl: Option<Duration>,
}

impl InMemoryLedger {
    /// Creates an empty ledger whose records expire after `ttl`, if set.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
        }
    }

    /// Claim evaluated at an explicit instant; the entry's shard lock makes it atomic.
    pub fn claim_at(&self, id: &MessageId, now: DateTime<Utc>) -> ClaimOutcome {
        match self.records.entry(id.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().is_expired(now) {
                    existing.insert(DedupRecord::new(id.clone(), now, self.ttl));
                    ClaimOutcome::Claimed
                } else {
                    ClaimOutcome::AlreadyClaimed
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(DedupRecord::new(id.clone(), now, self.ttl));
                ClaimOutcome::Claimed
            }
        }
    }

    /// Stored record for `id`.
    pub fn record(&self, id: &MessageId) -> Option<DedupRecord> {
        self.records.get(id).map(|r| r.clone())
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn try_claim(&self, id: &MessageId) -> Result<ClaimOutcome, LedgerError> {
        Ok(self.claim_at(id, Utc::now()))
    }

    async fn unclaim(&self, id: &MessageId) -> Result<(), LedgerError> {
        self.records.remove(id);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, LedgerError> {
        let mut purged = 0u64;
        self.records.retain(|_, record| {
            let keep = !record.is_expired(now);
            if !keep {
                purged += 1;
            }
            keep
        });
        debug!(purged, "In-memory ledger purged");
        Ok(purged)
    }

    async fn record_count(&self) -> Result<u64, LedgerError> {
        Ok(self.records.len() as u64)
    }
}
