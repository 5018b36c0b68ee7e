use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use proto::{ClaimOutcome, ClaimScope, LedgerError, MessageId};
use sqlx::{Row, sqlite::SqlitePool};
use tracing::{debug, info};

use crate::ledger::Ledger;

/// SQLite-backed dedup ledger; claims survive restarts
pub struct SqliteLedger {
    pool: SqlitePool,
    scope: ClaimScope,
    ttl: Option<Duration>,
}

impl SqliteLedger {
    /// Open (or create) the ledger database and run migrations
    pub async fn open(
        db_url: &str,
        scope: ClaimScope,
        ttl: Option<Duration>,
    ) -> Result<Self, LedgerError> {
        // Expand ~ in path
        let url = if db_url.starts_with('~') {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            db_url.replacen('~', &home, 1)
        } else {
            db_url.to_string()
        };

        if let Some(parent) = std::path::Path::new(&url).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        }

        let pool = SqlitePool::connect(&format!("sqlite:{url}?mode=rwc"))
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        let migrations_dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
        let migrator = sqlx::migrate::Migrator::new(migrations_dir.as_path())
            .await
            .map_err(|e| LedgerError::Unavailable(format!("migration: {e}")))?;

        migrator
            .run(&pool)
            .await
            .map_err(|e| LedgerError::Unavailable(format!("migration: {e}")))?;

        info!("SQLite ledger opened: {url} (scope: {scope})");
        Ok(Self { pool, scope, ttl })
    }

    /// Same database, different claim scope.
    pub fn with_scope(&self, scope: ClaimScope) -> Self {
        Self {
            pool: self.pool.clone(),
            scope,
            ttl: self.ttl,
        }
    }

    /// Scope this handle claims in.
    pub fn scope(&self) -> ClaimScope {
        self.scope
    }

    /// Close the underlying pool; subsequent calls fail with `Unavailable`.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Claim evaluated at an explicit instant.
    ///
    /// A single upsert: inserts a new record, or overwrites one that expired.
    /// SQLite serialises writers, so exactly one concurrent caller changes a row.
    pub async fn claim_at(
        &self,
        id: &MessageId,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, LedgerError> {
        let processed_at = now.timestamp_millis();
        let expires_at = self
            .ttl
            .and_then(|ttl| now.checked_add_signed(ttl))
            .map(|at| at.timestamp_millis());

        let result = sqlx::query(
            "INSERT INTO ledger (scope, message_id, processed_at, expires_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(scope, message_id) DO UPDATE
                SET processed_at = excluded.processed_at, expires_at = excluded.expires_at
                WHERE ledger.expires_at IS NOT NULL AND ledger.expires_at <= excluded.processed_at",
        )
        .bind(self.scope.as_str())
        .bind(id.as_str())
        .bind(processed_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        let outcome = if result.rows_affected() == 1 {
            ClaimOutcome::Claimed
        } else {
            ClaimOutcome::AlreadyClaimed
        };
        debug!(message_id = %id, scope = %self.scope, ?outcome, "Ledger claim");
        Ok(outcome)
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn try_claim(&self, id: &MessageId) -> Result<ClaimOutcome, LedgerError> {
        self.claim_at(id, Utc::now()).await
    }

    async fn unclaim(&self, id: &MessageId) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM ledger WHERE scope = ? AND message_id = ?")
            .bind(self.scope.as_str())
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, LedgerError> {
        let result = sqlx::query(
            "DELETE FROM ledger WHERE scope = ? AND expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(self.scope.as_str())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        debug!(scope = %self.scope, purged = result.rows_affected(), "SQLite ledger purged");
        Ok(result.rows_affected())
    }

    async fn record_count(&self) -> Result<u64, LedgerError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM ledger WHERE scope = ?")
            .bind(self.scope.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        let count: i64 = row.get("n");
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    async fn open_temp(ttl: Option<Duration>) -> (tempfile::TempDir, SqliteLedger) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger.db");
        let ledger = SqliteLedger::open(path.to_str().expect("utf8"), ClaimScope::Inbound, ttl)
            .await
            .expect("open ledger");
        (dir, ledger)
    }

    #[tokio::test]
    async fn claim_then_duplicate() {
        let (_dir, ledger) = open_temp(None).await;
        let id = MessageId::from("m-1");
        assert_eq!(ledger.try_claim(&id).await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(
            ledger.try_claim(&id).await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
        assert_eq!(ledger.record_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn huge_ttl_claims_without_panicking_and_still_dedups() {
        let ttl = Duration::try_seconds(10_000_000_000_000).expect("in range");
        let (_dir, ledger) = open_temp(Some(ttl)).await;
        let id = MessageId::from("dup");
        assert_eq!(ledger.try_claim(&id).await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(
            ledger.try_claim(&id).await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
        assert_eq!(ledger.purge_expired(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn scopes_share_database_but_not_claims() {
        let (_dir, inbound) = open_temp(None).await;
        let outbound = inbound.with_scope(ClaimScope::Outbound);
        let id = MessageId::from("m-2");
        assert!(inbound.try_claim(&id).await.unwrap().is_claimed());
        assert!(outbound.try_claim(&id).await.unwrap().is_claimed());
        assert!(!outbound.try_claim(&id).await.unwrap().is_claimed());
        assert_eq!(outbound.scope(), ClaimScope::Outbound);
    }

    #[tokio::test]
    async fn concurrent_claims_yield_exactly_one_winner() {
        let (_dir, ledger) = open_temp(None).await;
        let ledger = Arc::new(ledger);
        let id = MessageId::from("contended");
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move { ledger.try_claim(&id).await }));
        }
        let mut claimed = 0;
        for task in tasks {
            if task.await.unwrap().unwrap().is_claimed() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn expired_records_are_reclaimable_and_purgeable() {
        let (_dir, ledger) = open_temp(Some(Duration::seconds(60))).await;
        let t0 = Utc::now();
        let id = MessageId::from("m-3");
        assert!(ledger.claim_at(&id, t0).await.unwrap().is_claimed());
        assert!(
            !ledger
                .claim_at(&id, t0 + Duration::seconds(30))
                .await
                .unwrap()
                .is_claimed()
        );
        assert!(
            ledger
                .claim_at(&id, t0 + Duration::seconds(61))
                .await
                .unwrap()
                .is_claimed()
        );

        ledger
            .claim_at(&MessageId::from("m-4"), t0)
            .await
            .unwrap();
        let purged = ledger
            .purge_expired(t0 + Duration::seconds(90))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(ledger.record_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn claims_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger.db");
        let url = path.to_str().expect("utf8").to_string();
        let id = MessageId::from("durable");
        {
            let ledger = SqliteLedger::open(&url, ClaimScope::Outbound, None)
                .await
                .expect("open");
            assert!(ledger.try_claim(&id).await.unwrap().is_claimed());
            ledger.close().await;
        }
        let reopened = SqliteLedger::open(&url, ClaimScope::Outbound, None)
            .await
            .expect("reopen");
        assert!(!reopened.try_claim(&id).await.unwrap().is_claimed());
    }

    #[tokio::test]
    async fn closed_pool_reports_unavailable() {
        let (_dir, ledger) = open_temp(None).await;
        ledger.close().await;
        let err = ledger
            .try_claim(&MessageId::from("late"))
            .await
            .expect_err("closed");
        assert!(matches!(err, LedgerError::Unavailable(_)));
    }

    #[tokio::test]
    async fn unclaim_removes_record() {
        let (_dir, ledger) = open_temp(None).await;
        let id = MessageId::from("m-5");
        ledger.try_claim(&id).await.unwrap();
        ledger.unclaim(&id).await.unwrap();
        assert_eq!(ledger.record_count().await.unwrap(), 0);
    }
}
