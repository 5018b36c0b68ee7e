//! Cron-based purge of expired ledger records.

use std::sync::Arc;

use chrono::Utc;
use proto::LedgerError;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::ledger::Ledger;

/// Default sweep schedule: every ten minutes.
pub const DEFAULT_SWEEP_CRON: &str = "0 */10 * * * *";

/// Purges expired records from every ledger once; returns the total removed.
pub async fn sweep_once(ledgers: &[Arc<dyn Ledger>]) -> Result<u64, LedgerError> {
    let now = Utc::now();
    let mut purged = 0;
    for ledger in ledgers {
        purged += ledger.purge_expired(now).await?;
    }
    Ok(purged)
}

/// Wraps tokio-cron-scheduler to purge ledgers on a schedule
pub struct LedgerSweeper {
    sched: JobScheduler,
}

impl LedgerSweeper {
    /// Creates a new scheduler instance.
    pub async fn new() -> Result<Self, String> {
        let sched = JobScheduler::new().await.map_err(|e| e.to_string())?;
        Ok(Self { sched })
    }

    /// Add a cron job purging `ledgers`; `on_sweep` receives each job's count.
    pub async fn add_sweep<F>(
        &self,
        cron_expr: &str,
        ledgers: Vec<Arc<dyn Ledger>>,
        on_sweep: F,
    ) -> Result<uuid::Uuid, String>
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        let on_sweep = Arc::new(on_sweep);
        let job = Job::new_async(cron_expr, move |_uuid, _lock| {
            let ledgers = ledgers.clone();
            let on_sweep = on_sweep.clone();
            Box::pin(async move {
                match sweep_once(&ledgers).await {
                    Ok(purged) => {
                        if purged > 0 {
                            info!("Ledger sweep purged {purged} expired record(s)");
                        }
                        on_sweep(purged);
                    }
                    Err(e) => error!("Ledger sweep failed: {e}"),
                }
            })
        })
        .map_err(|e| e.to_string())?;

        let id = self.sched.add(job).await.map_err(|e| e.to_string())?;
        info!("Ledger sweep scheduled: {id} ({cron_expr})");
        Ok(id)
    }

    /// Starts scheduler background processing.
    pub async fn start(&self) -> Result<(), String> {
        self.sched.start().await.map_err(|e| e.to_string())?;
        info!("LedgerSweeper started");
        Ok(())
    }

    /// Gracefully shuts down the scheduler.
    pub async fn shutdown(&mut self) -> Result<(), String> {
        self.sched.shutdown().await.map_err(|e| e.to_string())?;
        info!("LedgerSweeper shutdown");
        Ok(())
    }
}
