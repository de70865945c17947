use crate::entities::{files, prelude::*};
use crate::services::deleter::{BulkDeleter, DeleteSelector};
use chrono::Utc;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QuerySelect};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Periodically deletes expired uploads through the bulk deleter. The
/// `in_progress` flag keeps sweeps single-flight: a tick that fires while a
/// slow sweep still runs is skipped, never queued.
pub struct RetentionSweeper {
    db: DatabaseConnection,
    deleter: Arc<BulkDeleter>,
    interval_secs: u64,
    in_progress: AtomicBool,
}

impl RetentionSweeper {
    pub fn new(
        db: DatabaseConnection,
        deleter: Arc<BulkDeleter>,
        interval_secs: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            deleter,
            interval_secs,
            in_progress: AtomicBool::new(false),
        })
    }

    /// Run one sweep. Returns the number of uploads removed, or None when a
    /// sweep was already running.
    pub async fn sweep_once(&self) -> Option<usize> {
        if self.in_progress.swap(true, Ordering::AcqRel) {
            info!("Skipping retention sweep, the previous one is still running");
            return None;
        }

        let result = self.sweep_inner().await;
        self.in_progress.store(false, Ordering::Release);

        match result {
            Ok(count) => {
                if count > 0 {
                    info!("Retention sweep deleted {} expired upload(s)", count);
                }
                Some(count)
            }
            Err(e) => {
                error!("Retention sweep failed: {:#}", e);
                Some(0)
            }
        }
    }

    async fn sweep_inner(&self) -> anyhow::Result<usize> {
        let now = Utc::now().timestamp();
        let expired: Vec<i64> = Files::find()
            .select_only()
            .column(files::Column::Id)
            .filter(files::Column::Expirydate.is_not_null())
            .filter(files::Column::Expirydate.lte(now))
            .into_tuple()
            .all(&self.db)
            .await?;

        if expired.is_empty() {
            return Ok(0);
        }

        let total = expired.len();
        let failed = self
            .deleter
            .bulk_delete(DeleteSelector::Ids(expired), &BulkDeleter::system_actor())
            .await?;
        if !failed.is_empty() {
            error!(
                "Retention sweep could not delete {} of {} upload(s)",
                failed.len(),
                total
            );
        }
        Ok(total - failed.len())
    }

    /// Background ticker. Errors are logged and never stop the loop.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let sweeper = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(sweeper.interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sweeper.sweep_once().await;
            }
        })
    }
}
