//! src/services/retention.rs
//!
//! Periodic cleanup: unclaimed temporary uploads, objects past their
//! bucket's retention window and placeholders of crashed conversions.
//! Every phase is bounded per run and safe to interrupt.

use crate::models::object::VirtualObject;
use crate::services::storage_service::{StorageResult, StorageService};
use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetentionConfig {
    /// Age after which an unclaimed temporary object is removed.
    pub temporary_grace: TimeDelta,
    /// Maximum number of objects deleted per phase and run.
    pub batch_size: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            temporary_grace: TimeDelta::hours(1),
            batch_size: 256,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub temporary_deleted: usize,
    pub expired_deleted: usize,
    pub placeholders_deleted: u64,
    pub failures: usize,
}

#[derive(Clone)]
pub struct RetentionSweep {
    storage: StorageService,
    config: RetentionConfig,
}

impl RetentionSweep {
    pub fn new(storage: StorageService, config: RetentionConfig) -> Self {
        Self { storage, config }
    }

    pub async fn run_once(&self) -> StorageResult<SweepReport> {
        self.run_once_at(Utc::now()).await
    }

    pub async fn run_once_at(&self, now: DateTime<Utc>) -> StorageResult<SweepReport> {
        let mut report = SweepReport::default();
        let grace_limit = now - self.config.temporary_grace;

        let stale = self
            .storage
            .find_stale_temporary(grace_limit, self.config.batch_size)
            .await?;
        report.temporary_deleted = self.delete_all(&stale, &mut report.failures).await;

        for bucket in self.storage.buckets().filter(|b| b.has_retention()) {
            let limit = now - TimeDelta::days(i64::from(bucket.delete_files_after_days));
            let expired = self
                .storage
                .find_expired(&bucket.name, limit, self.config.batch_size)
                .await?;
            report.expired_deleted += self.delete_all(&expired, &mut report.failures).await;
        }

        report.placeholders_deleted = self.storage.delete_stale_placeholders(grace_limit).await?;
        Ok(report)
    }

    async fn delete_all(&self, objects: &[VirtualObject], failures: &mut usize) -> usize {
        let mut deleted = 0;
        for object in objects {
            match self.storage.delete(object).await {
                Ok(()) => deleted += 1,
                Err(err) => {
                    *failures += 1;
                    warn!(
                        bucket = %object.bucket,
                        key = %object.object_key,
                        error = %err,
                        "failed to delete object during retention sweep"
                    );
                }
            }
        }
        deleted
    }

    /// Runs the sweep every `interval` until the task is aborted.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match self.run_once().await {
                    Ok(report) => info!(
                        temporary = report.temporary_deleted,
                        expired = report.expired_deleted,
                        placeholders = report.placeholders_deleted,
                        failures = report.failures,
                        "retention sweep finished"
                    ),
                    Err(err) => warn!(error = %err, "retention sweep failed"),
                }
            }
        })
    }
}
