//! Age-based cleanup of database rows and archived objects.
//!
//! One sweep walks `Idle -> Scanning -> Deleting -> Idle`, first over the
//! database then over the archive listing. Batches that keep failing are
//! skipped and reported; the next sweep picks them up again since the data
//! is still expired. Keys whose date cannot be derived are never deleted.

use crate::archive_index::ArchiveIndex;
use crate::config::RetentionConfig;
use crate::error::{ArchiveError, Result};
use crate::log_store::{LogStore, RecordKind};
use crate::object_store::ObjectStore;
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Sweep state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepState {
    Idle,
    Scanning,
    Deleting,
}

/// Which half of the sweep a failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepPhase {
    Database,
    Files,
}

/// A batch that exhausted its retries
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub phase: SweepPhase,
    pub kind: Option<RecordKind>,
    /// Rows or objects in the batch, 0 when the scan itself failed
    pub items: usize,
    pub attempts: u32,
    pub error: String,
}

/// Result of one sweep cycle
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub records_deleted: u64,
    pub objects_scanned: u64,
    pub objects_deleted: u64,
    /// Objects kept because their key carries no derivable date
    pub retention_unknown: u64,
    /// Expired items found while in dry-run mode
    pub candidates: u64,
    /// Partial failures; the sweep carried on past each of them
    pub failures: Vec<BatchFailure>,
    /// Set when shutdown cut the sweep short
    pub interrupted: bool,
}

impl SweepReport {
    fn new(started_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            started_at,
            finished_at: None,
            dry_run,
            records_deleted: 0,
            objects_scanned: 0,
            objects_deleted: 0,
            retention_unknown: 0,
            candidates: 0,
            failures: Vec::new(),
            interrupted: false,
        }
    }

    pub fn is_partial_failure(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Debug)]
pub enum SweepOutcome {
    Completed(SweepReport),
    /// Another sweep was running, or the sweeper is shut down
    Skipped,
}

/// Drives retention sweeps; at most one runs at any time
pub struct RetentionSweeper {
    log_store: Arc<dyn LogStore>,
    store: Arc<dyn ObjectStore>,
    index: ArchiveIndex,
    config: RetentionConfig,
    state: RwLock<SweepState>,
    running: Mutex<()>,
    shutdown: CancellationToken,
}

impl RetentionSweeper {
    pub fn new(
        log_store: Arc<dyn LogStore>,
        store: Arc<dyn ObjectStore>,
        index: ArchiveIndex,
        config: RetentionConfig,
    ) -> Self {
        Self {
            log_store,
            store,
            index,
            config,
            state: RwLock::new(SweepState::Idle),
            running: Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SweepState {
        *self.state.read()
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Stop accepting sweeps, wait for the current batch to finish
    pub async fn shutdown(&self) {
        info!("Retention sweeper shutting down");
        self.shutdown.cancel();
        let _guard = self.running.lock().await;
        info!("Retention sweeper stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run one sweep against `now`; skipped if one is already in progress
    #[instrument(skip(self))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> SweepOutcome {
        if self.shutdown.is_cancelled() {
            debug!("Sweeper is shut down, skipping trigger");
            return SweepOutcome::Skipped;
        }
        let Ok(_guard) = self.running.try_lock() else {
            warn!("Previous retention sweep still running, skipping trigger");
            metrics::counter!("archive.retention.sweeps_skipped").increment(1);
            return SweepOutcome::Skipped;
        };

        let mut report = SweepReport::new(Utc::now(), self.config.dry_run);
        info!(
            db_retention_days = self.config.db_retention_days,
            file_retention_days = self.config.file_retention_days,
            dry_run = self.config.dry_run,
            "Retention sweep started"
        );

        if self.config.db_retention_days > 0 {
            let cutoff = now - ChronoDuration::days(i64::from(self.config.db_retention_days));
            for kind in RecordKind::ALL {
                if self.shutdown.is_cancelled() {
                    break;
                }
                self.sweep_records(kind, cutoff, &mut report).await;
            }
        }

        if self.config.file_retention_days > 0 && !self.shutdown.is_cancelled() {
            let cutoff = now.date_naive()
                - ChronoDuration::days(i64::from(self.config.file_retention_days));
            self.sweep_files(cutoff, &mut report).await;
        }

        self.set_state(SweepState::Idle);
        report.interrupted = self.shutdown.is_cancelled();
        report.finished_at = Some(Utc::now());

        metrics::counter!("archive.retention.sweeps").increment(1);
        metrics::counter!("archive.retention.records_deleted").increment(report.records_deleted);
        metrics::counter!("archive.retention.objects_deleted").increment(report.objects_deleted);
        metrics::counter!("archive.retention.unknown").increment(report.retention_unknown);
        if report.is_partial_failure() {
            metrics::counter!("archive.retention.partial_failures").increment(1);
        }

        info!(
            records_deleted = report.records_deleted,
            objects_deleted = report.objects_deleted,
            retention_unknown = report.retention_unknown,
            failures = report.failures.len(),
            "Retention sweep finished"
        );

        SweepOutcome::Completed(report)
    }

    fn set_state(&self, state: SweepState) {
        *self.state.write() = state;
    }

    async fn sweep_records(&self, kind: RecordKind, cutoff: DateTime<Utc>, report: &mut SweepReport) {
        let mut after: Option<Uuid> = None;
        let batch_size = self.config.batch_size.max(1);

        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            self.set_state(SweepState::Scanning);
            let ids = match self
                .with_retry(|| {
                    self.log_store
                        .record_ids_before(kind, cutoff, after, batch_size as i64)
                })
                .await
            {
                Ok(ids) => ids,
                Err((e, attempts)) => {
                    error!(?kind, error = %e, "Retention scan failed");
                    report.failures.push(BatchFailure {
                        phase: SweepPhase::Database,
                        kind: Some(kind),
                        items: 0,
                        attempts,
                        error: e.to_string(),
                    });
                    return;
                }
            };

            let Some(last) = ids.last().copied() else {
                return;
            };
            after = Some(last);
            let full_batch = ids.len() >= batch_size;

            if self.config.dry_run {
                report.candidates += ids.len() as u64;
            } else {
                self.set_state(SweepState::Deleting);
                match self
                    .with_retry(|| self.log_store.delete_records(kind, &ids))
                    .await
                {
                    Ok(deleted) => {
                        debug!(?kind, deleted, "Expired records deleted");
                        report.records_deleted += deleted;
                    }
                    Err((e, attempts)) => {
                        warn!(?kind, batch = ids.len(), error = %e, "Skipping record batch");
                        report.failures.push(BatchFailure {
                            phase: SweepPhase::Database,
                            kind: Some(kind),
                            items: ids.len(),
                            attempts,
                            error: e.to_string(),
                        });
                    }
                }
            }

            if !full_batch {
                return;
            }
        }
    }

    async fn sweep_files(&self, cutoff: NaiveDate, report: &mut SweepReport) {
        self.set_state(SweepState::Scanning);
        let batch_size = self.config.batch_size.max(1);
        let mut listing = self.index.list(None);
        let mut batch: Vec<String> = Vec::new();

        while let Some(item) = listing.next().await {
            let descriptor = match item {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    error!(error = %e, "Archive listing failed during retention");
                    report.failures.push(BatchFailure {
                        phase: SweepPhase::Files,
                        kind: None,
                        items: 0,
                        attempts: 1,
                        error: e.to_string(),
                    });
                    break;
                }
            };
            report.objects_scanned += 1;

            match descriptor.date {
                None => {
                    debug!(key = %descriptor.key, "Retention unknown, keeping object");
                    report.retention_unknown += 1;
                }
                Some(date) if date.entirely_before(cutoff) => {
                    batch.push(descriptor.key);
                    if batch.len() >= batch_size {
                        self.delete_object_batch(std::mem::take(&mut batch), report)
                            .await;
                        if self.shutdown.is_cancelled() {
                            return;
                        }
                        self.set_state(SweepState::Scanning);
                    }
                }
                Some(_) => {}
            }
        }

        if !batch.is_empty() {
            self.delete_object_batch(batch, report).await;
        }
    }

    async fn delete_object_batch(&self, keys: Vec<String>, report: &mut SweepReport) {
        if self.config.dry_run {
            for key in &keys {
                info!(key = %key, "Dry run: would delete expired object");
            }
            report.candidates += keys.len() as u64;
            return;
        }

        self.set_state(SweepState::Deleting);
        match self.with_retry(|| self.store.delete_objects(&keys)).await {
            Ok(()) => {
                debug!(deleted = keys.len(), "Expired objects deleted");
                report.objects_deleted += keys.len() as u64;
            }
            Err((e, attempts)) => {
                warn!(batch = keys.len(), error = %e, "Skipping object batch");
                report.failures.push(BatchFailure {
                    phase: SweepPhase::Files,
                    kind: None,
                    items: keys.len(),
                    attempts,
                    error: e.to_string(),
                });
            }
        }
    }

    /// Retry transient failures with exponential backoff.
    ///
    /// Returns the last error and the number of attempts made.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> std::result::Result<T, (ArchiveError, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.retry_base_delay(),
            max_interval: self.config.retry_max_delay(),
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempts <= self.config.max_retries => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| self.config.retry_max_delay());
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retention batch failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => return Err((e, attempts)),
                    }
                }
                Err(e) => return Err((e, attempts)),
            }
        }
    }
}
