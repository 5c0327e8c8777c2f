use crate::error::Result;
use crate::log_store::{ArchiveJobRecord, JobStatus, LogRecord, LogStore};
use crate::object_store::ObjectStore;
use crate::path_scheme::{HourRange, PathScheme};
use crate::s3_store::content_type_for;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Timelike, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Rewrites log records before they leave the database
pub trait PayloadMasker: Send + Sync {
    fn mask(&self, record: LogRecord) -> LogRecord;
}

/// Archives records unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughMasker;

impl PayloadMasker for PassthroughMasker {
    fn mask(&self, record: LogRecord) -> LogRecord {
        record
    }
}

/// Moves one hour of log rows into the archive, one object per service and status
pub struct ArchiveJob {
    log_store: Arc<dyn LogStore>,
    store: Arc<dyn ObjectStore>,
    scheme: Arc<PathScheme>,
    masker: Arc<dyn PayloadMasker>,
}

impl ArchiveJob {
    pub fn new(log_store: Arc<dyn LogStore>, store: Arc<dyn ObjectStore>, scheme: Arc<PathScheme>) -> Self {
        Self {
            log_store,
            store,
            scheme,
            masker: Arc::new(PassthroughMasker),
        }
    }

    pub fn with_masker(mut self, masker: Arc<dyn PayloadMasker>) -> Self {
        self.masker = masker;
        self
    }

    /// Start of the last complete hour before `now`
    pub fn previous_hour(now: DateTime<Utc>) -> DateTime<Utc> {
        let current = now
            .duration_trunc(ChronoDuration::hours(1))
            .unwrap_or(now);
        current - ChronoDuration::hours(1)
    }

    /// Archive `[hour_start, hour_start + 1h)`.
    ///
    /// The job row is written before any object and finished with the
    /// outcome, so failed runs stay visible.
    #[instrument(skip(self), fields(hour_start = %hour_start))]
    pub async fn run_hour(&self, hour_start: DateTime<Utc>) -> Result<ArchiveJobRecord> {
        let hour_start = hour_start
            .duration_trunc(ChronoDuration::hours(1))
            .unwrap_or(hour_start);
        let mut job = ArchiveJobRecord::start(hour_start);
        self.log_store.insert_job(&job).await?;

        let outcome = self.archive(&mut job).await;
        job.finished_at = Some(Utc::now());
        match &outcome {
            Ok(()) => {
                job.status = JobStatus::Completed;
                metrics::counter!("archive.jobs.completed").increment(1);
                info!(
                    files_written = job.files_written,
                    records_archived = job.records_archived,
                    bytes_written = job.bytes_written,
                    "Archive job completed"
                );
            }
            Err(e) => {
                job.status = JobStatus::Failed;
                job.error = Some(e.to_string());
                metrics::counter!("archive.jobs.failed").increment(1);
                error!(error = %e, "Archive job failed");
            }
        }

        self.log_store.finish_job(&job).await?;
        outcome.map(|()| job)
    }

    async fn archive(&self, job: &mut ArchiveJobRecord) -> Result<()> {
        let hour_start = job.hour_start;
        let records = self
            .log_store
            .logs_between(hour_start, hour_start + ChronoDuration::hours(1))
            .await?;

        let hour_range = HourRange::for_hour(hour_start.hour())?;
        let date = hour_start.date_naive();
        let include_time = self.scheme.config().naming.include_time;

        let mut groups: BTreeMap<(String, String), Vec<LogRecord>> = BTreeMap::new();
        for record in records {
            let record = self.masker.mask(record);
            groups
                .entry((record.service.clone(), record.status.clone()))
                .or_default()
                .push(record);
        }

        for ((service, status), records) in groups {
            let file_name = if include_time {
                format!("{}-logs_{}.json", service, hour_range)
            } else {
                format!("{}-logs.json", service)
            };

            let key = match self
                .scheme
                .generate_cloud_path(date, &file_name, Some(hour_range), Some(&status))
            {
                Ok(key) => key,
                Err(e) => {
                    warn!(service = %service, status = %status, error = %e, "Skipping unarchivable group");
                    metrics::counter!("archive.jobs.groups_skipped").increment(1);
                    continue;
                }
            };

            let body = serde_json::to_vec(&records)?;
            let size = body.len();
            self.store
                .put_object(&key, Bytes::from(body), content_type_for(&file_name))
                .await?;

            job.files_written += 1;
            job.records_archived += records.len() as i64;
            job.bytes_written += size as i64;
            metrics::counter!("archive.jobs.bytes_written").increment(size as u64);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArchiveConfig, NamingConfig, StructureType, SubFolderConfig};
    use crate::error::ArchiveError;
    use crate::log_store::MockLogStore;
    use crate::object_store::MemoryObjectStore;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn hour() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap()
    }

    fn record(service: &str, status: &str, minute: u32) -> LogRecord {
        LogRecord {
            id: Uuid::new_v4(),
            timestamp: hour() + ChronoDuration::minutes(i64::from(minute)),
            service: service.to_string(),
            status: status.to_string(),
            method: Some("GET".to_string()),
            path: Some("/v1/users".to_string()),
            status_code: Some(200),
            duration_ms: Some(8),
            payload: serde_json::json!({"authorization": "Bearer secret", "user": 42}),
        }
    }

    fn scheme(include_time: bool) -> Arc<PathScheme> {
        Arc::new(
            PathScheme::new(ArchiveConfig {
                structure_type: StructureType::Monthly,
                pattern: None,
                sub_folders: SubFolderConfig {
                    enabled: true,
                    by_hour: true,
                    by_status: true,
                    custom: vec![],
                },
                naming: NamingConfig {
                    prefix: Some("logs".to_string()),
                    include_time,
                    ..Default::default()
                },
            })
            .unwrap(),
        )
    }

    fn mock_with_logs(logs: Vec<LogRecord>) -> MockLogStore {
        let mut log_store = MockLogStore::new();
        log_store.expect_insert_job().times(1).returning(|_| Ok(()));
        log_store
            .expect_logs_between()
            .withf(|from, to| *from == hour() && *to == hour() + ChronoDuration::hours(1))
            .times(1)
            .return_once(move |_, _| Ok(logs));
        log_store
    }

    struct RedactingMasker;

    impl PayloadMasker for RedactingMasker {
        fn mask(&self, mut record: LogRecord) -> LogRecord {
            if let Some(obj) = record.payload.as_object_mut() {
                obj.insert("authorization".to_string(), serde_json::json!("***"));
            }
            record
        }
    }

    #[tokio::test]
    async fn test_run_hour_writes_one_object_per_group() {
        let mut log_store = mock_with_logs(vec![
            record("api", "success", 1),
            record("api", "success", 2),
            record("api", "error", 3),
            record("billing", "success", 4),
        ]);
        log_store
            .expect_finish_job()
            .withf(|job| job.status == JobStatus::Completed && job.files_written == 3)
            .times(1)
            .returning(|_| Ok(()));

        let store = Arc::new(MemoryObjectStore::new());
        let job = ArchiveJob::new(Arc::new(log_store), store.clone(), scheme(false))
            .with_masker(Arc::new(RedactingMasker))
            .run_hour(hour() + ChronoDuration::minutes(25))
            .await
            .unwrap();

        assert_eq!(job.records_archived, 4);
        assert_eq!(
            store.keys(),
            vec![
                "logs_2024-01/hour-14-15/error/api-logs.json",
                "logs_2024-01/hour-14-15/success/api-logs.json",
                "logs_2024-01/hour-14-15/success/billing-logs.json",
            ]
        );

        let body = store
            .get_object("logs_2024-01/hour-14-15/success/api-logs.json")
            .await
            .unwrap();
        let archived: Vec<LogRecord> = serde_json::from_slice(&body).unwrap();
        assert_eq!(archived.len(), 2);
        assert_eq!(archived[0].payload["authorization"], "***");
        assert_eq!(archived[0].payload["user"], 42);
        assert_eq!(job.bytes_written as u64, {
            let mut total = 0;
            for key in store.keys() {
                total += store.get_object(&key).await.unwrap().len() as u64;
            }
            total
        });
    }

    #[tokio::test]
    async fn test_include_time_names_files_by_hour() {
        let mut log_store = mock_with_logs(vec![record("api", "success", 0)]);
        log_store.expect_finish_job().returning(|_| Ok(()));

        let store = Arc::new(MemoryObjectStore::new());
        ArchiveJob::new(Arc::new(log_store), store.clone(), scheme(true))
            .run_hour(hour())
            .await
            .unwrap();

        assert!(store.contains("logs_2024-01/hour-14-15/success/api-logs_14-15.json"));
    }

    #[tokio::test]
    async fn test_invalid_group_is_skipped() {
        let mut log_store = mock_with_logs(vec![
            record("api", "success", 0),
            record("api", "hour-99", 1),
        ]);
        log_store
            .expect_finish_job()
            .withf(|job| job.files_written == 1)
            .returning(|_| Ok(()));

        let store = Arc::new(MemoryObjectStore::new());
        ArchiveJob::new(Arc::new(log_store), store.clone(), scheme(false))
            .run_hour(hour())
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_on_job_row() {
        let mut log_store = MockLogStore::new();
        log_store.expect_insert_job().returning(|_| Ok(()));
        log_store
            .expect_logs_between()
            .returning(|_, _| Err(ArchiveError::Database("connection refused".to_string())));
        log_store
            .expect_finish_job()
            .withf(|job| {
                job.status == JobStatus::Failed
                    && job.error.as_deref().is_some_and(|e| e.contains("connection refused"))
                    && job.finished_at.is_some()
            })
            .times(1)
            .returning(|_| Ok(()));

        let result = ArchiveJob::new(
            Arc::new(log_store),
            Arc::new(MemoryObjectStore::new()),
            scheme(false),
        )
        .run_hour(hour())
        .await;
        assert!(matches!(result, Err(ArchiveError::Database(_))));
    }

    #[test]
    fn test_previous_hour() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 15, 5, 30).unwrap();
        assert_eq!(ArchiveJob::previous_hour(now), hour());
    }
}
