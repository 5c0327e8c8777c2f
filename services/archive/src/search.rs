use crate::access_gate::{AccessGate, Caller};
use crate::archive_index::{ArchiveIndex, FileDescriptor};
use crate::error::{ArchiveError, Result};
use crate::filter_pipeline::{FilterPipeline, Pagination, SearchCriteria, SearchPage, SortBy, SortOrder};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// Echo of the criteria that shaped a result page
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedCriteria {
    pub applied_filters: Vec<&'static str>,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub success: bool,
    pub files: Vec<FileDescriptor>,
    pub total_count: usize,
    pub pagination: Pagination,
    pub search_criteria: AppliedCriteria,
}

/// Runs one query: access check, listing, then the filter pipeline
pub struct SearchService {
    gate: Arc<AccessGate>,
    index: ArchiveIndex,
    pipeline: FilterPipeline,
    default_deadline: Option<Duration>,
}

impl SearchService {
    pub fn new(
        gate: Arc<AccessGate>,
        index: ArchiveIndex,
        pipeline: FilterPipeline,
        default_deadline: Option<Duration>,
    ) -> Self {
        Self {
            gate,
            index,
            pipeline,
            default_deadline,
        }
    }

    pub fn gate(&self) -> &AccessGate {
        &self.gate
    }

    /// Search the archive on behalf of `caller`.
    ///
    /// `deadline` overrides the configured default. When it elapses the
    /// in-flight listing and downloads are dropped and `Timeout` is returned.
    #[instrument(skip(self, caller, criteria), fields(caller = %caller.name))]
    pub async fn search(
        &self,
        caller: &Caller,
        criteria: SearchCriteria,
        deadline: Option<Duration>,
    ) -> Result<SearchResponse> {
        let started = Instant::now();
        metrics::counter!("archive.search.requests").increment(1);

        let authorized = self
            .gate
            .authorize(&caller.name, &caller.profile, criteria, Utc::now())
            .map_err(|e| {
                if matches!(e, ArchiveError::AccessDenied { .. }) {
                    metrics::counter!("archive.search.denied").increment(1);
                }
                e
            })?;
        let criteria = authorized.criteria;

        let scope = match (criteria.date_range.from, criteria.date_range.to) {
            (Some(from), Some(to)) => self.index.scheme().scope_prefix(from, to),
            _ => None,
        };

        let run = async {
            let descriptors = self.index.snapshot(scope).await?;
            self.pipeline
                .apply(descriptors, &criteria, authorized.service_allowlist.as_ref())
                .await
        };

        let page: SearchPage = match deadline.or(self.default_deadline) {
            Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| {
                warn!(deadline_ms = limit.as_millis() as u64, "Search deadline elapsed");
                metrics::counter!("archive.search.timeouts").increment(1);
                ArchiveError::Timeout(limit)
            })??,
            None => run.await?,
        };

        metrics::histogram!("archive.search.duration_seconds").record(started.elapsed().as_secs_f64());
        info!(
            total_count = page.total_count,
            returned = page.files.len(),
            "Search completed"
        );

        Ok(SearchResponse {
            success: true,
            files: page.files,
            total_count: page.total_count,
            pagination: page.pagination,
            search_criteria: AppliedCriteria {
                applied_filters: criteria.applied_filters(),
                sort_by: criteria.sort_by,
                sort_order: criteria.sort_order,
            },
        })
    }
}
