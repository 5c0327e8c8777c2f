//! Cron-driven job table.
//!
//! Jobs are keyed by name. Each job owns one task that sleeps until the next
//! cron tick and awaits its handler inline, so a job never overlaps itself.
//! Stopping a job only cancels its sleep; a handler in progress runs to
//! completion.

use crate::error::{ArchiveError, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Work run on each tick
pub type JobHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Returned by [`CronScheduler::schedule`]; identifies the job by name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn name(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJobInfo {
    pub name: String,
    pub expression: String,
    pub next_run: Option<DateTime<Utc>>,
    pub runs: u64,
}

struct ScheduledJob {
    expression: String,
    schedule: Schedule,
    handler: JobHandler,
    runs: Arc<AtomicU64>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ScheduledJob {
    /// Stop future ticks; a handler already running is left to finish
    fn cancel(&self) {
        self.token.cancel();
    }
}

/// Parse a cron expression; 5-field expressions get a leading seconds field
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    };

    Schedule::from_str(&normalized)
        .map_err(|e| ArchiveError::Config(format!("invalid cron expression '{}': {}", expression, e)))
}

#[derive(Default)]
pub struct CronScheduler {
    jobs: Mutex<HashMap<String, ScheduledJob>>,
}

impl CronScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any job with that name
    pub fn schedule(&self, expression: &str, name: &str, handler: JobHandler) -> Result<JobHandle> {
        let schedule = parse_schedule(expression)?;
        let token = CancellationToken::new();
        let runs = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn(run_job(
            name.to_string(),
            schedule.clone(),
            handler.clone(),
            runs.clone(),
            token.clone(),
        ));

        let job = ScheduledJob {
            expression: expression.to_string(),
            schedule,
            handler,
            runs,
            token,
            task,
        };

        if let Some(previous) = self.jobs.lock().insert(name.to_string(), job) {
            debug!(job = %name, "Replacing scheduled job");
            previous.cancel();
        }

        info!(job = %name, expression = %expression, "Job scheduled");
        Ok(JobHandle(name.to_string()))
    }

    /// Stop one job; false if it was not scheduled
    pub fn stop(&self, handle: &JobHandle) -> bool {
        match self.jobs.lock().remove(handle.name()) {
            Some(job) => {
                job.cancel();
                info!(job = %handle.name(), "Job stopped");
                true
            }
            None => false,
        }
    }

    /// Stop every job whose name starts with `prefix`
    pub fn stop_matching(&self, prefix: &str) -> usize {
        let mut jobs = self.jobs.lock();
        let names: Vec<String> = jobs
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();

        for name in &names {
            if let Some(job) = jobs.remove(name) {
                job.cancel();
            }
        }
        info!(prefix = %prefix, stopped = names.len(), "Jobs stopped");
        names.len()
    }

    pub fn list_active(&self) -> Vec<ScheduledJobInfo> {
        let mut active: Vec<ScheduledJobInfo> = self
            .jobs
            .lock()
            .iter()
            .map(|(name, job)| ScheduledJobInfo {
                name: name.clone(),
                expression: job.expression.clone(),
                next_run: job.schedule.upcoming(Utc).next(),
                runs: job.runs.load(Ordering::Relaxed),
            })
            .collect();
        active.sort_by(|a, b| a.name.cmp(&b.name));
        active
    }

    /// Run a job's handler immediately, outside its schedule
    pub async fn run_now(&self, name: &str) -> Result<()> {
        let (handler, runs) = {
            let jobs = self.jobs.lock();
            let job = jobs
                .get(name)
                .ok_or_else(|| ArchiveError::UnknownJob(name.to_string()))?;
            (job.handler.clone(), job.runs.clone())
        };

        info!(job = %name, "Running job on demand");
        runs.fetch_add(1, Ordering::Relaxed);
        handler().await;
        Ok(())
    }

    /// Stop all jobs and wait up to `grace` for running handlers to return.
    ///
    /// Handlers still running after `grace` are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        let tasks: Vec<JoinHandle<()>> = self
            .jobs
            .lock()
            .drain()
            .map(|(_, job)| {
                job.cancel();
                job.task
            })
            .collect();

        let aborts: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();
        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(grace_ms = grace.as_millis() as u64, "Jobs still running after grace period, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
        info!("Scheduler stopped");
    }
}

async fn run_job(
    name: String,
    schedule: Schedule,
    handler: JobHandler,
    runs: Arc<AtomicU64>,
    token: CancellationToken,
) {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!(job = %name, "Schedule has no upcoming runs");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        debug!(job = %name, "Running scheduled job");
        runs.fetch_add(1, Ordering::Relaxed);
        handler().await;
    }
}
