//! Log Archive Service
//!
//! Archives high-volume request logs into time-partitioned object storage,
//! answers access-controlled searches over the archive, and ages out both
//! database rows and archived files.
//!
//! ## Features
//!
//! - **Deterministic layout**: every object key is generated from the log's
//!   date, hour and status, and those fields are recovered from the key alone
//! - **Search**: date, service, extension, size and file name filters, with
//!   optional content search, sorting and pagination
//! - **Access control**: per-caller day limits, service allowlists and hourly
//!   rate limits enforced before anything is listed
//! - **Retention**: batched, retried cleanup of expired rows and objects that
//!   never touches keys it cannot date
//!
//! ## Architecture
//!
//! ```text
//! PostgreSQL                 Archive Job               Object Store
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ request_logs │──────────▶│ group by     │─────────▶│ {date}/      │
//! │ archive_jobs │           │ service and  │          │  hour-HH-HH/ │
//! └──────────────┘           │ status       │          │   {status}/  │
//!        ▲                   └──────────────┘          └──────────────┘
//!        │                                                    │
//!        │                   ┌──────────────┐                 │
//!        └───────────────────│ Retention    │◀────────────────┤
//!                            │ Sweeper      │                 │
//!                            └──────────────┘                 ▼
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Search API   │──────────▶│ Access Gate  │─────────▶│ Archive      │
//! └──────────────┘           └──────────────┘          │ Index        │
//!        ▲                                             └──────────────┘
//!        │                   ┌──────────────┐                 │
//!        └───────────────────│ Filter       │◀────────────────┘
//!                            │ Pipeline     │
//!                            └──────────────┘
//! ```

pub mod access_gate;
pub mod api;
pub mod archive_index;
pub mod archive_job;
pub mod config;
pub mod error;
pub mod filter_pipeline;
pub mod log_store;
pub mod object_store;
pub mod path_scheme;
pub mod retention;
pub mod s3_store;
pub mod scheduler;
pub mod search;

pub use access_gate::{AccessGate, AccessLevel, AccessProfile, Caller};
pub use archive_index::{ArchiveIndex, FileDescriptor};
pub use archive_job::{ArchiveJob, PassthroughMasker, PayloadMasker};
pub use config::Config;
pub use error::{ArchiveError, DenyReason, Result};
pub use filter_pipeline::{FilterPipeline, Pagination, SearchCriteria};
pub use log_store::{LogRecord, LogStore, PgLogStore};
pub use object_store::{MemoryObjectStore, ObjectStore};
pub use path_scheme::{ArchiveDate, HourRange, ParsedPath, PathScheme};
pub use retention::{RetentionSweeper, SweepOutcome, SweepReport};
pub use s3_store::S3ObjectStore;
pub use scheduler::CronScheduler;
pub use search::{SearchResponse, SearchService};
