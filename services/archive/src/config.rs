use crate::access_gate::AccessProfile;
use crate::error::{ArchiveError, Result};
use crate::path_scheme::{validate_component, DatePattern};
use crate::scheduler::parse_schedule;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the archive service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Object storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Archive layout
    #[serde(default)]
    pub archive: ArchiveConfig,
    /// Scheduled job configuration
    #[serde(default)]
    pub jobs: JobsConfig,
    /// Retention configuration
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Access control configuration
    #[serde(default)]
    pub access: AccessConfig,
    /// Query execution configuration
    #[serde(default)]
    pub query: QueryConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Which object store implementation backs the archive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    S3,
    /// Process-local store, contents are lost on restart
    Memory,
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// S3 bucket name for archived log files
    #[serde(default)]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
    /// Keys requested per listing page
    #[serde(default = "default_list_page_size")]
    pub list_page_size: i32,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Top-level folder layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StructureType {
    #[default]
    Daily,
    Monthly,
    Yearly,
    /// Layout comes from `ArchiveConfig::pattern`
    Custom,
}

/// Sub-folders nested under the date segment
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubFolderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub by_hour: bool,
    #[serde(default)]
    pub by_status: bool,
    /// Literal segments appended in order
    #[serde(default)]
    pub custom: Vec<String>,
}

/// Date segment and file naming
#[derive(Debug, Clone, Deserialize)]
pub struct NamingConfig {
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    /// Token format for daily layouts, e.g. `YYYY-MM-DD`
    #[serde(default = "default_date_format")]
    pub date_format: String,
    /// Append the hour range to archived file names
    #[serde(default)]
    pub include_time: bool,
}

/// How archived objects are laid out in the store.
///
/// Loaded once at startup; changing it only affects objects written afterwards.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub structure_type: StructureType,
    /// Overrides `structure_type` when set
    pub pattern: Option<String>,
    #[serde(default)]
    pub sub_folders: SubFolderConfig,
    #[serde(default)]
    pub naming: NamingConfig,
}

/// Scheduled archival job configuration
#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    /// Register the hourly archival job
    #[serde(default = "default_true")]
    pub archive_enabled: bool,
    /// Cron expression for the archival job (archives the previous hour)
    #[serde(default = "default_archive_cron")]
    pub archive_cron: String,
    /// Seconds to wait for running jobs on shutdown before aborting them
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

/// Retention configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Register the periodic cleanup sweep
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Days to keep database rows, 0 keeps them forever
    #[serde(default = "default_db_retention_days")]
    pub db_retention_days: u32,
    /// Days to keep archived files, 0 keeps them forever
    #[serde(default = "default_file_retention_days")]
    pub file_retention_days: u32,
    /// Hours between sweeps: a divisor of 24, 24 or 168
    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u32,
    /// Explicit cron expression, overrides `cleanup_interval_hours`
    pub cron: Option<String>,
    /// Rows or objects per deletion batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Retries per batch before it is skipped until the next sweep
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Report candidates without deleting
    #[serde(default)]
    pub dry_run: bool,
}

/// A caller known to the service
#[derive(Debug, Clone, Deserialize)]
pub struct CallerConfig {
    /// Caller identity used for rate limiting and logs
    pub name: String,
    /// Value presented in the `x-api-key` header
    pub api_key: String,
    pub profile: AccessProfile,
}

/// Access control configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    /// Server-side ceiling for `limit`
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    #[serde(default)]
    pub callers: Vec<CallerConfig>,
}

/// Query execution configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Concurrent downloads during content search
    #[serde(default = "default_content_search_concurrency")]
    pub content_search_concurrency: usize,
    /// Deadline applied when the caller passes none, 0 disables it
    #[serde(default = "default_query_deadline_secs")]
    pub default_deadline_secs: u64,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "archive-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_list_page_size() -> i32 {
    1000
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_date_format() -> String {
    "YYYY-MM-DD".to_string()
}

fn default_archive_cron() -> String {
    // Five minutes past every hour, leaving late writes time to land
    "0 5 * * * *".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_db_retention_days() -> u32 {
    30
}

fn default_file_retention_days() -> u32 {
    180
}

fn default_cleanup_interval_hours() -> u32 {
    24
}

fn default_batch_size() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_max_limit() -> usize {
    100
}

fn default_content_search_concurrency() -> usize {
    8
}

fn default_query_deadline_secs() -> u64 {
    30
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "archive-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/archive").required(false))
            .add_source(config::File::with_name("/etc/logarchive/archive").required(false))
            // Override with environment variables
            // ARCHIVE__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("ARCHIVE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints the type system cannot express
    pub fn validate(&self) -> Result<()> {
        self.archive.validate()?;
        parse_schedule(&self.retention.schedule_expression()?)?;
        parse_schedule(&self.jobs.archive_cron)?;

        if self.storage.backend == StorageBackend::S3 && self.storage.bucket.is_empty() {
            return Err(ArchiveError::Config(
                "storage.bucket is required for the s3 backend".to_string(),
            ));
        }
        if self.access.max_limit == 0 {
            return Err(ArchiveError::Config(
                "access.max_limit must be greater than zero".to_string(),
            ));
        }
        if self.query.content_search_concurrency == 0 {
            return Err(ArchiveError::Config(
                "query.content_search_concurrency must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// How long shutdown waits for running scheduled jobs
    pub fn job_shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.jobs.shutdown_grace_secs)
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.storage.presigned_url_expiry_secs)
    }

    /// Deadline applied to queries that do not carry their own
    pub fn default_query_deadline(&self) -> Option<Duration> {
        match self.query.default_deadline_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl DatabaseConfig {
    /// Pool acquire timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Pool idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl ArchiveConfig {
    /// Reject layouts whose keys could not be parsed back
    pub fn validate(&self) -> Result<()> {
        DatePattern::for_config(self)?;

        if let Some(ref prefix) = self.naming.prefix {
            validate_component(prefix)?;
        }
        if let Some(ref suffix) = self.naming.suffix {
            validate_component(suffix)?;
        }
        for segment in &self.sub_folders.custom {
            validate_component(segment)?;
        }

        if !self.naming.include_time && !(self.sub_folders.enabled && self.sub_folders.by_hour) {
            tracing::warn!(
                "archive layout encodes no hour; hourly batches for the same service overwrite each other"
            );
        }
        Ok(())
    }
}

impl RetentionConfig {
    /// Cron expression the sweep is registered with.
    ///
    /// Cron steps restart at every day and month boundary, so only intervals
    /// that divide a day, plus daily and weekly, give evenly spaced sweeps.
    pub fn schedule_expression(&self) -> Result<String> {
        if let Some(ref cron) = self.cron {
            return Ok(cron.clone());
        }
        match self.cleanup_interval_hours {
            0 => Err(ArchiveError::Config(
                "retention.cleanup_interval_hours must be greater than zero".to_string(),
            )),
            h if h < 24 && 24 % h == 0 => Ok(format!("0 0 */{} * * *", h)),
            24 => Ok("0 0 0 * * *".to_string()),
            168 => Ok("0 0 0 * * Mon".to_string()),
            h => Err(ArchiveError::Config(format!(
                "retention.cleanup_interval_hours={} cannot be expressed as a schedule; set retention.cron",
                h
            ))),
        }
    }

    /// Delay before the first retry of a failed batch
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Ceiling for the retry backoff
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            bucket: String::new(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            presigned_url_expiry_secs: default_presigned_url_expiry_secs(),
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
            list_page_size: default_list_page_size(),
        }
    }
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            prefix: None,
            suffix: None,
            date_format: default_date_format(),
            include_time: false,
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            archive_enabled: true,
            archive_cron: default_archive_cron(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_retention_days: default_db_retention_days(),
            file_retention_days: default_file_retention_days(),
            cleanup_interval_hours: default_cleanup_interval_hours(),
            cron: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            dry_run: false,
        }
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            max_limit: default_max_limit(),
            callers: Vec::new(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            content_search_concurrency: default_content_search_concurrency(),
            default_deadline_secs: default_query_deadline_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_max_limit(), 100);
        assert_eq!(default_date_format(), "YYYY-MM-DD");
        assert_eq!(default_presigned_url_expiry_secs(), 3600);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse(
            r#"
            [database]
            url = "postgres://localhost/logs"

            [storage]
            backend = "memory"
            "#,
        );

        assert_eq!(config.archive.structure_type, StructureType::Daily);
        assert_eq!(config.retention.batch_size, 1000);
        assert_eq!(config.access.max_limit, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_archive_layout_and_callers() {
        let config = parse(
            r#"
            [database]
            url = "postgres://localhost/logs"

            [storage]
            bucket = "log-archive"

            [archive]
            structure_type = "monthly"

            [archive.sub_folders]
            enabled = true
            by_hour = true
            by_status = true

            [archive.naming]
            prefix = "logs"

            [[access.callers]]
            name = "dashboard"
            api_key = "Key-ABC"

            [access.callers.profile]
            access_level = "read"
            day_limit = 180
            allowed_services = ["api"]
            rate_limit_per_hour = 500
            "#,
        );

        assert_eq!(config.archive.structure_type, StructureType::Monthly);
        assert_eq!(config.archive.naming.prefix.as_deref(), Some("logs"));
        assert_eq!(config.access.callers[0].api_key, "Key-ABC");
        assert_eq!(config.access.callers[0].profile.day_limit, 180);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_s3_backend_requires_bucket() {
        let config = parse(
            r#"
            [database]
            url = "postgres://localhost/logs"
            "#,
        );
        assert!(matches!(config.validate(), Err(ArchiveError::Config(_))));
    }

    #[test]
    fn test_database_pool_timeouts() {
        let config = parse(
            r#"
            [database]
            url = "postgres://localhost/logs"
            connect_timeout_secs = 5

            [storage]
            backend = "memory"
            "#,
        );
        assert_eq!(config.database.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.database.idle_timeout(), Duration::from_secs(600));
        assert_eq!(config.job_shutdown_grace(), Duration::from_secs(30));
    }

    #[test]
    fn test_retention_schedule_expression() {
        let mut retention = RetentionConfig::default();
        assert_eq!(retention.schedule_expression().unwrap(), "0 0 0 * * *");

        retention.cleanup_interval_hours = 6;
        assert_eq!(retention.schedule_expression().unwrap(), "0 0 */6 * * *");

        retention.cleanup_interval_hours = 168;
        assert_eq!(retention.schedule_expression().unwrap(), "0 0 0 * * Mon");
        assert!(parse_schedule(&retention.schedule_expression().unwrap()).is_ok());

        // Uneven gaps at the day or month boundary
        for hours in [5, 7, 25, 48, 72] {
            retention.cleanup_interval_hours = hours;
            assert!(
                matches!(retention.schedule_expression(), Err(ArchiveError::Config(_))),
                "interval {} accepted",
                hours
            );
        }

        retention.cron = Some("0 30 3 * * *".to_string());
        assert_eq!(retention.schedule_expression().unwrap(), "0 30 3 * * *");
    }

    #[test]
    fn test_invalid_archive_cron_is_rejected() {
        let config = parse(
            r#"
            [database]
            url = "postgres://localhost/logs"

            [storage]
            backend = "memory"

            [jobs]
            archive_cron = "hourly please"
            "#,
        );
        assert!(matches!(config.validate(), Err(ArchiveError::Config(_))));
    }

    #[test]
    fn test_custom_structure_without_pattern_is_rejected() {
        let archive = ArchiveConfig {
            structure_type: StructureType::Custom,
            ..Default::default()
        };
        assert!(archive.validate().is_err());
    }
}
