//! Caller profiles, criteria clamping and per-caller rate limiting.

use crate::config::AccessConfig;
use crate::error::{ArchiveError, DenyReason, Result};
use crate::filter_pipeline::SearchCriteria;
use crate::path_scheme::ArchiveDate;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{debug, warn};

/// Ordered permission level: `read < write < admin`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Read,
    Write,
    Admin,
}

/// Permissions attached to a caller, read-only at query time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessProfile {
    pub access_level: AccessLevel,
    /// Oldest accessible file, in days before today
    pub day_limit: u32,
    /// Services the caller may query; empty allows all
    #[serde(default)]
    pub allowed_services: BTreeSet<String>,
    /// Requests per rolling hour, 0 for unlimited
    pub rate_limit_per_hour: u32,
}

impl AccessProfile {
    /// First day the caller may see
    pub fn window_start(&self, today: NaiveDate) -> NaiveDate {
        today
            .checked_sub_signed(ChronoDuration::days(i64::from(self.day_limit)))
            .unwrap_or(NaiveDate::MIN)
    }

    fn allows_service(&self, service: &str) -> bool {
        self.allowed_services.is_empty()
            || self
                .allowed_services
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(service))
    }
}

/// Caller identity resolved from an API key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub name: String,
    pub profile: AccessProfile,
}

/// Criteria that passed every policy check
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizedCriteria {
    pub criteria: SearchCriteria,
    /// Services results are restricted to, `None` when unrestricted
    pub service_allowlist: Option<BTreeSet<String>>,
}

const RATE_WINDOW_SECS: i64 = 3600;

/// Enforces caller profiles before any listing happens
pub struct AccessGate {
    max_limit: usize,
    callers: HashMap<String, Caller>,
    /// Accepted request times per caller within the last hour
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl AccessGate {
    pub fn new(config: &AccessConfig) -> Self {
        let callers = config
            .callers
            .iter()
            .map(|c| {
                (
                    c.api_key.clone(),
                    Caller {
                        name: c.name.clone(),
                        profile: c.profile.clone(),
                    },
                )
            })
            .collect();

        Self {
            max_limit: config.max_limit.max(1),
            callers,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Look up the caller presenting `api_key`
    pub fn resolve(&self, api_key: Option<&str>) -> Result<Caller> {
        api_key
            .and_then(|key| self.callers.get(key))
            .cloned()
            .ok_or(ArchiveError::denied(DenyReason::UnknownCaller))
    }

    /// Check an operation that needs at least `level`
    pub fn require(profile: &AccessProfile, level: AccessLevel) -> Result<()> {
        if profile.access_level >= level {
            Ok(())
        } else {
            Err(ArchiveError::denied(DenyReason::InsufficientAccessLevel))
        }
    }

    /// Check direct access to one archived object.
    ///
    /// Objects without a derivable date are outside every window.
    pub fn authorize_object(
        profile: &AccessProfile,
        date: Option<ArchiveDate>,
        service: Option<&str>,
        today: NaiveDate,
    ) -> Result<()> {
        let window_start = profile.window_start(today);
        match date {
            Some(date) if date.overlaps(Some(window_start), None) => {}
            _ => return Err(ArchiveError::denied(DenyReason::RetentionWindowExceeded)),
        }

        if !profile.allowed_services.is_empty() && !service.is_some_and(|s| profile.allows_service(s)) {
            return Err(ArchiveError::denied(DenyReason::ServiceNotAllowed));
        }
        Ok(())
    }

    /// Check a download of one object and charge it to the caller's hourly
    /// quota, which searches share. A denied download is not charged.
    pub fn authorize_download(
        &self,
        caller: &str,
        profile: &AccessProfile,
        date: Option<ArchiveDate>,
        service: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        Self::authorize_object(profile, date, service, now.date_naive())?;
        self.charge(caller, profile.rate_limit_per_hour, now)
    }

    /// Validate and clamp `criteria` for `caller`.
    ///
    /// Policy checks run before the rate limit is charged, so a rejected
    /// request never consumes quota.
    pub fn authorize(
        &self,
        caller: &str,
        profile: &AccessProfile,
        mut criteria: SearchCriteria,
        now: DateTime<Utc>,
    ) -> Result<AuthorizedCriteria> {
        let window_start = profile.window_start(now.date_naive());

        match criteria.date_range.from {
            Some(from) if from < window_start => {
                debug!(caller = %caller, %from, %window_start, "Date range outside access window");
                return Err(ArchiveError::denied(DenyReason::RetentionWindowExceeded));
            }
            Some(_) => {}
            None => criteria.date_range.from = Some(window_start),
        }

        if let Some(service) = criteria
            .service_filter
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            if !profile.allows_service(service) {
                debug!(caller = %caller, service = %service, "Service outside allowlist");
                return Err(ArchiveError::denied(DenyReason::ServiceNotAllowed));
            }
        }

        if criteria.limit == 0 {
            return Err(ArchiveError::InvalidCriteria(
                "limit must be greater than zero".to_string(),
            ));
        }
        if let (Some(from), Some(to)) = (criteria.date_range.from, criteria.date_range.to) {
            if from > to {
                return Err(ArchiveError::InvalidCriteria(format!(
                    "dateRange.from {} is after dateRange.to {}",
                    from, to
                )));
            }
        }

        criteria.limit = criteria.limit.min(self.max_limit);

        self.charge(caller, profile.rate_limit_per_hour, now)?;

        Ok(AuthorizedCriteria {
            criteria,
            service_allowlist: (!profile.allowed_services.is_empty())
                .then(|| profile.allowed_services.clone()),
        })
    }

    /// Record one request against the caller's rolling window
    fn charge(&self, caller: &str, limit: u32, now: DateTime<Utc>) -> Result<()> {
        if limit == 0 {
            return Ok(());
        }

        let horizon = now - ChronoDuration::seconds(RATE_WINDOW_SECS);
        let mut windows = self.windows.lock();
        let window = windows.entry(caller.to_string()).or_default();
        while window.front().is_some_and(|t| *t <= horizon) {
            window.pop_front();
        }

        if window.len() >= limit as usize {
            warn!(caller = %caller, limit, "Rate limit exceeded");
            metrics::counter!("archive.access.rate_limited").increment(1);
            return Err(ArchiveError::denied(DenyReason::RateLimited));
        }

        window.push_back(now);
        Ok(())
    }

    /// Requests left in the caller's current window
    pub fn remaining_quota(&self, caller: &str, profile: &AccessProfile, now: DateTime<Utc>) -> Option<u32> {
        if profile.rate_limit_per_hour == 0 {
            return None;
        }
        let horizon = now - ChronoDuration::seconds(RATE_WINDOW_SECS);
        let used = self
            .windows
            .lock()
            .get(caller)
            .map_or(0, |w| w.iter().filter(|t| **t > horizon).count());
        Some(profile.rate_limit_per_hour.saturating_sub(used as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CallerConfig;
    use crate::filter_pipeline::{DateRange, SizeRange, SortBy};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap()
    }

    fn profile(day_limit: u32, rate: u32, services: &[&str]) -> AccessProfile {
        AccessProfile {
            access_level: AccessLevel::Read,
            day_limit,
            allowed_services: services.iter().map(|s| s.to_string()).collect(),
            rate_limit_per_hour: rate,
        }
    }

    fn gate() -> AccessGate {
        AccessGate::new(&AccessConfig {
            max_limit: 100,
            callers: vec![CallerConfig {
                name: "dashboard".to_string(),
                api_key: "key-1".to_string(),
                profile: profile(180, 10, &[]),
            }],
        })
    }

    fn from(date: NaiveDate) -> SearchCriteria {
        SearchCriteria {
            date_range: DateRange {
                from: Some(date),
                to: None,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_old_from_always_exceeds_window() {
        let gate = gate();
        let profile = profile(30, 0, &["api"]);
        let too_old = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();

        let variants = [
            from(too_old),
            SearchCriteria {
                limit: 0,
                ..from(too_old)
            },
            SearchCriteria {
                service_filter: Some("billing".to_string()),
                ..from(too_old)
            },
            SearchCriteria {
                date_range: DateRange {
                    from: Some(too_old),
                    to: Some(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()),
                },
                size_range: SizeRange {
                    min: Some(1),
                    max: None,
                },
                sort_by: SortBy::Name,
                ..Default::default()
            },
        ];

        for criteria in variants {
            let err = gate.authorize("c", &profile, criteria, now()).unwrap_err();
            assert!(matches!(
                err,
                ArchiveError::AccessDenied {
                    reason: DenyReason::RetentionWindowExceeded
                }
            ));
        }
    }

    #[test]
    fn test_missing_from_is_filled_with_window_start() {
        let authorized = gate()
            .authorize("c", &profile(30, 0, &[]), SearchCriteria::default(), now())
            .unwrap();
        assert_eq!(
            authorized.criteria.date_range.from,
            NaiveDate::from_ymd_opt(2024, 5, 31)
        );
        assert_eq!(authorized.service_allowlist, None);
    }

    #[test]
    fn test_window_boundary_is_accessible() {
        let boundary = NaiveDate::from_ymd_opt(2024, 5, 31).unwrap();
        assert!(gate()
            .authorize("c", &profile(30, 0, &[]), from(boundary), now())
            .is_ok());
    }

    #[test]
    fn test_service_allowlist() {
        let gate = gate();
        let profile = profile(180, 0, &["api", "Billing"]);

        let denied = gate.authorize(
            "c",
            &profile,
            SearchCriteria {
                service_filter: Some("auth".to_string()),
                ..Default::default()
            },
            now(),
        );
        assert!(matches!(
            denied,
            Err(ArchiveError::AccessDenied {
                reason: DenyReason::ServiceNotAllowed
            })
        ));

        let allowed = gate
            .authorize(
                "c",
                &profile,
                SearchCriteria {
                    service_filter: Some("billing".to_string()),
                    ..Default::default()
                },
                now(),
            )
            .unwrap();
        assert_eq!(allowed.service_allowlist.map(|s| s.len()), Some(2));
    }

    #[test]
    fn test_limit_clamped_and_validated() {
        let gate = gate();
        let profile = profile(180, 0, &[]);

        let clamped = gate
            .authorize(
                "c",
                &profile,
                SearchCriteria {
                    limit: 5000,
                    ..Default::default()
                },
                now(),
            )
            .unwrap();
        assert_eq!(clamped.criteria.limit, 100);

        let reversed = SearchCriteria {
            date_range: DateRange {
                from: NaiveDate::from_ymd_opt(2024, 6, 20),
                to: NaiveDate::from_ymd_opt(2024, 6, 10),
            },
            ..Default::default()
        };
        assert!(matches!(
            gate.authorize("c", &profile, reversed, now()),
            Err(ArchiveError::InvalidCriteria(_))
        ));
    }

    #[test]
    fn test_rate_limit_rolling_window() {
        let gate = gate();
        let profile = profile(180, 3, &[]);

        for _ in 0..3 {
            assert!(gate.authorize("c", &profile, SearchCriteria::default(), now()).is_ok());
        }
        let limited = gate.authorize("c", &profile, SearchCriteria::default(), now());
        assert!(matches!(
            limited,
            Err(ArchiveError::AccessDenied {
                reason: DenyReason::RateLimited
            })
        ));
        assert_eq!(gate.remaining_quota("c", &profile, now()), Some(0));

        // Other callers keep their own window
        assert!(gate.authorize("other", &profile, SearchCriteria::default(), now()).is_ok());

        let later = now() + ChronoDuration::minutes(61);
        assert!(gate.authorize("c", &profile, SearchCriteria::default(), later).is_ok());
    }

    #[test]
    fn test_denied_requests_do_not_consume_quota() {
        let gate = gate();
        let profile = profile(30, 2, &["api"]);
        let too_old = from(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());

        for _ in 0..5 {
            assert!(gate.authorize("c", &profile, too_old.clone(), now()).is_err());
        }
        assert_eq!(gate.remaining_quota("c", &profile, now()), Some(2));

        for _ in 0..5 {
            let _ = gate.authorize("c", &profile, SearchCriteria::default(), now());
        }
        assert_eq!(gate.remaining_quota("c", &profile, now()), Some(0));
    }

    #[test]
    fn test_require_levels() {
        let mut profile = profile(180, 0, &[]);
        assert!(AccessGate::require(&profile, AccessLevel::Read).is_ok());
        assert!(AccessGate::require(&profile, AccessLevel::Write).is_err());

        profile.access_level = AccessLevel::Admin;
        assert!(AccessGate::require(&profile, AccessLevel::Write).is_ok());
        assert!(AccessGate::require(&profile, AccessLevel::Admin).is_ok());
    }

    #[test]
    fn test_authorize_object() {
        let today = now().date_naive();
        let profile = profile(30, 0, &["api"]);
        let recent = ArchiveDate::from(NaiveDate::from_ymd_opt(2024, 6, 15).unwrap());
        let old = ArchiveDate::from(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        // The May bucket still covers days inside the window
        let partial = ArchiveDate::new(2024, Some(5), None).unwrap();

        assert!(AccessGate::authorize_object(&profile, Some(recent), Some("API"), today).is_ok());
        assert!(AccessGate::authorize_object(&profile, Some(partial), Some("api"), today).is_ok());
        assert!(matches!(
            AccessGate::authorize_object(&profile, Some(old), Some("api"), today),
            Err(ArchiveError::AccessDenied {
                reason: DenyReason::RetentionWindowExceeded
            })
        ));
        assert!(AccessGate::authorize_object(&profile, None, Some("api"), today).is_err());
        assert!(matches!(
            AccessGate::authorize_object(&profile, Some(recent), None, today),
            Err(ArchiveError::AccessDenied {
                reason: DenyReason::ServiceNotAllowed
            })
        ));
    }

    #[test]
    fn test_downloads_are_charged_to_the_rate_limit() {
        let gate = gate();
        let profile = profile(30, 2, &[]);
        let recent = Some(ArchiveDate::from(NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()));
        let old = Some(ArchiveDate::from(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()));

        // Denied downloads leave the quota untouched
        assert!(gate.authorize_download("dashboard", &profile, old, Some("api"), now()).is_err());
        assert_eq!(gate.remaining_quota("dashboard", &profile, now()), Some(2));

        assert!(gate.authorize_download("dashboard", &profile, recent, Some("api"), now()).is_ok());
        assert!(gate
            .authorize("dashboard", &profile, SearchCriteria::default(), now())
            .is_ok());
        assert!(matches!(
            gate.authorize_download("dashboard", &profile, recent, Some("api"), now()),
            Err(ArchiveError::AccessDenied {
                reason: DenyReason::RateLimited
            })
        ));
    }

    #[test]
    fn test_resolve_caller() {
        let gate = gate();
        assert_eq!(gate.resolve(Some("key-1")).unwrap().name, "dashboard");
        assert!(matches!(
            gate.resolve(Some("nope")),
            Err(ArchiveError::AccessDenied {
                reason: DenyReason::UnknownCaller
            })
        ));
        assert!(gate.resolve(None).is_err());
    }
}
