//! Ordered filter, sort and paginate stages over archive listings.

use crate::archive_index::FileDescriptor;
use crate::error::{ArchiveError, Result};
use crate::object_store::ObjectStore;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

fn default_limit() -> usize {
    50
}

/// Inclusive calendar range
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateRange {
    pub fn is_empty(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }
}

/// Inclusive size bounds in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeRange {
    pub min: Option<u64>,
    pub max: Option<u64>,
}

impl SizeRange {
    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    fn contains(&self, size: u64) -> bool {
        self.min.map_or(true, |min| size >= min) && self.max.map_or(true, |max| size <= max)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortBy {
    Name,
    Size,
    #[default]
    LastModified,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Caller-supplied search request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchCriteria {
    #[serde(default)]
    pub date_range: DateRange,
    pub service_filter: Option<String>,
    #[serde(default)]
    pub file_extensions: Vec<String>,
    #[serde(default)]
    pub size_range: SizeRange,
    pub file_name_pattern: Option<String>,
    pub search_term: Option<String>,
    #[serde(default)]
    pub sort_by: SortBy,
    #[serde(default)]
    pub sort_order: SortOrder,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl Default for SearchCriteria {
    fn default() -> Self {
        Self {
            date_range: DateRange::default(),
            service_filter: None,
            file_extensions: Vec::new(),
            size_range: SizeRange::default(),
            file_name_pattern: None,
            search_term: None,
            sort_by: SortBy::default(),
            sort_order: SortOrder::default(),
            limit: default_limit(),
            offset: 0,
        }
    }
}

impl SearchCriteria {
    /// Names of the filter stages this request activates
    pub fn applied_filters(&self) -> Vec<&'static str> {
        let mut applied = Vec::new();
        if !self.date_range.is_empty() {
            applied.push("dateRange");
        }
        if non_blank(&self.service_filter).is_some() {
            applied.push("serviceFilter");
        }
        if !self.file_extensions.is_empty() {
            applied.push("fileExtensions");
        }
        if !self.size_range.is_empty() {
            applied.push("sizeRange");
        }
        if non_blank(&self.file_name_pattern).is_some() {
            applied.push("fileNamePattern");
        }
        if non_blank(&self.search_term).is_some() {
            applied.push("searchTerm");
        }
        applied
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub current_page: usize,
    pub total_pages: usize,
    pub has_more: bool,
    pub limit: usize,
    pub offset: usize,
}

impl Pagination {
    pub fn new(total_count: usize, limit: usize, offset: usize) -> Self {
        Self {
            current_page: offset / limit + 1,
            total_pages: total_count.div_ceil(limit),
            has_more: offset.saturating_add(limit) < total_count,
            limit,
            offset,
        }
    }
}

/// One page of results plus the size of the full filtered set
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    pub files: Vec<FileDescriptor>,
    pub total_count: usize,
    pub pagination: Pagination,
}

enum NameMatcher {
    Pattern(Regex),
    /// Lowercased needle used when the pattern does not compile
    Substring(String),
}

impl NameMatcher {
    fn new(pattern: &str) -> Self {
        match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(regex) => NameMatcher::Pattern(regex),
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Invalid file name pattern, using substring match");
                NameMatcher::Substring(pattern.to_lowercase())
            }
        }
    }

    fn matches(&self, file_name: &str) -> bool {
        match self {
            NameMatcher::Pattern(regex) => regex.is_match(file_name),
            NameMatcher::Substring(needle) => file_name.to_lowercase().contains(needle.as_str()),
        }
    }
}

/// Metadata stages compiled once per request
struct MetadataFilter {
    date_range: Option<DateRange>,
    service: Option<String>,
    allowlist: Option<BTreeSet<String>>,
    extensions: BTreeSet<String>,
    size_range: SizeRange,
    name: Option<NameMatcher>,
}

impl MetadataFilter {
    fn new(criteria: &SearchCriteria, allowlist: Option<&BTreeSet<String>>) -> Self {
        Self {
            date_range: (!criteria.date_range.is_empty()).then_some(criteria.date_range),
            service: non_blank(&criteria.service_filter).map(str::to_lowercase),
            allowlist: allowlist
                .filter(|set| !set.is_empty())
                .map(|set| set.iter().map(|s| s.to_lowercase()).collect()),
            extensions: criteria
                .file_extensions
                .iter()
                .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
            size_range: criteria.size_range,
            name: non_blank(&criteria.file_name_pattern).map(NameMatcher::new),
        }
    }

    fn matches(&self, descriptor: &FileDescriptor) -> bool {
        if let Some(range) = &self.date_range {
            match &descriptor.date {
                Some(date) if date.overlaps(range.from, range.to) => {}
                _ => return false,
            }
        }

        let service = descriptor.service.as_deref().map(str::to_lowercase);
        if let Some(filter) = &self.service {
            match &service {
                Some(service) if service.contains(filter.as_str()) => {}
                _ => return false,
            }
        }
        if let Some(allowlist) = &self.allowlist {
            match &service {
                Some(service) if allowlist.contains(service) => {}
                _ => return false,
            }
        }

        if !self.extensions.is_empty() {
            match &descriptor.extension {
                Some(ext) if self.extensions.contains(ext) => {}
                _ => return false,
            }
        }

        if !self.size_range.contains(descriptor.size_bytes) {
            return false;
        }

        match &self.name {
            Some(matcher) => matcher.matches(&descriptor.file_name),
            None => true,
        }
    }
}

/// Sort in place; `desc` inverts the comparator
pub fn sort_descriptors(descriptors: &mut [FileDescriptor], sort_by: SortBy, order: SortOrder) {
    let compare = |a: &FileDescriptor, b: &FileDescriptor| -> Ordering {
        match sort_by {
            SortBy::Name => a.file_name.cmp(&b.file_name),
            SortBy::Size => a.size_bytes.cmp(&b.size_bytes),
            SortBy::LastModified => a.last_modified.cmp(&b.last_modified),
        }
    };

    match order {
        SortOrder::Asc => descriptors.sort_unstable_by(compare),
        SortOrder::Desc => descriptors.sort_unstable_by(|a, b| compare(a, b).reverse()),
    }
}

/// Slice the sorted result set into the requested page
pub fn paginate(descriptors: Vec<FileDescriptor>, limit: usize, offset: usize) -> SearchPage {
    let total_count = descriptors.len();
    let files = descriptors.into_iter().skip(offset).take(limit).collect();
    SearchPage {
        files,
        total_count,
        pagination: Pagination::new(total_count, limit, offset),
    }
}

/// Applies search criteria to a listing
pub struct FilterPipeline {
    store: Arc<dyn ObjectStore>,
    content_search_concurrency: usize,
}

impl FilterPipeline {
    pub fn new(store: Arc<dyn ObjectStore>, content_search_concurrency: usize) -> Self {
        Self {
            store,
            content_search_concurrency: content_search_concurrency.max(1),
        }
    }

    /// Run every stage over `descriptors`.
    ///
    /// `allowlist` restricts results to services the caller may see. Criteria
    /// must already be validated; a zero limit is rejected here as well.
    #[instrument(skip(self, descriptors, criteria, allowlist), fields(candidates = descriptors.len()))]
    pub async fn apply(
        &self,
        descriptors: Vec<FileDescriptor>,
        criteria: &SearchCriteria,
        allowlist: Option<&BTreeSet<String>>,
    ) -> Result<SearchPage> {
        if criteria.limit == 0 {
            return Err(ArchiveError::InvalidCriteria(
                "limit must be greater than zero".to_string(),
            ));
        }

        let filter = MetadataFilter::new(criteria, allowlist);
        let mut matched: Vec<FileDescriptor> = descriptors
            .into_iter()
            .filter(|d| filter.matches(d))
            .collect();

        if let Some(term) = non_blank(&criteria.search_term) {
            matched = self.content_search(matched, term).await?;
        }

        debug!(matched = matched.len(), "Filters applied");

        sort_descriptors(&mut matched, criteria.sort_by, criteria.sort_order);
        Ok(paginate(matched, criteria.limit, criteria.offset))
    }

    /// Keep descriptors whose body contains `term`.
    ///
    /// Objects deleted since listing are dropped; any other download failure
    /// aborts the query.
    async fn content_search(
        &self,
        candidates: Vec<FileDescriptor>,
        term: &str,
    ) -> Result<Vec<FileDescriptor>> {
        let downloads = candidates.len();
        let results: Vec<Result<Option<FileDescriptor>>> = stream::iter(candidates)
            .map(|descriptor| {
                let store = self.store.clone();
                async move {
                    match store.get_object(&descriptor.key).await {
                        Ok(body) => Ok(String::from_utf8_lossy(&body)
                            .contains(term)
                            .then_some(descriptor)),
                        Err(ArchiveError::ObjectNotFound(key)) => {
                            debug!(key = %key, "Object vanished before content search");
                            Ok(None)
                        }
                        Err(e) => Err(e),
                    }
                }
            })
            .buffer_unordered(self.content_search_concurrency)
            .collect()
            .await;

        metrics::counter!("archive.search.content_downloads").increment(downloads as u64);

        let mut kept = Vec::new();
        for result in results {
            if let Some(descriptor) = result? {
                kept.push(descriptor);
            }
        }
        Ok(kept)
    }
}
