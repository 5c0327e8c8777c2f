//! Typed view over the object store listing.

use crate::error::{ArchiveError, Result};
use crate::object_store::{ObjectEntry, ObjectStore};
use crate::path_scheme::{ArchiveDate, HourRange, PathScheme};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

/// Read-only description of one archived object, rebuilt on every query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub key: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
    pub service: Option<String>,
    pub extension: Option<String>,
    /// Key without the file name
    pub folder: String,
    pub date: Option<ArchiveDate>,
    pub hour_range: Option<HourRange>,
    pub status: Option<String>,
}

impl FileDescriptor {
    /// Derive descriptor fields from a listing entry.
    ///
    /// Keys the scheme cannot parse keep their filename-derived fields and
    /// carry no date, hour or status.
    pub fn from_entry(entry: ObjectEntry, scheme: &PathScheme) -> Self {
        let (folder, file_name) = match entry.key.rsplit_once('/') {
            Some((folder, file_name)) => (folder.to_string(), file_name.to_string()),
            None => (String::new(), entry.key.clone()),
        };

        let parsed = match scheme.parse_path(&entry.key) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                trace!(key = %entry.key, error = %e, "Key does not match archive layout");
                None
            }
        };

        Self {
            service: derive_service(&file_name),
            extension: derive_extension(&file_name),
            date: parsed.as_ref().and_then(|p| p.date()),
            hour_range: parsed.as_ref().and_then(|p| p.hour_range),
            status: parsed.and_then(|p| p.status),
            key: entry.key,
            file_name,
            size_bytes: entry.size_bytes,
            last_modified: entry.last_modified,
            folder,
        }
    }
}

/// Service name encoded in a file name: `api-logs.json` -> `api`,
/// `user-service-logs_14-15.json` -> `user-service`.
///
/// The last `-logs`/`_logs` marker wins, so a service whose own name
/// contains the marker keeps it.
pub fn derive_service(file_name: &str) -> Option<String> {
    let stem = file_name.split('.').next().unwrap_or_default();
    let marker = [stem.rfind("-logs"), stem.rfind("_logs")]
        .into_iter()
        .flatten()
        .max();
    let service = match marker {
        Some(index) => &stem[..index],
        None => stem.split(['-', '_']).next().unwrap_or_default(),
    };
    (!service.is_empty()).then(|| service.to_string())
}

/// Lowercased text after the last `.`
pub fn derive_extension(file_name: &str) -> Option<String> {
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}

enum Cursor {
    Start,
    Token(String),
    Done,
}

/// Enumerates archived objects as [`FileDescriptor`]s
#[derive(Clone)]
pub struct ArchiveIndex {
    store: Arc<dyn ObjectStore>,
    scheme: Arc<PathScheme>,
}

impl ArchiveIndex {
    pub fn new(store: Arc<dyn ObjectStore>, scheme: Arc<PathScheme>) -> Self {
        Self { store, scheme }
    }

    pub fn scheme(&self) -> &PathScheme {
        &self.scheme
    }

    /// Stream every object under `scope_hint`.
    ///
    /// Pages are requested lazily; a listing failure ends the stream with
    /// `StorageUnavailable`.
    pub fn list(&self, scope_hint: Option<String>) -> BoxStream<'static, Result<FileDescriptor>> {
        let store = self.store.clone();
        let scheme = self.scheme.clone();

        stream::try_unfold(Cursor::Start, move |cursor| {
            let store = store.clone();
            let scheme = scheme.clone();
            let prefix = scope_hint.clone();

            async move {
                let token = match cursor {
                    Cursor::Done => return Ok(None),
                    Cursor::Start => None,
                    Cursor::Token(token) => Some(token),
                };

                let page = store
                    .list_objects(prefix.as_deref(), token.as_deref())
                    .await
                    .map_err(|e| match e {
                        ArchiveError::StorageUnavailable(_) => e,
                        other => ArchiveError::StorageUnavailable(other.to_string()),
                    })?;

                let next = match page.next_token {
                    Some(next) if Some(&next) != token.as_ref() => Cursor::Token(next),
                    _ => Cursor::Done,
                };

                metrics::counter!("archive.index.objects_listed").increment(page.entries.len() as u64);

                let descriptors: Vec<Result<FileDescriptor>> = page
                    .entries
                    .into_iter()
                    // Zero-byte folder placeholders created by some S3 clients
                    .filter(|entry| !entry.key.ends_with('/'))
                    .map(|entry| Ok(FileDescriptor::from_entry(entry, &scheme)))
                    .collect();

                Ok::<_, ArchiveError>(Some((stream::iter(descriptors), next)))
            }
        })
        .try_flatten()
        .boxed()
    }

    /// Collect the full listing; fails as a whole if any page fails
    #[instrument(skip(self))]
    pub async fn snapshot(&self, scope_hint: Option<String>) -> Result<Vec<FileDescriptor>> {
        let descriptors: Vec<FileDescriptor> = self.list(scope_hint).try_collect().await?;
        debug!(count = descriptors.len(), "Archive listing complete");
        Ok(descriptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArchiveConfig, NamingConfig, StructureType, SubFolderConfig};
    use crate::object_store::MemoryObjectStore;

    fn monthly_scheme() -> Arc<PathScheme> {
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
                    ..Default::default()
                },
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_derive_service() {
        assert_eq!(derive_service("api-logs.json").as_deref(), Some("api"));
        assert_eq!(
            derive_service("user-service-logs_14-15.json").as_deref(),
            Some("user-service")
        );
        assert_eq!(derive_service("billing_2024.json").as_deref(), Some("billing"));
        assert_eq!(derive_service("summary.json").as_deref(), Some("summary"));
        assert_eq!(derive_service(".hidden"), None);
        assert_eq!(
            derive_service("api-logs-x-logs.json").as_deref(),
            Some("api-logs-x")
        );
        assert_eq!(
            derive_service("api-logs-x-logs_14-15.json").as_deref(),
            Some("api-logs-x")
        );
    }

    #[test]
    fn test_derive_extension() {
        assert_eq!(derive_extension("api-logs.JSON").as_deref(), Some("json"));
        assert_eq!(derive_extension("api-logs.json.gz").as_deref(), Some("gz"));
        assert_eq!(derive_extension("README"), None);
        assert_eq!(derive_extension("trailing."), None);
    }

    #[test]
    fn test_descriptor_from_parsed_key() {
        let entry = ObjectEntry {
            key: "logs_2024-01/hour-14-15/success/api-logs.json".to_string(),
            size_bytes: 512,
            last_modified: Utc::now(),
        };
        let descriptor = FileDescriptor::from_entry(entry, &monthly_scheme());

        assert_eq!(descriptor.file_name, "api-logs.json");
        assert_eq!(descriptor.folder, "logs_2024-01/hour-14-15/success");
        assert_eq!(descriptor.service.as_deref(), Some("api"));
        assert_eq!(descriptor.extension.as_deref(), Some("json"));
        assert_eq!(descriptor.date.map(|d| d.to_string()).as_deref(), Some("2024-01"));
        assert_eq!(descriptor.status.as_deref(), Some("success"));
    }

    #[test]
    fn test_legacy_key_keeps_descriptor() {
        let entry = ObjectEntry {
            key: "2023/07/api-logs.json".to_string(),
            size_bytes: 10,
            last_modified: Utc::now(),
        };
        let descriptor = FileDescriptor::from_entry(entry, &monthly_scheme());

        assert_eq!(descriptor.date, None);
        assert_eq!(descriptor.hour_range, None);
        assert_eq!(descriptor.status, None);
        assert_eq!(descriptor.service.as_deref(), Some("api"));
    }

    #[tokio::test]
    async fn test_list_concatenates_pages() {
        let store = Arc::new(MemoryObjectStore::with_page_size(3));
        for i in 0..10 {
            store.insert(
                &format!("logs_2024-01/success/svc{}-logs.json", i),
                "[]",
                Utc::now(),
            );
        }
        store.insert("logs_2024-01/", "", Utc::now());

        let index = ArchiveIndex::new(store, monthly_scheme());
        let descriptors = index.snapshot(None).await.unwrap();
        assert_eq!(descriptors.len(), 10);
    }

    #[tokio::test]
    async fn test_list_with_scope_hint() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("logs_2024-01/api-logs.json", "[]", Utc::now());
        store.insert("logs_2024-02/api-logs.json", "[]", Utc::now());

        let index = ArchiveIndex::new(store, monthly_scheme());
        let descriptors = index
            .snapshot(Some("logs_2024-02/".to_string()))
            .await
            .unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].key, "logs_2024-02/api-logs.json");
    }

    #[tokio::test]
    async fn test_listing_failure_is_not_partial_success() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("logs_2024-01/api-logs.json", "[]", Utc::now());
        store.set_listing_unavailable(true);

        let index = ArchiveIndex::new(store, monthly_scheme());
        assert!(matches!(
            index.snapshot(None).await,
            Err(ArchiveError::StorageUnavailable(_))
        ));
    }
}
