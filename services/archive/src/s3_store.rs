use crate::config::StorageConfig;
use crate::error::{ArchiveError, Result};
use crate::object_store::{ListPage, ObjectEntry, ObjectStore};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// S3 limit on keys per DeleteObjects request
const MAX_DELETE_KEYS: usize = 1000;

/// S3-backed archive store
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    config: StorageConfig,
}

impl S3ObjectStore {
    /// Create a new S3 store client
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    /// Simple single-part upload for small files
    async fn simple_upload(&self, key: &str, body: Bytes, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| unavailable("upload object", key, e))?;
        Ok(())
    }

    /// Multipart upload for large files
    async fn multipart_upload(&self, key: &str, body: Bytes, content_type: &str) -> Result<()> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| unavailable("create multipart upload", key, e))?;

        let upload_id = create_response.upload_id().ok_or_else(|| {
            ArchiveError::StorageUnavailable(format!("no upload id returned for {}", key))
        })?;

        let mut completed_parts = Vec::new();
        let part_size = self.config.part_size_bytes.max(1);

        for (index, chunk) in body.chunks(part_size).enumerate() {
            let part_number = index as i32 + 1;
            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(body.slice_ref(chunk)))
                .send()
                .await
                .map_err(|e| unavailable("upload part", key, e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| unavailable("complete multipart upload", key, e))?;

        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn list_objects(
        &self,
        prefix: Option<&str>,
        continuation_token: Option<&str>,
    ) -> Result<ListPage> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .set_prefix(prefix.map(String::from))
            .set_continuation_token(continuation_token.map(String::from))
            .max_keys(self.config.list_page_size)
            .send()
            .await
            .map_err(|e| unavailable("list objects", prefix.unwrap_or(""), e))?;

        let entries = response
            .contents()
            .iter()
            .filter_map(|obj| {
                let key = obj.key()?.to_string();
                let last_modified = obj
                    .last_modified()
                    .and_then(|t| Utc.timestamp_opt(t.secs(), t.subsec_nanos()).single())
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                Some(ObjectEntry {
                    key,
                    size_bytes: obj.size().unwrap_or(0).max(0) as u64,
                    last_modified,
                })
            })
            .collect();

        let next_token = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(String::from)
        } else {
            None
        };

        Ok(ListPage {
            entries,
            next_token,
        })
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get_object(&self, key: &str) -> Result<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|e| e.is_no_such_key()).unwrap_or(false) {
                    ArchiveError::ObjectNotFound(key.to_string())
                } else {
                    unavailable("get object", key, e)
                }
            })?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| unavailable("read object body", key, e))?;

        Ok(body.into_bytes())
    }

    #[instrument(skip(self, body), fields(key = %key, size_bytes = body.len()))]
    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> Result<()> {
        let size = body.len();

        // Check if we should use multipart upload
        if size > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, body, content_type).await?;
        } else {
            self.simple_upload(key, body, content_type).await?;
        }

        debug!(key = %key, size_bytes = size, "Object uploaded");
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| unavailable("delete object", key, e))?;

        debug!(key = %key, "Object deleted");
        Ok(())
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn delete_objects(&self, keys: &[String]) -> Result<()> {
        for chunk in keys.chunks(MAX_DELETE_KEYS) {
            let objects = chunk
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| ArchiveError::StorageUnavailable(e.to_string()))?;

            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| ArchiveError::StorageUnavailable(e.to_string()))?;

            let response = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| unavailable("delete objects", "", e))?;

            let errors = response.errors();
            if !errors.is_empty() {
                for error in errors {
                    warn!(
                        key = error.key().unwrap_or_default(),
                        code = error.code().unwrap_or_default(),
                        "Object delete rejected"
                    );
                }
                return Err(ArchiveError::StorageUnavailable(format!(
                    "{} of {} deletes rejected",
                    errors.len(),
                    chunk.len()
                )));
            }
        }
        Ok(())
    }

    async fn presigned_url(&self, key: &str, expires_in: Duration) -> Result<Option<String>> {
        let presigning_config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| ArchiveError::Config(format!("invalid presign expiry: {}", e)))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| unavailable("presign object", key, e))?;

        Ok(Some(presigned.uri().to_string()))
    }
}

fn unavailable(action: &str, key: &str, error: impl std::fmt::Display) -> ArchiveError {
    ArchiveError::StorageUnavailable(format!("failed to {} '{}': {}", action, key, error))
}

/// Get content type for an archived file extension
pub fn content_type_for(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "json" => "application/json",
        "ndjson" | "jsonl" => "application/x-ndjson",
        "log" | "txt" => "text/plain",
        "csv" => "text/csv",
        "gz" => "application/gzip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("api-logs.json"), "application/json");
        assert_eq!(content_type_for("API-LOGS.JSON"), "application/json");
        assert_eq!(content_type_for("api.jsonl"), "application/x-ndjson");
        assert_eq!(content_type_for("api.json.gz"), "application/gzip");
        assert_eq!(content_type_for("README"), "application/octet-stream");
    }
}
