//! An S3-compatible object store client, backing the artifact gate against
//! Cloudflare R2. R2 speaks the S3 API, so `aws-sdk-s3` works unmodified
//! against it once pointed at the R2 account endpoint with path-style
//! addressing and a static credential pair.

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("object store request failed: {0}")]
    Request(String),
    #[error("failed to presign url: {0}")]
    Presign(String),
}

/// A streamed or fully-buffered object body plus the metadata needed to
/// answer a ranged GET.
pub struct RangeObject {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub content_range: Option<String>,
    pub partial: bool,
}

#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    async fn get_object(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError>;
    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, ObjectStoreError>;
    async fn get_object_range(&self, key: &str, range: Option<&str>) -> Result<RangeObject, ObjectStoreError>;
}

pub struct S3ObjectStoreClient {
    client: Client,
    bucket: String,
}

impl S3ObjectStoreClient {
    pub fn new(endpoint: &str, bucket: &str, access_key_id: &str, secret_access_key: &str) -> Self {
        let credentials = Credentials::new(access_key_id, secret_access_key, None, None, "r2-static");
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .endpoint_url(endpoint)
            .region(aws_sdk_s3::config::Region::new("auto"))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Self {
            client: Client::from_conf(config),
            bucket: bucket.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStoreClient for S3ObjectStoreClient {
    async fn get_object(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::NotFound(format!("{key}: {e}")))?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, ObjectStoreError> {
        let presign_config =
            PresigningConfig::expires_in(ttl).map_err(|e| ObjectStoreError::Presign(e.to_string()))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presign_config)
            .await
            .map_err(|e| ObjectStoreError::Presign(e.to_string()))?;
        Ok(presigned.uri().to_string())
    }

    async fn get_object_range(&self, key: &str, range: Option<&str>) -> Result<RangeObject, ObjectStoreError> {
        let mut request = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some(range) = range {
            request = request.range(range);
        }
        let output = request
            .send()
            .await
            .map_err(|e| ObjectStoreError::NotFound(format!("{key}: {e}")))?;
        let partial = output.content_range().is_some();
        let content_type = output.content_type().map(str::to_string);
        let content_range = output.content_range().map(str::to_string);
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?;
        Ok(RangeObject {
            body: bytes.into_bytes().to_vec(),
            content_type,
            content_range,
            partial,
        })
    }
}
