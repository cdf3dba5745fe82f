//! S3-backed `ObjectStore`, grounded on angzarr's
//! `src/payload_store/s3.rs` client-construction pattern.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;

use super::{ObjectMeta, ObjectStore};
use crate::error::{EntDbError, Result};

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(bucket: impl Into<String>, region: impl Into<String>, endpoint: Option<String>) -> Self {
        let region = aws_config::Region::new(region.into());
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        let client = Client::new(&sdk_config);
        Self { client, bucket: bucket.into() }
    }

    pub fn with_client(client: Client, bucket: impl Into<String>) -> Self {
        Self { client, bucket: bucket.into() }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| EntDbError::Connection(format!("s3 put_object {key}: {e}")))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| EntDbError::NotFound(format!("s3 get_object {key}: {e}")))?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| EntDbError::Connection(format!("s3 get_object body {key}: {e}")))?
            .into_bytes();
        Ok(bytes)
    }

    async fn head_object(&self, key: &str) -> Result<bool> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) {
                    Ok(false)
                } else {
                    Err(EntDbError::Connection(format!("s3 head_object {key}: {e}")))
                }
            }
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut out = Vec::new();
        let mut continuation_token = None;
        loop {
            let mut req = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
            if let Some(token) = continuation_token.take() {
                req = req.continuation_token(token);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| EntDbError::Connection(format!("s3 list_objects {prefix}: {e}")))?;
            for obj in resp.contents() {
                let key = obj.key().unwrap_or_default().to_string();
                let size_bytes = obj.size().unwrap_or(0).max(0) as u64;
                let last_modified_ms =
                    obj.last_modified().and_then(|d| d.as_millis().ok()).unwrap_or(0);
                out.push(ObjectMeta { key, size_bytes, last_modified_ms });
            }
            if resp.is_truncated().unwrap_or(false) {
                continuation_token = resp.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}
