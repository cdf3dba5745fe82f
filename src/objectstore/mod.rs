//! Object storage abstraction used by the archiver and snapshotter.
//! Grounded on angzarr's `src/payload_store/s3.rs`, generalized to a
//! plain put/get/head/list trait so both a real S3 backend and an
//! in-memory reference implementation can share callers.

pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub key: String,
    pub size_bytes: u64,
    pub last_modified_ms: i64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> Result<()>;
    async fn get_object(&self, key: &str) -> Result<Bytes>;
    async fn head_object(&self, key: &str) -> Result<bool>;
    /// Lists object keys with the given prefix. The in-memory and S3
    /// implementations both return keys sorted lexicographically, which
    /// for this system's zero-padded-offset key scheme is also offset
    /// order.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;
}
