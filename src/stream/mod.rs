//! Log stream abstraction: a durable, partitioned, ordered append-only
//! record log. Grounded on angzarr's `EventBus` trait
//! (`src/bus/mod.rs`), generalized to the append/subscribe/commit/
//! get_positions shape this system needs.

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

#[cfg(feature = "kinesis")]
pub mod kinesis;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;

/// A coordinate within the log: topic, partition, offset, and the
/// broker-assigned timestamp of the record at that coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPos {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp_ms: i64,
}

impl std::fmt::Display for StreamPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.topic, self.partition, self.offset)
    }
}

/// A single record read back from the log.
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub key: String,
    pub value: Bytes,
    pub position: StreamPos,
    pub headers: HashMap<String, String>,
}

impl StreamRecord {
    pub fn value_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.value)?)
    }
}

/// Durable, partitioned, ordered append-only log. A tenant-id key keeps
/// one tenant's records totally ordered within a single partition.
#[async_trait]
pub trait LogStream: Send + Sync {
    async fn append(
        &self,
        topic: &str,
        key: &str,
        value: Bytes,
        headers: HashMap<String, String>,
    ) -> Result<StreamPos>;

    /// Produces records in partition order starting from the
    /// consumer group's committed position (or `start_pos` if the group
    /// has none yet). The returned stream is logically infinite; callers
    /// drive it with `commit` after processing each record. Takes `Arc<
    /// Self>` rather than `&self` because the returned stream must outlive
    /// the call and keeps polling the backend after it returns.
    async fn subscribe(
        self: std::sync::Arc<Self>,
        topic: &str,
        consumer_group: &str,
        start_pos: Option<StreamPos>,
    ) -> Result<BoxStream<'static, StreamRecord>>;

    async fn commit(&self, consumer_group: &str, record: &StreamRecord) -> Result<()>;

    async fn get_positions(
        &self,
        topic: &str,
        consumer_group: &str,
    ) -> Result<HashMap<i32, StreamPos>>;
}
