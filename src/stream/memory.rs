//! In-memory reference `LogStream`, grounded on angzarr's
//! `ChannelEventBus` (`src/bus/channel/mod.rs`): partitioned buffers behind
//! a `Mutex`, a `Notify` per partition to wake blocked subscribers, and a
//! stable-hash partition assignment. Used by `entdb-standalone` and the
//! integration tests in lieu of a real Kafka/Kinesis backend.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use super::{LogStream, StreamPos, StreamRecord};
use crate::error::Result;

#[derive(Clone)]
struct StoredRecord {
    key: String,
    value: Bytes,
    headers: HashMap<String, String>,
    offset: i64,
    timestamp_ms: i64,
}

#[derive(Default)]
struct Partition {
    records: Vec<StoredRecord>,
}

pub struct InMemoryLogStream {
    num_partitions: i32,
    // keyed by (topic, partition)
    partitions: Mutex<HashMap<(String, i32), Partition>>,
    notify: Mutex<HashMap<(String, i32), Arc<Notify>>>,
    // keyed by (topic, consumer_group, partition)
    committed: Mutex<HashMap<(String, String, i32), i64>>,
}

impl InMemoryLogStream {
    pub fn new(num_partitions: i32) -> Self {
        Self {
            num_partitions: num_partitions.max(1),
            partitions: Mutex::new(HashMap::new()),
            notify: Mutex::new(HashMap::new()),
            committed: Mutex::new(HashMap::new()),
        }
    }

    fn partition_for_key(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.num_partitions as u64) as i32
    }

    async fn notify_for(&self, topic: &str, partition: i32) -> Arc<Notify> {
        let mut notify = self.notify.lock().await;
        notify
            .entry((topic.to_string(), partition))
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}

impl Default for InMemoryLogStream {
    fn default() -> Self {
        Self::new(4)
    }
}

#[async_trait]
impl LogStream for InMemoryLogStream {
    async fn append(
        &self,
        topic: &str,
        key: &str,
        value: Bytes,
        headers: HashMap<String, String>,
    ) -> Result<StreamPos> {
        let partition = self.partition_for_key(key);
        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        let offset = {
            let mut partitions = self.partitions.lock().await;
            let p = partitions.entry((topic.to_string(), partition)).or_default();
            let offset = p.records.len() as i64;
            p.records.push(StoredRecord {
                key: key.to_string(),
                value,
                headers,
                offset,
                timestamp_ms,
            });
            offset
        };
        self.notify_for(topic, partition).await.notify_waiters();
        Ok(StreamPos { topic: topic.to_string(), partition, offset, timestamp_ms })
    }

    async fn subscribe(
        self: Arc<Self>,
        topic: &str,
        consumer_group: &str,
        start_pos: Option<StreamPos>,
    ) -> Result<BoxStream<'static, StreamRecord>> {
        let partitions: Vec<i32> = (0..self.num_partitions).collect();
        let mut next_offsets = HashMap::new();
        {
            let committed = self.committed.lock().await;
            for p in &partitions {
                let committed_offset = committed
                    .get(&(topic.to_string(), consumer_group.to_string(), *p))
                    .copied();
                let start = match (&start_pos, committed_offset) {
                    (_, Some(off)) => off + 1,
                    (Some(pos), None) if pos.partition == *p => pos.offset + 1,
                    _ => 0,
                };
                next_offsets.insert(*p, start);
            }
        }

        struct State {
            stream: Arc<InMemoryLogStream>,
            topic: String,
            next_offsets: HashMap<i32, i64>,
            partitions: Vec<i32>,
            round_robin: usize,
        }

        let state = State { stream: self, topic: topic.to_string(), next_offsets, partitions, round_robin: 0 };

        let out = stream::unfold(state, |mut state| async move {
            loop {
                let n = state.partitions.len();
                for i in 0..n {
                    let idx = (state.round_robin + i) % n;
                    let partition = state.partitions[idx];
                    let next_offset = *state.next_offsets.get(&partition).unwrap_or(&0);

                    let found = {
                        let partitions = state.stream.partitions.lock().await;
                        partitions
                            .get(&(state.topic.clone(), partition))
                            .and_then(|p| p.records.get(next_offset as usize).cloned())
                    };

                    if let Some(rec) = found {
                        state.next_offsets.insert(partition, next_offset + 1);
                        state.round_robin = (idx + 1) % n;
                        let record = StreamRecord {
                            key: rec.key,
                            value: rec.value,
                            position: StreamPos {
                                topic: state.topic.clone(),
                                partition,
                                offset: rec.offset,
                                timestamp_ms: rec.timestamp_ms,
                            },
                            headers: rec.headers,
                        };
                        return Some((record, state));
                    }
                }

                // Nothing ready in any partition; wait to be woken by the
                // next append, re-checking on a short timeout in case a
                // notification races with this loop re-arming.
                let notify = state.stream.notify_for(&state.topic, state.partitions[state.round_robin % n]).await;
                let _ = tokio::time::timeout(Duration::from_millis(50), notify.notified()).await;
            }
        });

        Ok(out.boxed())
    }

    async fn commit(&self, consumer_group: &str, record: &StreamRecord) -> Result<()> {
        let mut committed = self.committed.lock().await;
        committed.insert(
            (record.position.topic.clone(), consumer_group.to_string(), record.position.partition),
            record.position.offset,
        );
        Ok(())
    }

    async fn get_positions(
        &self,
        topic: &str,
        consumer_group: &str,
    ) -> Result<HashMap<i32, StreamPos>> {
        let committed = self.committed.lock().await;
        let mut out = HashMap::new();
        for p in 0..self.num_partitions {
            if let Some(offset) =
                committed.get(&(topic.to_string(), consumer_group.to_string(), p))
            {
                out.insert(
                    p,
                    StreamPos {
                        topic: topic.to_string(),
                        partition: p,
                        offset: *offset,
                        timestamp_ms: 0,
                    },
                );
            }
        }
        Ok(out)
    }
}
