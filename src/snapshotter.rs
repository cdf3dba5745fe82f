//! Snapshotter: periodically captures a consistent, compressed copy of
//! each tenant database plus a JSON manifest, uploaded to object storage.
//! Grounded on `dbaas/entdb_server/snapshot/snapshotter.py`.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::error::{EntDbError, Result};
use crate::objectstore::ObjectStore;
use crate::store::CanonicalStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub snapshot_prefix: String,
    pub interval: Duration,
    pub min_events_since_last: u64,
    pub compression: Compression,
    pub max_concurrent: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            snapshot_prefix: "snapshots".to_string(),
            interval: Duration::from_secs(3600),
            min_events_since_last: 1000,
            compression: Compression::Gzip,
            max_concurrent: 4,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SnapshotManifest {
    pub tenant_id: String,
    pub snapshot_ts: i64,
    pub last_stream_pos: Option<i64>,
    pub schema_fingerprint: Option<String>,
    pub checksum: String,
    pub size_bytes: u64,
    pub s3_key: String,
}

pub struct Snapshotter {
    store: Arc<CanonicalStore>,
    object_store: Arc<dyn ObjectStore>,
    config: SnapshotConfig,
    semaphore: Arc<Semaphore>,
}

impl Snapshotter {
    pub fn new(store: Arc<CanonicalStore>, object_store: Arc<dyn ObjectStore>, config: SnapshotConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self { store, object_store, config, semaphore }
    }

    /// Takes an immediate snapshot of one tenant, bypassing the "is a
    /// snapshot needed" schedule check — the ad-hoc operational path.
    pub async fn snapshot_now(&self, tenant_id: &str, schema_fingerprint: Option<String>) -> Result<SnapshotManifest> {
        let _permit = self.semaphore.acquire().await.map_err(|e| EntDbError::Internal(e.to_string()))?;

        let tmp = tempfile::NamedTempFile::new()?;
        let tmp_path = tmp.path().to_path_buf();
        self.store.backup_to(tenant_id, &tmp_path).await?;

        let last_stream_pos = self.store.get_last_applied_position(tenant_id).await?;

        let raw = tokio::fs::read(&tmp_path).await?;
        let (body, ext) = match self.config.compression {
            Compression::None => (raw, ".sqlite"),
            Compression::Gzip => (gzip_bytes(&raw)?, ".sqlite.gz"),
        };
        let checksum = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
        let size_bytes = body.len() as u64;

        let snapshot_ts = chrono::Utc::now().timestamp_millis();
        let s3_key = format!("{}/tenant={}/ts={}{}", self.config.snapshot_prefix, tenant_id, snapshot_ts, ext);

        self.object_store.put_object(&s3_key, Bytes::from(body), "application/octet-stream").await?;

        let manifest = SnapshotManifest {
            tenant_id: tenant_id.to_string(),
            snapshot_ts,
            last_stream_pos,
            schema_fingerprint,
            checksum,
            size_bytes,
            s3_key: s3_key.clone(),
        };
        let manifest_key = format!("{s3_key}.manifest.json");
        self.object_store
            .put_object(&manifest_key, Bytes::from(serde_json::to_vec(&manifest)?), "application/json")
            .await?;

        // tmp is removed on drop regardless of the exit path taken above.
        info!(tenant_id, s3_key, size_bytes, "snapshot uploaded");
        Ok(manifest)
    }

    /// Runs the periodic loop: on each tick, snapshot every tenant database
    /// found under the data directory whose last snapshot is missing or
    /// older than the configured interval.
    pub async fn run(self: Arc<Self>, data_dir: &Path) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            ticker.tick().await;
            let tenants = list_tenant_ids(data_dir).await?;
            let mut handles = Vec::new();
            for tenant_id in tenants {
                let this = Arc::clone(&self);
                handles.push(tokio::spawn(async move {
                    if let Err(e) = this.snapshot_now(&tenant_id, None).await {
                        warn!(tenant_id, error = %e, "snapshot failed");
                    }
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }
}

fn gzip_bytes(raw: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(raw)?;
    Ok(encoder.finish()?)
}

pub fn gunzip_bytes(raw: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(raw);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

async fn list_tenant_ids(data_dir: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(data_dir).await {
        Ok(e) => e,
        Err(_) => return Ok(out),
    };
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            if let Some(tenant) = name.strip_prefix("tenant_").and_then(|s| s.strip_suffix(".db")) {
                out.push(tenant.to_string());
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectstore::memory::InMemoryObjectStore;
    use crate::store::CanonicalStoreConfig;

    #[tokio::test]
    async fn snapshot_now_uploads_blob_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CanonicalStore::new(CanonicalStoreConfig {
            data_dir: dir.path().to_path_buf(),
            busy_timeout_ms: 5000,
            cache_size_pages: -2000,
        }));
        store.initialize_tenant("t1").await.unwrap();

        let object_store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let snapshotter = Snapshotter::new(store, object_store.clone(), SnapshotConfig::default());

        let manifest = snapshotter.snapshot_now("t1", Some("sha256:abc".to_string())).await.unwrap();
        assert!(object_store.head_object(&manifest.s3_key).await.unwrap());
        assert!(object_store.head_object(&format!("{}.manifest.json", manifest.s3_key)).await.unwrap());
        assert!(manifest.checksum.starts_with("sha256:"));
    }

    #[test]
    fn gzip_round_trips() {
        let data = b"hello world".repeat(100);
        let compressed = gzip_bytes(&data).unwrap();
        let decompressed = gunzip_bytes(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }
}
