//! entdb-snapshotter: periodically snapshots every tenant database to
//! object storage. Bootstrap shape grounded on
//! angzarr's `src/bin/angzarr_aggregate.rs`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use entdb::config::ServerConfig;
use entdb::objectstore::ObjectStore;
use entdb::snapshotter::{Compression, SnapshotConfig, Snapshotter};
use entdb::store::{CanonicalStore, CanonicalStoreConfig};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("ENTDB_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = ServerConfig::load().map_err(|e| {
        error!("failed to load configuration: {e}");
        e
    })?;
    config.validate()?;

    if !config.snapshot.enabled {
        info!("snapshotter disabled via configuration, exiting");
        return Ok(());
    }

    let data_dir = PathBuf::from(config.storage.data_dir.clone());
    let store = Arc::new(CanonicalStore::new(CanonicalStoreConfig {
        data_dir: data_dir.clone(),
        busy_timeout_ms: config.storage.busy_timeout_ms,
        cache_size_pages: config.storage.cache_size,
    }));
    let object_store: Arc<dyn ObjectStore> = build_object_store(&config).await;

    let snapshot_config = SnapshotConfig {
        snapshot_prefix: config.s3.snapshot_prefix.clone(),
        interval: Duration::from_secs(config.snapshot.interval_seconds),
        min_events_since_last: config.snapshot.min_events,
        compression: if config.snapshot.compression == "gzip" { Compression::Gzip } else { Compression::None },
        max_concurrent: config.snapshot.max_concurrent,
    };

    info!(interval_seconds = config.snapshot.interval_seconds, "starting snapshotter");
    let snapshotter = Arc::new(Snapshotter::new(store, object_store, snapshot_config));
    snapshotter.run(&data_dir).await?;
    Ok(())
}

#[cfg(feature = "s3")]
async fn build_object_store(config: &ServerConfig) -> Arc<dyn ObjectStore> {
    use entdb::objectstore::s3::S3ObjectStore;
    Arc::new(S3ObjectStore::new(config.s3.bucket.clone(), config.s3.region.clone(), config.s3.endpoint.clone()).await)
}

#[cfg(not(feature = "s3"))]
async fn build_object_store(_config: &ServerConfig) -> Arc<dyn ObjectStore> {
    Arc::new(entdb::objectstore::memory::InMemoryObjectStore::new())
}
