//! entdb-standalone: all-in-one development server. Runs the applier,
//! archiver, and snapshotter together against an in-memory log and
//! in-memory object store, no Kafka/Kinesis/S3 required. Grounded on
//! angzarr's `src/bin/angzarr_standalone.rs` ("all-in-one" bootstrap,
//! `tokio::try_join!` over every long-running service).
//!
//! Not intended for production use: state is lost on restart.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use entdb::applier::{Applier, ApplierConfig};
use entdb::archiver::{Archiver, ArchiverConfig, Compression as ArchiveCompression};
use entdb::config::ServerConfig;
use entdb::objectstore::memory::InMemoryObjectStore;
use entdb::objectstore::ObjectStore;
use entdb::snapshotter::{Compression as SnapshotCompression, SnapshotConfig, Snapshotter};
use entdb::store::{CanonicalStore, CanonicalStoreConfig, MailboxStore, MailboxStoreConfig};
use entdb::stream::memory::InMemoryLogStream;
use entdb::stream::LogStream;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("ENTDB_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::load().map_err(|e| {
        error!("failed to load configuration: {e}");
        e
    })?;

    info!("starting entdb-standalone (in-memory log, in-memory object store)");

    let data_dir = std::path::PathBuf::from(config.storage.data_dir.clone());
    let store = Arc::new(CanonicalStore::new(CanonicalStoreConfig {
        data_dir: data_dir.clone(),
        busy_timeout_ms: config.storage.busy_timeout_ms,
        cache_size_pages: config.storage.cache_size,
    }));
    let mailbox = Arc::new(MailboxStore::new(MailboxStoreConfig {
        data_dir: data_dir.join("mailboxes"),
        busy_timeout_ms: config.storage.busy_timeout_ms,
    }));

    let log: Arc<dyn LogStream> = Arc::new(InMemoryLogStream::default());
    let object_store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());

    let applier = Arc::new(Applier::new(
        log.clone(),
        store.clone(),
        mailbox,
        ApplierConfig {
            topic: config.kafka.topic.clone(),
            consumer_group: config.kafka.consumer_group.clone(),
            batch_size: config.applier.batch_size,
            commit_interval_ms: config.applier.commit_interval_ms,
            retry_delay_ms: config.applier.retry_delay_ms,
            max_retries: config.applier.max_retries,
            pinned_fingerprint: None,
            fanout_node_types: Vec::new(),
        },
    ));

    let archiver = Arc::new(Archiver::new(
        log.clone(),
        object_store.clone(),
        ArchiverConfig {
            topic: config.kafka.topic.clone(),
            consumer_group: format!("{}-archiver", config.kafka.consumer_group),
            archive_prefix: config.s3.archive_prefix.clone(),
            flush_interval: Duration::from_secs(config.archiver.flush_seconds),
            max_segment_size_bytes: config.archiver.max_segment_bytes,
            max_segment_events: config.archiver.max_segment_events,
            compression: ArchiveCompression::Gzip,
        },
    ));

    let snapshotter = Arc::new(Snapshotter::new(
        store,
        object_store,
        SnapshotConfig {
            snapshot_prefix: config.s3.snapshot_prefix.clone(),
            interval: Duration::from_secs(config.snapshot.interval_seconds),
            min_events_since_last: config.snapshot.min_events,
            compression: SnapshotCompression::Gzip,
            max_concurrent: config.snapshot.max_concurrent,
        },
    ));

    info!("applier, archiver, and snapshotter running in-process");

    tokio::try_join!(applier.run(), archiver.run(), snapshotter.run(&data_dir))?;
    Ok(())
}
