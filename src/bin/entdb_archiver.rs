//! entdb-archiver: consumes the WAL under its own consumer group and
//! flushes immutable segments to object storage. Bootstrap shape grounded
//! on angzarr's `src/bin/angzarr_aggregate.rs`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use entdb::archiver::{Archiver, ArchiverConfig, Compression};
use entdb::config::ServerConfig;
use entdb::objectstore::ObjectStore;
use entdb::stream::LogStream;

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

    if !config.archiver.enabled {
        info!("archiver disabled via configuration, exiting");
        return Ok(());
    }

    let log: Arc<dyn LogStream> = build_log_stream(&config).await?;
    let object_store: Arc<dyn ObjectStore> = build_object_store(&config).await;

    let archiver_config = ArchiverConfig {
        topic: config.kafka.topic.clone(),
        consumer_group: format!("{}-archiver", config.kafka.consumer_group),
        archive_prefix: config.s3.archive_prefix.clone(),
        flush_interval: Duration::from_secs(config.archiver.flush_seconds),
        max_segment_size_bytes: config.archiver.max_segment_bytes,
        max_segment_events: config.archiver.max_segment_events,
        compression: if config.archiver.compression == "gzip" { Compression::Gzip } else { Compression::None },
    };

    info!(topic = %archiver_config.topic, "starting archiver");
    let archiver = Arc::new(Archiver::new(log, object_store, archiver_config));
    archiver.run().await?;
    Ok(())
}

#[cfg(feature = "kafka")]
async fn build_log_stream(config: &ServerConfig) -> entdb::Result<Arc<dyn LogStream>> {
    use entdb::stream::kafka::{KafkaConfig, KafkaLogStream};
    let kafka_config = KafkaConfig {
        brokers: config.kafka.brokers.clone(),
        security_protocol: Some(config.kafka.security_protocol.clone()),
        sasl_mechanism: config.kafka.sasl_mechanism.clone(),
        sasl_username: config.kafka.sasl_username.clone(),
        sasl_password: config.kafka.sasl_password.clone(),
        ssl_cafile: config.kafka.ssl_cafile.clone(),
        acks: config.kafka.acks.clone(),
        enable_idempotence: config.kafka.enable_idempotence,
        auto_offset_reset: config.kafka.auto_offset_reset.clone(),
    };
    Ok(Arc::new(KafkaLogStream::new(kafka_config)?))
}

#[cfg(not(feature = "kafka"))]
async fn build_log_stream(_config: &ServerConfig) -> entdb::Result<Arc<dyn LogStream>> {
    Ok(Arc::new(entdb::stream::memory::InMemoryLogStream::default()))
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
