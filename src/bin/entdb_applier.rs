//! entdb-applier: consumes the WAL and materializes events into each
//! tenant's canonical SQLite store. Grounded on angzarr's
//! `src/bin/angzarr_aggregate.rs` bootstrap shape (tracing init, load
//! config, build collaborators, run forever) adapted from a gRPC sidecar
//! to a background consumer loop.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use entdb::applier::{Applier, ApplierConfig};
use entdb::config::ServerConfig;
use entdb::store::{CanonicalStore, CanonicalStoreConfig, MailboxStore, MailboxStoreConfig};
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

    let data_dir: std::path::PathBuf = config.storage.data_dir.clone().into();
    let store = Arc::new(CanonicalStore::new(CanonicalStoreConfig {
        data_dir: data_dir.clone(),
        busy_timeout_ms: config.storage.busy_timeout_ms,
        cache_size_pages: config.storage.cache_size,
    }));
    let mailbox = Arc::new(MailboxStore::new(MailboxStoreConfig {
        data_dir: data_dir.join("mailboxes"),
        busy_timeout_ms: config.storage.busy_timeout_ms,
    }));

    let log: Arc<dyn LogStream> = build_log_stream(&config).await?;

    let applier_config = ApplierConfig {
        topic: config.kafka.topic.clone(),
        consumer_group: config.kafka.consumer_group.clone(),
        batch_size: config.applier.batch_size,
        commit_interval_ms: config.applier.commit_interval_ms,
        retry_delay_ms: config.applier.retry_delay_ms,
        max_retries: config.applier.max_retries,
        pinned_fingerprint: None,
        fanout_node_types: Vec::new(),
    };

    info!(topic = %applier_config.topic, consumer_group = %applier_config.consumer_group, "starting applier");
    let applier = Arc::new(Applier::new(log, store, mailbox, applier_config));
    applier.run().await?;
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
