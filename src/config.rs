//! Environment-variable configuration, grounded on
//! `dbaas/entdb_server/config.py`'s `ServerConfig.from_env` and on
//! angzarr's own `ANGZARR__`-prefixed `config` crate usage
//! (`src/config.rs`). Every flat variable name from the original Python
//! service keeps working; an `ENTDB__`-prefixed, `__`-separated override
//! layer sits on top for deployments that want the newer nested form.

use config::{Config as RawConfig, Environment};
use serde::Deserialize;

use crate::error::{EntDbError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalBackend {
    Kafka,
    Kinesis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    #[serde(default = "default_kafka_brokers")]
    pub brokers: String,
    #[serde(default = "default_kafka_topic")]
    pub topic: String,
    #[serde(default = "default_kafka_consumer_group")]
    pub consumer_group: String,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    #[serde(default = "default_security_protocol")]
    pub security_protocol: String,
    pub ssl_cafile: Option<String>,
    pub ssl_certfile: Option<String>,
    pub ssl_keyfile: Option<String>,
    #[serde(default = "default_kafka_acks")]
    pub acks: String,
    #[serde(default = "default_true")]
    pub enable_idempotence: bool,
    #[serde(default = "default_kafka_max_in_flight")]
    pub max_in_flight: u32,
    #[serde(default = "default_kafka_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default)]
    pub auto_commit: bool,
}

fn default_kafka_brokers() -> String { "localhost:9092".to_string() }
fn default_kafka_topic() -> String { "entdb-wal".to_string() }
fn default_kafka_consumer_group() -> String { "entdb-applier".to_string() }
fn default_security_protocol() -> String { "PLAINTEXT".to_string() }
fn default_kafka_acks() -> String { "all".to_string() }
fn default_kafka_max_in_flight() -> u32 { 5 }
fn default_kafka_auto_offset_reset() -> String { "earliest".to_string() }
fn default_true() -> bool { true }

#[derive(Debug, Clone, Deserialize)]
pub struct KinesisConfig {
    #[serde(default = "default_kafka_topic")]
    pub stream_name: String,
    #[serde(default = "default_aws_region")]
    pub region: String,
    pub endpoint_url: Option<String>,
    #[serde(default = "default_kinesis_max_records")]
    pub max_records: u32,
    #[serde(default = "default_kinesis_iterator_type")]
    pub iterator_type: String,
}

fn default_aws_region() -> String { "us-east-1".to_string() }
fn default_kinesis_max_records() -> u32 { 1000 }
fn default_kinesis_iterator_type() -> String { "TRIM_HORIZON".to_string() }

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    #[serde(default = "default_s3_bucket")]
    pub bucket: String,
    #[serde(default = "default_aws_region")]
    pub region: String,
    pub endpoint: Option<String>,
    #[serde(default = "default_archive_prefix")]
    pub archive_prefix: String,
    #[serde(default = "default_snapshot_prefix")]
    pub snapshot_prefix: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

fn default_s3_bucket() -> String { "entdb-storage".to_string() }
fn default_archive_prefix() -> String { "archive".to_string() }
fn default_snapshot_prefix() -> String { "snapshots".to_string() }

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_true")]
    pub wal_mode: bool,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_cache_size")]
    pub cache_size: i64,
}

fn default_data_dir() -> String { "/var/lib/entdb".to_string() }
fn default_busy_timeout_ms() -> u64 { 5000 }
fn default_cache_size() -> i64 { -64000 }

#[derive(Debug, Clone, Deserialize)]
pub struct ApplierConfig {
    #[serde(default = "default_applier_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_applier_commit_interval_ms")]
    pub commit_interval_ms: u64,
    #[serde(default = "default_applier_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_applier_max_retries")]
    pub max_retries: u32,
}

fn default_applier_batch_size() -> usize { 100 }
fn default_applier_commit_interval_ms() -> u64 { 1000 }
fn default_applier_retry_delay_ms() -> u64 { 100 }
fn default_applier_max_retries() -> u32 { 3 }

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiverConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_archive_flush_seconds")]
    pub flush_seconds: u64,
    #[serde(default = "default_archive_max_segment_bytes")]
    pub max_segment_bytes: usize,
    #[serde(default = "default_archive_max_segment_events")]
    pub max_segment_events: usize,
    #[serde(default = "default_gzip")]
    pub compression: String,
}

fn default_archive_flush_seconds() -> u64 { 60 }
fn default_archive_max_segment_bytes() -> usize { 100 * 1024 * 1024 }
fn default_archive_max_segment_events() -> usize { 10_000 }
fn default_gzip() -> String { "gzip".to_string() }

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_snapshot_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_snapshot_min_events")]
    pub min_events: u64,
    #[serde(default = "default_gzip")]
    pub compression: String,
    #[serde(default = "default_snapshot_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_snapshot_interval_seconds() -> u64 { 3600 }
fn default_snapshot_min_events() -> u64 { 1000 }
fn default_snapshot_max_concurrent() -> usize { 4 }

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_trace_sampling_rate")]
    pub trace_sampling_rate: f64,
}

fn default_log_level() -> String { "INFO".to_string() }
fn default_log_format() -> String { "json".to_string() }
fn default_metrics_port() -> u16 { 9090 }
fn default_trace_sampling_rate() -> f64 { 0.1 }

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_wal_backend")]
    pub wal_backend: WalBackend,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub kinesis: KinesisConfig,
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub applier: ApplierConfig,
    #[serde(default)]
    pub archiver: ArchiverConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_wal_backend() -> WalBackend {
    WalBackend::Kafka
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_kafka_brokers(),
            topic: default_kafka_topic(),
            consumer_group: default_kafka_consumer_group(),
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            security_protocol: default_security_protocol(),
            ssl_cafile: None,
            ssl_certfile: None,
            ssl_keyfile: None,
            acks: default_kafka_acks(),
            enable_idempotence: true,
            max_in_flight: default_kafka_max_in_flight(),
            auto_offset_reset: default_kafka_auto_offset_reset(),
            auto_commit: false,
        }
    }
}

impl Default for KinesisConfig {
    fn default() -> Self {
        Self {
            stream_name: default_kafka_topic(),
            region: default_aws_region(),
            endpoint_url: None,
            max_records: default_kinesis_max_records(),
            iterator_type: default_kinesis_iterator_type(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: default_s3_bucket(),
            region: default_aws_region(),
            endpoint: None,
            archive_prefix: default_archive_prefix(),
            snapshot_prefix: default_snapshot_prefix(),
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            wal_mode: true,
            busy_timeout_ms: default_busy_timeout_ms(),
            cache_size: default_cache_size(),
        }
    }
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            batch_size: default_applier_batch_size(),
            commit_interval_ms: default_applier_commit_interval_ms(),
            retry_delay_ms: default_applier_retry_delay_ms(),
            max_retries: default_applier_max_retries(),
        }
    }
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_seconds: default_archive_flush_seconds(),
            max_segment_bytes: default_archive_max_segment_bytes(),
            max_segment_events: default_archive_max_segment_events(),
            compression: default_gzip(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_snapshot_interval_seconds(),
            min_events: default_snapshot_min_events(),
            compression: default_gzip(),
            max_concurrent: default_snapshot_max_concurrent(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_enabled: true,
            metrics_port: default_metrics_port(),
            trace_sampling_rate: default_trace_sampling_rate(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from the environment: flat, un-prefixed
    /// variable names (`KAFKA_BROKERS`, `S3_BUCKET`, ...) matching the
    /// original Python service, with an `ENTDB`-prefixed, `__`-separated
    /// layer on top (`ENTDB__KAFKA__BROKERS`) taking precedence.
    pub fn load() -> Result<Self> {
        let raw = RawConfig::builder()
            .add_source(Environment::default().try_parsing(true))
            .add_source(Environment::with_prefix("ENTDB").separator("__").try_parsing(true))
            .build()
            .map_err(|e| EntDbError::InvalidArgument(format!("config load failed: {e}")))?;

        let flat: FlatEnv = raw
            .try_deserialize()
            .map_err(|e| EntDbError::InvalidArgument(format!("config parse failed: {e}")))?;

        Ok(flat.into_server_config())
    }

    pub fn validate(&self) -> Result<()> {
        if self.archiver.enabled && self.s3.bucket.is_empty() {
            return Err(EntDbError::InvalidArgument("S3_BUCKET required when archiver is enabled".into()));
        }
        if self.snapshot.enabled && self.s3.bucket.is_empty() {
            return Err(EntDbError::InvalidArgument("S3_BUCKET required when snapshotter is enabled".into()));
        }
        if matches!(self.wal_backend, WalBackend::Kafka) && self.kafka.topic.is_empty() {
            return Err(EntDbError::InvalidArgument("KAFKA_TOPIC must not be empty".into()));
        }
        Ok(())
    }
}

/// Intermediate flat struct matching the literal, single-underscore
/// environment variable names from `config.py`. `ServerConfig::load`
/// deserializes into this shape first, then assembles the nested
/// `ServerConfig` from it, so the nested nature of `ServerConfig` doesn't
/// have to match the flat historical variable names one-for-one.
#[derive(Debug, Clone, Deserialize, Default)]
struct FlatEnv {
    wal_backend: Option<String>,
    kafka_brokers: Option<String>,
    kafka_topic: Option<String>,
    kafka_consumer_group: Option<String>,
    kafka_sasl_mechanism: Option<String>,
    kafka_sasl_username: Option<String>,
    kafka_sasl_password: Option<String>,
    kafka_security_protocol: Option<String>,
    kafka_ssl_cafile: Option<String>,
    kafka_ssl_certfile: Option<String>,
    kafka_ssl_keyfile: Option<String>,
    kafka_acks: Option<String>,
    kafka_enable_idempotence: Option<bool>,
    kafka_max_in_flight: Option<u32>,
    kafka_auto_offset_reset: Option<String>,
    kafka_auto_commit: Option<bool>,
    kinesis_stream_name: Option<String>,
    aws_region: Option<String>,
    aws_default_region: Option<String>,
    kinesis_endpoint_url: Option<String>,
    kinesis_max_records: Option<u32>,
    kinesis_iterator_type: Option<String>,
    s3_bucket: Option<String>,
    s3_region: Option<String>,
    s3_endpoint: Option<String>,
    s3_archive_prefix: Option<String>,
    s3_snapshot_prefix: Option<String>,
    aws_access_key_id: Option<String>,
    aws_secret_access_key: Option<String>,
    data_dir: Option<String>,
    sqlite_wal_mode: Option<bool>,
    sqlite_busy_timeout_ms: Option<u64>,
    sqlite_cache_size: Option<i64>,
    applier_batch_size: Option<usize>,
    applier_commit_interval_ms: Option<u64>,
    applier_retry_delay_ms: Option<u64>,
    applier_max_retries: Option<u32>,
    archiver_enabled: Option<bool>,
    archive_flush_seconds: Option<u64>,
    archive_max_segment_bytes: Option<usize>,
    archive_max_segment_events: Option<usize>,
    archive_compression: Option<String>,
    snapshot_enabled: Option<bool>,
    snapshot_interval_seconds: Option<u64>,
    snapshot_min_events: Option<u64>,
    snapshot_compression: Option<String>,
    snapshot_max_concurrent: Option<usize>,
    log_level: Option<String>,
    log_format: Option<String>,
    metrics_enabled: Option<bool>,
    metrics_port: Option<u16>,
    trace_sampling_rate: Option<f64>,
}

impl FlatEnv {
    fn into_server_config(self) -> ServerConfig {
        let wal_backend = match self.wal_backend.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("kinesis") => WalBackend::Kinesis,
            _ => WalBackend::Kafka,
        };
        ServerConfig {
            wal_backend,
            kafka: KafkaConfig {
                brokers: self.kafka_brokers.unwrap_or_else(default_kafka_brokers),
                topic: self.kafka_topic.unwrap_or_else(default_kafka_topic),
                consumer_group: self.kafka_consumer_group.unwrap_or_else(default_kafka_consumer_group),
                sasl_mechanism: self.kafka_sasl_mechanism,
                sasl_username: self.kafka_sasl_username,
                sasl_password: self.kafka_sasl_password,
                security_protocol: self.kafka_security_protocol.unwrap_or_else(default_security_protocol),
                ssl_cafile: self.kafka_ssl_cafile,
                ssl_certfile: self.kafka_ssl_certfile,
                ssl_keyfile: self.kafka_ssl_keyfile,
                acks: self.kafka_acks.unwrap_or_else(default_kafka_acks),
                enable_idempotence: self.kafka_enable_idempotence.unwrap_or(true),
                max_in_flight: self.kafka_max_in_flight.unwrap_or_else(default_kafka_max_in_flight),
                auto_offset_reset: self.kafka_auto_offset_reset.unwrap_or_else(default_kafka_auto_offset_reset),
                auto_commit: self.kafka_auto_commit.unwrap_or(false),
            },
            kinesis: KinesisConfig {
                stream_name: self.kinesis_stream_name.unwrap_or_else(default_kafka_topic),
                region: self
                    .aws_region
                    .or(self.aws_default_region)
                    .unwrap_or_else(default_aws_region),
                endpoint_url: self.kinesis_endpoint_url,
                max_records: self.kinesis_max_records.unwrap_or_else(default_kinesis_max_records),
                iterator_type: self.kinesis_iterator_type.unwrap_or_else(default_kinesis_iterator_type),
            },
            s3: S3Config {
                bucket: self.s3_bucket.unwrap_or_else(default_s3_bucket),
                region: self.s3_region.unwrap_or_else(default_aws_region),
                endpoint: self.s3_endpoint,
                archive_prefix: self.s3_archive_prefix.unwrap_or_else(default_archive_prefix),
                snapshot_prefix: self.s3_snapshot_prefix.unwrap_or_else(default_snapshot_prefix),
                access_key_id: self.aws_access_key_id,
                secret_access_key: self.aws_secret_access_key,
            },
            storage: StorageConfig {
                data_dir: self.data_dir.unwrap_or_else(default_data_dir),
                wal_mode: self.sqlite_wal_mode.unwrap_or(true),
                busy_timeout_ms: self.sqlite_busy_timeout_ms.unwrap_or_else(default_busy_timeout_ms),
                cache_size: self.sqlite_cache_size.unwrap_or_else(default_cache_size),
            },
            applier: ApplierConfig {
                batch_size: self.applier_batch_size.unwrap_or_else(default_applier_batch_size),
                commit_interval_ms: self
                    .applier_commit_interval_ms
                    .unwrap_or_else(default_applier_commit_interval_ms),
                retry_delay_ms: self.applier_retry_delay_ms.unwrap_or_else(default_applier_retry_delay_ms),
                max_retries: self.applier_max_retries.unwrap_or_else(default_applier_max_retries),
            },
            archiver: ArchiverConfig {
                enabled: self.archiver_enabled.unwrap_or(true),
                flush_seconds: self.archive_flush_seconds.unwrap_or_else(default_archive_flush_seconds),
                max_segment_bytes: self
                    .archive_max_segment_bytes
                    .unwrap_or_else(default_archive_max_segment_bytes),
                max_segment_events: self
                    .archive_max_segment_events
                    .unwrap_or_else(default_archive_max_segment_events),
                compression: self.archive_compression.unwrap_or_else(default_gzip),
            },
            snapshot: SnapshotConfig {
                enabled: self.snapshot_enabled.unwrap_or(true),
                interval_seconds: self.snapshot_interval_seconds.unwrap_or_else(default_snapshot_interval_seconds),
                min_events: self.snapshot_min_events.unwrap_or_else(default_snapshot_min_events),
                compression: self.snapshot_compression.unwrap_or_else(default_gzip),
                max_concurrent: self.snapshot_max_concurrent.unwrap_or_else(default_snapshot_max_concurrent),
            },
            observability: ObservabilityConfig {
                log_level: self.log_level.unwrap_or_else(default_log_level),
                log_format: self.log_format.unwrap_or_else(default_log_format),
                metrics_enabled: self.metrics_enabled.unwrap_or(true),
                metrics_port: self.metrics_port.unwrap_or_else(default_metrics_port),
                trace_sampling_rate: self.trace_sampling_rate.unwrap_or_else(default_trace_sampling_rate),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_service() {
        let cfg = FlatEnv::default().into_server_config();
        assert_eq!(cfg.storage.data_dir, "/var/lib/entdb");
        assert_eq!(cfg.archiver.max_segment_bytes, 104_857_600);
        assert_eq!(cfg.snapshot.interval_seconds, 3600);
        assert!(matches!(cfg.wal_backend, WalBackend::Kafka));
    }

    #[test]
    fn validate_requires_bucket_when_archiver_enabled() {
        let mut cfg = FlatEnv::default().into_server_config();
        cfg.s3.bucket = String::new();
        assert!(cfg.validate().is_err());
    }
}
