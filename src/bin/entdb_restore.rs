//! entdb-restore: CLI tool that rebuilds a tenant database from its latest
//! snapshot plus archived events newer than it. Flags grounded on
//! `dbaas/entdb_server/tools/restore.py`'s `argparse` definition
//! (`--tenant-id`, `--data-dir`, `--s3-bucket`, `--dry-run`,
//! `--skip-archive`, `--no-verify`, `-v/--verbose`).

use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use entdb::objectstore::ObjectStore;
use entdb::restore::{RestoreConfig, RestoreTool};
use entdb::store::{CanonicalStore, CanonicalStoreConfig, MailboxStore, MailboxStoreConfig};

struct Args {
    tenant_id: String,
    data_dir: String,
    s3_bucket: String,
    s3_region: String,
    s3_endpoint: Option<String>,
    dry_run: bool,
    skip_archive: bool,
    no_verify: bool,
    verbose: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut tenant_id = None;
    let mut data_dir = None;
    let mut s3_bucket = None;
    let mut s3_region = "us-east-1".to_string();
    let mut s3_endpoint = None;
    let mut dry_run = false;
    let mut skip_archive = false;
    let mut no_verify = false;
    let mut verbose = false;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--tenant-id" => tenant_id = Some(it.next().ok_or("--tenant-id requires a value")?),
            "--data-dir" => data_dir = Some(it.next().ok_or("--data-dir requires a value")?),
            "--s3-bucket" => s3_bucket = Some(it.next().ok_or("--s3-bucket requires a value")?),
            "--s3-region" => s3_region = it.next().ok_or("--s3-region requires a value")?,
            "--s3-endpoint" => s3_endpoint = Some(it.next().ok_or("--s3-endpoint requires a value")?),
            "--dry-run" => dry_run = true,
            "--skip-archive" => skip_archive = true,
            "--no-verify" => no_verify = true,
            "-v" | "--verbose" => verbose = true,
            other => return Err(format!("unrecognized argument: {other}")),
        }
    }

    Ok(Args {
        tenant_id: tenant_id.ok_or("--tenant-id is required")?,
        data_dir: data_dir.ok_or("--data-dir is required")?,
        s3_bucket: s3_bucket.ok_or("--s3-bucket is required")?,
        s3_region,
        s3_endpoint,
        dry_run,
        skip_archive,
        no_verify,
        verbose,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("entdb-restore: {e}");
            return ExitCode::FAILURE;
        }
    };

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_env("ENTDB_LOG").unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let data_dir: std::path::PathBuf = args.data_dir.clone().into();
    let store = Arc::new(CanonicalStore::new(CanonicalStoreConfig {
        data_dir: data_dir.clone(),
        busy_timeout_ms: 5000,
        cache_size_pages: -64000,
    }));
    let mailbox = Arc::new(MailboxStore::new(MailboxStoreConfig {
        data_dir: data_dir.join("mailboxes"),
        busy_timeout_ms: 5000,
    }));
    let object_store: Arc<dyn ObjectStore> = build_object_store(&args).await;
    let tool = RestoreTool::new(store, mailbox, object_store);

    let config = RestoreConfig {
        tenant_id: args.tenant_id,
        snapshot_prefix: "snapshots".to_string(),
        archive_prefix: "archive".to_string(),
        dry_run: args.dry_run,
        verify: !args.no_verify,
        skip_archive: args.skip_archive,
    };

    match tool.restore(&config).await {
        Ok(result) => {
            println!("Restore completed successfully");
            println!("  Snapshot: {}", result.snapshot_used.as_deref().unwrap_or("none"));
            println!("  Events replayed: {}", result.events_replayed);
            println!("  Final offset: {}", result.final_offset.map(|o| o.to_string()).unwrap_or_else(|| "none".to_string()));
            println!("  Duration: {}ms", result.duration_ms);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Restore failed: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(feature = "s3")]
async fn build_object_store(args: &Args) -> Arc<dyn ObjectStore> {
    use entdb::objectstore::s3::S3ObjectStore;
    Arc::new(S3ObjectStore::new(args.s3_bucket.clone(), args.s3_region.clone(), args.s3_endpoint.clone()).await)
}

#[cfg(not(feature = "s3"))]
async fn build_object_store(_args: &Args) -> Arc<dyn ObjectStore> {
    Arc::new(entdb::objectstore::memory::InMemoryObjectStore::new())
}
