pub mod audit;
pub mod init;
pub mod inventory;
pub mod pull;
pub mod push;
pub mod rebuild;
pub mod retry;
pub mod status;
pub mod worker;

use crate::config::Config;
use anyhow::{Result, anyhow};
use blobkeep_backends::HealthTracker;
use blobkeep_core::{ChangesetId, FsSource, ManifestStore};
use blobkeep_engine::{RunReport, UploadCoordinator};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

pub async fn open_manifest(config: &Config) -> Result<ManifestStore> {
    info!("Opening manifest at: {}", config.manifest.display());
    let manifest = ManifestStore::connect(&config.manifest)
        .await?
        .with_stuck_threshold(config.stuck_threshold());
    Ok(manifest)
}

/// Full hex id, or a unique prefix of one.
pub async fn resolve_changeset(manifest: &ManifestStore, id: &str) -> Result<ChangesetId> {
    if let Ok(parsed) = id.parse::<ChangesetId>() {
        return Ok(parsed);
    }
    let matches: Vec<ChangesetId> = manifest
        .list_changesets(None)
        .await?
        .into_iter()
        .map(|c| c.changeset_id)
        .filter(|c| c.to_hex().starts_with(id))
        .collect();
    match matches.as_slice() {
        [only] => Ok(*only),
        [] => Err(anyhow!("No changeset matches '{}'", id)),
        _ => Err(anyhow!("'{}' is ambiguous ({} changesets match)", id, matches.len())),
    }
}

pub fn source_root(config: &Config, requested: Option<&Path>) -> Result<PathBuf> {
    let root = requested
        .map(Path::to_path_buf)
        .or_else(|| config.source_root.clone())
        .ok_or_else(|| anyhow!("Source root required (argument or source_root in config)"))?;
    if !root.is_dir() {
        return Err(anyhow!("Source root is not a directory: {}", root.display()));
    }
    Ok(root.canonicalize()?)
}

pub async fn build_coordinator(
    config: &Config,
    manifest: ManifestStore,
    root: &Path,
    passphrase: String,
) -> Result<UploadCoordinator> {
    if config.backends.is_empty() {
        return Err(anyhow!("No backends configured"));
    }
    let mut slots = Vec::with_capacity(config.backends.len());
    for backend in &config.backends {
        slots.push(backend.slot().await?);
    }

    let coordinator = UploadCoordinator::new(
        manifest,
        slots,
        Arc::new(FsSource::new(root)),
        passphrase,
        config.coordinator_config(),
    )?
    .with_health_tracker(Arc::new(HealthTracker::new(config.upload.degraded_after_failures)));
    Ok(coordinator)
}

pub fn progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb
}

pub fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(120));
    pb
}

pub fn print_run_report(report: &RunReport) {
    println!(
        "Uploaded {} ({:.2} MB), deduplicated {}, failed {}, blocked {}, deferred {}",
        report.committed,
        report.bytes_uploaded as f64 / 1024.0 / 1024.0,
        report.deduplicated,
        report.failed,
        report.blocked,
        report.deferred
    );
    if let Some(lagging) = &report.lagging {
        println!(
            "Lagging backends: {} recovered, {} still failing",
            lagging.recovered, lagging.still_failing
        );
    }
    for failure in &report.failures {
        let hold = failure.hold.map(|h| h.as_str()).unwrap_or("deferred");
        println!("  {:<8} {}  {}", hold, failure.path, failure.error);
    }
    if let Some(status) = report.status {
        println!("Changeset status: {}", status);
    }
}
