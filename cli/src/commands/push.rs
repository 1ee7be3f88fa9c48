use super::OutputFormat;
use anyhow::{Result, anyhow};
use blobkeep_engine::TreeScanner;
use clap::Args;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct PushCommand {
    #[arg(help = "Directory to scan (defaults to source_root)")]
    root: Option<PathBuf>,

    #[arg(long, help = "Changeset name")]
    name: String,

    #[arg(long, help = "Record the changeset but leave uploading to workers")]
    submit_only: bool,

    #[arg(long, value_enum, default_value = "table", help = "Output format")]
    format: OutputFormat,
}

impl PushCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("Changeset name must not be empty"));
        }

        let config = cli.load_config()?;
        let root = super::source_root(&config, self.root.as_deref())?;
        let passphrase = cli.passphrase()?;
        let manifest = super::open_manifest(&config).await?;

        let pb = super::spinner("Scanning files...");
        let mut scanner = TreeScanner::new(&root);
        if let Some(parent) = config.manifest.parent() {
            if let Ok(parent) = parent.canonicalize() {
                scanner = scanner.exclude(parent);
            }
        }
        let request = scanner.scan(&self.name).await?;
        pb.finish_with_message(format!("Found {} files", request.files.len()));

        let coordinator = super::build_coordinator(&config, manifest.clone(), &root, passphrase).await?;
        let pb = super::spinner("Hashing and recording changeset...");
        let changeset_id = coordinator.submit(&request).await?;
        pb.finish_with_message(format!("Changeset {}", changeset_id.short_string()));

        if self.submit_only {
            println!("Recorded changeset {} ({})", changeset_id, self.name);
            return Ok(());
        }

        let progress = manifest.progress(&changeset_id).await?;
        info!(canonical = progress.canonical, remaining = progress.remaining(), "Uploading changeset");
        let pb = super::progress_bar(progress.remaining());
        pb.set_message("Uploading");
        let report = coordinator
            .run_changeset_with(&changeset_id, |batch| pb.inc(batch.claimed))
            .await?;
        pb.finish_with_message("Done");

        match self.format {
            OutputFormat::Table => super::print_run_report(&report),
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        }
        println!("{}", coordinator.stats().summary());
        Ok(())
    }
}
