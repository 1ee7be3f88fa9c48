use anyhow::{Result, anyhow};
use blobkeep_core::BlobCodec;
use blobkeep_engine::{Reconstructor, RestoreOptions};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Args)]
pub struct PullCommand {
    #[arg(long, help = "Backend name from the configuration")]
    backend: String,

    #[arg(long, help = "Directory to restore into")]
    target: PathBuf,

    #[arg(long, help = "Replace files that already exist in the target")]
    overwrite: bool,
}

impl PullCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let config = cli.load_config()?;
        let backend = config.backend(&self.backend)?.open().await?;
        let passphrase = cli.passphrase()?;
        let codec = Arc::new(BlobCodec::with_kdf_params(passphrase, config.kdf_params()));

        println!("Restoring from backend {} into {}", self.backend, self.target.display());
        println!("Note: hardlinks are restored as independent files");
        info!(backend = %self.backend, target = %self.target.display(), "Starting restore");

        let pb = super::spinner("Restoring files...");
        let report = Reconstructor::new(backend)
            .restore_all(
                &self.target,
                &codec,
                RestoreOptions {
                    overwrite: self.overwrite,
                },
            )
            .await?;
        pb.finish_with_message("Restore finished");

        println!(
            "Restored {} file(s) ({:.2} MB) and {} symlink(s); {} older version(s) skipped",
            report.files,
            report.bytes as f64 / 1024.0 / 1024.0,
            report.symlinks,
            report.superseded
        );
        if !report.skipped_existing.is_empty() {
            println!(
                "{} existing file(s) left untouched (use --overwrite to replace)",
                report.skipped_existing.len()
            );
        }
        for (path, error) in &report.failed {
            println!("  failed {}: {}", path, error);
        }

        if report.failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{} file(s) could not be restored", report.failed.len()))
        }
    }
}
