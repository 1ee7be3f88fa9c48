use anyhow::{Result, anyhow};
use blobkeep_engine::Reconstructor;
use clap::Args;

#[derive(Args)]
pub struct RebuildCommand {
    #[arg(long, help = "Backend name from the configuration")]
    backend: String,

    #[arg(long, help = "Name of the recovered changeset")]
    name: String,
}

impl RebuildCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("Changeset name must not be empty"));
        }
        let config = cli.load_config()?;
        let manifest = super::open_manifest(&config).await?;
        let backend = config.backend(&self.backend)?.open().await?;

        let pb = super::spinner("Reading blob metadata...");
        let report = Reconstructor::new(backend).rebuild_manifest(&manifest, &self.name).await?;
        pb.finish_and_clear();

        if report.created {
            println!(
                "Recorded changeset {} with {} file(s) from backend {}",
                report.changeset_id.short_string(),
                report.records,
                self.backend
            );
        } else {
            println!("Changeset {} was already in the manifest", report.changeset_id.short_string());
        }
        if !report.mismatched.is_empty() {
            println!("Skipped {} blob(s) stored under an unexpected key", report.mismatched.len());
        }
        Ok(())
    }
}
