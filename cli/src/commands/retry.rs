use anyhow::{Result, anyhow};
use blobkeep_core::Hold;
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct RetryCommand {
    #[arg(long, help = "Limit to one changeset (id or unique prefix)")]
    changeset: Option<String>,

    #[arg(long, help = "Release records held after exhausting retries or failing to encode")]
    failed: bool,

    #[arg(long, help = "Release records blocked by permanent backend errors")]
    blocked: bool,

    #[arg(long, help = "Push blobs again to backends that fell behind")]
    backends: bool,

    #[arg(long, help = "Return abandoned claims older than the stuck threshold")]
    stale: bool,

    #[arg(long, help = "Source root for --backends (defaults to source_root in config)")]
    source_root: Option<PathBuf>,
}

impl RetryCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        if !(self.failed || self.blocked || self.backends || self.stale) {
            return Err(anyhow!("Nothing to retry: pass --failed, --blocked, --backends and/or --stale"));
        }

        let config = cli.load_config()?;
        let manifest = super::open_manifest(&config).await?;
        let changeset_id = match &self.changeset {
            Some(id) => Some(super::resolve_changeset(&manifest, id).await?),
            None => None,
        };

        let hold = match (self.failed, self.blocked) {
            (true, true) => Some(None),
            (true, false) => Some(Some(Hold::Failed)),
            (false, true) => Some(Some(Hold::Blocked)),
            (false, false) => None,
        };
        if let Some(kind) = hold {
            let released = manifest.release_holds(changeset_id.as_ref(), kind).await?;
            println!("Released {} held record(s)", released);
        }

        if self.stale {
            let reset = manifest.reset_stale(manifest.stuck_threshold()).await?;
            println!("Reset {} stale claim(s)", reset);
        }

        if self.backends {
            let root = super::source_root(&config, self.source_root.as_deref())?;
            let passphrase = cli.passphrase()?;
            let coordinator = super::build_coordinator(&config, manifest.clone(), &root, passphrase).await?;
            let report = coordinator.retry_lagging_backends(changeset_id.as_ref()).await?;
            println!(
                "Lagging backends: {} attempted, {} recovered, {} still failing, {} group(s) committed",
                report.attempted, report.recovered, report.still_failing, report.committed
            );
        }
        Ok(())
    }
}
