use super::OutputFormat;
use anyhow::{Result, anyhow};
use blobkeep_core::BlobCodec;
use blobkeep_engine::audit::{audit, repair};
use clap::Args;
use std::sync::Arc;

#[derive(Args)]
pub struct AuditCommand {
    #[arg(long, help = "Backend name from the configuration")]
    backend: String,

    #[arg(long, help = "Download and verify every committed blob (needs the passphrase)")]
    deep: bool,

    #[arg(long, help = "Invalidate missing and corrupt groups so they are uploaded again")]
    repair: bool,

    #[arg(long, value_enum, default_value = "table", help = "Output format")]
    format: OutputFormat,
}

impl AuditCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let config = cli.load_config()?;
        let manifest = super::open_manifest(&config).await?;
        let backend = config.backend(&self.backend)?.open().await?;
        let codec = if self.deep {
            Some(Arc::new(BlobCodec::with_kdf_params(cli.passphrase()?, config.kdf_params())))
        } else {
            None
        };

        let pb = super::spinner("Auditing backend...");
        let report = audit(&manifest, backend.as_ref(), codec.as_ref()).await?;
        pb.finish_and_clear();

        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            OutputFormat::Table => {
                println!(
                    "Backend {}: {} committed, {} stored{}",
                    report.backend,
                    report.committed,
                    report.stored,
                    if report.deep { ", deep" } else { "" }
                );
                println!("Missing:  {}", report.missing.len());
                for key in &report.missing {
                    println!("  {}", key);
                }
                println!("Orphaned: {}", report.orphaned.len());
                println!("Corrupt:  {}", report.corrupt.len());
                for (key, error) in &report.corrupt {
                    println!("  {}: {}", key, error);
                }
            }
        }

        if self.repair && !report.is_clean() {
            let reset = repair(&manifest, &report).await?;
            println!("Reset {} record(s); the next push or worker run re-uploads them", reset);
            return Ok(());
        }

        if report.is_clean() {
            Ok(())
        } else {
            Err(anyhow!("Audit found problems on backend {}", report.backend))
        }
    }
}
