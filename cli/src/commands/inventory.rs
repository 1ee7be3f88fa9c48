use super::OutputFormat;
use anyhow::Result;
use blobkeep_engine::Reconstructor;
use clap::Args;

#[derive(Args)]
pub struct InventoryCommand {
    #[arg(long, help = "Backend name from the configuration")]
    backend: String,

    #[arg(long, help = "Show only the newest blob per path")]
    latest: bool,

    #[arg(long, value_enum, default_value = "table", help = "Output format")]
    format: OutputFormat,
}

impl InventoryCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let config = cli.load_config()?;
        let backend = config.backend(&self.backend)?.open().await?;

        let pb = super::spinner("Reading blob metadata...");
        let inventory = Reconstructor::new(backend).reconstruct_metadata().await?;
        pb.finish_with_message(format!("{} blobs", inventory.blobs.len()));

        let blobs: Vec<_> = if self.latest {
            inventory.latest_by_path()
        } else {
            inventory.blobs.iter().collect()
        };

        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&blobs)?),
            OutputFormat::Table => {
                println!("{:<12} {:<20} {:<8} {:>12} {}", "Key", "Modified", "Type", "Size", "Path");
                println!("{:-<90}", "");
                for blob in &blobs {
                    let kind = if blob.metadata.blob_type.is_symlink() { "symlink" } else { "file" };
                    println!(
                        "{:<12} {:<20} {:<8} {:>12} {}",
                        blob.storage_key.short_string(),
                        blob.metadata.modified().format("%Y-%m-%d %H:%M:%S"),
                        kind,
                        blob.metadata.size,
                        blob.metadata.path
                    );
                }
                println!(
                    "{} blob(s), {:.2} MB of content",
                    blobs.len(),
                    inventory.total_size() as f64 / 1024.0 / 1024.0
                );
                for (key, error) in &inventory.unreadable {
                    println!("  unreadable {}: {}", key.short_string(), error);
                }
            }
        }
        Ok(())
    }
}
