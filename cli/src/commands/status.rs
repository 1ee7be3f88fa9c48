use super::OutputFormat;
use anyhow::Result;
use blobkeep_core::{ChangesetStatus, FileRecord};
use clap::Args;

#[derive(Args)]
pub struct StatusCommand {
    #[arg(long, help = "Show details for one changeset (id or unique prefix)")]
    changeset: Option<String>,

    #[arg(long, value_parser = parse_status, help = "Only list changesets in this state")]
    state: Option<ChangesetStatus>,

    #[arg(long, help = "List uploads claimed longer than the stuck threshold")]
    stuck: bool,

    #[arg(long, value_enum, default_value = "table", help = "Output format")]
    format: OutputFormat,
}

fn parse_status(s: &str) -> Result<ChangesetStatus, String> {
    s.parse().map_err(|e: blobkeep_core::Error| e.to_string())
}

impl StatusCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let config = cli.load_config()?;
        let manifest = super::open_manifest(&config).await?;

        if self.stuck {
            let stuck = manifest.stuck_uploads(manifest.stuck_threshold()).await?;
            return match self.format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&stuck)?);
                    Ok(())
                }
                OutputFormat::Table if stuck.is_empty() => {
                    println!("No stuck uploads");
                    Ok(())
                }
                OutputFormat::Table => {
                    println!("{:<12} {:<20} {}", "Changeset", "Claimed", "Path");
                    println!("{:-<80}", "");
                    for record in &stuck {
                        print_claim(record);
                    }
                    Ok(())
                }
            };
        }

        if let Some(id) = &self.changeset {
            let changeset_id = super::resolve_changeset(&manifest, id).await?;
            let report = manifest.report(&changeset_id).await?;
            if self.format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }

            let progress = &report.progress;
            println!("{}", report.changeset.summary());
            println!(
                "Canonical files: {} ({} records incl. hardlinks)",
                progress.canonical, progress.files
            );
            println!(
                "Finished: {}  In progress: {}  Failed: {}  Blocked: {}  Remaining: {}",
                progress.finished,
                progress.in_progress,
                progress.failed,
                progress.blocked,
                progress.remaining()
            );
            for record in &report.failing {
                println!(
                    "  {:<8} {}  {}",
                    record.hold.map(|h| h.as_str()).unwrap_or("-"),
                    record.path,
                    record.last_error.as_deref().unwrap_or("")
                );
            }
            for status in &report.failed_backends {
                println!(
                    "  backend {} lagging on {} (attempts: {}): {}",
                    status.backend,
                    status.storage_key.short_string(),
                    status.retry_count,
                    status.last_error.as_deref().unwrap_or("")
                );
            }
            return Ok(());
        }

        let changesets = manifest.list_changesets(self.state).await?;
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&changesets)?),
            OutputFormat::Table if changesets.is_empty() => println!("No changesets found"),
            OutputFormat::Table => {
                println!(
                    "{:<12} {:<20} {:<11} {:>7} {:>12} {}",
                    "ID", "Created", "Status", "Files", "Bytes", "Name"
                );
                println!("{:-<90}", "");
                for changeset in changesets {
                    println!(
                        "{:<12} {:<20} {:<11} {:>7} {:>12} {}",
                        changeset.short_id(),
                        changeset.created_at.format("%Y-%m-%d %H:%M:%S"),
                        changeset.status,
                        changeset.file_count,
                        changeset.total_size,
                        changeset.name
                    );
                }
            }
        }
        Ok(())
    }
}

fn print_claim(record: &FileRecord) {
    let claimed = record
        .upload_started_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();
    println!("{:<12} {:<20} {}", record.changeset_id.short_string(), claimed, record.path);
}
