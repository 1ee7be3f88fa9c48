mod commands;
mod config;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use commands::{
    audit::AuditCommand, init::InitCommand, inventory::InventoryCommand, pull::PullCommand, push::PushCommand,
    rebuild::RebuildCommand, retry::RetryCommand, status::StatusCommand, worker::WorkerCommand,
};
use config::Config;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "blobkeep",
    about = "Deduplicating, encrypted blob uploads to redundant storage",
    long_about = "Blobkeep records changesets of files in a local manifest and uploads each \
                  distinct file once, encrypted, to one or more storage backends"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, env = "BLOBKEEP_CONFIG", global = true, help = "Configuration file")]
    config: Option<PathBuf>,

    #[arg(long, env = "BLOBKEEP_MANIFEST", global = true, help = "Manifest database (overrides config)")]
    manifest: Option<PathBuf>,

    #[arg(long, env = "BLOBKEEP_PASSPHRASE", global = true, hide_env_values = true, help = "Encryption passphrase")]
    passphrase: Option<String>,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Write a configuration file and create the manifest")]
    Init(InitCommand),

    #[command(about = "Scan a directory, record a changeset and upload it")]
    Push(PushCommand),

    #[command(about = "Show changesets, their progress and stuck uploads")]
    Status(StatusCommand),

    #[command(about = "Process pending changesets until interrupted")]
    Worker(WorkerCommand),

    #[command(about = "Return held records to the queue or catch up lagging backends")]
    Retry(RetryCommand),

    #[command(about = "List blobs on a backend from their plaintext metadata")]
    Inventory(InventoryCommand),

    #[command(about = "Restore files from a backend without the manifest")]
    Pull(PullCommand),

    #[command(about = "Compare the manifest with a backend's contents")]
    Audit(AuditCommand),

    #[command(about = "Recreate manifest rows from a backend's contents")]
    Rebuild(RebuildCommand),
}

impl Cli {
    pub fn load_config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        if let Some(manifest) = &self.manifest {
            config.manifest = manifest.clone();
        }
        debug!(manifest = %config.manifest.display(), backends = config.backends.len(), "Loaded configuration");
        Ok(config)
    }

    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_path)
    }

    pub fn passphrase(&self) -> Result<String> {
        self.passphrase
            .clone()
            .or_else(|| {
                print!("Enter passphrase: ");
                io::stdout().flush().ok()?;
                rpassword::read_password().ok()
            })
            .filter(|p| !p.is_empty())
            .ok_or_else(|| anyhow!("Passphrase required (--passphrase or BLOBKEEP_PASSPHRASE)"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet)?;

    match cli.command {
        Commands::Init(ref cmd) => cmd.run(&cli).await,
        Commands::Push(ref cmd) => cmd.run(&cli).await,
        Commands::Status(ref cmd) => cmd.run(&cli).await,
        Commands::Worker(ref cmd) => cmd.run(&cli).await,
        Commands::Retry(ref cmd) => cmd.run(&cli).await,
        Commands::Inventory(ref cmd) => cmd.run(&cli).await,
        Commands::Pull(ref cmd) => cmd.run(&cli).await,
        Commands::Audit(ref cmd) => cmd.run(&cli).await,
        Commands::Rebuild(ref cmd) => cmd.run(&cli).await,
    }
}

fn init_tracing(verbose: bool, quiet: bool) -> Result<()> {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "blobkeep={level},blobkeep_core={level},blobkeep_backends={level},blobkeep_engine={level}"
        ))
    });
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();

    tracing::subscriber::set_global_default(subscriber).map_err(|e| anyhow!("Setting default subscriber failed: {e}"))
}
