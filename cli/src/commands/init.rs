use crate::config::{BackendConfig, Config};
use anyhow::{Result, anyhow};
use clap::Args;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct InitCommand {
    #[arg(long, help = "Directory the manifest paths are relative to")]
    source_root: Option<PathBuf>,

    #[arg(long, help = "Directory for a local backend named 'local'")]
    local_path: Option<PathBuf>,

    #[arg(long, help = "Overwrite an existing configuration file")]
    force: bool,
}

impl InitCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let path = cli.config_path();
        if path.exists() && !self.force {
            return Err(anyhow!(
                "Configuration already exists at {} (use --force to overwrite)",
                path.display()
            ));
        }

        let mut config = Config::default();
        if let Some(manifest) = &cli.manifest {
            config.manifest = manifest.clone();
        }
        config.source_root = self.source_root.clone();
        if let Some(local) = &self.local_path {
            config.backends.push(BackendConfig::local("local", local));
        }
        config.validate()?;

        info!("Writing configuration to: {}", path.display());
        config.save(&path)?;

        let manifest = super::open_manifest(&config).await?;
        manifest.close().await;

        println!("Configuration written to {}", path.display());
        println!("Manifest created at {}", config.manifest.display());
        if config.backends.is_empty() {
            println!("No backends configured yet; add [[backends]] entries before pushing");
        }
        Ok(())
    }
}
