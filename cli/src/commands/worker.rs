use anyhow::{Result, anyhow};
use blobkeep_engine::{StatsSummary, Worker, WorkerConfig};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Args)]
pub struct WorkerCommand {
    #[arg(long, help = "Source root (defaults to source_root in config)")]
    source_root: Option<PathBuf>,

    #[arg(long, default_value_t = 1, help = "Workers to run in this process")]
    workers: usize,

    #[arg(long, default_value_t = 5, help = "Initial idle sleep in seconds")]
    idle_secs: u64,

    #[arg(long, default_value_t = 60, help = "Seconds between statistics log lines")]
    stats_secs: u64,
}

impl WorkerCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        if self.workers == 0 {
            return Err(anyhow!("--workers must be at least 1"));
        }

        let config = cli.load_config()?;
        let root = super::source_root(&config, self.source_root.as_deref())?;
        let passphrase = cli.passphrase()?;
        let manifest = super::open_manifest(&config).await?;
        let coordinator = Arc::new(super::build_coordinator(&config, manifest, &root, passphrase).await?);

        let reset = coordinator.manifest().reset_stale(config.stuck_threshold()).await?;
        if reset > 0 {
            info!(reset, "Returned abandoned claims to the queue");
        }

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let worker_config = WorkerConfig {
            idle_sleep: Duration::from_secs(self.idle_secs.max(1)),
            stats_interval: Duration::from_secs(self.stats_secs.max(1)),
            ..WorkerConfig::default()
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let id = format!("{host}-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
            let worker = Worker::new(id, coordinator.clone(), worker_config.clone());
            let rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move { worker.run(rx).await }));
        }
        println!("Started {} worker(s); press Ctrl-C to stop", self.workers);

        tokio::signal::ctrl_c().await?;
        info!("Shutdown requested");
        let _ = shutdown_tx.send(true);

        let mut last: Option<StatsSummary> = None;
        for handle in handles {
            match handle.await {
                Ok(summary) => last = Some(summary),
                Err(e) => warn!(error = %e, "Worker task panicked"),
            }
        }
        if let Some(summary) = last {
            println!("{}", summary);
        }
        coordinator.manifest().close().await;
        Ok(())
    }
}
