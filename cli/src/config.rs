use anyhow::{Context, Result, anyhow};
use blobkeep_backends::{Backend, LocalBackend, RetryConfig, S3Backend, S3Config};
use blobkeep_core::KdfParams;
use blobkeep_core::manifest::DEFAULT_STUCK_THRESHOLD_SECS;
use blobkeep_engine::coordinator::{DEFAULT_BACKEND_CONCURRENCY, DEFAULT_BATCH_SIZE, DEFAULT_CONCURRENCY};
use blobkeep_engine::{BackendSlot, CoordinatorConfig, LaggingBackendPolicy};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite manifest database.
    pub manifest: PathBuf,
    /// Directory manifest paths are relative to.
    pub source_root: Option<PathBuf>,
    pub upload: UploadConfig,
    pub kdf: KdfConfig,
    pub backends: Vec<BackendConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manifest: data_dir().join("manifest.db"),
            source_root: None,
            upload: UploadConfig::default(),
            kdf: KdfConfig::default(),
            backends: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub batch_size: u32,
    pub concurrency: usize,
    pub backend_concurrency: usize,
    pub stuck_threshold_secs: i64,
    /// Backends that must hold a blob before it counts as committed. All when unset.
    pub require_minimum_backends: Option<usize>,
    pub lagging_backends: LaggingBackendPolicy,
    pub degraded_after_failures: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            backend_concurrency: DEFAULT_BACKEND_CONCURRENCY,
            stuck_threshold_secs: DEFAULT_STUCK_THRESHOLD_SECS,
            require_minimum_backends: None,
            lagging_backends: LaggingBackendPolicy::default(),
            degraded_after_failures: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    pub iterations: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            iterations: KdfParams::default().iterations,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: BackendKind,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendKind {
    Local { path: PathBuf },
    S3(S3Config),
}

fn default_max_attempts() -> u32 {
    RetryConfig::default().max_attempts
}

fn default_initial_backoff_ms() -> u64 {
    RetryConfig::default().initial_backoff.as_millis() as u64
}

fn default_max_backoff_ms() -> u64 {
    RetryConfig::default().max_backoff.as_millis() as u64
}

impl BackendConfig {
    pub fn local(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind: BackendKind::Local { path: path.into() },
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            ..RetryConfig::default()
        }
    }

    pub async fn open(&self) -> Result<Arc<dyn Backend>> {
        let backend: Arc<dyn Backend> = match &self.kind {
            BackendKind::Local { path } => Arc::new(LocalBackend::new(&self.name, path)),
            BackendKind::S3(s3) => Arc::new(S3Backend::new(&self.name, s3.clone()).await?),
        };
        Ok(backend)
    }

    pub async fn slot(&self) -> Result<BackendSlot> {
        Ok(BackendSlot::new(self.open().await?).with_retry(self.retry()))
    }
}

impl Config {
    pub fn default_path() -> PathBuf {
        ProjectDirs::from("", "", "blobkeep")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
    }

    /// Read `path`, or the default location. A missing default file yields
    /// the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (Self::default_path(), false),
        };
        if !path.exists() {
            if explicit {
                return Err(anyhow!("Config file not found: {}", path.display()));
            }
            return Ok(Self::default());
        }

        let contents =
            std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config =
            toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = std::collections::HashSet::new();
        for backend in &self.backends {
            if !names.insert(backend.name.as_str()) {
                return Err(anyhow!("Duplicate backend name: {}", backend.name));
            }
        }
        if let Some(quorum) = self.upload.require_minimum_backends {
            if quorum == 0 || quorum > self.backends.len() {
                return Err(anyhow!(
                    "require_minimum_backends = {} but {} backend(s) are configured",
                    quorum,
                    self.backends.len()
                ));
            }
        }
        if self.kdf.iterations == 0 {
            return Err(anyhow!("kdf.iterations must be positive"));
        }
        Ok(())
    }

    pub fn backend(&self, name: &str) -> Result<&BackendConfig> {
        self.backends
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| anyhow!("No backend named '{}' in configuration", name))
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            batch_size: self.upload.batch_size,
            concurrency: self.upload.concurrency,
            backend_concurrency: self.upload.backend_concurrency,
            require_minimum_backends: self.upload.require_minimum_backends,
            lagging_backends: self.upload.lagging_backends,
            kdf: self.kdf_params(),
        }
    }

    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            iterations: self.kdf.iterations,
        }
    }

    pub fn stuck_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.upload.stuck_threshold_secs)
    }
}

fn data_dir() -> PathBuf {
    ProjectDirs::from("", "", "blobkeep")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".blobkeep"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
                manifest = "/var/lib/blobkeep/manifest.db"
                source_root = "/srv/data"

                [upload]
                batch_size = 16
                require_minimum_backends = 1
                lagging_backends = "automatic"

                [kdf]
                iterations = 200000

                [[backends]]
                name = "disk"
                kind = "local"
                path = "/mnt/backup"

                [[backends]]
                name = "offsite"
                kind = "s3"
                bucket = "blobs"
                prefix = "host-a"
                endpoint = "http://minio:9000"
                path_style = true
                max_attempts = 8
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.upload.batch_size, 16);
        assert_eq!(config.upload.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.upload.lagging_backends, LaggingBackendPolicy::Automatic);
        assert_eq!(config.kdf_params().iterations, 200_000);
        assert!(matches!(config.backend("disk").unwrap().kind, BackendKind::Local { .. }));

        let offsite = config.backend("offsite").unwrap();
        let BackendKind::S3(s3) = &offsite.kind else {
            panic!("expected s3 backend");
        };
        assert_eq!(s3.bucket, "blobs");
        assert!(s3.path_style);
        assert_eq!(offsite.retry().max_attempts, 8);
        assert_eq!(offsite.retry().initial_backoff, Duration::from_millis(500));
    }

    #[test]
    fn test_defaults_and_roundtrip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.backends.push(BackendConfig::local("disk", dir.path().join("blobs")));
        config.save(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.backends.len(), 1);
        assert_eq!(loaded.kdf.iterations, 100_000);
        assert_eq!(loaded.upload.stuck_threshold_secs, 3600);
        assert!(Config::load(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_rejects_unreachable_quorum() {
        let mut config = Config::default();
        config.backends.push(BackendConfig::local("a", "/tmp/a"));
        config.upload.require_minimum_backends = Some(2);
        assert!(config.validate().is_err());

        config.backends.push(BackendConfig::local("a", "/tmp/b"));
        assert!(config.validate().is_err());
    }
}
