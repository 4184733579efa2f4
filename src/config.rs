use crate::models::collection::Collection;
use crate::models::depositor::Depositor;
use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::time::Duration;
use std::{env, fs, path::PathBuf};

/// Centralized application configuration.
/// Combines environment variables, CLI arguments, and the YAML service file.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub config_path: PathBuf,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "SWORD2-style deposit ingestion service")]
pub struct Args {
    /// Host to bind to (overrides DEPOSIT_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DEPOSIT_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Path to the YAML service configuration (overrides DEPOSIT_STORE_CONFIG)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("DEPOSIT_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("DEPOSIT_STORE_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing DEPOSIT_STORE_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading DEPOSIT_STORE_PORT"),
        };
        let env_config = env::var("DEPOSIT_STORE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| "config.yml".into());

        // --- Merge ---
        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            config_path: args.config.unwrap_or(env_config),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Service configuration loaded from the YAML file: collections, depositor
/// accounts, and finalization-scheduler tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Administrator contact surfaced in FAILED-deposit messages.
    pub email: String,

    /// Fixed delay before a rescheduled deposit is retried.
    #[serde(default = "default_reschedule_delay_seconds")]
    pub reschedule_delay_seconds: u64,

    /// Capacity of the finalizer event queue (the backpressure bound).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Size of the finalize worker pool.
    #[serde(default = "default_finalizer_workers")]
    pub finalizer_workers: usize,

    /// Size of the reschedule worker pool.
    #[serde(default = "default_rescheduler_workers")]
    pub rescheduler_workers: usize,

    pub collections: Vec<Collection>,

    #[serde(default)]
    pub users: Vec<Depositor>,
}

fn default_reschedule_delay_seconds() -> u64 {
    300
}

fn default_queue_capacity() -> usize {
    64
}

fn default_finalizer_workers() -> usize {
    2
}

fn default_rescheduler_workers() -> usize {
    1
}

impl ServiceConfig {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading service config {}", path.display()))?;
        let config: ServiceConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing service config {}", path.display()))?;

        if config.collections.is_empty() {
            anyhow::bail!("service config must define at least one collection");
        }
        Ok(config)
    }

    pub fn reschedule_delay(&self) -> Duration {
        Duration::from_secs(self.reschedule_delay_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_a_full_service_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
email: sword-admin@example.com
reschedule_delay_seconds: 30
collections:
  - name: collection1
    path: col1
    uploads: data/uploads
    deposits: data/deposits
    disk_space_margin: 1048576
    auto_clean: [INVALID, FAILED]
users:
  - name: user001
    filepath_mapping: true
    collections: [collection1]
"#
        )
        .unwrap();

        let config = ServiceConfig::load(file.path()).unwrap();
        assert_eq!(config.email, "sword-admin@example.com");
        assert_eq!(config.reschedule_delay(), Duration::from_secs(30));
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.collections.len(), 1);
        assert!(config.users[0].filepath_mapping);
    }

    #[test]
    fn rejects_a_config_without_collections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "email: a@b.c\ncollections: []\n").unwrap();
        assert!(ServiceConfig::load(file.path()).is_err());
    }
}
