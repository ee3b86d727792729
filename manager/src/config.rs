//! Configuration for the manager binary
//!
//! Settings come from an optional TOML file with serde-supplied defaults;
//! command-line flags override file values.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

fn default_listen_address() -> String {
    "0.0.0.0:5554".to_string()
}

fn default_scheduler() -> String {
    "epvm".to_string()
}

fn default_store_backend() -> String {
    "memory".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

/// Manager settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Address the HTTP API listens on.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Worker addresses in `host:port` form.
    #[serde(default)]
    pub workers: Vec<String>,
    /// "roundrobin" or "epvm".
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    /// "memory" or "sqlite".
    #[serde(default = "default_store_backend")]
    pub store_backend: String,
    /// Directory holding the durable store files.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            workers: Vec::new(),
            scheduler: default_scheduler(),
            store_backend: default_store_backend(),
            data_dir: default_data_dir(),
        }
    }
}

impl ManagerConfig {
    /// Load from a TOML file, or start from defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                toml::from_str(&content).with_context(|| {
                    format!("Failed to parse {} - TOML syntax error", path.display())
                })?
            }
            None => Self::default(),
        };
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_address
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("Invalid listen address '{}'", self.listen_address))?;
        if self.workers.is_empty() {
            anyhow::bail!("at least one worker address is required");
        }
        for worker in &self.workers {
            let mut parts = worker.split(':');
            let host = parts.next().unwrap_or_default();
            let port = parts.next().unwrap_or_default();
            if host.is_empty() || port.parse::<u16>().is_err() {
                anyhow::bail!("invalid worker address '{}' (expected host:port)", worker);
            }
        }
        if self.scheduler != "roundrobin"
            && self.scheduler != "round-robin"
            && self.scheduler != "epvm"
        {
            anyhow::bail!(
                "unknown scheduler '{}' (expected 'roundrobin' or 'epvm')",
                self.scheduler
            );
        }
        if self.store_backend != "memory" && self.store_backend != "sqlite" {
            anyhow::bail!(
                "unknown store backend '{}' (expected 'memory' or 'sqlite')",
                self.store_backend
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn with_workers() -> ManagerConfig {
        ManagerConfig {
            workers: vec!["127.0.0.1:5555".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_need_workers() {
        assert!(ManagerConfig::default().validate().is_err());
        assert!(with_workers().validate().is_ok());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
listen_address = "127.0.0.1:5554"
workers = ["127.0.0.1:5555", "127.0.0.1:5556"]
scheduler = "roundrobin"
store_backend = "sqlite"
"#
        )
        .unwrap();

        let config = ManagerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.workers.len(), 2);
        assert_eq!(config.scheduler, "roundrobin");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_worker_address_rejected() {
        let config = ManagerConfig {
            workers: vec!["nonsense".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_scheduler_rejected() {
        let config = ManagerConfig {
            scheduler: "random".to_string(),
            ..with_workers()
        };
        assert!(config.validate().is_err());
    }
}
