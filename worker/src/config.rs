//! Configuration for the worker binary
//!
//! Settings come from an optional TOML file with serde-supplied defaults;
//! command-line flags override file values.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

fn default_name() -> String {
    format!("worker-{}", uuid::Uuid::new_v4())
}

fn default_listen_address() -> String {
    "0.0.0.0:5555".to_string()
}

fn default_store_backend() -> String {
    "memory".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

/// Worker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Logical worker name, used in logs and by the manager's node view.
    #[serde(default = "default_name")]
    pub name: String,
    /// Address the HTTP API listens on.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// "memory" or "sqlite".
    #[serde(default = "default_store_backend")]
    pub store_backend: String,
    /// Directory holding the durable store file.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            listen_address: default_listen_address(),
            store_backend: default_store_backend(),
            data_dir: default_data_dir(),
        }
    }
}

impl WorkerConfig {
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
        if self.name.is_empty() {
            anyhow::bail!("worker name cannot be empty");
        }
        self.listen_address
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("Invalid listen address '{}'", self.listen_address))?;
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

    #[test]
    fn test_defaults_validate() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.name.starts_with("worker-"));
        assert_eq!(config.store_backend, "memory");
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
name = "worker-1"
listen_address = "127.0.0.1:5556"
store_backend = "sqlite"
data_dir = "/tmp/worker-1"
"#
        )
        .unwrap();

        let config = WorkerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.name, "worker-1");
        assert_eq!(config.listen_address, "127.0.0.1:5556");
        assert_eq!(config.store_backend, "sqlite");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_backend_rejected() {
        let config = WorkerConfig {
            store_backend: "postgres".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_listen_address_rejected() {
        let config = WorkerConfig {
            listen_address: "not-an-address".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
