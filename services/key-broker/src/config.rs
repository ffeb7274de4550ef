//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Key secrets are never stored in the TOML: each `[[keys]]` entry names an
//! environment variable (`key_env`) or a file (`key_file`) holding the value.

use common::Secret;
use key_pool::CredentialConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// CORS origins allowed to call the broker. Empty allows any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// One upstream key, in priority order.
#[derive(Debug, Deserialize)]
pub struct KeyConfig {
    /// Downstream model name returned alongside the key
    pub label: String,
    pub rpm: u32,
    pub rpd: u32,
    /// Environment variable holding the key
    #[serde(default)]
    pub key_env: Option<String>,
    /// File holding the key (alternative to key_env)
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(skip)]
    pub key: Option<Secret<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
            allowed_origins: Vec::new(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

fn default_max_connections() -> usize {
    1000
}

impl Config {
    /// Load configuration from a TOML file and resolve every key secret.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        for origin in &config.server.allowed_origins {
            if !origin.starts_with("http://") && !origin.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "allowed_origins entries must start with http:// or https://, got: {origin}"
                )));
            }
        }

        if config.keys.is_empty() {
            return Err(common::Error::Config(
                "at least one [[keys]] entry is required".into(),
            ));
        }

        for (index, key) in config.keys.iter_mut().enumerate() {
            if key.label.trim().is_empty() {
                return Err(common::Error::Config(format!(
                    "key #{index} has an empty label"
                )));
            }
            key.key = Some(resolve_secret(index, key)?);
        }

        Ok(config)
    }

    /// Pool construction input, in file order.
    pub fn credentials(&self) -> common::Result<Vec<CredentialConfig>> {
        self.keys
            .iter()
            .enumerate()
            .map(|(index, key)| {
                let identity = key.key.clone().ok_or_else(|| common::Error::Secret {
                    index,
                    reason: "secret was not resolved".into(),
                })?;
                Ok(CredentialConfig {
                    identity,
                    label: key.label.clone(),
                    rpm_limit: key.rpm,
                    rpd_limit: key.rpd,
                })
            })
            .collect()
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("key-broker.toml")
    }
}

/// Read one key from its env var or file. Exactly one source must be set.
fn resolve_secret(index: usize, key: &KeyConfig) -> common::Result<Secret<String>> {
    let raw = match (&key.key_env, &key.key_file) {
        (Some(var), None) => std::env::var(var).map_err(|_| common::Error::Secret {
            index,
            reason: format!("environment variable {var} is not set"),
        })?,
        (None, Some(path)) => {
            std::fs::read_to_string(path).map_err(|e| common::Error::Secret {
                index,
                reason: format!("failed to read key_file {}: {e}", path.display()),
            })?
        }
        _ => {
            return Err(common::Error::Config(format!(
                "key #{index} must set exactly one of key_env or key_file"
            )));
        }
    };

    let value = raw.trim().to_owned();
    if value.is_empty() {
        return Err(common::Error::Secret {
            index,
            reason: "key is empty".into(),
        });
    }
    Ok(Secret::new(value))
}
