use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// Proxy configuration. Every key is optional and falls back to its default.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub target_host: String,
    /// Backend ports, cycled through in order.
    pub target_port: Vec<u16>,
    /// Upper bound for a single read from either side of a connection.
    pub buffer_size: usize,
    /// Backend connect timeout. Unset means wait for the OS to give up.
    pub connect_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 80,
            target_host: "127.0.0.1".to_string(),
            target_port: vec![3000],
            buffer_size: 4096,
            connect_timeout_secs: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.target_port.is_empty() {
            bail!("target_port must list at least one backend port");
        }
        if self.target_port.contains(&0) {
            bail!("target_port must not contain port 0");
        }
        if self.buffer_size == 0 {
            bail!("buffer_size must be greater than zero");
        }
        Ok(())
    }

    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn target_addr(&self, port: u16) -> String {
        format!("{}:{}", self.target_host, port)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config as valid TOML")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Failed to load {}", path.display()))
}
