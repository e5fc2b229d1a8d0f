use anyhow::Context;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use ws_bridge::{BridgeConfig, Endpoint, ProxyEndpoint, ProxyPolicy};

use crate::cli::Cli;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    /// HTTP proxy URL. Unset means the proxy comes from the environment.
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            proxy: None,
            handshake_timeout: default_handshake_timeout(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_host() -> String {
    BridgeConfig::DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    BridgeConfig::DEFAULT_PORT
}

fn default_handshake_timeout() -> Duration {
    BridgeConfig::DEFAULT_HANDSHAKE_TIMEOUT
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// Returns `Ok(None)` if the file does not exist; the caller falls back to
/// defaults and warns once logging is up.
pub fn load(path: &Path) -> anyhow::Result<Option<Config>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    let config: Config = serde_yml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    Ok(Some(config))
}

impl Config {
    /// Merge command line overrides into this configuration and validate the
    /// server and proxy URLs.
    pub fn bridge_config(&self, cli: &Cli) -> anyhow::Result<BridgeConfig> {
        let target = Endpoint::parse(&cli.url)
            .with_context(|| format!("failed to parse '{}'", cli.url))?;

        let proxy = match cli.proxy.as_deref().or(self.proxy.as_deref()) {
            Some(url) => ProxyPolicy::Explicit(
                ProxyEndpoint::parse(url).with_context(|| format!("failed to parse '{url}'"))?,
            ),
            None => ProxyPolicy::Environment,
        };

        let mut config = BridgeConfig::new(target);
        config.listen_host = cli.host.clone().unwrap_or_else(|| self.listen.host.clone());
        config.listen_port = cli.port.unwrap_or(self.listen.port);
        config.handshake_timeout = cli.handshake_timeout.unwrap_or(self.handshake_timeout);
        config.proxy = proxy;
        Ok(config)
    }

    /// Log filter, with the command line taking precedence.
    pub fn log_level<'a>(&'a self, cli: &'a Cli) -> &'a str {
        cli.log_level.as_deref().unwrap_or(&self.logging.level)
    }
}
