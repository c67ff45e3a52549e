//! Configuration for a bitswap node.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{client, network::SenderConfig, server};

/// Settings for all parts of a [`crate::Bitswap`] node.
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client: client::Config,
    pub server: server::Config,
    pub sender: SenderConfig,
}

impl Config {
    /// Load the config from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config> {
        let s = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("failed to read {}", path.as_ref().to_string_lossy()))?;
        let config: Config = toml::from_str(&s)?;
        Ok(config)
    }
}
