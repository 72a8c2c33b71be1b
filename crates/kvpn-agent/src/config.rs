//! TOML configuration, merged with CLI overrides in one validated place:
//! a file provides defaults, CLI flags override specific fields.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

fn default_listen() -> String {
    "127.0.0.1:1080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_retries() -> usize {
    1
}

fn default_max_fails() -> u32 {
    3
}

fn default_fail_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub chain: ChainSection,
    #[serde(default)]
    pub auth: AuthSection,
}

#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub device_name: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub knocking_host: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            device_name: None,
            log_level: default_log_level(),
            knocking_host: None,
        }
    }
}

impl Default for ChainSection {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            retries: default_retries(),
            max_fails: default_max_fails(),
            fail_timeout_secs: default_fail_timeout_secs(),
        }
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            chain: ChainSection::default(),
            auth: AuthSection::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChainSection {
    #[serde(default)]
    pub nodes: Vec<NodeSection>,
    #[serde(default = "default_retries")]
    pub retries: usize,
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,
    #[serde(default = "default_fail_timeout_secs")]
    pub fail_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NodeSection {
    pub address: String,
    /// One of "tcp", "tls", "ws", "kcp", "quic".
    pub transport: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct AuthSection {
    #[serde(default)]
    pub users: HashMap<String, String>,
}

/// Fully resolved configuration after merging the TOML file (if any) with
/// CLI overrides.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen: String,
    pub device_name: Option<String>,
    pub log_level: String,
    pub knocking_host: Option<String>,
    pub nodes: Vec<NodeSection>,
    pub retries: usize,
    pub max_fails: u32,
    pub fail_timeout_secs: u64,
    pub users: HashMap<String, String>,
}

impl AgentConfig {
    /// Loads `config_path` (expanding a leading `~`) if given, then applies
    /// CLI overrides on top. Every override is optional; absence means
    /// "keep whatever the file (or its own default) said."
    pub fn load(
        config_path: Option<&Path>,
        listen_override: Option<String>,
        log_level_override: Option<String>,
    ) -> anyhow::Result<Self> {
        let file = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                let contents = std::fs::read_to_string(&expanded).map_err(|e| {
                    anyhow::anyhow!("reading config {}: {e}", expanded.display())
                })?;
                toml::from_str(&contents)
                    .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", expanded.display()))?
            }
            None => ConfigFile::default(),
        };

        Ok(Self {
            listen: listen_override.unwrap_or(file.server.listen),
            device_name: file.server.device_name,
            log_level: log_level_override.unwrap_or(file.server.log_level),
            knocking_host: file.server.knocking_host,
            nodes: file.chain.nodes,
            retries: file.chain.retries,
            max_fails: file.chain.max_fails,
            fail_timeout_secs: file.chain.fail_timeout_secs,
            users: file.auth.users,
        })
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let as_str = path.to_string_lossy();
    if let Some(rest) = as_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_with_no_config_file() {
        let config = AgentConfig::load(None, None, None).unwrap();
        assert_eq!(config.listen, "127.0.0.1:1080");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.retries, 1);
        assert_eq!(config.max_fails, 3);
        assert!(config.nodes.is_empty());
    }

    #[test]
    fn cli_overrides_win_over_defaults() {
        let config = AgentConfig::load(
            None,
            Some("0.0.0.0:9999".to_string()),
            Some("debug".to_string()),
        )
        .unwrap();
        assert_eq!(config.listen, "0.0.0.0:9999");
        assert_eq!(config.log_level, "debug");
    }
}
