use directories::ProjectDirs;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

use super::data::Config;
use crate::mcp::transport::McpTransportKind;

const CONFIG_FILE_NAME: &str = "concierge.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Loads configuration from an explicit path, the working directory, or the
/// platform config directory, in that order. A missing file yields the
/// defaults so the bot can still greet and refuse with zero servers.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let resolved = match path {
        Some(path) => Some(path.to_path_buf()),
        None => discover_config_path(),
    };

    let Some(resolved) = resolved else {
        warn!("no config file found; starting with defaults and no tool servers");
        return Ok(Config::default());
    };

    let contents = std::fs::read_to_string(&resolved)?;
    let config: Config = toml::from_str(&contents)?;
    validate(&config)?;
    Ok(config)
}

fn discover_config_path() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.is_file() {
        return Some(local);
    }
    let project_dirs = ProjectDirs::from("org", "permacommons", "concierge")?;
    let candidate = project_dirs.config_dir().join(CONFIG_FILE_NAME);
    candidate.is_file().then_some(candidate)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for server in &config.servers {
        if server.name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "server entries need a non-empty name".to_string(),
            ));
        }
        if !names.insert(server.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate server name: {}",
                server.name
            )));
        }
        McpTransportKind::from_config(server)
            .map_err(|err| ConfigError::Invalid(format!("server {}: {err}", server.name)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_config() {
        let config: Config = toml::from_str(
            r#"
            [oracle]
            base_url = "http://localhost:11434/v1"
            model = "llama3.2"

            [limits]
            large_result_chars = 1500

            [[servers]]
            name = "exchange"
            base_url = "http://localhost:8000/mcp"
            allowed_tools = ["get_price"]

            [servers.tool_hints]
            get_price = "Use full trading pairs, e.g. BTCUSDT."

            [[servers]]
            name = "files"
            transport = "stdio"
            command = "npx"
            args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
            "#,
        )
        .expect("config should parse");

        validate(&config).expect("config should validate");
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.limits.large_result_chars, 1500);
        assert_eq!(config.servers[0].allowed_tools, vec!["get_price"]);
        assert!(config.servers[0].tool_hints.contains_key("get_price"));
    }

    #[test]
    fn rejects_duplicate_server_names() {
        let config: Config = toml::from_str(
            r#"
            [[servers]]
            name = "alpha"
            command = "a"

            [[servers]]
            name = "alpha"
            command = "b"
            "#,
        )
        .expect("config should parse");

        assert!(matches!(validate(&config), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_servers_without_an_endpoint() {
        let config: Config = toml::from_str(
            r#"
            [[servers]]
            name = "alpha"
            "#,
        )
        .expect("config should parse");

        assert!(validate(&config).is_err());
    }

    #[test]
    fn defaults_apply_when_sections_are_missing() {
        let config: Config = toml::from_str("").expect("empty config should parse");
        assert_eq!(config.limits.large_result_chars, 2000);
        assert_eq!(config.limits.history_turns, 10);
        assert_eq!(config.oracle.api_key_env, "OPENAI_API_KEY");
        assert!(config.servers.is_empty());
    }
}
