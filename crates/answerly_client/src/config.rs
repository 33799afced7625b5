//! Client config load/save for `~/.answerly/config.yaml`.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Endpoint used when the config names none.
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8000/ws/chat";

/// Server section. `url` wins; otherwise the URL is built from host/port/path.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ServerSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
}

impl Config {
    /// WebSocket URL of the answer service.
    pub fn endpoint(&self) -> String {
        let server = &self.server;
        if let Some(url) = server.url.as_deref().filter(|u| !u.trim().is_empty()) {
            return url.to_string();
        }
        if server.host.is_none() && server.port.is_none() && server.path.is_none() {
            return DEFAULT_ENDPOINT.to_string();
        }
        let host = server.host.as_deref().unwrap_or("localhost");
        let port = server.port.unwrap_or(8000);
        let path = server.path.as_deref().unwrap_or("/ws/chat");
        let path = path.strip_prefix('/').unwrap_or(path);
        format!("ws://{}:{}/{}", host, port, path)
    }
}

/// Returns the default config file path: `~/.answerly/config.yaml` (platform-specific).
pub fn default_config_path() -> Option<PathBuf> {
    let home = home_dir()?;
    Some(home.join(".answerly").join("config.yaml"))
}

#[cfg(unix)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(windows)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE").map(PathBuf::from)
}

#[cfg(not(any(unix, windows)))]
fn home_dir() -> Option<PathBuf> {
    None
}

/// Load config from a YAML file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(serde_yaml::from_str(&contents)?)
}

/// Load from `path` if it exists, otherwise return defaults.
pub fn load_or_default(path: &Path) -> Result<Config, ConfigError> {
    if path.exists() {
        load(path)
    } else {
        Ok(Config::default())
    }
}

/// Save config to a YAML file. Creates parent directory if missing.
pub fn save(path: &Path, config: &Config) -> Result<(), ConfigError> {
    let io_err = |e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    };
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    std::fs::write(path, contents).map_err(io_err)
}

/// Config load/save error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_default_endpoint() {
        assert_eq!(Config::default().endpoint(), DEFAULT_ENDPOINT);
    }

    #[test]
    fn explicit_url_wins() {
        let cfg: Config = serde_yaml::from_str(
            "server:\n  url: wss://answers.example.com/ws/chat\n  port: 9999\n",
        )
        .unwrap();
        assert_eq!(cfg.endpoint(), "wss://answers.example.com/ws/chat");
    }

    #[test]
    fn endpoint_from_parts() {
        let cfg: Config = serde_yaml::from_str("server:\n  port: 8123\n").unwrap();
        assert_eq!(cfg.endpoint(), "ws://localhost:8123/ws/chat");

        let cfg: Config =
            serde_yaml::from_str("server:\n  host: 10.0.0.2\n  path: chat\n").unwrap();
        assert_eq!(cfg.endpoint(), "ws://10.0.0.2:8000/chat");
    }
}
