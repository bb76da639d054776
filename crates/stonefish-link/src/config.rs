//! Configuration loading from `stonefish.toml` with defaults.

use crate::auth::AuthPolicy;
use crate::transport::MAX_MESSAGE_SIZE;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "stonefish.toml";

/// Settings for a link node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Address the node listens on.
    pub listen_addr: SocketAddr,
    /// Largest frame accepted or sent, in bytes.
    pub max_message_size: u32,
    /// Reject named functions in incoming programs even after authentication.
    pub secure_resolvables: bool,
    /// How incoming `Authenticate` requests are decided.
    pub auth: AuthPolicy,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_message_size: MAX_MESSAGE_SIZE,
            secure_resolvables: false,
            auth: AuthPolicy::default(),
        }
    }
}

/// Load configuration from a TOML file, falling back to defaults.
pub fn load_config(path: Option<&Path>) -> LinkConfig {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return LinkConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<LinkConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                LinkConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            LinkConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_missing_file() {
        let config = load_config(Some(Path::new("/nonexistent/stonefish.toml")));
        assert_eq!(config, LinkConfig::default());
        assert_eq!(config.auth, AuthPolicy::DenyAll);
        assert_eq!(config.max_message_size, MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_load_config_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stonefish.toml");
        std::fs::write(
            &path,
            r#"
            listen_addr = "127.0.0.1:7400"
            secure_resolvables = true

            [auth]
            policy = "key_match"
            key = "secret"
            "#,
        )
        .unwrap();

        let config = load_config(Some(&path));
        assert_eq!(config.listen_addr.port(), 7400);
        assert!(config.secure_resolvables);
        assert_eq!(config.max_message_size, MAX_MESSAGE_SIZE);
        assert_eq!(
            config.auth,
            AuthPolicy::KeyMatch {
                key: "secret".to_string()
            }
        );
    }

    #[test]
    fn test_load_config_invalid_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stonefish.toml");
        std::fs::write(&path, "listen_addr = 12\n[auth]\npolicy = \"nope\"\n").unwrap();
        assert_eq!(load_config(Some(&path)), LinkConfig::default());
    }
}
