//! User configuration, read from `~/.qmk-gui/config.toml`.
//!
//! ```toml
//! [clangd]
//! command = "/opt/llvm/bin/clangd"
//! args = ["--limit-results=0", "--background-index"]
//! request_timeout_secs = 60
//! ```

use std::path::{Path, PathBuf};

use qmk_lsp::ClangdConfig;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct QmkConfig {
    #[serde(default)]
    pub clangd: ClangdConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl QmkConfig {
    /// Load the user config. A missing file (or home directory) means
    /// defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".qmk-gui").join("config.toml"))
}
