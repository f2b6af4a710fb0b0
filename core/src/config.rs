use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ImageError, Result};

/// Environment variable overriding the store root.
pub const ROOT_ENV: &str = "A3S_IMAGE_ROOT";

/// Default cap on a single metadata entry (layer json, image json, manifest, repositories): 10 MiB.
pub const DEFAULT_MAX_METADATA_SIZE: u64 = 10 * 1024 * 1024;

/// Default capacity of the buffered archive writer: 128 KiB.
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 128 * 1024;

/// Image archive configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Root directory of the on-disk image store
    pub root: PathBuf,

    /// Upper bound for any metadata entry read from an archive
    pub max_metadata_size: u64,

    /// Buffer size used when streaming an archive to its destination
    pub copy_buffer_size: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            max_metadata_size: DEFAULT_MAX_METADATA_SIZE,
            copy_buffer_size: DEFAULT_COPY_BUFFER_SIZE,
        }
    }
}

impl ArchiveConfig {
    /// Load configuration: defaults, then the optional YAML file, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.with_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML configuration file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            ImageError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(serde_yaml::from_str(&data)?)
    }

    /// Apply environment overrides through `lookup`.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(ROOT_ENV).filter(|v| !v.is_empty()) {
            self.root = PathBuf::from(root);
        }
        self
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_metadata_size == 0 {
            return Err(ImageError::Config(
                "max_metadata_size must be greater than zero".to_string(),
            ));
        }
        if self.copy_buffer_size == 0 {
            return Err(ImageError::Config(
                "copy_buffer_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// `~/.a3s/images`, or `.a3s/images` when there is no home directory.
fn default_root() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".a3s"))
        .unwrap_or_else(|| PathBuf::from(".a3s"))
        .join("images")
}
