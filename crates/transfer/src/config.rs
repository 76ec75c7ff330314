//! Transfer configuration.
//!
//! Stored as camelCase JSON, by default at
//! `~/.config/chunkup/config.json`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::UploadError;

/// On-disk config format. Every field is optional so partial files load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scratch_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default_target_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sync_writes: Option<bool>,
}

/// Settings for an [`UploadManager`](crate::UploadManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Directory holding one subdirectory per session.
    pub scratch_root: PathBuf,
    /// Base directory for targets derived from original file names.
    pub default_target_dir: PathBuf,
    /// Flush chunk, metadata and target files to stable storage before
    /// acknowledging. Turning this off trades durability for speed.
    pub sync_writes: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        let data = data_base_dir().join("chunkup");
        Self {
            scratch_root: data.join("scratch"),
            default_target_dir: data.join("files"),
            sync_writes: true,
        }
    }
}

impl TransferConfig {
    /// Config rooted at `base`: `<base>/scratch` and `<base>/files`.
    pub fn in_dir(base: &Path) -> Self {
        Self {
            scratch_root: base.join("scratch"),
            default_target_dir: base.join("files"),
            sync_writes: true,
        }
    }

    /// Loads configuration from the default location.
    pub fn load() -> Result<Self, UploadError> {
        Self::load_from(&config_file_path())
    }

    /// Loads configuration from `path`.
    ///
    /// A missing file yields defaults. A malformed file is logged and also
    /// yields defaults, so a bad edit never blocks recovery of uploads.
    pub fn load_from(path: &Path) -> Result<Self, UploadError> {
        let mut config = Self::default();
        if !path.exists() {
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<ConfigFile>(&content) {
            Ok(file) => {
                if let Some(root) = file.scratch_root {
                    config.scratch_root = root;
                }
                if let Some(dir) = file.default_target_dir {
                    config.default_target_dir = dir;
                }
                if let Some(sync) = file.sync_writes {
                    config.sync_writes = sync;
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse transfer config, using defaults"
                );
            }
        }
        Ok(config)
    }

    /// Saves configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), UploadError> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        let file = ConfigFile {
            scratch_root: Some(self.scratch_root.clone()),
            default_target_dir: Some(self.default_target_dir.clone()),
            sync_writes: Some(self.sync_writes),
        };
        let json = serde_json::to_vec_pretty(&file)?;
        crate::store::write_atomic(&parent, path, &json, false)?;

        tracing::debug!(path = %path.display(), "transfer configuration saved");
        Ok(())
    }
}

/// Default config file location.
pub fn config_file_path() -> PathBuf {
    home_dir().join(".config").join("chunkup").join("config.json")
}

fn data_base_dir() -> PathBuf {
    home_dir().join(".local").join("share")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = TransferConfig::load_from(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, TransferConfig::default());
        assert!(config.sync_writes);
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = TransferConfig {
            sync_writes: false,
            ..TransferConfig::in_dir(dir.path())
        };
        config.save_to(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["syncWrites"], false);
        assert!(raw["scratchRoot"].is_string());

        assert_eq!(TransferConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"scratchRoot": "/srv/scratch"}"#).unwrap();

        let config = TransferConfig::load_from(&path).unwrap();
        assert_eq!(config.scratch_root, PathBuf::from("/srv/scratch"));
        assert_eq!(
            config.default_target_dir,
            TransferConfig::default().default_target_dir
        );
        assert!(config.sync_writes);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "scratchRoot = nope").unwrap();
        assert_eq!(
            TransferConfig::load_from(&path).unwrap(),
            TransferConfig::default()
        );
    }
}
