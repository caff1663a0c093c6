//! User plugins stored under `<app data>/plugins/`.
//!
//! With plugins disabled every operation degrades to "nothing there" instead of failing.

use crate::config::StorageConfig;
use crate::error::{CoreError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

const PLUGINS_DIR: &str = "plugins";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledPlugin {
    pub plugin_name: String,
    /// Directory the plugin was picked from.
    pub sel_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PluginStore {
    enabled: bool,
    dir: PathBuf,
}

impl PluginStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self::with_dir(config.app_data_dir.join(PLUGINS_DIR), config.enable_plugins)
    }

    pub fn with_dir(dir: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            enabled,
            dir: dir.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Copies `source` into the plugins directory; `None` when plugins are disabled.
    pub async fn install(&self, source: &Path) -> Result<Option<InstalledPlugin>> {
        if !self.enabled {
            return Ok(None);
        }
        let name = source
            .file_name()
            .ok_or_else(|| {
                CoreError::io(
                    "install",
                    source,
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"),
                )
            })?
            .to_owned();

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CoreError::io("create", &self.dir, e))?;
        let target = self.dir.join(&name);
        if fs::try_exists(&target).await.unwrap_or(false) {
            return Err(CoreError::FileExists(target));
        }
        fs::copy(source, &target)
            .await
            .map_err(|e| CoreError::io("copy", source, e))?;
        info!(plugin = %target.display(), "installed plugin");

        Ok(Some(InstalledPlugin {
            plugin_name: name.to_string_lossy().into_owned(),
            sel_dir: crate::store::dirname(source),
        }))
    }

    /// Path of an installed plugin, provided the name stays inside the plugins directory.
    pub async fn plugin_file(&self, name: &str) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }
        let candidate = self.dir.join(name);
        let root = paths::normalize(&self.dir);
        let resolved = paths::normalize(&candidate);
        if resolved == root || !resolved.starts_with(&root) {
            return None;
        }
        fs::try_exists(&candidate)
            .await
            .unwrap_or(false)
            .then_some(candidate)
    }

    pub async fn uninstall(&self, name: &str) -> Result<()> {
        if let Some(file) = self.plugin_file(name).await {
            fs::remove_file(&file)
                .await
                .map_err(|e| CoreError::io("delete", &file, e))?;
            info!(plugin = %file.display(), "uninstalled plugin");
        }
        Ok(())
    }
}
