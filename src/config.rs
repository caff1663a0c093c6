use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where documents, backups and plugins live, and which optional steps run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Installation directory; nothing under it is ever written, read back or deleted.
    pub app_base_dir: Option<PathBuf>,
    pub enable_backups: bool,
    pub app_data_dir: PathBuf,
    pub enable_plugins: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            app_base_dir: std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf)),
            enable_backups: true,
            app_data_dir: dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("draw.io"),
            enable_plugins: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportConfig {
    pub capture_delay_ms: u64,
    pub large_capture_delay_ms: u64,
    /// Content area (in pixels) from which the long capture delay applies.
    pub large_image_area: u64,
    /// Content bounds below this (either side) mean the page rendered empty.
    pub min_content_size: f64,
    pub jpeg_quality: u8,
    pub creator: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            capture_delay_ms: 1000,
            large_capture_delay_ms: 5000,
            large_image_area: 30_000_000,
            min_content_size: 5.0,
            jpeg_quality: 90,
            creator: crate::pdf::DEFAULT_CREATOR.to_string(),
        }
    }
}

impl ExportConfig {
    /// Settle time before capturing a surface of `area` pixels.
    pub fn capture_delay(&self, area: u64) -> Duration {
        if area < self.large_image_area {
            Duration::from_millis(self.capture_delay_ms)
        } else {
            Duration::from_millis(self.large_capture_delay_ms)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub export: ExportConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    storage: Option<StorageFile>,
    export: Option<ExportFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct StorageFile {
    app_base_dir: Option<PathBuf>,
    enable_backups: Option<bool>,
    app_data_dir: Option<PathBuf>,
    enable_plugins: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ExportFile {
    capture_delay_ms: Option<u64>,
    large_capture_delay_ms: Option<u64>,
    large_image_area: Option<u64>,
    min_content_size: Option<f64>,
    jpeg_quality: Option<u8>,
    creator: Option<String>,
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    let Some(path) = path else {
        return Ok(config);
    };

    let contents = std::fs::read_to_string(path)?;
    let parsed: ConfigFile = serde_json::from_str(&contents)?;

    if let Some(storage) = parsed.storage {
        if let Some(v) = storage.app_base_dir {
            config.storage.app_base_dir = Some(v);
        }
        if let Some(v) = storage.enable_backups {
            config.storage.enable_backups = v;
        }
        if let Some(v) = storage.app_data_dir {
            config.storage.app_data_dir = v;
        }
        if let Some(v) = storage.enable_plugins {
            config.storage.enable_plugins = v;
        }
    }

    if let Some(export) = parsed.export {
        if let Some(v) = export.capture_delay_ms {
            config.export.capture_delay_ms = v;
        }
        if let Some(v) = export.large_capture_delay_ms {
            config.export.large_capture_delay_ms = v;
        }
        if let Some(v) = export.large_image_area {
            config.export.large_image_area = v;
        }
        if let Some(v) = export.min_content_size {
            config.export.min_content_size = v;
        }
        if let Some(v) = export.jpeg_quality {
            config.export.jpeg_quality = v.clamp(1, 100);
        }
        if let Some(v) = export.creator {
            config.export.creator = v;
        }
    }

    tracing::debug!(path = %path.display(), "loaded config");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_yields_defaults() {
        let config = load_config(None).unwrap();
        assert!(config.storage.enable_backups);
        assert!(!config.storage.enable_plugins);
        assert_eq!(config.export.jpeg_quality, 90);
        assert_eq!(config.export.creator, "diagrams.net");
        assert!(config.storage.app_data_dir.ends_with("draw.io"));
    }

    #[test]
    fn file_overrides_only_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.json");
        std::fs::write(
            &path,
            r#"{"storage":{"enableBackups":false,"appBaseDir":"/opt/app"},"export":{"captureDelayMs":0,"jpegQuality":250}}"#,
        )
        .unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert!(!config.storage.enable_backups);
        assert_eq!(config.storage.app_base_dir, Some(PathBuf::from("/opt/app")));
        assert_eq!(config.export.capture_delay_ms, 0);
        assert_eq!(config.export.large_capture_delay_ms, 5000);
        assert_eq!(config.export.jpeg_quality, 100);
    }

    #[test]
    fn large_areas_wait_longer() {
        let export = ExportConfig::default();
        assert_eq!(export.capture_delay(1_000), Duration::from_secs(1));
        assert_eq!(export.capture_delay(30_000_000), Duration::from_secs(5));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }
}
