//! Renderer Configuration
//!
//! Every option has a default, so an empty JSON object is a valid config.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::templates::DocumentTemplate;
use crate::validation::default_blacklist;

/// Socket file name used when no explicit rendezvous address is configured.
pub const DEFAULT_SOCKET_NAME: &str = "formula-renderer.sock";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Program names for the three external stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolCommands {
    pub latex: String,
    pub dvips: String,
    pub convert: String,
}

impl Default for ToolCommands {
    fn default() -> Self {
        Self {
            latex: "latex".to_string(),
            dvips: "dvips".to_string(),
            convert: "convert".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Artifact output directory.
    pub image_dir: PathBuf,
    /// Root under which per-attempt workspaces are created.
    pub temp_dir: PathBuf,
    /// Artifact extension, also handed to the rasterizer as output format.
    pub image_format: String,
    /// Pass-through options for the raster stage, split on whitespace.
    pub convert_options: String,
    /// Keep failed workspaces for inspection.
    pub debug: bool,
    pub blacklist: Vec<String>,
    /// Rendezvous socket path. Defaults to a socket under `temp_dir`.
    pub service_address: Option<PathBuf>,
    /// Worker exits after this long with an empty queue. `None` keeps it alive.
    pub idle_timeout_ms: Option<u64>,
    pub poll_interval_ms: u64,
    /// Upper bound on how long `result` waits. `None` waits for the worker.
    pub result_timeout_ms: Option<u64>,
    pub submit_attempts: u32,
    pub submit_backoff_ms: u64,
    /// Per-stage deadline. Off unless configured.
    pub stage_timeout_ms: Option<u64>,
    pub tools: ToolCommands,
    /// Markup wrapped around each formula before compiling.
    pub template: DocumentTemplate,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            image_dir: PathBuf::from("/tmp/latex-images"),
            temp_dir: PathBuf::from("/tmp/latex-images"),
            image_format: "png".to_string(),
            convert_options: "-trim -density 120".to_string(),
            debug: false,
            blacklist: default_blacklist(),
            service_address: None,
            idle_timeout_ms: Some(5_000),
            poll_interval_ms: 100,
            result_timeout_ms: None,
            submit_attempts: 5,
            submit_backoff_ms: 500,
            stage_timeout_ms: None,
            tools: ToolCommands::default(),
            template: DocumentTemplate::default(),
        }
    }
}

impl RendererConfig {
    /// Config rooted at a single directory, used for images and workspaces.
    pub fn rooted_at(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            image_dir: dir.clone(),
            temp_dir: dir,
            ..Self::default()
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image_format.is_empty()
            || !self.image_format.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(ConfigError::Invalid(format!(
                "image_format must be a non-empty alphanumeric extension, got {:?}",
                self.image_format
            )));
        }
        if self.submit_attempts == 0 {
            return Err(ConfigError::Invalid("submit_attempts must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn service_address(&self) -> PathBuf {
        self.service_address
            .clone()
            .unwrap_or_else(|| self.temp_dir.join(DEFAULT_SOCKET_NAME))
    }

    pub fn convert_args(&self) -> Vec<String> {
        self.convert_options.split_whitespace().map(str::to_string).collect()
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn result_timeout(&self) -> Option<Duration> {
        self.result_timeout_ms.map(Duration::from_millis)
    }

    pub fn submit_backoff(&self) -> Duration {
        Duration::from_millis(self.submit_backoff_ms)
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_ms.map(Duration::from_millis)
    }

    /// Create the image and temp directories (mode 0755 on unix).
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.image_dir, &self.temp_dir] {
            create_dir(dir)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn create_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o755).create(dir)
}

#[cfg(not(unix))]
fn create_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config: RendererConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.image_format, "png");
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.submit_attempts, 5);
        assert_eq!(config.submit_backoff(), Duration::from_millis(500));
        assert!(config.stage_timeout().is_none());
        assert!(config.blacklist.contains(&"input".to_string()));
    }

    #[test]
    fn test_default_service_address_under_temp_dir() {
        let config = RendererConfig::rooted_at("/srv/formulas");
        assert_eq!(
            config.service_address(),
            PathBuf::from("/srv/formulas").join(DEFAULT_SOCKET_NAME)
        );
    }

    #[test]
    fn test_convert_args_split() {
        let config = RendererConfig::default();
        assert_eq!(config.convert_args(), vec!["-trim", "-density", "120"]);
    }

    #[test]
    fn test_rejects_bad_format() {
        let config = RendererConfig {
            image_format: "../png".into(),
            ..RendererConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("renderer.json");
        fs::write(&path, r#"{"image_format": "gif", "idle_timeout_ms": null, "debug": true}"#)
            .unwrap();
        let config = RendererConfig::from_json_file(&path).unwrap();
        assert_eq!(config.image_format, "gif");
        assert!(config.idle_timeout().is_none());
        assert!(config.debug);
    }

    #[test]
    fn test_from_json_file_reports_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("renderer.json");
        fs::write(&path, "{ not json").unwrap();
        let err = RendererConfig::from_json_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_ensure_dirs_creates_both() {
        let dir = tempfile::tempdir().unwrap();
        let config = RendererConfig {
            image_dir: dir.path().join("images"),
            temp_dir: dir.path().join("work"),
            ..RendererConfig::default()
        };
        config.ensure_dirs().unwrap();
        assert!(config.image_dir.is_dir());
        assert!(config.temp_dir.is_dir());
    }
}
