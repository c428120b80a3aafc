//! Pipeline configuration and config file lookup.
//!
//! Config file priority:
//! 1. `--config` CLI argument
//! 2. `MSGPIPE_CONFIG` environment variable
//! 3. `msgpipe.json` in the current directory, if present
//! 4. Platform config dir from dirs-next (`~/.config/msgpipe/msgpipe.json` on Linux)
//!
//! A missing file is not an error: every field has a default.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::PipelineError;

pub const CONFIG_FILE_NAME: &str = "msgpipe.json";
pub const CONFIG_ENV_VAR: &str = "MSGPIPE_CONFIG";

/// When the pacer considers a frame rendered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderAck {
    /// As soon as synchronous panel notification returns
    #[default]
    Immediate,
    /// When the host calls `Pipeline::render_committed()` after its render pass
    Explicit,
}

/// Tunables for one pipeline instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Target panel frame rate; the frame budget is `1000 / frame_rate` ms
    pub frame_rate: f64,
    /// Ceiling for all frame promises of one frame
    pub promise_timeout_ms: u64,
    /// Receive time vs. current time gap that counts as drift
    pub drift_threshold_secs: f64,
    /// How long drift may persist (waiting for a seek) before it is reported
    pub drift_grace_ms: u64,
    /// Quiet period before merged subscriptions are pushed to the player
    pub subscription_debounce_ms: u64,
    pub render_ack: RenderAck,
    /// Threads that wait out frames off the player's thread
    pub worker_threads: usize,
    pub track_message_order: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_rate: 60.0,
            promise_timeout_ms: 5000,
            drift_threshold_secs: 1.0,
            drift_grace_ms: 1000,
            subscription_debounce_ms: 0,
            render_ack: RenderAck::Immediate,
            worker_threads: 2,
            track_message_order: true,
        }
    }
}

impl PipelineConfig {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> std::result::Result<(), PipelineError> {
        if !self.frame_rate.is_finite() || self.frame_rate <= 0.0 {
            return Err(PipelineError::InvalidFrameRate(self.frame_rate));
        }
        if !self.drift_threshold_secs.is_finite() || self.drift_threshold_secs < 0.0 {
            return Err(PipelineError::Config(format!(
                "drift_threshold_secs must be >= 0, got {}",
                self.drift_threshold_secs
            )));
        }
        if self.worker_threads == 0 {
            return Err(PipelineError::Config("worker_threads must be >= 1".into()));
        }
        Ok(())
    }

    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load from the resolved config path, or defaults if no file exists.
    pub fn resolve(cli_path: Option<PathBuf>) -> Result<Self> {
        let explicit = cli_path.is_some() || std::env::var_os(CONFIG_ENV_VAR).is_some();
        let path = config_path(cli_path);
        if path.exists() {
            log::info!("Loading config: {}", path.display());
            return Self::load(&path);
        }
        if explicit {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        log::debug!("No config at {}, using defaults", path.display());
        Ok(Self::default())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
            }
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw).with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

/// Resolve the config file path (see module docs for priority).
pub fn config_path(cli_path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli_path {
        return path;
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
        return PathBuf::from(path);
    }
    if let Ok(current_dir) = std::env::current_dir() {
        let local = current_dir.join(CONFIG_FILE_NAME);
        if local.exists() {
            return local;
        }
    }
    if let Some(dir) = dirs_next::config_dir() {
        return dir.join("msgpipe").join(CONFIG_FILE_NAME);
    }
    PathBuf::from(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("msgpipe_test_{}", Uuid::new_v4()))
            .join(name)
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.promise_timeout_ms, 5000);
        assert_eq!(config.render_ack, RenderAck::Immediate);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: PipelineConfig = serde_json::from_str(r#"{"frame_rate": 30, "render_ack": "explicit"}"#).unwrap();
        assert_eq!(config.frame_rate, 30.0);
        assert_eq!(config.render_ack, RenderAck::Explicit);
        assert_eq!(config.drift_grace_ms, 1000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = PipelineConfig {
            frame_rate: 0.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PipelineError::InvalidFrameRate(_))));

        let config = PipelineConfig {
            worker_threads: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_save_then_load() {
        let path = temp_path("msgpipe.json");
        let config = PipelineConfig {
            frame_rate: 24.0,
            subscription_debounce_ms: 16,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap(), config);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_cli_path_wins() {
        let path = PathBuf::from("/custom/pipeline.json");
        assert_eq!(config_path(Some(path.clone())), path);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let path = temp_path("missing.json");
        assert!(PipelineConfig::resolve(Some(path)).is_err());
    }

    #[test]
    fn test_load_reports_parse_error() {
        let path = temp_path("broken.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();
        let err = PipelineConfig::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
