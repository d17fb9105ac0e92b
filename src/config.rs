//! Configuration module for difftview
//!
//! Loads user configuration from ~/.difftview/config.toml

use crate::palette::{Background, ColorFaceTable};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// difftastic executable
    pub difftastic: String,
    /// git executable
    pub git: String,
    /// Background hint for difftastic and the default palette
    pub background: Background,
    /// Fixed `--width`; the terminal width when unset
    pub width: Option<u16>,
    /// Extra flags passed to every difftastic invocation
    pub extra_args: Vec<String>,
    /// Custom face table; the built-in one for `background` when unset
    pub palette: Option<ColorFaceTable>,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            difftastic: "difft".to_string(),
            git: "git".to_string(),
            background: Background::default(),
            width: None,
            extra_args: Vec::new(),
            palette: None,
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default path (~/.difftview/config.toml)
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Config::default());
        }

        let contents = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        if let Some(palette) = &config.palette {
            palette.validate()?;
        }
        tracing::debug!(target: "config", path = %config_path.display(), "config_loaded");
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".difftview")
            .join("config.toml")
    }

    /// Default log file location
    pub fn log_path(&self) -> PathBuf {
        self.log_file.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("difftview")
                .join("difftview.log")
        })
    }

    /// Merge CLI overrides into config
    pub fn with_overrides(
        mut self,
        background: Option<Background>,
        width: Option<u16>,
        difftastic: Option<String>,
    ) -> Self {
        if let Some(bg) = background {
            self.background = bg;
        }
        if let Some(w) = width {
            self.width = Some(w);
        }
        if let Some(path) = difftastic {
            self.difftastic = path;
        }
        self
    }

    /// Face table in effect, shared by every surface's decoder
    pub fn face_table(&self) -> Arc<ColorFaceTable> {
        Arc::new(
            self.palette
                .clone()
                .unwrap_or_else(|| ColorFaceTable::for_background(self.background)),
        )
    }

    /// Create a default config file
    pub fn create_default() -> Result<PathBuf> {
        let config_path = Self::default_path();
        let config = Config::default();

        // Create parent directory if needed
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(&config)
            .context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(config_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ViewError;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "difftastic = \"/opt/difft\"\nbackground = \"light\"\nextra_args = [\"--display\", \"inline\"]\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.difftastic, "/opt/difft");
        assert_eq!(config.background, Background::Light);
        assert_eq!(config.extra_args, vec!["--display", "inline"]);
        assert_eq!(config.git, "git");
        assert_eq!(
            *config.face_table(),
            ColorFaceTable::for_background(Background::Light)
        );
    }

    #[test]
    fn test_invalid_palette_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[palette]\nnormal = [{ name = \"red\", fg = \"red\", bg = \"black\" }]\nbright = []\n",
        )
        .unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ViewError>(),
            Some(ViewError::InvalidPalette(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let config = Config::default().with_overrides(
            Some(Background::Light),
            Some(120),
            Some("difft-nightly".to_string()),
        );
        assert_eq!(config.background, Background::Light);
        assert_eq!(config.width, Some(120));
        assert_eq!(config.difftastic, "difft-nightly");

        let unchanged = Config::default().with_overrides(None, None, None);
        assert_eq!(unchanged, Config::default());
    }

    #[test]
    fn test_default_round_trips_through_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, Config::default());
    }
}
