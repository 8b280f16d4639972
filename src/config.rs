//! Explicit configuration passed to the codec, storage and comment layers.
//!
//! Values come from three places, later ones winning:
//! built-in defaults, the environment (`EB_USER`, `USER`, `VISUAL`,
//! `EDITOR`), and the tracker's `config.yaml`.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::mapfile::{Format, DEFAULT_CONTEXT};

const FALLBACK_USER: &str = "anonymous";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Identity recorded as the author of new comments and issues.
    pub user_id: String,
    /// Command used to edit text interactively, if any.
    pub editor: Option<String>,
    pub format: Format,
    /// Context lines around each value in written records.
    pub context: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: FALLBACK_USER.to_string(),
            editor: None,
            format: Format::default(),
            context: DEFAULT_CONTEXT,
        }
    }
}

/// The persisted subset of [`Config`], stored as `config.yaml`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Config {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [`Config::from_env`] but reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let nonempty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let user_id = nonempty("EB_USER")
            .or_else(|| nonempty("USER"))
            .or_else(|| nonempty("USERNAME"))
            .unwrap_or_else(|| FALLBACK_USER.to_string());
        let editor = nonempty("VISUAL").or_else(|| nonempty("EDITOR"));
        Self {
            user_id,
            editor,
            ..Self::default()
        }
    }

    /// Apply the settings stored in a tracker's config file.
    pub fn apply_file(&mut self, file: &ConfigFile) -> Result<()> {
        if let Some(format) = file.format {
            self.format = format;
        }
        if let Some(context) = file.context {
            if context == 0 {
                anyhow::bail!("config.yaml: context must be at least 1");
            }
            self.context = context;
        }
        if let Some(user_id) = &file.user_id {
            self.user_id = user_id.clone();
        }
        Ok(())
    }

    /// The settings worth writing back to `config.yaml`.
    pub fn to_file(&self) -> ConfigFile {
        ConfigFile {
            format: Some(self.format),
            context: Some(self.context),
            user_id: None,
        }
    }
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config")?;
        fs::write(path, yaml).with_context(|| format!("Failed to write {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_env_precedence() {
        let config = Config::from_lookup(lookup(&[
            ("USER", "plain"),
            ("EB_USER", "Jane <jane@example.com>"),
            ("EDITOR", "vi"),
            ("VISUAL", ""),
        ]));
        assert_eq!(config.user_id, "Jane <jane@example.com>");
        assert_eq!(config.editor.as_deref(), Some("vi"));
        assert_eq!(config.context, DEFAULT_CONTEXT);
    }

    #[test]
    fn test_defaults_without_env() {
        let config = Config::from_lookup(lookup(&[]));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config = Config::default();
        config.format = Format::V1;
        config.context = 5;
        config.to_file().save(&path).unwrap();

        let mut reloaded = Config::default();
        reloaded.apply_file(&ConfigFile::load(&path).unwrap()).unwrap();
        assert_eq!(reloaded.format, Format::V1);
        assert_eq!(reloaded.context, 5);
    }

    #[test]
    fn test_config_file_rejects_zero_context() {
        let file: ConfigFile = serde_yaml::from_str("context: 0\n").unwrap();
        assert!(Config::default().apply_file(&file).is_err());
        assert!(serde_yaml::from_str::<ConfigFile>("format: 7\n").is_err());
    }
}
