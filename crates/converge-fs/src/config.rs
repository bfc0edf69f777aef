//! Promise files, run configs and state databases on disk
//!
//! The on-disk format follows the file extension, so the same document can
//! be kept as TOML, JSON or YAML.

use crate::{Error, Result, io};
use serde::{Serialize, de::DeserializeOwned};
use std::path::Path;

/// Serialization format implied by a file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
    Yaml,
}

impl ConfigFormat {
    /// `.toml`, `.json`, `.yaml` and `.yml`, case-insensitively.
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "toml" => Ok(Self::Toml),
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            _ => Err(Error::UnsupportedFormat { extension }),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Toml => "TOML",
            Self::Json => "JSON",
            Self::Yaml => "YAML",
        }
    }

    fn decode<T: DeserializeOwned>(self, content: &str) -> std::result::Result<T, String> {
        match self {
            Self::Toml => toml::from_str(content).map_err(|e| e.to_string()),
            Self::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
            Self::Yaml => serde_yaml::from_str(content).map_err(|e| e.to_string()),
        }
    }

    fn encode<T: Serialize>(self, value: &T) -> std::result::Result<String, String> {
        match self {
            Self::Toml => toml::to_string_pretty(value).map_err(|e| e.to_string()),
            Self::Json => serde_json::to_string_pretty(value).map_err(|e| e.to_string()),
            Self::Yaml => serde_yaml::to_string(value).map_err(|e| e.to_string()),
        }
    }
}

/// Loads and saves serde documents in the format named by their extension.
///
/// Saving goes through [`io::write_atomic`], so a reader never sees a
/// half-written document.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigStore {
    /// Permission bits for files written by [`ConfigStore::save`].
    mode: Option<u32>,
}

impl ConfigStore {
    /// A store whose saved files get the process umask.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose saved files always get `mode`.
    pub fn with_mode(mode: u32) -> Self {
        Self { mode: Some(mode) }
    }

    pub fn load<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let format = ConfigFormat::from_path(path)?;
        let content = io::read_text(path)?;
        format.decode(&content).map_err(|message| Error::ConfigParse {
            path: path.to_path_buf(),
            format: format.name().into(),
            message,
        })
    }

    /// Decode `content` as if it had been read from `path`.
    pub fn parse<T: DeserializeOwned>(path: &Path, content: &str) -> Result<T> {
        let format = ConfigFormat::from_path(path)?;
        format.decode(content).map_err(|message| Error::ConfigParse {
            path: path.to_path_buf(),
            format: format.name().into(),
            message,
        })
    }

    pub fn save<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let format = ConfigFormat::from_path(path)?;
        let content = format.encode(value).map_err(|message| Error::ConfigSerialize {
            path: path.to_path_buf(),
            format: format.name().into(),
            message,
        })?;
        io::write_atomic(path, content.as_bytes(), self.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("promises.toml", ConfigFormat::Toml)]
    #[case("run.JSON", ConfigFormat::Json)]
    #[case("promises.yml", ConfigFormat::Yaml)]
    #[case("/etc/converge/promises.yaml", ConfigFormat::Yaml)]
    fn format_follows_extension(#[case] path: &str, #[case] expected: ConfigFormat) {
        assert_eq!(ConfigFormat::from_path(Path::new(path)).unwrap(), expected);
    }

    #[test]
    fn missing_extension_is_unsupported() {
        let err = ConfigFormat::from_path(Path::new("promises")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat { extension } if extension.is_empty()));
    }
}
