//! TOML config file store

use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// Directory holding Crucible config files
#[derive(Debug, Clone)]
pub struct ConfigStore {
    base_dir: PathBuf,
}

impl ConfigStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Global settings (~/.config/crucible/)
    pub fn global() -> Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Cannot find config directory".to_string()))?
            .join("crucible");
        Ok(Self::new(dir))
    }

    /// Project settings (<root>/.crucible/)
    pub fn project(root: impl Into<PathBuf>) -> Self {
        Self::new(root.into().join(".crucible"))
    }

    pub fn current_project() -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::Config(format!("Cannot get current directory: {}", e)))?;
        Ok(Self::project(cwd))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.base_dir.join(filename)
    }

    /// Raw table, `None` when the file does not exist
    pub fn load_table(&self, filename: &str) -> Result<Option<toml::Table>> {
        let path = self.file_path(filename);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let table = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        Ok(Some(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        assert!(store.load_table("config.toml").unwrap().is_none());
    }

    #[test]
    fn test_load_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::project(dir.path());
        std::fs::create_dir_all(store.base_dir()).unwrap();
        std::fs::write(
            store.file_path("config.toml"),
            "[container]\nimage = \"alpine:3.19\"\n",
        )
        .unwrap();

        let table = store.load_table("config.toml").unwrap().unwrap();
        assert_eq!(
            table["container"]["image"].as_str(),
            Some("alpine:3.19")
        );
    }

    #[test]
    fn test_parse_error_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        std::fs::write(store.file_path("config.toml"), "not = [valid").unwrap();

        assert!(matches!(
            store.load_table("config.toml"),
            Err(Error::Config(_))
        ));
    }
}
