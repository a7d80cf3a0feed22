use directories::ProjectDirs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub struct AppPaths {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn new() -> Result<Self> {
        let project_dirs = ProjectDirs::from("dev", "relaychat", "RelayChat")
            .ok_or_else(|| Error::platform("Failed to determine application directories"))?;

        Ok(Self {
            config_dir: project_dirs.config_dir().to_path_buf(),
            data_dir: project_dirs.data_dir().to_path_buf(),
        })
    }

    /// Keeps config and data under one root; used by tests and `--config`.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
        }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.config_dir.clone()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn database_file(&self, file_name: &str) -> PathBuf {
        self.data_dir.join(file_name)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn ensure_dirs_exist(&self) -> Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.data_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rooted_paths() {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_root(temp_dir.path());
        paths.ensure_dirs_exist().unwrap();

        assert!(paths.config_file().starts_with(temp_dir.path()));
        assert!(paths.logs_dir().exists());
        assert_eq!(
            paths.database_file("usage.db"),
            temp_dir.path().join("data").join("usage.db")
        );
    }
}
