//! Installation hand-off.
//!
//! The pipeline decides *what* to install; an [`Installer`] does it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledMod {
    pub name: String,
    pub destination: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("{0} has no file name")]
    NoFileName(PathBuf),

    #[error("failed to install {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(&self, file: &Path) -> Result<InstalledMod, InstallError>;
}

/// Copies files into the mods folder, replacing any previous version.
pub struct CopyInstaller {
    mods_dir: PathBuf,
}

impl CopyInstaller {
    pub fn new(mods_dir: impl Into<PathBuf>) -> Self {
        Self {
            mods_dir: mods_dir.into(),
        }
    }
}

#[async_trait]
impl Installer for CopyInstaller {
    async fn install(&self, file: &Path) -> Result<InstalledMod, InstallError> {
        let name = file
            .file_name()
            .ok_or_else(|| InstallError::NoFileName(file.to_path_buf()))?;
        let io_err = |source| InstallError::Io {
            path: file.to_path_buf(),
            source,
        };

        tokio::fs::create_dir_all(&self.mods_dir)
            .await
            .map_err(io_err)?;
        let destination = self.mods_dir.join(name);
        tokio::fs::copy(file, &destination).await.map_err(io_err)?;

        Ok(InstalledMod {
            name: name.to_string_lossy().into_owned(),
            destination,
        })
    }
}
