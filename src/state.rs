//! Persisted provider state
//!
//! Between runs, a provider's persisted paths live in one tar file on the
//! operator's machine. It is readable by the owner only since it usually
//! holds credentials and infrastructure state.

use crate::error::Result;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const STATE_FILE_MODE: u32 = 0o600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<cluster_dir>/provider-<provider_type>.tar`
    pub fn for_provider(cluster_dir: &Path, provider_type: &str) -> Self {
        Self::new(cluster_dir.join(format!("provider-{}.tar", provider_type)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The saved archive, or `None` if nothing was saved yet.
    pub fn load(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no saved state");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the saved archive.
    pub fn save(&self, archive: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(STATE_FILE_MODE)
            .open(&self.path)?;
        file.write_all(archive)?;
        file.sync_all()?;

        // mode() only applies when the file is created
        fs::set_permissions(&self.path, fs::Permissions::from_mode(STATE_FILE_MODE))?;

        debug!(path = %self.path.display(), bytes = archive.len(), "saved state");
        Ok(())
    }
}
