use std::ops::Deref;
use std::path::{Path, PathBuf};

/// Typed wrapper for the app's data directory.
///
/// Centralizes the on-disk layout so callers use methods instead of
/// ad-hoc `path.join("club.db")` etc.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppDir {
    path: PathBuf,
}

impl AppDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Platform data directory (`~/.local/share/club` on Linux).
    pub fn platform_default() -> Self {
        let base = dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join("club"))
    }

    pub fn db_path(&self) -> PathBuf {
        self.path.join("club.db")
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join("config.yaml")
    }

    /// Where the bearer token of the signed-in member is kept between runs.
    pub fn session_token_path(&self) -> PathBuf {
        self.path.join("session_token")
    }
}

impl Deref for AppDir {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.path
    }
}

impl AsRef<Path> for AppDir {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl From<PathBuf> for AppDir {
    fn from(path: PathBuf) -> Self {
        Self { path }
    }
}
