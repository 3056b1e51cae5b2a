//! Downloaded media handling and image comparison.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::PlatformError;
use crate::platform::ImageComparator;

/// A downloaded attachment on local disk.
///
/// The file is removed when the guard is dropped, so every exit path of a
/// send (success, error, early return) releases it.
#[derive(Debug)]
pub struct DownloadedMedia {
    path: PathBuf,
}

impl DownloadedMedia {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DownloadedMedia {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed downloaded media"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove downloaded media"),
        }
    }
}

/// Byte-exact comparator: 1.0 for identical files, 0.0 otherwise.
pub struct ExactMatchComparator;

#[async_trait]
impl ImageComparator for ExactMatchComparator {
    async fn similarity(&self, a: &Path, b: &Path) -> Result<f64, PlatformError> {
        let (left, right) = tokio::try_join!(tokio::fs::read(a), tokio::fs::read(b))?;
        Ok(if left == right { 1.0 } else { 0.0 })
    }
}
