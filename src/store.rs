//! Destination store.
//!
//! Finished staging files are moved into one base directory under their
//! destination name. The move is a rename over any existing file, so a
//! reader of the destination path sees either the old file or the new one,
//! never a partial write.
use crate::error::DownloadError;
use crate::state::StoredArtifact;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
enum BaseDir {
    Fixed(PathBuf),
    /// The platform documents directory, looked up on every persist.
    Documents,
}

#[derive(Debug, Clone)]
pub struct DestinationStore {
    base: BaseDir,
}

impl DestinationStore {
    /// A store rooted at `base`. The directory must already exist when persisting.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: BaseDir::Fixed(base.into()),
        }
    }

    /// A store rooted at the user's documents directory.
    pub const fn documents() -> Self {
        Self {
            base: BaseDir::Documents,
        }
    }

    async fn resolve_base(&self) -> Result<PathBuf, DownloadError> {
        let base = match &self.base {
            BaseDir::Fixed(path) => path.clone(),
            BaseDir::Documents => dirs::document_dir()
                .ok_or_else(|| DownloadError::persistence("no documents directory on this platform"))?,
        };

        match tokio::fs::metadata(&base).await {
            Ok(meta) if meta.is_dir() => Ok(base),
            Ok(_) => Err(DownloadError::persistence(format!(
                "{} is not a directory",
                base.display()
            ))),
            Err(e) => Err(DownloadError::persistence(format!(
                "cannot locate {}: {e}",
                base.display()
            ))),
        }
    }

    /// Move `temporary` into the store as `destination_name`, replacing any
    /// existing file of that name.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Persistence`] when the base directory is
    /// missing, the name would escape it, or the move fails.
    pub async fn persist(
        &self,
        temporary: &Path,
        destination_name: &str,
    ) -> Result<StoredArtifact, DownloadError> {
        if destination_name.is_empty()
            || destination_name == "."
            || destination_name == ".."
            || destination_name.contains(['/', '\\'])
        {
            return Err(DownloadError::persistence(format!(
                "invalid destination name '{destination_name}'"
            )));
        }

        let base = self.resolve_base().await?;
        let destination = base.join(destination_name);

        match tokio::fs::rename(temporary, &destination).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::CrossesDevices => {
                tracing::debug!(
                    from = %temporary.display(),
                    to = %destination.display(),
                    "Staging file is on another device, copying"
                );
                copy_then_replace(temporary, &base, &destination).await?;
            }
            Err(e) => {
                return Err(DownloadError::persistence(format!(
                    "cannot move {} to {}: {e}",
                    temporary.display(),
                    destination.display()
                )));
            }
        }

        tracing::info!(path = %destination.display(), "Stored artifact");
        Ok(StoredArtifact {
            name: destination_name.to_string(),
            path: destination,
        })
    }
}

/// Copy into a sibling temp file first so the final step is still a
/// same-directory rename.
async fn copy_then_replace(
    temporary: &Path,
    base: &Path,
    destination: &Path,
) -> Result<(), DownloadError> {
    let temporary = temporary.to_path_buf();
    let base = base.to_path_buf();
    let destination = destination.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<(), DownloadError> {
        let mut source = std::fs::File::open(&temporary).map_err(DownloadError::persistence)?;
        let mut sibling = tempfile::Builder::new()
            .prefix(".rfetch-incoming-")
            .tempfile_in(&base)
            .map_err(DownloadError::persistence)?;
        std::io::copy(&mut source, &mut sibling).map_err(DownloadError::persistence)?;
        sibling
            .as_file()
            .sync_all()
            .map_err(DownloadError::persistence)?;
        sibling
            .persist(&destination)
            .map_err(|e| DownloadError::persistence(e.error))?;

        if let Err(e) = std::fs::remove_file(&temporary) {
            tracing::debug!(path = %temporary.display(), error = %e, "Could not remove staging file");
        }
        Ok(())
    })
    .await
    .map_err(DownloadError::persistence)?
}
