use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::descriptor::{is_contained_path, ArtifactRef};
use crate::storage::{ArtifactStore, StoreError};

/// Artifact store backed by a directory tree. References are paths relative
/// to the root.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, artifact: &ArtifactRef) -> Result<PathBuf, StoreError> {
        if !is_contained_path(artifact.as_str()) {
            return Err(StoreError::InvalidRef(artifact.clone()));
        }
        Ok(self.root.join(artifact.as_str()))
    }
}

impl ArtifactStore for FsArtifactStore {
    async fn fetch(&self, artifact: &ArtifactRef) -> Result<Bytes, StoreError> {
        let path = self.resolve(artifact)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(artifact.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn push(&self, artifact: &ArtifactRef, data: Bytes) -> Result<(), StoreError> {
        let path = self.resolve(artifact)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write to a sibling temp file first so readers never see a partial output.
        let tmp = path.with_file_name(format!(".{}.partial", artifact.file_name()));
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
