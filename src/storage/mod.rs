//! Artifact store access.
//!
//! [`ArtifactStore`] is the narrow interface to a storage backend;
//! [`StoreClient`] wraps a backend with the configured timeout and turns every
//! backend problem into [`CondorError::StorageUnavailable`], which the
//! scheduler treats as a retryable attempt failure.

pub mod fs;

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::descriptor::ArtifactRef;
use crate::error::{CondorError, Result};

pub use fs::FsArtifactStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("artifact not found: {0}")]
    NotFound(ArtifactRef),

    #[error("artifact reference escapes the store: {0}")]
    InvalidRef(ArtifactRef),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A storage backend holding input bundles and job outputs.
pub trait ArtifactStore: Send + Sync + 'static {
    fn fetch(&self, artifact: &ArtifactRef)
        -> impl Future<Output = std::result::Result<Bytes, StoreError>> + Send;

    fn push(
        &self,
        artifact: &ArtifactRef,
        data: Bytes,
    ) -> impl Future<Output = std::result::Result<(), StoreError>> + Send;
}

/// Timeout-bounded client over an [`ArtifactStore`].
#[derive(Debug, Clone)]
pub struct StoreClient<S> {
    backend: S,
    timeout: Duration,
}

impl<S: ArtifactStore> StoreClient<S> {
    pub fn new(backend: S, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// Retrieve an input bundle.
    pub async fn fetch_input(&self, artifact: &ArtifactRef) -> Result<Bytes> {
        match tokio::time::timeout(self.timeout, self.backend.fetch(artifact)).await {
            Ok(Ok(data)) => {
                tracing::debug!(artifact = %artifact, bytes = data.len(), "Fetched input");
                Ok(data)
            }
            Ok(Err(e)) => Err(CondorError::StorageUnavailable(e.to_string())),
            Err(_) => Err(CondorError::StorageUnavailable(format!(
                "fetch of {} timed out after {:?}",
                artifact, self.timeout
            ))),
        }
    }

    /// Persist one output file.
    pub async fn push_output(&self, artifact: &ArtifactRef, data: Bytes) -> Result<()> {
        let len = data.len();
        match tokio::time::timeout(self.timeout, self.backend.push(artifact, data)).await {
            Ok(Ok(())) => {
                tracing::debug!(artifact = %artifact, bytes = len, "Pushed output");
                Ok(())
            }
            Ok(Err(e)) => Err(CondorError::StorageUnavailable(e.to_string())),
            Err(_) => Err(CondorError::StorageUnavailable(format!(
                "push of {} timed out after {:?}",
                artifact, self.timeout
            ))),
        }
    }
}
