use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::descriptor::{ArtifactRef, JobDescriptor};
use crate::error::CondorError;
use crate::scheduler::{Dispatch, FailureReason, WorkerOutcome};
use crate::storage::{ArtifactStore, StoreClient};
use crate::worker::runner::{ExecutionResult, Launch, WorkerRunner};

/// Messages a dispatch task sends back to the scheduler loop.
#[derive(Debug)]
pub enum WorkerEvent {
    /// Input is staged. The scheduler answers whether to launch.
    Staged {
        job_id: Uuid,
        attempt: u32,
        proceed: oneshot::Sender<bool>,
    },
    /// The container exited. The scheduler answers whether this attempt may
    /// still push its outputs.
    Finishing {
        job_id: Uuid,
        attempt: u32,
        proceed: oneshot::Sender<bool>,
    },
    /// The attempt is over.
    Finished {
        job_id: Uuid,
        attempt: u32,
        outcome: WorkerOutcome,
    },
}

/// Drives one attempt per dispatch: stage input, wait for the go-ahead, run
/// the container, confirm the attempt is still current, push outputs, report.
pub struct Dispatcher<R, S> {
    runner: Arc<R>,
    store: Arc<StoreClient<S>>,
    scratch_root: PathBuf,
    events: mpsc::Sender<WorkerEvent>,
}

impl<R, S> Clone for Dispatcher<R, S> {
    fn clone(&self) -> Self {
        Self {
            runner: self.runner.clone(),
            store: self.store.clone(),
            scratch_root: self.scratch_root.clone(),
            events: self.events.clone(),
        }
    }
}

impl<R: WorkerRunner, S: ArtifactStore> Dispatcher<R, S> {
    pub fn new(
        runner: Arc<R>,
        store: Arc<StoreClient<S>>,
        scratch_root: PathBuf,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            runner,
            store,
            scratch_root,
            events,
        }
    }

    /// Run the attempt on its own task so the scheduler loop never blocks.
    pub fn spawn(&self, dispatch: Dispatch) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.execute(dispatch).await })
    }

    /// Host directory an attempt stages into.
    pub fn scratch_dir(&self, dispatch: &Dispatch) -> PathBuf {
        self.scratch_root.join(format!(
            "{}-{}",
            dispatch.descriptor.batch_id(),
            dispatch.attempt
        ))
    }

    pub async fn execute(&self, dispatch: Dispatch) {
        let job_id = dispatch.job_id;
        let attempt = dispatch.attempt;
        let scratch_dir = self.scratch_dir(&dispatch);

        let outcome = self.attempt(&dispatch, &scratch_dir).await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(job_id = %job_id, error = %e, "Failed to remove scratch directory");
            }
        }

        // `None` means the scheduler withdrew the attempt.
        let Some(outcome) = outcome else {
            return;
        };
        if self
            .events
            .send(WorkerEvent::Finished {
                job_id,
                attempt,
                outcome,
            })
            .await
            .is_err()
        {
            tracing::warn!(job_id = %job_id, "Scheduler gone, dropping worker report");
        }
    }

    async fn attempt(
        &self,
        dispatch: &Dispatch,
        scratch_dir: &std::path::Path,
    ) -> Option<WorkerOutcome> {
        let descriptor = &dispatch.descriptor;

        if let Err(e) = self.stage_input(descriptor, scratch_dir).await {
            return Some(WorkerOutcome::failed(storage_failure(e)));
        }

        let (job_id, attempt) = (dispatch.job_id, dispatch.attempt);
        let staged = self
            .confirm(|proceed| WorkerEvent::Staged {
                job_id,
                attempt,
                proceed,
            })
            .await;
        if !staged {
            tracing::info!(job_id = %job_id, attempt, "Attempt withdrawn after staging");
            return None;
        }

        let launch = Launch {
            job_id: dispatch.job_id,
            attempt: dispatch.attempt,
            descriptor: descriptor.clone(),
            grant: dispatch.grant,
            endpoint: dispatch.worker.endpoint.clone(),
            scratch_dir: scratch_dir.to_path_buf(),
        };
        let result = self.runner.run(&launch).await;

        let current = self
            .confirm(|proceed| WorkerEvent::Finishing {
                job_id,
                attempt,
                proceed,
            })
            .await;
        if !current {
            tracing::info!(job_id = %job_id, attempt, "Attempt superseded, discarding its outputs");
            return None;
        }

        Some(self.collect(descriptor, scratch_dir, result).await)
    }

    async fn stage_input(
        &self,
        descriptor: &JobDescriptor,
        scratch_dir: &std::path::Path,
    ) -> Result<(), CondorError> {
        tokio::fs::create_dir_all(scratch_dir)
            .await
            .map_err(|e| CondorError::StorageUnavailable(format!("scratch directory: {}", e)))?;

        if let Some(input) = &descriptor.input_artifact {
            let data = self.store.fetch_input(input).await?;
            tokio::fs::write(scratch_dir.join(input.file_name()), &data)
                .await
                .map_err(|e| CondorError::StorageUnavailable(format!("staging {}: {}", input, e)))?;
        }
        Ok(())
    }

    /// Ask the scheduler loop a yes/no question about this attempt. A gone
    /// scheduler counts as no.
    async fn confirm(&self, ask: impl FnOnce(oneshot::Sender<bool>) -> WorkerEvent) -> bool {
        let (proceed, answer) = oneshot::channel();
        if self.events.send(ask(proceed)).await.is_err() {
            return false;
        }
        answer.await.unwrap_or(false)
    }

    /// Turn an execution result into the attempt's outcome, pushing outputs on
    /// success. Captured stdout/stderr are pushed whenever they were requested.
    async fn collect(
        &self,
        descriptor: &JobDescriptor,
        scratch_dir: &std::path::Path,
        result: ExecutionResult,
    ) -> WorkerOutcome {
        let mut outputs = Vec::new();
        let streams = [
            (&descriptor.stdout_artifact, result.stdout),
            (&descriptor.stderr_artifact, result.stderr),
        ];
        for (name, data) in streams {
            let Some(name) = name else { continue };
            let artifact = descriptor.output_ref(name);
            match self.store.push_output(&artifact, Bytes::from(data)).await {
                Ok(()) => outputs.push(artifact),
                Err(e) if result.failure.is_none() => {
                    return WorkerOutcome::failed(storage_failure(e));
                }
                Err(e) => {
                    tracing::warn!(job_id = %descriptor.id, error = %e, "Could not push log of failed attempt");
                }
            }
        }

        if let Some(reason) = result.failure {
            return WorkerOutcome::Failed {
                reason,
                exit_code: result.exit_code,
            };
        }

        for name in &descriptor.output_artifacts {
            match self.push_file(descriptor, scratch_dir, name).await {
                Ok(artifact) => outputs.push(artifact),
                Err(reason) => {
                    return WorkerOutcome::Failed {
                        reason,
                        exit_code: result.exit_code,
                    }
                }
            }
        }

        WorkerOutcome::Succeeded {
            outputs,
            exit_code: result.exit_code.unwrap_or(0),
        }
    }

    async fn push_file(
        &self,
        descriptor: &JobDescriptor,
        scratch_dir: &std::path::Path,
        name: &str,
    ) -> Result<ArtifactRef, FailureReason> {
        let data = match tokio::fs::read(scratch_dir.join(name)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FailureReason::MissingOutput(name.to_string()));
            }
            Err(e) => return Err(FailureReason::StorageUnavailable(e.to_string())),
        };

        let artifact = descriptor.output_ref(name);
        self.store
            .push_output(&artifact, Bytes::from(data))
            .await
            .map_err(storage_failure)?;
        Ok(artifact)
    }
}

fn storage_failure(err: CondorError) -> FailureReason {
    match err {
        CondorError::StorageUnavailable(msg) => FailureReason::StorageUnavailable(msg),
        other => FailureReason::StorageUnavailable(other.to_string()),
    }
}
