use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::descriptor::{JobDescriptor, Resources};
use crate::scheduler::FailureReason;

/// Exit status docker reports when the kernel OOM killer ended the container.
const OOM_KILLED_EXIT: i32 = 137;
/// Exit status of `docker run` itself failing (daemon error, bad image, ...).
const DOCKER_RUN_ERROR_EXIT: i32 = 125;

/// Everything a runner needs to launch one attempt.
#[derive(Debug, Clone)]
pub struct Launch {
    pub job_id: Uuid,
    pub attempt: u32,
    pub descriptor: Arc<JobDescriptor>,
    pub grant: Resources,
    /// Container engine endpoint of the assigned worker.
    pub endpoint: Option<String>,
    /// Host directory holding the staged input; outputs are collected from it.
    pub scratch_dir: PathBuf,
}

/// Result of one container execution
#[derive(Debug)]
pub struct ExecutionResult {
    pub job_id: Uuid,
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the container exited cleanly within its limits.
    pub failure: Option<FailureReason>,
}

/// Launches a job's container on its assigned worker.
pub trait WorkerRunner: Send + Sync + 'static {
    fn run(&self, launch: &Launch) -> impl Future<Output = ExecutionResult> + Send;
}

/// Runs jobs in Docker containers with security isolation.
///
/// The grant becomes hard limits: `--gpus`, `--cpus` and `--memory` (with swap
/// disabled). Disk is enforced by measuring the scratch directory after the
/// container exits.
#[derive(Debug, Clone)]
pub struct DockerRunner {
    config: SandboxConfig,
}

impl DockerRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Build the full `docker` argument list for a launch.
    pub fn docker_args(&self, launch: &Launch) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(ref endpoint) = launch.endpoint {
            args.push("-H".to_string());
            args.push(endpoint.clone());
        }

        args.push("run".to_string());
        args.push("--rm".to_string());
        args.push(format!("--name={}", container_name(launch)));

        // Network isolation
        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }

        // Hard resource limits from the grant
        let grant = &launch.grant;
        args.push(format!("--cpus={}", grant.cpus));
        args.push(format!("--memory={}b", grant.memory_bytes));
        args.push(format!("--memory-swap={}b", grant.memory_bytes));
        if grant.gpus > 0 {
            args.push(format!("--gpus={}", grant.gpus));
        }

        // Security: drop all capabilities, no new privileges
        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());

        if self.config.read_only_root {
            args.push("--read-only".to_string());
            args.push("--tmpfs=/tmp".to_string());
        }

        // Scratch directory carries inputs in and outputs out
        args.push(format!(
            "--volume={}:{}",
            launch.scratch_dir.display(),
            self.config.container_workdir
        ));
        args.push(format!("--workdir={}", self.config.container_workdir));

        args.push(launch.descriptor.image.clone());
        args.extend(launch.descriptor.command.iter().cloned());
        args
    }

    /// `docker rm -f` arguments for the launch's container.
    pub fn remove_args(&self, launch: &Launch) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ref endpoint) = launch.endpoint {
            args.push("-H".to_string());
            args.push(endpoint.clone());
        }
        args.push("rm".to_string());
        args.push("-f".to_string());
        args.push(container_name(launch));
        args
    }

    fn classify(
        exit_code: Option<i32>,
        stderr: &[u8],
        disk_used: Option<u64>,
        grant: &Resources,
    ) -> Option<FailureReason> {
        if let Some(used) = disk_used {
            if used > grant.disk_bytes {
                return Some(FailureReason::ResourceExceeded(format!(
                    "disk: used {} of {} bytes",
                    used, grant.disk_bytes
                )));
            }
        }

        match exit_code {
            Some(0) => None,
            Some(OOM_KILLED_EXIT) => Some(FailureReason::ResourceExceeded(format!(
                "memory: limit {} bytes",
                grant.memory_bytes
            ))),
            Some(DOCKER_RUN_ERROR_EXIT) => Some(FailureReason::LaunchFailed(
                String::from_utf8_lossy(stderr).trim().to_string(),
            )),
            Some(code) => Some(FailureReason::NonZeroExit(code)),
            None => Some(FailureReason::LaunchFailed(
                "container terminated by signal".to_string(),
            )),
        }
    }
}

impl WorkerRunner for DockerRunner {
    async fn run(&self, launch: &Launch) -> ExecutionResult {
        let args = self.docker_args(launch);
        tracing::info!(
            job_id = %launch.job_id,
            attempt = launch.attempt,
            image = %launch.descriptor.image,
            endpoint = ?launch.endpoint,
            "Launching container"
        );

        let mut guard = ContainerGuard {
            docker_binary: self.config.docker_binary.clone(),
            remove_args: self.remove_args(launch),
            job_id: launch.job_id,
            armed: true,
        };
        let result = Command::new(&self.config.docker_binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;
        guard.armed = false;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(job_id = %launch.job_id, error = %e, "Container launch failed");
                return ExecutionResult {
                    job_id: launch.job_id,
                    exit_code: None,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                    failure: Some(FailureReason::LaunchFailed(e.to_string())),
                };
            }
        };

        let disk_used = scratch_usage(&launch.scratch_dir).await;
        let exit_code = output.status.code();
        let failure = Self::classify(exit_code, &output.stderr, disk_used, &launch.grant);

        tracing::info!(
            job_id = %launch.job_id,
            exit_code = ?exit_code,
            failure = ?failure,
            "Container exited"
        );

        ExecutionResult {
            job_id: launch.job_id,
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            failure,
        }
    }
}

fn container_name(launch: &Launch) -> String {
    format!("condor-{}-{}", launch.job_id.simple(), launch.attempt)
}

/// Removes the container when a run is dropped before `docker run` returns.
/// Killing the `docker` client alone leaves the container running.
struct ContainerGuard {
    docker_binary: String,
    remove_args: Vec<String>,
    job_id: Uuid,
    armed: bool,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(job_id = %self.job_id, "No runtime to remove abandoned container");
            return;
        };

        let mut remove = Command::new(&self.docker_binary);
        remove
            .args(&self.remove_args)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let job_id = self.job_id;
        runtime.spawn(async move {
            match remove.status().await {
                Ok(status) if status.success() => {
                    tracing::info!(job_id = %job_id, "Removed abandoned container");
                }
                Ok(status) => {
                    tracing::warn!(job_id = %job_id, %status, "Could not remove abandoned container");
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Could not remove abandoned container");
                }
            }
        });
    }
}

/// Bytes used below `dir`, `None` if it cannot be measured.
pub async fn scratch_usage(dir: &Path) -> Option<u64> {
    let dir = dir.to_path_buf();
    match tokio::task::spawn_blocking(move || dir_size(&dir)).await {
        Ok(Ok(size)) => Some(size),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "Could not measure scratch directory");
            None
        }
        Err(_) => None,
    }
}

fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}
