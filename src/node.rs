use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::{self, ApiState};
use crate::config::NodeConfig;
use crate::descriptor::JobSpec;
use crate::error::{CondorError, Result};
use crate::scheduler::{JobStatus, Scheduler, Submission, WorkerAdvertisement, WorkerInfo};
use crate::storage::{ArtifactStore, FsArtifactStore, StoreClient};
use crate::worker::{Dispatcher, DockerRunner, HeartbeatSender, WorkerEvent, WorkerRunner};

const MESSAGE_CHANNEL_CAPACITY: usize = 256;

/// Requests into the scheduler loop. Each carries its own reply channel.
#[derive(Debug)]
pub enum SchedulerMessage {
    Submit {
        specs: Vec<JobSpec>,
        reply: oneshot::Sender<Result<Submission>>,
    },
    Cancel {
        job_id: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        job_id: Uuid,
        reply: oneshot::Sender<Result<JobStatus>>,
    },
    List {
        reply: oneshot::Sender<Vec<JobStatus>>,
    },
    Heartbeat {
        advertisement: WorkerAdvertisement,
    },
    Workers {
        reply: oneshot::Sender<Vec<WorkerInfo>>,
    },
    /// Run a scheduling pass now; replies with the number of jobs dispatched.
    Tick {
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable front door to the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerMessage>,
}

impl SchedulerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SchedulerMessage,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| CondorError::SchedulerUnavailable)?;
        rx.await.map_err(|_| CondorError::SchedulerUnavailable)
    }

    pub async fn submit(&self, specs: Vec<JobSpec>) -> Result<Submission> {
        self.request(|reply| SchedulerMessage::Submit { specs, reply })
            .await?
    }

    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        self.request(|reply| SchedulerMessage::Cancel { job_id, reply })
            .await?
    }

    pub async fn status(&self, job_id: Uuid) -> Result<JobStatus> {
        self.request(|reply| SchedulerMessage::Status { job_id, reply })
            .await?
    }

    pub async fn list(&self) -> Result<Vec<JobStatus>> {
        self.request(|reply| SchedulerMessage::List { reply }).await
    }

    pub async fn workers(&self) -> Result<Vec<WorkerInfo>> {
        self.request(|reply| SchedulerMessage::Workers { reply })
            .await
    }

    pub async fn tick(&self) -> Result<usize> {
        self.request(|reply| SchedulerMessage::Tick { reply }).await
    }

    pub async fn heartbeat(&self, advertisement: WorkerAdvertisement) -> Result<()> {
        self.tx
            .send(SchedulerMessage::Heartbeat { advertisement })
            .await
            .map_err(|_| CondorError::SchedulerUnavailable)
    }
}

/// Task driving one dispatched attempt.
struct RunningAttempt {
    attempt: u32,
    scratch_dir: PathBuf,
    task: JoinHandle<()>,
}

/// The single task that owns the [`Scheduler`].
///
/// Client requests and worker events arrive over channels and are applied one
/// at a time, so every job state transition is serialized even though
/// attempts execute concurrently. Attempts the scheduler has given up on are
/// aborted.
pub struct SchedulerLoop<R, S> {
    scheduler: Scheduler,
    messages: mpsc::Receiver<SchedulerMessage>,
    events: mpsc::Receiver<WorkerEvent>,
    dispatcher: Dispatcher<R, S>,
    running: HashMap<Uuid, RunningAttempt>,
}

impl<R: WorkerRunner, S: ArtifactStore> SchedulerLoop<R, S> {
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.scheduler.config().tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Scheduler loop shutting down");
                    break;
                }

                message = self.messages.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    if self.handle_message(message) {
                        self.schedule();
                    }
                }

                Some(event) = self.events.recv() => {
                    self.handle_event(event);
                    self.schedule();
                }

                _ = interval.tick() => {
                    self.schedule();
                }
            }
            self.reap();
        }
    }

    /// Apply a client message. Returns true if a scheduling pass should follow.
    fn handle_message(&mut self, message: SchedulerMessage) -> bool {
        match message {
            SchedulerMessage::Submit { specs, reply } => {
                let result = self.scheduler.submit_batch(specs);
                let accepted = result.is_ok();
                let _ = reply.send(result);
                accepted
            }
            SchedulerMessage::Cancel { job_id, reply } => {
                let _ = reply.send(self.scheduler.cancel(&job_id));
                false
            }
            SchedulerMessage::Status { job_id, reply } => {
                let _ = reply.send(self.scheduler.status(&job_id));
                false
            }
            SchedulerMessage::List { reply } => {
                let _ = reply.send(self.scheduler.list());
                false
            }
            SchedulerMessage::Heartbeat { advertisement } => {
                self.scheduler.heartbeat(advertisement);
                true
            }
            SchedulerMessage::Workers { reply } => {
                let _ = reply.send(self.scheduler.workers(Instant::now()));
                false
            }
            SchedulerMessage::Tick { reply } => {
                let _ = reply.send(self.schedule());
                false
            }
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Staged {
                job_id,
                attempt,
                proceed,
            } => {
                let go = self.scheduler.on_staged(&job_id, attempt);
                let _ = proceed.send(go);
            }
            WorkerEvent::Finishing {
                job_id,
                attempt,
                proceed,
            } => {
                let go = self.scheduler.on_finishing(&job_id, attempt);
                let _ = proceed.send(go);
            }
            WorkerEvent::Finished {
                job_id,
                attempt,
                outcome,
            } => {
                // The task has nothing left to do once it reports.
                if self
                    .running
                    .get(&job_id)
                    .is_some_and(|r| r.attempt == attempt)
                {
                    self.running.remove(&job_id);
                }
                match self.scheduler.on_worker_report(&job_id, attempt, outcome) {
                    Ok(disposition) => {
                        tracing::debug!(job_id = %job_id, attempt, ?disposition, "Worker report applied");
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Worker report rejected");
                    }
                }
            }
        }
    }

    fn schedule(&mut self) -> usize {
        let dispatches = self.scheduler.tick();
        let count = dispatches.len();
        for dispatch in dispatches {
            let job_id = dispatch.job_id;
            let running = RunningAttempt {
                attempt: dispatch.attempt,
                scratch_dir: self.dispatcher.scratch_dir(&dispatch),
                task: self.dispatcher.spawn(dispatch),
            };
            if let Some(previous) = self.running.insert(job_id, running) {
                withdraw(job_id, previous);
            }
        }
        count
    }

    /// Forget finished attempt tasks and abort those whose attempt is no
    /// longer the job's current one.
    fn reap(&mut self) {
        let done: Vec<Uuid> = self
            .running
            .iter()
            .filter(|(job_id, running)| {
                running.task.is_finished()
                    || !self.scheduler.is_current_attempt(job_id, running.attempt)
            })
            .map(|(job_id, _)| *job_id)
            .collect();

        for job_id in done {
            if let Some(running) = self.running.remove(&job_id) {
                if !running.task.is_finished() {
                    withdraw(job_id, running);
                }
            }
        }
    }
}

/// Abort an attempt's task and clean up its scratch directory once the task
/// has stopped.
fn withdraw(job_id: Uuid, running: RunningAttempt) {
    tracing::info!(job_id = %job_id, attempt = running.attempt, "Aborting superseded attempt");
    running.task.abort();
    tokio::spawn(async move {
        let _ = running.task.await;
        if let Err(e) = tokio::fs::remove_dir_all(&running.scratch_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(job_id = %job_id, error = %e, "Failed to remove scratch directory");
            }
        }
    });
}

/// Main node that wires the scheduler loop, local workers and the HTTP API.
pub struct Node<R, S> {
    pub config: NodeConfig,
    handle: SchedulerHandle,
    scheduler_loop: SchedulerLoop<R, S>,
}

impl Node<DockerRunner, FsArtifactStore> {
    /// Node that runs containers with Docker and stores artifacts on disk.
    pub fn with_docker(config: NodeConfig) -> Self {
        let runner = DockerRunner::new(config.sandbox.clone());
        let store = FsArtifactStore::new(config.storage.root.clone());
        Self::new(config, runner, store)
    }
}

impl<R: WorkerRunner, S: ArtifactStore> Node<R, S> {
    pub fn new(config: NodeConfig, runner: R, store: S) -> Self {
        let (tx, messages) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let (events_tx, events) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);

        let store = StoreClient::new(store, config.storage.timeout());
        let dispatcher = Dispatcher::new(
            Arc::new(runner),
            Arc::new(store),
            config.sandbox.scratch_root.clone(),
            events_tx,
        );

        let scheduler_loop = SchedulerLoop {
            scheduler: Scheduler::new(config.scheduler.clone()),
            messages,
            events,
            dispatcher,
            running: HashMap::new(),
        };

        Self {
            config,
            handle: SchedulerHandle { tx },
            scheduler_loop,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Start the scheduler loop and the heartbeats of local workers.
    pub fn spawn(self, shutdown: CancellationToken) -> (SchedulerHandle, JoinHandle<()>) {
        let handle = self.handle.clone();

        // Local workers advertise well inside the timeout window.
        let interval = (self.config.scheduler.heartbeat_timeout() / 3)
            .max(std::time::Duration::from_millis(1));
        for advertisement in self.config.local_workers {
            let handle = handle.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tracing::info!(worker_id = %advertisement.worker_id, "Starting local worker");
                HeartbeatSender::new(interval)
                    .run(shutdown, || {
                        let handle = handle.clone();
                        let advertisement = advertisement.clone();
                        async move { handle.heartbeat(advertisement).await.is_ok() }
                    })
                    .await;
            });
        }

        let scheduler_loop = self.scheduler_loop;
        let join = tokio::spawn(async move {
            scheduler_loop.run(shutdown).await;
        });

        (handle, join)
    }

    /// Run the node until shutdown: scheduler loop, local workers and the
    /// HTTP API.
    ///
    /// # Errors
    ///
    /// Returns an error if the API listener cannot be bound or fails.
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        let listen_addr = self.config.listen_addr;
        let (handle, join) = self.spawn(shutdown.clone());

        let state = ApiState { scheduler: handle };
        api::serve(listen_addr, state, shutdown.clone()).await?;

        shutdown.cancel();
        if let Err(e) = join.await {
            tracing::error!(error = %e, "Scheduler loop panicked");
        }
        Ok(())
    }
}
