use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::descriptor::{JobDescriptor, JobSpec, Resources};
use crate::error::{CondorError, Result};
use crate::scheduler::job::{FailureReason, JobRecord, JobState, JobStatus, WorkerOutcome};
use crate::scheduler::matcher;
use crate::scheduler::pool::{WorkerAdvertisement, WorkerInfo, WorkerPool};
use crate::scheduler::queue::JobTable;

/// Work handed to a worker runner by a scheduling pass.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub job_id: Uuid,
    pub attempt: u32,
    pub descriptor: Arc<JobDescriptor>,
    pub worker: WorkerAdvertisement,
    pub grant: Resources,
}

/// Result of accepting a batch of specs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub cluster_id: u64,
    pub job_ids: Vec<Uuid>,
}

/// What a worker report did to its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportDisposition {
    /// The job succeeded.
    Completed,
    /// The attempt failed and the job went back to the queue.
    Requeued,
    /// The attempt failed and no retries were left.
    Exhausted,
    /// The report was for another attempt or a job no longer assigned.
    Ignored,
}

/// Owns the job table and the worker pool and makes every state transition.
///
/// The scheduler is a plain synchronous state machine. Callers serialize
/// access to it (the node runs it inside a single task); it never blocks and
/// never performs I/O.
#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    jobs: JobTable,
    pool: WorkerPool,
    next_cluster_id: u64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            jobs: JobTable::with_capacity(config.max_active_jobs),
            pool: WorkerPool::new(config.heartbeat_timeout()),
            next_cluster_id: 1,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn record(&self, job_id: &Uuid) -> Option<&JobRecord> {
        self.jobs.get(job_id)
    }

    pub fn status(&self, job_id: &Uuid) -> Result<JobStatus> {
        self.jobs
            .get(job_id)
            .map(JobRecord::status)
            .ok_or(CondorError::JobNotFound(*job_id))
    }

    pub fn list(&self) -> Vec<JobStatus> {
        self.jobs.all().into_iter().map(JobRecord::status).collect()
    }

    pub fn workers(&self, now: Instant) -> Vec<WorkerInfo> {
        self.pool.info(now)
    }

    /// Submit one job. A spec without a cluster id gets a fresh one.
    pub fn submit(&mut self, spec: JobSpec) -> Result<Uuid> {
        let submission = self.submit_batch(vec![spec])?;
        submission
            .job_ids
            .into_iter()
            .next()
            .ok_or_else(|| CondorError::Internal("empty submission".into()))
    }

    /// Submit a batch all-or-nothing. Specs without a cluster id share one
    /// freshly allocated cluster id.
    pub fn submit_batch(&mut self, specs: Vec<JobSpec>) -> Result<Submission> {
        if specs.is_empty() {
            return Err(CondorError::InvalidRequest("no jobs in submission".into()));
        }
        if self.jobs.active_len() + specs.len() > self.jobs.max_active() {
            tracing::warn!(
                active = self.jobs.active_len(),
                requested = specs.len(),
                "Job queue at capacity, submission rejected"
            );
            return Err(CondorError::QueueFull(self.jobs.max_active()));
        }

        let fresh_cluster = if specs.iter().any(|s| s.cluster_id.is_none()) {
            Some(self.peek_cluster_id())
        } else {
            None
        };

        let mut bound = Vec::with_capacity(specs.len());
        let mut keys = HashSet::new();
        for mut spec in specs {
            let cluster_id = spec.cluster_id.or(fresh_cluster).unwrap_or_default();
            spec.bind_cluster(cluster_id);
            spec.validate(&self.config.resource_caps)?;

            let key = (cluster_id, spec.process_id);
            if self.jobs.contains_batch(key.0, key.1) || !keys.insert(key) {
                return Err(CondorError::InvalidRequest(format!(
                    "job {}.{} already exists",
                    key.0, key.1
                )));
            }
            bound.push(spec);
        }

        if let Some(cluster_id) = fresh_cluster {
            self.next_cluster_id = cluster_id + 1;
        }

        let submitted_at = Utc::now();
        let cluster_id = bound
            .first()
            .and_then(|s| s.cluster_id)
            .unwrap_or_default();
        let mut job_ids = Vec::with_capacity(bound.len());
        for spec in bound {
            let descriptor = Arc::new(JobDescriptor::from_spec(Uuid::new_v4(), spec, submitted_at));
            let seq = self.jobs.next_seq();
            let job_id = descriptor.id;
            tracing::info!(
                job_id = %job_id,
                batch = %descriptor.batch_id(),
                image = %descriptor.image,
                resources = %descriptor.resources,
                "Job submitted"
            );
            if !self.jobs.insert(JobRecord::new(descriptor, seq)) {
                return Err(CondorError::Internal(format!("duplicate job id {}", job_id)));
            }
            job_ids.push(job_id);
        }

        Ok(Submission {
            cluster_id,
            job_ids,
        })
    }

    fn peek_cluster_id(&self) -> u64 {
        let above_existing = self.jobs.max_cluster_id().map_or(1, |c| c + 1);
        self.next_cluster_id.max(above_existing)
    }

    pub fn heartbeat(&mut self, advertisement: WorkerAdvertisement) {
        self.heartbeat_at(advertisement, Instant::now());
    }

    pub fn heartbeat_at(&mut self, advertisement: WorkerAdvertisement, now: Instant) {
        self.pool.heartbeat(advertisement, now);
    }

    pub fn tick(&mut self) -> Vec<Dispatch> {
        self.tick_at(Instant::now())
    }

    /// One scheduling pass: expire silent workers, then place Queued jobs in
    /// submission order on the best eligible worker.
    pub fn tick_at(&mut self, now: Instant) -> Vec<Dispatch> {
        self.expire_workers(now);

        let mut snapshot = self.pool.snapshot(now);
        let mut dispatches = Vec::new();
        if snapshot.is_empty() {
            return dispatches;
        }

        for job_id in self.jobs.queued() {
            let Some(descriptor) = self.jobs.get(&job_id).map(|r| r.descriptor.clone()) else {
                continue;
            };
            let Some(candidate) =
                matcher::best_candidate(&descriptor.resources, &descriptor.labels, &snapshot)
            else {
                tracing::trace!(job_id = %job_id, "No eligible worker");
                continue;
            };

            let grant = descriptor.resources;
            if !self.pool.reserve(&candidate.worker_id, job_id, grant) {
                continue;
            }
            if let Some(entry) = snapshot
                .iter_mut()
                .find(|w| w.worker_id == candidate.worker_id)
            {
                entry.free = candidate.remaining;
            }

            let Some(worker) = self
                .pool
                .get(&candidate.worker_id)
                .map(|w| w.advertisement.clone())
            else {
                continue;
            };
            let Some(record) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            record.assigned_worker = Some(candidate.worker_id.clone());
            record.grant = Some(grant);
            record.attempt += 1;
            let attempt = record.attempt;
            self.jobs.transition(&job_id, JobState::Staging);

            tracing::info!(
                job_id = %job_id,
                worker_id = %candidate.worker_id,
                attempt,
                "Job assigned"
            );

            dispatches.push(Dispatch {
                job_id,
                attempt,
                descriptor,
                worker,
                grant,
            });
        }

        dispatches
    }

    /// Drop workers that missed their heartbeat window; their jobs are Lost.
    /// Returns the number of jobs affected.
    pub fn expire_workers(&mut self, now: Instant) -> usize {
        let mut affected = 0;
        for worker_id in self.pool.expire(now) {
            for job_id in self.jobs.assigned_to(&worker_id) {
                tracing::warn!(job_id = %job_id, worker_id = %worker_id, "Job lost with its worker");
                self.fail_attempt(&job_id, FailureReason::Lost, None, true);
                affected += 1;
            }
        }
        affected
    }

    /// True while `attempt` is the job's live dispatch (Staging or Running).
    pub fn is_current_attempt(&self, job_id: &Uuid, attempt: u32) -> bool {
        self.jobs
            .get(job_id)
            .is_some_and(|r| r.state.is_assigned() && r.attempt == attempt)
    }

    fn attempt_in(&self, job_id: &Uuid, attempt: u32, state: JobState) -> bool {
        self.jobs
            .get(job_id)
            .is_some_and(|r| r.state == state && r.attempt == attempt)
    }

    /// Staging finished for `attempt`. Returns true if the job moved to
    /// Running and the container may be launched.
    pub fn on_staged(&mut self, job_id: &Uuid, attempt: u32) -> bool {
        if !self.attempt_in(job_id, attempt, JobState::Staging) {
            return false;
        }
        self.jobs.transition(job_id, JobState::Running);
        tracing::debug!(job_id = %job_id, attempt, "Job running");
        true
    }

    /// The container of `attempt` exited. Returns true if the attempt still
    /// owns the job and may write its outputs to the store.
    pub fn on_finishing(&self, job_id: &Uuid, attempt: u32) -> bool {
        let current = self.attempt_in(job_id, attempt, JobState::Running);
        if !current {
            tracing::info!(job_id = %job_id, attempt, "Withholding outputs of superseded attempt");
        }
        current
    }

    /// Apply a worker's report for one attempt of a job.
    pub fn on_worker_report(
        &mut self,
        job_id: &Uuid,
        attempt: u32,
        outcome: WorkerOutcome,
    ) -> Result<ReportDisposition> {
        let record = self
            .jobs
            .get(job_id)
            .ok_or(CondorError::JobNotFound(*job_id))?;

        let state = record.state;
        if !state.is_assigned() || record.attempt != attempt {
            tracing::debug!(
                job_id = %job_id,
                attempt,
                current_attempt = record.attempt,
                state = %record.state,
                "Ignoring stale worker report"
            );
            return Ok(ReportDisposition::Ignored);
        }

        let disposition = match outcome {
            WorkerOutcome::Succeeded { outputs, exit_code } => {
                if state != JobState::Running {
                    tracing::warn!(job_id = %job_id, "Success reported before staging finished");
                    return Ok(self.fail_attempt(
                        job_id,
                        FailureReason::LaunchFailed(
                            "success reported before staging finished".to_string(),
                        ),
                        None,
                        false,
                    ));
                }
                self.release(job_id);
                if let Some(record) = self.jobs.get_mut(job_id) {
                    record.outputs = outputs;
                    record.exit_code = Some(exit_code);
                }
                self.jobs.transition(job_id, JobState::Succeeded);
                tracing::info!(job_id = %job_id, attempt, "Job succeeded");
                ReportDisposition::Completed
            }
            WorkerOutcome::Failed { reason, exit_code } => {
                self.fail_attempt(job_id, reason, exit_code, false)
            }
            WorkerOutcome::Lost => self.fail_attempt(job_id, FailureReason::Lost, None, true),
        };
        Ok(disposition)
    }

    /// Cancel a job that has not started running.
    pub fn cancel(&mut self, job_id: &Uuid) -> Result<()> {
        let state = self
            .jobs
            .get(job_id)
            .map(|r| r.state)
            .ok_or(CondorError::JobNotFound(*job_id))?;

        match state {
            JobState::Queued | JobState::Staging => {
                self.release(job_id);
                if let Some(record) = self.jobs.get_mut(job_id) {
                    record.last_failure = Some(FailureReason::Cancelled);
                }
                self.jobs.transition(job_id, JobState::Failed);
                tracing::info!(job_id = %job_id, from = %state, "Job cancelled");
                Ok(())
            }
            state => Err(CondorError::InvalidState {
                job_id: *job_id,
                state,
            }),
        }
    }

    /// Clear the job's assignment and return its reservation to the pool.
    fn release(&mut self, job_id: &Uuid) {
        let Some(record) = self.jobs.get_mut(job_id) else {
            return;
        };
        if let (Some(worker_id), Some(grant)) = (record.assigned_worker.take(), record.grant.take())
        {
            self.pool.release(&worker_id, job_id, grant);
        }
    }

    fn fail_attempt(
        &mut self,
        job_id: &Uuid,
        reason: FailureReason,
        exit_code: Option<i32>,
        lost: bool,
    ) -> ReportDisposition {
        self.release(job_id);
        let max_retries = self.config.max_retries;
        let Some(record) = self.jobs.get_mut(job_id) else {
            return ReportDisposition::Ignored;
        };

        if exit_code.is_some() {
            record.exit_code = exit_code;
        }
        tracing::warn!(
            job_id = %job_id,
            attempt = record.attempt,
            retry_count = record.retry_count,
            reason = %reason,
            "Job attempt failed"
        );
        record.last_failure = Some(reason);
        let retry = record.retry_count < max_retries;
        if retry {
            record.retry_count += 1;
        }
        let retries = record.retry_count;

        if lost {
            self.jobs.transition(job_id, JobState::Lost);
        }
        if retry {
            self.jobs.transition(job_id, JobState::Queued);
            ReportDisposition::Requeued
        } else {
            self.jobs.transition(job_id, JobState::Failed);
            tracing::error!(job_id = %job_id, retries, "Job failed, retries exhausted");
            ReportDisposition::Exhausted
        }
    }
}
