use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::descriptor::{Labels, Resources};

/// What a worker announces about itself on every heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAdvertisement {
    pub worker_id: String,
    pub capacity: Resources,
    #[serde(default)]
    pub labels: Labels,
    /// Container engine endpoint (`docker -H`), local engine when absent.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Jobs the worker itself believes it is running.
    #[serde(default)]
    pub load: u32,
}

impl WorkerAdvertisement {
    pub fn new(worker_id: impl Into<String>, capacity: Resources) -> Self {
        Self {
            worker_id: worker_id.into(),
            capacity,
            labels: Labels::new(),
            endpoint: None,
            load: 0,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// Scheduler-side tracking of one worker.
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub advertisement: WorkerAdvertisement,
    pub last_heartbeat: Instant,
    pub reserved: Resources,
    pub jobs: HashSet<Uuid>,
}

impl WorkerState {
    fn new(advertisement: WorkerAdvertisement, now: Instant) -> Self {
        Self {
            advertisement,
            last_heartbeat: now,
            reserved: Resources::default(),
            jobs: HashSet::new(),
        }
    }

    pub fn free(&self) -> Resources {
        self.advertisement.capacity.saturating_sub(&self.reserved)
    }

    pub fn is_alive(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat) < timeout
    }
}

/// Read-only view of a worker given to the resource matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub free: Resources,
    pub labels: Labels,
}

/// Serializable view of a worker for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub capacity: Resources,
    pub free: Resources,
    pub labels: Labels,
    pub endpoint: Option<String>,
    pub load: u32,
    pub assigned_jobs: usize,
    pub heartbeat_age_ms: u64,
}

/// Worker advertisements and the capacity reserved on each worker.
///
/// Only the scheduler core mutates the pool; reservations are made when a job
/// is dispatched and released when the attempt ends.
#[derive(Debug)]
pub struct WorkerPool {
    workers: BTreeMap<String, WorkerState>,
    heartbeat_timeout: Duration,
}

impl WorkerPool {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            workers: BTreeMap::new(),
            heartbeat_timeout,
        }
    }

    /// Register or refresh a worker. Reservations survive a refresh.
    pub fn heartbeat(&mut self, advertisement: WorkerAdvertisement, now: Instant) {
        match self.workers.get_mut(&advertisement.worker_id) {
            Some(worker) => {
                worker.advertisement = advertisement;
                worker.last_heartbeat = now;
            }
            None => {
                tracing::info!(
                    worker_id = %advertisement.worker_id,
                    capacity = %advertisement.capacity,
                    "Worker registered"
                );
                self.workers.insert(
                    advertisement.worker_id.clone(),
                    WorkerState::new(advertisement, now),
                );
            }
        }
    }

    pub fn get(&self, worker_id: &str) -> Option<&WorkerState> {
        self.workers.get(worker_id)
    }

    /// Live workers and their free capacity, ordered by worker id.
    pub fn snapshot(&self, now: Instant) -> Vec<WorkerSnapshot> {
        self.workers
            .values()
            .filter(|w| w.is_alive(now, self.heartbeat_timeout))
            .map(|w| WorkerSnapshot {
                worker_id: w.advertisement.worker_id.clone(),
                free: w.free(),
                labels: w.advertisement.labels.clone(),
            })
            .collect()
    }

    /// Reserve `grant` on a worker for a job. Fails if the worker is unknown or
    /// lacks the free capacity.
    pub fn reserve(&mut self, worker_id: &str, job_id: Uuid, grant: Resources) -> bool {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return false;
        };
        if !grant.fits_within(&worker.free()) {
            return false;
        }
        worker.reserved = worker.reserved.saturating_add(&grant);
        worker.jobs.insert(job_id);
        true
    }

    /// Give back a reservation. Unknown workers (already expired) are ignored.
    pub fn release(&mut self, worker_id: &str, job_id: &Uuid, grant: Resources) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            if worker.jobs.remove(job_id) {
                worker.reserved = worker.reserved.saturating_sub(&grant);
            }
        }
    }

    /// Remove workers whose heartbeat is older than the timeout and return
    /// their ids.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.heartbeat_timeout;
        let dead: Vec<String> = self
            .workers
            .values()
            .filter(|w| !w.is_alive(now, timeout))
            .map(|w| w.advertisement.worker_id.clone())
            .collect();

        for worker_id in &dead {
            self.workers.remove(worker_id);
            tracing::warn!(worker_id = %worker_id, "Worker heartbeat timed out");
        }
        dead
    }

    pub fn info(&self, now: Instant) -> Vec<WorkerInfo> {
        self.workers
            .values()
            .map(|w| WorkerInfo {
                worker_id: w.advertisement.worker_id.clone(),
                capacity: w.advertisement.capacity,
                free: w.free(),
                labels: w.advertisement.labels.clone(),
                endpoint: w.advertisement.endpoint.clone(),
                load: w.advertisement.load,
                assigned_jobs: w.jobs.len(),
                heartbeat_age_ms: now.saturating_duration_since(w.last_heartbeat).as_millis()
                    as u64,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
