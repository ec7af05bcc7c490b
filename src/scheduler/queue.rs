use std::collections::{BTreeMap, HashMap, HashSet};

use uuid::Uuid;

use crate::scheduler::job::{JobRecord, JobState};

const DEFAULT_MAX_ACTIVE_JOBS: usize = 10_000;

/// Owns every [`JobRecord`]. Terminal records stay in the table so they can
/// still be queried; only active records count against capacity.
///
/// State changes go through [`JobTable::transition`] so the queued index and
/// the active count stay in step with the records.
#[derive(Debug)]
pub struct JobTable {
    jobs: HashMap<Uuid, JobRecord>,
    batches: HashSet<(u64, u32)>,
    /// Queued job ids keyed by submission sequence.
    queued: BTreeMap<u64, Uuid>,
    active: usize,
    next_seq: u64,
    max_active: usize,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ACTIVE_JOBS)
    }

    pub fn with_capacity(max_active: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            batches: HashSet::new(),
            queued: BTreeMap::new(),
            active: 0,
            next_seq: 0,
            max_active,
        }
    }

    /// Sequence number for the next submission; defines FIFO order.
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Insert a record. Returns false if the id or `(cluster, process)` is taken.
    pub fn insert(&mut self, record: JobRecord) -> bool {
        let key = (record.descriptor.cluster_id, record.descriptor.process_id);
        if self.jobs.contains_key(&record.id()) || self.batches.contains(&key) {
            return false;
        }
        if record.state == JobState::Queued {
            self.queued.insert(record.seq, record.id());
        }
        if !record.state.is_terminal() {
            self.active += 1;
        }
        self.batches.insert(key);
        self.jobs.insert(record.id(), record);
        true
    }

    pub fn get(&self, id: &Uuid) -> Option<&JobRecord> {
        self.jobs.get(id)
    }

    /// Mutable access for bookkeeping fields. Use [`JobTable::transition`] to
    /// change the state.
    pub(crate) fn get_mut(&mut self, id: &Uuid) -> Option<&mut JobRecord> {
        self.jobs.get_mut(id)
    }

    /// Move a record to `state` and log the transition. Returns false for an
    /// unknown id.
    pub fn transition(&mut self, id: &Uuid, state: JobState) -> bool {
        let Some(record) = self.jobs.get_mut(id) else {
            return false;
        };
        let from = record.state;
        record.transition(state);

        if from == JobState::Queued && state != JobState::Queued {
            self.queued.remove(&record.seq);
        } else if from != JobState::Queued && state == JobState::Queued {
            self.queued.insert(record.seq, *id);
        }
        match (from.is_terminal(), state.is_terminal()) {
            (false, true) => self.active -= 1,
            (true, false) => self.active += 1,
            _ => {}
        }
        true
    }

    pub fn contains_batch(&self, cluster_id: u64, process_id: u32) -> bool {
        self.batches.contains(&(cluster_id, process_id))
    }

    /// Highest cluster id in use, if any.
    pub fn max_cluster_id(&self) -> Option<u64> {
        self.batches.iter().map(|(c, _)| *c).max()
    }

    /// Ids of Queued jobs in submission order.
    pub fn queued(&self) -> Vec<Uuid> {
        self.queued.values().copied().collect()
    }

    /// All records in submission order.
    pub fn all(&self) -> Vec<&JobRecord> {
        let mut jobs: Vec<&JobRecord> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.seq);
        jobs
    }

    /// Ids of jobs currently holding a reservation on `worker_id`.
    pub fn assigned_to(&self, worker_id: &str) -> Vec<Uuid> {
        let mut assigned: Vec<&JobRecord> = self
            .jobs
            .values()
            .filter(|j| j.state.is_assigned() && j.assigned_worker.as_deref() == Some(worker_id))
            .collect();
        assigned.sort_by_key(|j| j.seq);
        assigned.into_iter().map(|j| j.id()).collect()
    }

    /// Records that are not yet Succeeded or Failed.
    pub fn active_len(&self) -> usize {
        self.active
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
