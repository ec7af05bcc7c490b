//! Resource matching: which workers can take a request right now.
//!
//! Pure functions over a [`WorkerSnapshot`] list; safe to call as often as
//! needed.

use crate::descriptor::{Labels, Resources};
use crate::scheduler::pool::WorkerSnapshot;

/// An eligible worker together with what it would have left after the match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub worker_id: String,
    pub remaining: Resources,
}

/// True if every requested label is advertised with the same value.
pub fn labels_satisfied(required: &Labels, advertised: &Labels) -> bool {
    required
        .iter()
        .all(|(key, value)| advertised.get(key) == Some(value))
}

pub fn is_eligible(request: &Resources, labels: &Labels, worker: &WorkerSnapshot) -> bool {
    request.fits_within(&worker.free) && labels_satisfied(labels, &worker.labels)
}

/// Every eligible worker, most remaining capacity first, then lowest id.
pub fn eligible_workers(
    request: &Resources,
    labels: &Labels,
    workers: &[WorkerSnapshot],
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = workers
        .iter()
        .filter(|w| is_eligible(request, labels, w))
        .filter_map(|w| {
            Some(Candidate {
                worker_id: w.worker_id.clone(),
                remaining: w.free.checked_sub(request)?,
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.remaining
            .headroom_key()
            .cmp(&a.remaining.headroom_key())
            .then_with(|| a.worker_id.cmp(&b.worker_id))
    });
    candidates
}

/// The worker the scheduler should pick, if any.
pub fn best_candidate(
    request: &Resources,
    labels: &Labels,
    workers: &[WorkerSnapshot],
) -> Option<Candidate> {
    eligible_workers(request, labels, workers).into_iter().next()
}
