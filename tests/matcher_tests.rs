use condor_lite::descriptor::{Labels, Resources};
use condor_lite::scheduler::matcher::{eligible_workers, is_eligible};
use condor_lite::scheduler::WorkerSnapshot;

fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A spread of workers covering each dimension being short, exact or ample.
fn fleet() -> Vec<WorkerSnapshot> {
    let mut workers = Vec::new();
    let mut n = 0;
    for gpus in [0, 1, 2] {
        for cpus in [1, 2, 8] {
            for memory in [50, 100, 400] {
                for disk in [10, 20] {
                    for tag in ["short", "long"] {
                        n += 1;
                        workers.push(WorkerSnapshot {
                            worker_id: format!("w{:03}", n),
                            free: Resources::new(gpus, cpus, memory, disk),
                            labels: labels(&[("jobLength", tag), ("site", "east")]),
                        });
                    }
                }
            }
        }
    }
    workers
}

fn requests() -> Vec<(Resources, Labels)> {
    vec![
        (Resources::new(0, 1, 1, 1), Labels::new()),
        (Resources::new(1, 2, 100, 20), labels(&[("jobLength", "short")])),
        (Resources::new(2, 8, 400, 20), labels(&[("jobLength", "long")])),
        (Resources::new(1, 1, 60, 15), labels(&[("site", "east"), ("jobLength", "short")])),
        (Resources::new(3, 1, 1, 1), Labels::new()),
        (Resources::new(0, 1, 1, 1), labels(&[("site", "west")])),
    ]
}

#[test]
fn test_every_candidate_satisfies_the_request() {
    let workers = fleet();
    for (request, required) in requests() {
        for candidate in eligible_workers(&request, &required, &workers) {
            let worker = workers
                .iter()
                .find(|w| w.worker_id == candidate.worker_id)
                .unwrap();
            assert!(request.fits_within(&worker.free), "{} too small", worker.worker_id);
            for (key, value) in &required {
                assert_eq!(worker.labels.get(key), Some(value));
            }
            assert_eq!(
                candidate.remaining,
                worker.free.checked_sub(&request).unwrap()
            );
        }
    }
}

#[test]
fn test_every_eligible_worker_is_a_candidate() {
    let workers = fleet();
    for (request, required) in requests() {
        let candidates: Vec<String> = eligible_workers(&request, &required, &workers)
            .into_iter()
            .map(|c| c.worker_id)
            .collect();

        for worker in &workers {
            let fits = worker.free.gpus >= request.gpus
                && worker.free.cpus >= request.cpus
                && worker.free.memory_bytes >= request.memory_bytes
                && worker.free.disk_bytes >= request.disk_bytes;
            let tagged = required
                .iter()
                .all(|(k, v)| worker.labels.get(k) == Some(v));
            assert_eq!(
                candidates.contains(&worker.worker_id),
                fits && tagged,
                "worker {} for request {}",
                worker.worker_id,
                request
            );
            assert_eq!(is_eligible(&request, &required, worker), fits && tagged);
        }
    }
}

#[test]
fn test_impossible_requests_have_no_candidates() {
    let workers = fleet();
    let too_many_gpus = Resources::new(3, 1, 1, 1);
    assert!(eligible_workers(&too_many_gpus, &Labels::new(), &workers).is_empty());
    assert!(eligible_workers(
        &Resources::new(0, 1, 1, 1),
        &labels(&[("site", "west")]),
        &workers
    )
    .is_empty());
}

#[test]
fn test_candidates_are_ranked_deterministically() {
    let workers = fleet();
    let request = Resources::new(1, 1, 10, 5);
    let ranked = eligible_workers(&request, &Labels::new(), &workers);
    assert!(!ranked.is_empty());

    for pair in ranked.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        let (ka, kb) = (a.remaining.headroom_key(), b.remaining.headroom_key());
        assert!(ka > kb || (ka == kb && a.worker_id < b.worker_id));
    }

    let mut reversed = workers.clone();
    reversed.reverse();
    assert_eq!(eligible_workers(&request, &Labels::new(), &reversed), ranked);
}
