use std::time::{Duration, Instant};

use condor_lite::config::SchedulerConfig;
use condor_lite::descriptor::{ArtifactRef, JobSpec, Resources};
use condor_lite::error::CondorError;
use condor_lite::scheduler::{
    FailureReason, JobState, ReportDisposition, Scheduler, WorkerAdvertisement, WorkerOutcome,
};

const GB: u64 = 1_000_000_000;

fn small() -> Resources {
    Resources::new(0, 1, 256 << 20, 1 << 30)
}

fn spec(image: &str) -> JobSpec {
    JobSpec::new(image)
        .with_command(["echo", "hi"])
        .with_resources(small())
}

fn worker(id: &str, cpus: u32) -> WorkerAdvertisement {
    WorkerAdvertisement::new(id, Resources::new(0, cpus, 8 << 30, 100 << 30))
}

fn scheduler(max_retries: u32) -> Scheduler {
    Scheduler::new(SchedulerConfig {
        max_retries,
        ..SchedulerConfig::default()
    })
}

#[test]
fn test_submit_then_status_is_queued() {
    let mut sched = scheduler(3);
    let id = sched.submit(spec("alpine")).unwrap();

    let status = sched.status(&id).unwrap();
    assert_eq!(status.state, JobState::Queued);
    assert_eq!(status.retry_count, 0);
    assert_eq!(status.attempt, 0);
    assert!(status.assigned_worker.is_none());
    assert_eq!(status.transitions.len(), 1);
    assert_eq!(status.cluster_id, 1);
}

#[test]
fn test_submit_rejects_invalid_specs() {
    let mut sched = scheduler(3);

    let no_image = JobSpec::new("").with_resources(small());
    assert!(matches!(
        sched.submit(no_image),
        Err(CondorError::InvalidRequest(_))
    ));

    let zero_cpus = JobSpec::new("alpine").with_resources(Resources::new(0, 0, 1, 1));
    assert!(matches!(
        sched.submit(zero_cpus),
        Err(CondorError::InvalidRequest(_))
    ));

    let too_many_gpus = JobSpec::new("alpine").with_resources(Resources::new(64, 1, 1, 1));
    assert!(matches!(
        sched.submit(too_many_gpus),
        Err(CondorError::InvalidRequest(_))
    ));

    assert!(sched.list().is_empty());
}

#[test]
fn test_batch_is_all_or_nothing() {
    let mut sched = scheduler(3);
    let batch = vec![
        spec("alpine").with_batch(7, 0),
        spec("alpine").with_batch(7, 1),
        JobSpec::new("alpine").with_batch(7, 2),
    ];
    assert!(sched.submit_batch(batch).is_err());
    assert!(sched.list().is_empty());

    let batch = vec![spec("alpine").with_batch(7, 0), spec("alpine").with_batch(7, 1)];
    let submission = sched.submit_batch(batch).unwrap();
    assert_eq!(submission.cluster_id, 7);
    assert_eq!(submission.job_ids.len(), 2);

    // Same (cluster, process) again is a duplicate.
    let dup = sched.submit_batch(vec![spec("alpine").with_batch(7, 1)]);
    assert!(matches!(dup, Err(CondorError::InvalidRequest(_))));

    // Fresh cluster ids skip past ones already in use.
    let next = sched.submit_batch(vec![spec("alpine")]).unwrap();
    assert_eq!(next.cluster_id, 8);
}

#[test]
fn test_queue_full_rejects_submission() {
    let mut sched = Scheduler::new(SchedulerConfig {
        max_active_jobs: 2,
        ..SchedulerConfig::default()
    });
    sched.submit(spec("a")).unwrap();
    sched.submit(spec("b")).unwrap();
    assert!(matches!(
        sched.submit(spec("c")),
        Err(CondorError::QueueFull(2))
    ));
}

#[test]
fn test_cluster_macro_expanded_at_submission() {
    let mut sched = scheduler(3);
    let mut job = spec("alpine");
    job.stdout_artifact = Some("out.$(Cluster).txt".to_string());
    let id = sched.submit(job).unwrap();

    let record = sched.record(&id).unwrap();
    assert_eq!(record.descriptor.stdout_artifact.as_deref(), Some("out.1.txt"));
}

#[test]
fn test_end_to_end_gpu_job_is_staged_on_matching_worker() {
    let mut sched = scheduler(3);

    let job = JobSpec::new("tensorflow/tensorflow:latest-gpu")
        .with_command(["python", "train.py"])
        .with_resources(Resources::new(1, 1, 64 * GB, 12 * GB))
        .with_label("jobLength", "short");
    let id = sched.submit(job).unwrap();

    let gpu = WorkerAdvertisement::new("gpu-1", Resources::new(1, 4, 128 * GB, 50 * GB))
        .with_label("jobLength", "short")
        .with_label("flockingAllowed", "true");
    let cpu_only = WorkerAdvertisement::new("cpu-1", Resources::new(0, 64, 512 * GB, 500 * GB))
        .with_label("jobLength", "short");
    sched.heartbeat(gpu);
    sched.heartbeat(cpu_only);

    let dispatches = sched.tick();
    assert_eq!(dispatches.len(), 1);
    assert_eq!(dispatches[0].job_id, id);
    assert_eq!(dispatches[0].worker.worker_id, "gpu-1");
    assert_eq!(dispatches[0].grant, Resources::new(1, 1, 64 * GB, 12 * GB));

    let status = sched.status(&id).unwrap();
    assert_eq!(status.state, JobState::Staging);
    assert_eq!(status.assigned_worker.as_deref(), Some("gpu-1"));

    let gpu_state = sched.pool().get("gpu-1").unwrap();
    assert_eq!(gpu_state.free(), Resources::new(0, 3, 64 * GB, 38 * GB));
}

#[test]
fn test_label_mismatch_keeps_job_queued() {
    let mut sched = scheduler(3);
    let id = sched.submit(spec("alpine").with_label("jobLength", "long")).unwrap();
    sched.heartbeat(worker("w1", 4).with_label("jobLength", "short"));

    assert!(sched.tick().is_empty());
    assert_eq!(sched.status(&id).unwrap().state, JobState::Queued);
}

#[test]
fn test_tick_is_idempotent_without_new_events() {
    let mut sched = scheduler(3);
    for _ in 0..3 {
        sched.submit(spec("alpine")).unwrap();
    }
    // Room for two of the three jobs.
    sched.heartbeat(worker("w1", 2));

    let first = sched.tick();
    assert_eq!(first.len(), 2);
    let before: Vec<_> = sched.list().into_iter().map(|s| (s.id, s.state, s.attempt)).collect();

    assert!(sched.tick().is_empty());
    let after: Vec<_> = sched.list().into_iter().map(|s| (s.id, s.state, s.attempt)).collect();
    assert_eq!(before, after);
}

#[test]
fn test_fifo_order_within_tick() {
    let mut sched = scheduler(3);
    let first = sched.submit(spec("first")).unwrap();
    let second = sched.submit(spec("second")).unwrap();
    sched.heartbeat(worker("w1", 1));

    let dispatches = sched.tick();
    assert_eq!(dispatches.len(), 1);
    assert_eq!(dispatches[0].job_id, first);
    assert_eq!(sched.status(&second).unwrap().state, JobState::Queued);
}

#[test]
fn test_best_fit_prefers_most_headroom_then_lowest_id() {
    let mut sched = scheduler(3);
    sched.heartbeat(worker("b-small", 2));
    sched.heartbeat(worker("c-large", 8));
    sched.heartbeat(worker("a-large", 8));

    let id = sched.submit(spec("alpine")).unwrap();
    let dispatches = sched.tick();
    assert_eq!(dispatches.len(), 1);
    assert_eq!(dispatches[0].job_id, id);
    assert_eq!(dispatches[0].worker.worker_id, "a-large");
}

#[test]
fn test_successful_report_completes_job() {
    let mut sched = scheduler(3);
    let id = sched.submit(spec("alpine").with_output("result.txt")).unwrap();
    sched.heartbeat(worker("w1", 4));
    let attempt = sched.tick()[0].attempt;

    assert!(sched.on_staged(&id, attempt));
    assert_eq!(sched.status(&id).unwrap().state, JobState::Running);

    let outputs = vec![ArtifactRef::output(1, 0, "result.txt")];
    let disposition = sched
        .on_worker_report(
            &id,
            attempt,
            WorkerOutcome::Succeeded {
                outputs: outputs.clone(),
                exit_code: 0,
            },
        )
        .unwrap();
    assert_eq!(disposition, ReportDisposition::Completed);

    let status = sched.status(&id).unwrap();
    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.outputs, outputs);
    assert_eq!(status.exit_code, Some(0));
    assert!(status.finished_at.is_some());
    assert!(status.assigned_worker.is_none());

    // Capacity went back to the worker.
    assert_eq!(sched.pool().get("w1").unwrap().free().cpus, 4);
}

#[test]
fn test_retry_bound_allows_exactly_max_retries_plus_one_attempts() {
    let max_retries = 2;
    let mut sched = scheduler(max_retries);
    let id = sched.submit(spec("alpine")).unwrap();
    sched.heartbeat(worker("w1", 4));

    let mut attempts = 0;
    loop {
        let dispatches = sched.tick();
        if dispatches.is_empty() {
            break;
        }
        attempts += 1;
        let attempt = dispatches[0].attempt;
        assert!(sched.on_staged(&id, attempt));
        sched
            .on_worker_report(
                &id,
                attempt,
                WorkerOutcome::Failed {
                    reason: FailureReason::NonZeroExit(1),
                    exit_code: Some(1),
                },
            )
            .unwrap();
    }

    assert_eq!(attempts, max_retries + 1);
    let status = sched.status(&id).unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.retry_count, max_retries);
    assert_eq!(status.last_failure, Some(FailureReason::NonZeroExit(1)));
    assert_eq!(status.exit_code, Some(1));
}

#[test]
fn test_storage_failure_during_staging_is_retried() {
    let mut sched = scheduler(1);
    let id = sched.submit(spec("alpine").with_input("bundles/in.tar")).unwrap();
    sched.heartbeat(worker("w1", 4));
    let attempt = sched.tick()[0].attempt;

    let disposition = sched
        .on_worker_report(
            &id,
            attempt,
            WorkerOutcome::failed(FailureReason::StorageUnavailable("timeout".into())),
        )
        .unwrap();
    assert_eq!(disposition, ReportDisposition::Requeued);

    let status = sched.status(&id).unwrap();
    assert_eq!(status.state, JobState::Queued);
    assert_eq!(status.retry_count, 1);

    let redispatch = sched.tick();
    assert_eq!(redispatch.len(), 1);
    assert_eq!(redispatch[0].attempt, attempt + 1);
}

#[test]
fn test_stale_report_is_ignored() {
    let mut sched = scheduler(3);
    let id = sched.submit(spec("alpine")).unwrap();
    sched.heartbeat(worker("w1", 4));
    let first = sched.tick()[0].attempt;
    sched
        .on_worker_report(&id, first, WorkerOutcome::failed(FailureReason::NonZeroExit(2)))
        .unwrap();
    let second = sched.tick()[0].attempt;
    assert_eq!(second, first + 1);

    let late = sched
        .on_worker_report(&id, first, WorkerOutcome::failed(FailureReason::NonZeroExit(2)))
        .unwrap();
    assert_eq!(late, ReportDisposition::Ignored);
    assert_eq!(sched.status(&id).unwrap().retry_count, 1);
    assert_eq!(sched.status(&id).unwrap().state, JobState::Staging);
}

#[test]
fn test_report_for_unknown_job_is_not_found() {
    let mut sched = scheduler(3);
    let missing = uuid::Uuid::new_v4();
    assert!(matches!(
        sched.on_worker_report(&missing, 1, WorkerOutcome::Lost),
        Err(CondorError::JobNotFound(id)) if id == missing
    ));
}

#[test]
fn test_cancel_queued_job() {
    let mut sched = scheduler(3);
    let id = sched.submit(spec("alpine")).unwrap();
    sched.cancel(&id).unwrap();

    let status = sched.status(&id).unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.last_failure, Some(FailureReason::Cancelled));

    sched.heartbeat(worker("w1", 4));
    assert!(sched.tick().is_empty());
}

#[test]
fn test_cancel_staging_job_withholds_launch() {
    let mut sched = scheduler(3);
    let id = sched.submit(spec("alpine")).unwrap();
    sched.heartbeat(worker("w1", 4));
    let attempt = sched.tick()[0].attempt;

    sched.cancel(&id).unwrap();
    assert!(!sched.on_staged(&id, attempt));
    assert_eq!(sched.status(&id).unwrap().state, JobState::Failed);
    assert_eq!(sched.pool().get("w1").unwrap().free().cpus, 4);
}

#[test]
fn test_cancel_running_job_is_invalid_state() {
    let mut sched = scheduler(3);
    let id = sched.submit(spec("alpine")).unwrap();
    sched.heartbeat(worker("w1", 4));
    let attempt = sched.tick()[0].attempt;
    assert!(sched.on_staged(&id, attempt));

    assert!(matches!(
        sched.cancel(&id),
        Err(CondorError::InvalidState { state: JobState::Running, .. })
    ));
}

#[test]
fn test_cancel_report_race_has_one_terminal_outcome() {
    // Cancel first: the late success report is ignored.
    let mut sched = scheduler(3);
    let id = sched.submit(spec("alpine")).unwrap();
    sched.heartbeat(worker("w1", 4));
    let attempt = sched.tick()[0].attempt;
    sched.cancel(&id).unwrap();
    let late = sched
        .on_worker_report(
            &id,
            attempt,
            WorkerOutcome::Succeeded {
                outputs: Vec::new(),
                exit_code: 0,
            },
        )
        .unwrap();
    assert_eq!(late, ReportDisposition::Ignored);
    assert_eq!(sched.status(&id).unwrap().state, JobState::Failed);

    // Report first: the cancel is refused.
    let mut sched = scheduler(3);
    let id = sched.submit(spec("alpine")).unwrap();
    sched.heartbeat(worker("w1", 4));
    let attempt = sched.tick()[0].attempt;
    assert!(sched.on_staged(&id, attempt));
    sched
        .on_worker_report(
            &id,
            attempt,
            WorkerOutcome::Succeeded {
                outputs: Vec::new(),
                exit_code: 0,
            },
        )
        .unwrap();
    assert!(matches!(
        sched.cancel(&id),
        Err(CondorError::InvalidState { state: JobState::Succeeded, .. })
    ));
    let status = sched.status(&id).unwrap();
    assert_eq!(status.state, JobState::Succeeded);
    let terminal = status
        .transitions
        .iter()
        .filter(|t| t.state.is_terminal())
        .count();
    assert_eq!(terminal, 1);
}

#[test]
fn test_silent_worker_loses_its_jobs() {
    let mut sched = scheduler(3);
    let timeout = sched.config().heartbeat_timeout();
    let id = sched.submit(spec("alpine")).unwrap();

    let t0 = Instant::now();
    sched.heartbeat_at(worker("w1", 4), t0);
    let dispatches = sched.tick_at(t0);
    assert_eq!(dispatches.len(), 1);

    let later = t0 + timeout + Duration::from_millis(1);
    assert!(sched.tick_at(later).is_empty());

    let status = sched.status(&id).unwrap();
    assert_eq!(status.state, JobState::Queued);
    assert_eq!(status.retry_count, 1);
    assert_eq!(status.last_failure, Some(FailureReason::Lost));
    assert!(status.transitions.iter().any(|t| t.state == JobState::Lost));
    assert!(sched.pool().get("w1").is_none());

    // A fresh worker picks the job up again.
    sched.heartbeat_at(worker("w2", 4), later);
    let redispatch = sched.tick_at(later);
    assert_eq!(redispatch.len(), 1);
    assert_eq!(redispatch[0].worker.worker_id, "w2");
}

#[test]
fn test_heartbeat_keeps_reservations() {
    let mut sched = scheduler(3);
    sched.submit(spec("alpine")).unwrap();
    sched.heartbeat(worker("w1", 1));
    assert_eq!(sched.tick().len(), 1);

    sched.heartbeat(worker("w1", 1));
    sched.submit(spec("alpine")).unwrap();
    assert!(sched.tick().is_empty());
    assert_eq!(sched.pool().get("w1").unwrap().free().cpus, 0);
}

#[test]
fn test_success_before_staging_finished_fails_attempt() {
    let mut sched = scheduler(3);
    let id = sched.submit(spec("alpine")).unwrap();
    sched.heartbeat(worker("w1", 1));
    let attempt = sched.tick()[0].attempt;

    let disposition = sched
        .on_worker_report(
            &id,
            attempt,
            WorkerOutcome::Succeeded {
                outputs: Vec::new(),
                exit_code: 0,
            },
        )
        .unwrap();
    assert_eq!(disposition, ReportDisposition::Requeued);

    let status = sched.status(&id).unwrap();
    assert_eq!(status.state, JobState::Queued);
    assert!(matches!(
        status.last_failure,
        Some(FailureReason::LaunchFailed(_))
    ));
    assert!(status.outputs.is_empty());
    // The reservation is returned, so the job can be placed again.
    assert_eq!(sched.pool().get("w1").unwrap().free().cpus, 1);
    assert_eq!(sched.tick()[0].attempt, attempt + 1);
}

#[test]
fn test_only_running_current_attempt_may_finish() {
    let mut sched = scheduler(3);
    let id = sched.submit(spec("alpine")).unwrap();
    let t0 = Instant::now();
    sched.heartbeat_at(worker("w1", 4), t0);
    let first = sched.tick_at(t0)[0].attempt;

    // Still staging.
    assert!(!sched.on_finishing(&id, first));
    assert!(sched.is_current_attempt(&id, first));
    assert!(sched.on_staged(&id, first));
    assert!(sched.on_finishing(&id, first));

    // The worker goes silent and the job moves on.
    let later = t0 + sched.config().heartbeat_timeout() + Duration::from_millis(1);
    sched.heartbeat_at(worker("w2", 4), later);
    let second = sched.tick_at(later)[0].attempt;
    assert_eq!(second, first + 1);

    assert!(!sched.is_current_attempt(&id, first));
    assert!(!sched.on_finishing(&id, first));
    assert!(sched.on_staged(&id, second));
    assert!(sched.on_finishing(&id, second));
    assert!(!sched.on_finishing(&uuid::Uuid::new_v4(), 1));
}
