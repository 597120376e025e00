//! Integration tests for the worker loop running real shell commands.

#![cfg(unix)]

use std::time::Duration;

use queuectl::scheduler::shutdown::request_stop;
use queuectl::scheduler::{
    CycleOutcome, JobQueue, JobState, NewJob, ShutdownSignal, Worker, WorkerConfig,
    WorkerIdentity,
};
use queuectl::storage::JobStore;

async fn wait_for_state(queue: &JobQueue, id: &str, state: JobState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let job = queue.store().get_job(id).await.unwrap().unwrap();
        if job.state == state {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "Job {} stuck in {}",
            id,
            job.state
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_worker_processes_jobs_until_stop_file() {
    let dir = tempfile::tempdir().unwrap();
    let stop_file = dir.path().join(".stop_workers");
    let store = JobStore::open(dir.path().join("job-queue.db")).await.unwrap();
    let queue = JobQueue::new(store);

    queue.enqueue(NewJob::new("ok", "echo hello")).await.unwrap();
    queue
        .enqueue(NewJob::new("bad", "echo failing >&2; exit 4").with_max_attempts(1))
        .await
        .unwrap();

    let config = WorkerConfig::new()
        .with_poll_interval(Duration::from_millis(50))
        .with_stop_file(&stop_file);
    let shutdown = ShutdownSignal::new(&stop_file);
    let worker = Worker::new(queue.clone(), config, shutdown)
        .with_identity(WorkerIdentity::new(920_001, "loop-host"));
    let handle = tokio::spawn(worker.run());

    wait_for_state(&queue, "ok", JobState::Completed).await;
    wait_for_state(&queue, "bad", JobState::Dead).await;

    let active = queue
        .store()
        .active_workers(chrono::Utc::now())
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].pid, 920_001);

    request_stop(&stop_file).unwrap();
    let stats = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("Worker should stop")
        .unwrap();

    assert_eq!(stats.completed, 1);
    assert_eq!(stats.dead_lettered, 1);

    let bad = queue.store().get_job("bad").await.unwrap().unwrap();
    assert_eq!(bad.last_error.as_deref(), Some("failing"));
    assert!(queue.store().all_workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_programmatic_stop_wakes_idle_worker() {
    let dir = tempfile::tempdir().unwrap();
    let store = JobStore::open(dir.path().join("job-queue.db")).await.unwrap();
    let queue = JobQueue::new(store);

    // A long poll interval: only cancellation can end the sleep quickly.
    let config = WorkerConfig::new()
        .with_poll_interval(Duration::from_secs(60))
        .with_stop_file(dir.path().join(".stop_workers"));
    let shutdown = ShutdownSignal::without_stop_file();
    let worker = Worker::new(queue.clone(), config, shutdown.clone())
        .with_identity(WorkerIdentity::new(920_002, "loop-host"));
    let handle = tokio::spawn(worker.run());

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.trigger();

    let stats = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("Worker should wake from idle sleep")
        .unwrap();
    assert_eq!(stats.total_processed(), 0);
    assert!(queue.store().all_workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_timed_out_job_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let store = JobStore::open(dir.path().join("job-queue.db")).await.unwrap();
    store.set_config("job_timeout_ms", "200").await.unwrap();
    let queue = JobQueue::new(store);

    queue.enqueue(NewJob::new("slow", "sleep 5")).await.unwrap();

    let config = WorkerConfig::new().with_stop_file(dir.path().join(".stop_workers"));
    let mut worker = Worker::new(queue.clone(), config, ShutdownSignal::without_stop_file())
        .with_identity(WorkerIdentity::new(920_003, "loop-host"));

    let outcome = worker.run_cycle().await;
    assert!(matches!(
        outcome,
        CycleOutcome::Executed {
            succeeded: false,
            exit_code: None,
            ..
        }
    ));
    assert!(worker.stats().busy_time >= Duration::from_millis(200));

    let job = queue.store().get_job("slow").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("Job timed out after 200ms"));

    worker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_pool_dead_letters_every_failing_job() {
    const WORKERS: u32 = 3;
    const JOBS: usize = 6;

    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("job-queue.db");
    let stop_file = dir.path().join(".stop_workers");
    let store = JobStore::open(&db).await.unwrap();
    store.set_config("backoff_base", "1").await.unwrap();
    let queue = JobQueue::new(store);

    let ids: Vec<String> = (0..JOBS).map(|i| format!("fail-{}", i)).collect();
    for id in &ids {
        queue
            .enqueue(NewJob::new(id.as_str(), "false").with_max_attempts(2))
            .await
            .unwrap();
    }

    // One store per worker, as separate processes would have.
    let mut handles = Vec::new();
    for n in 0..WORKERS {
        let store = JobStore::open(&db).await.unwrap();
        let config = WorkerConfig::new()
            .with_poll_interval(Duration::from_millis(20))
            .with_stop_file(&stop_file);
        let worker = Worker::new(JobQueue::new(store), config, ShutdownSignal::new(&stop_file))
            .with_identity(WorkerIdentity::new(920_010 + n, "pool-host"));
        handles.push(tokio::spawn(worker.run()));
    }

    for id in &ids {
        wait_for_state(&queue, id, JobState::Dead).await;
    }

    request_stop(&stop_file).unwrap();
    let mut retried = 0;
    let mut dead_lettered = 0;
    for handle in handles {
        let stats = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("Worker should stop")
            .unwrap();
        retried += stats.retried;
        dead_lettered += stats.dead_lettered;
        assert_eq!(stats.completed, 0);
    }
    assert_eq!(retried, JOBS as u64);
    assert_eq!(dead_lettered, JOBS as u64);

    let dead = queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), JOBS);
    for job in &dead {
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 2, "job {} attempts", job.id);
        assert_eq!(
            job.last_error.as_deref(),
            Some("Command exited with status 1")
        );
    }
    assert!(queue.store().all_workers().await.unwrap().is_empty());
}
