//! End-to-end tests for the job driver over SQLite stores.

mod common;

use common::{
    fast_config, new_job, sync_job, wait_for, CountingWorker, RunningDriver, SlowWorker,
    StallingWorker, TestController, NAMESPACE,
};
use repo_job_controller::history::HistoryStore;
use repo_job_controller::jobs::{JobAction, JobKey, JobState, JobStore};
use repo_job_controller::workers::WorkerRegistry;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_sync_job_runs_to_history() {
    let controller = TestController::new();
    controller.seed_file("overview.json", "{\"title\":\"Overview\"}");
    controller.seed_file("folder/latency.json", "{\"title\":\"Latency\"}");

    let store = controller.job_store();
    let history = controller.history_store();
    let running = RunningDriver::spawn(controller.driver(
        fast_config("pool-a"),
        store.clone(),
        controller.standard_workers(),
    ));
    // Let the slots finish their first (empty) claim round.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The poll interval is 30s, so only the Created notification can wake a slot in time.
    store.create(sync_job("pull")).unwrap();
    assert!(
        wait_for(Duration::from_secs(5), || {
            history.list(Some(NAMESPACE), 10).unwrap().len() == 1
        })
        .await
    );
    running.stop().await;

    let records = history.list(Some(NAMESPACE), 10).unwrap();
    let record = &records[0];
    assert_eq!(record.key, JobKey::new(NAMESPACE, "pull"));
    assert_eq!(record.status.state, JobState::Succeeded);
    assert_eq!(record.status.progress, 1.0);
    assert_eq!(record.attempts, 1);
    assert!(record.status.started_at.is_some());
    assert!(store.get(&record.key).unwrap().is_none());

    assert_eq!(
        controller.mirror_file("overview.json").as_deref(),
        Some("{\"title\":\"Overview\"}")
    );
    assert!(controller.mirror_file("folder/latency.json").is_some());
}

#[tokio::test]
async fn test_job_without_worker_fails() {
    let controller = TestController::new();
    let store = controller.job_store();
    let history = controller.history_store();
    let workers = WorkerRegistry::new().with_worker(Arc::new(SlowWorker {
        delay: Duration::from_millis(10),
    }));

    store
        .create(new_job(
            "cleanup",
            JobAction::Delete {
                git_ref: None,
                paths: vec!["old.json".to_string()],
            },
        ))
        .unwrap();
    let running = RunningDriver::spawn(controller.driver(fast_config("pool-a"), store, workers));

    assert!(wait_for(Duration::from_secs(5), || !history.list(None, 10).unwrap().is_empty()).await);
    running.stop().await;

    let records = history.list(None, 10).unwrap();
    assert_eq!(records[0].status.state, JobState::Failed);
    assert_eq!(records[0].status.message, "no worker registered for delete jobs");
    assert_eq!(records[0].status.errors.len(), 1);
}

#[tokio::test]
async fn test_job_exceeding_max_duration_times_out() {
    let controller = TestController::new();
    let store = controller.job_store();
    let history = controller.history_store();
    let workers = WorkerRegistry::new().with_worker(Arc::new(SlowWorker {
        delay: Duration::from_secs(30),
    }));
    let config = repo_job_controller::DriverConfig {
        max_job_duration: Duration::from_millis(200),
        ..fast_config("pool-a")
    };

    store.create(sync_job("stuck")).unwrap();
    let running = RunningDriver::spawn(controller.driver(config, store.clone(), workers));

    assert!(wait_for(Duration::from_secs(5), || !history.list(None, 10).unwrap().is_empty()).await);
    running.stop().await;

    let record = &history.list(None, 10).unwrap()[0];
    assert_eq!(record.status.state, JobState::Timeout);
    assert!(record.status.message.contains("maximum duration"));
    assert!(store.list(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_two_pools_process_each_job_once() {
    let controller = TestController::new();
    let counter = Arc::new(CountingWorker::default());
    let config = |identity: &str| repo_job_controller::DriverConfig {
        slots: 3,
        poll_interval: Duration::from_millis(50),
        ..fast_config(identity)
    };

    let store_a = controller.job_store();
    let store_b = controller.job_store();
    let pool_a = RunningDriver::spawn(controller.driver(
        config("pool-a"),
        store_a.clone(),
        WorkerRegistry::new().with_worker(counter.clone()),
    ));
    let pool_b = RunningDriver::spawn(controller.driver(
        config("pool-b"),
        store_b,
        WorkerRegistry::new().with_worker(counter.clone()),
    ));

    for i in 0..20 {
        store_a.create(sync_job(&format!("job-{}", i))).unwrap();
    }

    let history = controller.history_store();
    assert!(wait_for(Duration::from_secs(10), || history.list(None, 100).unwrap().len() == 20).await);
    pool_a.stop().await;
    pool_b.stop().await;

    let runs = counter.runs();
    assert_eq!(runs.len(), 20);
    assert!(runs.values().all(|count| *count == 1));
    assert!(store_a.list(None).unwrap().is_empty());
    assert!(history
        .list(None, 100)
        .unwrap()
        .iter()
        .all(|record| record.status.state == JobState::Succeeded && record.attempts == 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_job_of_stalled_pool_is_taken_over() {
    let controller = TestController::new();
    let stalling = Arc::new(StallingWorker::new(Duration::from_millis(600)));
    let counter = Arc::new(CountingWorker::default());
    let key = JobKey::new(NAMESPACE, "handover");

    let store_a = controller.job_store();
    store_a.create(sync_job("handover")).unwrap();
    let pool_a = RunningDriver::spawn(controller.driver(
        repo_job_controller::DriverConfig {
            slots: 1,
            lease_duration: Duration::from_millis(150),
            lease_renewal_interval: Duration::from_millis(50),
            ..fast_config("pool-a")
        },
        store_a.clone(),
        WorkerRegistry::new().with_worker(stalling.clone()),
    ));
    assert!(
        wait_for(Duration::from_secs(5), || {
            store_a
                .get(&key)
                .unwrap()
                .and_then(|job| job.lease)
                .is_some_and(|lease| lease.holder.starts_with("pool-a/"))
        })
        .await
    );

    // Only polling can show pool-b the expired lease.
    let pool_b = RunningDriver::spawn(controller.driver(
        repo_job_controller::DriverConfig {
            slots: 1,
            poll_interval: Duration::from_millis(50),
            ..fast_config("pool-b")
        },
        controller.job_store(),
        WorkerRegistry::new().with_worker(counter.clone()),
    ));

    let history = controller.history_store();
    assert!(
        wait_for(Duration::from_secs(10), || {
            history.list(None, 10).unwrap().len() == 1 && stalling.was_cancelled()
        })
        .await
    );
    pool_a.stop().await;
    pool_b.stop().await;

    let records = history.list(None, 10).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status.state, JobState::Succeeded);
    assert_eq!(records[0].status.message, "counted");
    assert_eq!(records[0].attempts, 2);
    assert_eq!(stalling.runs(), 1);
    assert_eq!(counter.runs().get(&key), Some(&1));
    assert!(store_a.list(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_shutdown_hands_job_back() {
    let controller = TestController::new();
    let store = controller.job_store();
    let history = controller.history_store();
    let workers = WorkerRegistry::new().with_worker(Arc::new(SlowWorker {
        delay: Duration::from_secs(30),
    }));

    store.create(sync_job("long")).unwrap();
    let running = RunningDriver::spawn(controller.driver(fast_config("pool-a"), store.clone(), workers));

    let key = JobKey::new(NAMESPACE, "long");
    assert!(
        wait_for(Duration::from_secs(5), || {
            store.get(&key).unwrap().is_some_and(|job| job.lease.is_some())
        })
        .await
    );
    running.stop().await;

    let job = store.get(&key).unwrap().unwrap();
    assert_eq!(job.status.state, JobState::Pending);
    assert!(job.lease.is_none());
    assert_eq!(job.attempts, 0);
    assert!(history.list(None, 10).unwrap().is_empty());
}
