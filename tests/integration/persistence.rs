//! State persistence: round trips, locking and recovery across restarts.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use taskflow::state::StateLockGuard;
use taskflow::{
    Error, PoolManagement, StateConfig, StateManagement, StateManager, TaskId, TaskProtocol,
    TaskState,
};

use crate::fixtures::{
    init_tracing, processing, task_with, was_started, Flaky, HoldStateLock, Record,
    SchedulerHarness, Sleep, Timed,
};

fn state_config(dir: &TempDir) -> StateConfig {
    StateConfig {
        backups: false,
        lock_timeout: 0.3,
        ..StateConfig::at(dir.path().join("state.json"))
    }
}

/// Test: records survive a second manager instance
/// Given three task states saved by one manager
/// When a second manager loads the same file
/// Then its records equal the saved ones
#[test]
fn test_round_trip_across_instances() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = state_config(&dir);

    let writer = StateManager::new(&config).unwrap();
    let ids: Vec<TaskId> = (0..3).map(|_| TaskId::new()).collect();
    writer.update(ids[0], TaskState::Completed).unwrap();
    writer.update(ids[1], TaskState::Failed).unwrap();
    writer.update(ids[2], TaskState::Running).unwrap();
    writer.save().unwrap();

    let reader = StateManager::new(&config).unwrap();
    reader.load().unwrap();
    assert_eq!(reader.records(), writer.records());
    assert_eq!(reader.get(&ids[1]).unwrap().state, TaskState::Failed);
}

/// Test: a schema version mismatch fails to load and keeps memory intact
#[test]
fn test_version_mismatch_leaves_memory_untouched() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let v1 = state_config(&dir);
    let v2 = StateConfig {
        version: 2,
        ..v1.clone()
    };

    let reader = StateManager::new(&v1).unwrap();
    let kept = TaskId::new();
    reader.update(kept, TaskState::Pending).unwrap();
    let before = reader.records();

    let writer = StateManager::new(&v2).unwrap();
    writer.update(TaskId::new(), TaskState::Completed).unwrap();
    writer.save().unwrap();

    let err = reader.load().unwrap_err();
    assert!(matches!(err, Error::StateLoad(_)));
    assert_eq!(reader.records(), before);
}

/// Test: a held lock makes save fail within the lock timeout
/// Given another holder keeps the lock file locked
/// When the manager tries to save
/// Then it fails with StateLock instead of hanging
#[test]
fn test_held_lock_times_out() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = state_config(&dir);
    let manager = StateManager::new(&config).unwrap();
    let _held = StateLockGuard::try_acquire(manager.lock_path()).unwrap();

    let started = Instant::now();
    let err = manager.update(TaskId::new(), TaskState::Pending).unwrap_err();
    assert!(matches!(err, Error::StateLock(_)));
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(5));
}

/// Test: a run saves the final state of every task
#[tokio::test]
async fn test_run_persists_final_states() {
    let harness = SchedulerHarness::new(2);
    let log = Arc::new(Mutex::new(Vec::new()));
    let ok = harness.add(task_with(processing(), Record::new("ok", &log)));
    let bad = harness.add(task_with(processing().with_max_retries(0), Flaky::always()));
    harness.scheduler.run().await.unwrap();

    let reader = StateManager::new(&harness.config.state).unwrap();
    reader.load().unwrap();
    assert_eq!(reader.get(&ok).unwrap().state, TaskState::Completed);
    assert_eq!(reader.get(&bad).unwrap().state, TaskState::Failed);
    assert!(harness.state_path().exists());
}

/// Test: completed tasks are not re-run after a restart
/// Given a first run that completed A and failed B
/// When a restarted scheduler is given A, B and C (depending on A)
/// Then A is restored without running, B runs again and C runs
#[tokio::test]
async fn test_restart_skips_completed_tasks() {
    let harness = SchedulerHarness::new(2);
    let a_id = TaskId::new();
    let b_id = TaskId::new();

    let first_a = Flaky::new(0);
    let first_b = Flaky::always();
    harness.add(task_with(processing().with_id(a_id), first_a));
    harness.add(task_with(
        processing().with_id(b_id).with_max_retries(0),
        first_b,
    ));
    let first = harness.scheduler.run().await.unwrap();
    assert_eq!(first.succeeded(), 1);
    assert_eq!(first.failed(), 1);

    let mut harness = harness.restart();
    let second_a = Flaky::new(0);
    let a_attempts = Arc::clone(&second_a.attempts);
    let second_b = Flaky::new(0);
    let b_attempts = Arc::clone(&second_b.attempts);
    let log = Arc::new(Mutex::new(Vec::new()));

    harness.add(task_with(processing().with_id(a_id), second_a));
    harness.add(task_with(processing().with_id(b_id), second_b));
    let c_id = harness.add(task_with(
        processing().with_dependencies([a_id]),
        Record::new("c", &log),
    ));

    let second = harness.scheduler.run().await.unwrap();
    assert!(second.is_success(), "report: {:?}", second);
    assert_eq!(a_attempts.load(Ordering::SeqCst), 0);
    assert_eq!(b_attempts.load(Ordering::SeqCst), 1);
    assert!(second.result(&c_id).unwrap().success);

    let events = harness.drain_events();
    assert!(!was_started(&events, a_id));
    assert_eq!(
        harness.scheduler.pool().get_task(&a_id).unwrap().state(),
        TaskState::Completed
    );
}

/// Test: backups are written before each save and pruned by cleanup
#[test]
fn test_backups_pruned_by_cleanup() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = StateConfig {
        backups: true,
        ..state_config(&dir)
    };
    let manager = StateManager::new(&config).unwrap();
    manager.update(TaskId::new(), TaskState::Completed).unwrap();
    manager.update(TaskId::new(), TaskState::Completed).unwrap();
    manager.save().unwrap();
    assert!(!manager.backups().is_empty());

    let removed = manager
        .cleanup(chrono::Utc::now() + chrono::Duration::hours(1))
        .unwrap();
    assert_eq!(removed, 2);
    assert!(manager.records().is_empty());
    assert!(manager.backups().is_empty());
}

/// Test: periodic cleanup during a run keeps persisted completions
/// Given a quick task A and a slow task B with a 0.3s cleanup interval
/// When the run outlasts several cleanups and the process restarts
/// Then A's COMPLETED record is still on disk and A does not run again
#[tokio::test]
async fn test_periodic_cleanup_keeps_completed_records() {
    let harness = SchedulerHarness::with_config(|config| {
        config.scheduler.cleanup_interval = 0.3;
    });
    let log = Arc::new(Mutex::new(Vec::new()));
    let a_id = TaskId::new();
    harness.add(task_with(processing().with_id(a_id), Record::new("a", &log)));
    harness.add(task_with(processing(), Sleep(Duration::from_millis(1200))));

    let first = harness.scheduler.run().await.unwrap();
    assert!(first.is_success(), "report: {:?}", first);
    assert_eq!(
        harness.scheduler.states().get(&a_id).unwrap().state,
        TaskState::Completed
    );

    let harness = harness.restart();
    harness.add(task_with(processing().with_id(a_id), Record::new("a", &log)));
    let second = harness.scheduler.run().await.unwrap();
    assert!(second.results.is_empty());
    assert_eq!(*log.lock().unwrap(), vec!["a".to_string()]);
}

/// Test: a busy state lock does not stall running task bodies
/// Given one body holding the state lock for 800ms, a quick task whose
///   completion must be saved, and a body sleeping 300ms
/// When the quick task's save waits on the lock
/// Then the sleeping body still wakes on time and every state is saved
#[tokio::test]
async fn test_busy_state_lock_does_not_stall_bodies() {
    let harness = SchedulerHarness::with_config(|config| {
        config.scheduler.max_concurrent_tasks = 3;
        config.state.save_interval = 0.0;
        config.state.lock_timeout = 5.0;
    });
    let lock_path = StateManager::new(&harness.config.state)
        .unwrap()
        .lock_path()
        .to_path_buf();

    harness.add(task_with(
        processing(),
        HoldStateLock {
            lock_path,
            hold: Duration::from_millis(800),
        },
    ));
    let quick = harness.add(task_with(processing(), Sleep(Duration::from_millis(20))));
    let timed = Timed::new(Duration::from_millis(300));
    let measured = Arc::clone(&timed.measured);
    harness.add(task_with(processing(), timed));

    let report = harness.scheduler.run().await.unwrap();
    assert!(report.is_success(), "report: {:?}", report);
    assert!(report.errors.is_empty(), "errors: {:?}", report.errors);

    let slept = measured.lock().unwrap().expect("timed body ran");
    assert!(slept < Duration::from_millis(700), "sleep took {:?}", slept);

    let reader = StateManager::new(&harness.config.state).unwrap();
    reader.load().unwrap();
    assert_eq!(reader.get(&quick).unwrap().state, TaskState::Completed);
}

/// Test: an out-of-range lock timeout waits instead of giving up at once
#[test]
fn test_huge_lock_timeout_waits_for_release() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = StateConfig {
        lock_timeout: 1e20,
        ..state_config(&dir)
    };
    let manager = StateManager::new(&config).unwrap();
    let held = StateLockGuard::try_acquire(manager.lock_path()).unwrap();
    let release = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        drop(held);
    });

    let started = Instant::now();
    manager.update(TaskId::new(), TaskState::Pending).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));
    release.join().unwrap();
}
