//! Retry, backoff and timeout behaviour.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use taskflow::{Error, PoolManagement, SchedulerEvent, TaskProtocol, TaskState};

use crate::fixtures::{processing, task_with, Flaky, SchedulerHarness, Sleep};

/// Test: a flaky task succeeds within its retry budget
/// Given a body that fails twice and max_retries 3
/// When the scheduler runs
/// Then the task completes after three attempts
#[tokio::test]
async fn test_retry_until_success() {
    let mut harness = SchedulerHarness::new(2);
    let flaky = Flaky::new(2);
    let attempts = Arc::clone(&flaky.attempts);
    let id = harness.add(task_with(processing().with_max_retries(3), flaky));

    let report = harness.scheduler.run().await.unwrap();
    assert!(report.is_success());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let task = harness.scheduler.pool().get_task(&id).unwrap();
    assert_eq!(task.state(), TaskState::Completed);
    assert_eq!(task.retry_count(), 2);
    assert_eq!(task.metrics().error_count, 2);
    assert_eq!(task.metrics().retry_count, 2);

    let events = harness.drain_events();
    let retries: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            SchedulerEvent::TaskRetrying { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![1, 2]);
    let starts = events
        .iter()
        .filter(|e| matches!(e, SchedulerEvent::TaskStarted { .. }))
        .count();
    assert_eq!(starts, 3);
}

/// Test: exhausted retries fail the task without aborting the run
/// Given one task that always fails (max_retries 2) and one healthy task
/// When the scheduler runs
/// Then the failing task ends FAILED with TaskMaxRetries reported
#[tokio::test]
async fn test_retries_exhausted() {
    let mut harness = SchedulerHarness::new(2);
    let flaky = Flaky::always();
    let attempts = Arc::clone(&flaky.attempts);
    let bad = harness.add(task_with(processing().with_max_retries(2), flaky));
    let good = harness.add(task_with(processing(), Flaky::new(0)));

    let report = harness.scheduler.run().await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(report.result(&good).unwrap().success);
    assert!(!report.result(&bad).unwrap().success);
    assert!(matches!(
        report.errors.as_slice(),
        [Error::TaskMaxRetries { task_id, retries: 2 }] if *task_id == bad
    ));

    let task = harness.scheduler.pool().get_task(&bad).unwrap();
    assert_eq!(task.state(), TaskState::Failed);
    assert_eq!(
        task.metrics().last_error.as_deref(),
        Some("Task execution failed: attempt 3 failed")
    );

    let events = harness.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        SchedulerEvent::TaskFailed { task_id, .. } if *task_id == bad
    )));
}

/// Test: retries wait for the configured backoff
#[tokio::test]
async fn test_retry_backoff_gates_next_attempt() {
    let mut harness = SchedulerHarness::with_config(|config| {
        config.scheduler.retry_delay = 0.2;
        config.scheduler.exponential_backoff = false;
    });
    let id = harness.add(task_with(processing().with_max_retries(1), Flaky::new(1)));

    let started = std::time::Instant::now();
    let report = harness.scheduler.run().await.unwrap();
    assert!(report.is_success());
    assert!(started.elapsed() >= Duration::from_millis(200));

    let events = harness.drain_events();
    let not_before = events.iter().find_map(|e| match e {
        SchedulerEvent::TaskRetrying {
            task_id,
            not_before,
            ..
        } if *task_id == id => *not_before,
        _ => None,
    });
    let not_before = not_before.expect("retry should be gated");
    let result = report.result(&id).unwrap();
    assert!(result.started_at.unwrap() >= not_before);
}

/// Test: a body exceeding its timeout counts as a failed attempt
/// Given a task with a 50ms timeout whose body sleeps 10s and no retries
/// When the scheduler runs
/// Then the task fails with a timeout error
#[tokio::test]
async fn test_timeout_fails_attempt() {
    let harness = SchedulerHarness::new(1);
    let id = harness.add(task_with(
        processing().with_timeout(0.05).with_max_retries(0),
        Sleep(Duration::from_secs(10)),
    ));

    let started = std::time::Instant::now();
    let report = harness.scheduler.run().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let result = report.result(&id).unwrap();
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("timed out"));
}

/// Test: timed-out attempts are retried like any other failure
#[tokio::test]
async fn test_timeout_is_retryable() {
    let mut harness = SchedulerHarness::new(1);
    let id = harness.add(task_with(
        processing().with_timeout(0.05).with_max_retries(1),
        Sleep(Duration::from_secs(10)),
    ));

    let report = harness.scheduler.run().await.unwrap();
    assert!(matches!(
        report.errors.as_slice(),
        [Error::TaskMaxRetries { retries: 1, .. }]
    ));
    let retried = harness
        .drain_events()
        .into_iter()
        .any(|e| matches!(e, SchedulerEvent::TaskRetrying { task_id, .. } if task_id == id));
    assert!(retried);
}

/// Test: a zero timeout means no limit
#[tokio::test]
async fn test_zero_timeout_is_unlimited() {
    let harness = SchedulerHarness::with_config(|config| {
        config.scheduler.default_task_timeout = 0.0;
    });
    let id = harness.add(task_with(
        processing().with_max_retries(0),
        Sleep(Duration::from_millis(150)),
    ));
    let report = harness.scheduler.run().await.unwrap();
    assert!(report.result(&id).unwrap().success);

    let task = harness.scheduler.pool().get_task(&id).unwrap();
    assert!(task.metrics().execution_time >= 0.15);
}

/// Test: a timeout too large for a Duration means effectively no limit
/// Given a task whose timeout is 1e20 seconds and no retries
/// When its 10ms body runs
/// Then the task completes instead of timing out on the first poll
#[tokio::test]
async fn test_huge_timeout_does_not_expire() {
    let harness = SchedulerHarness::new(1);
    let id = harness.add(task_with(
        processing().with_timeout(1e20).with_max_retries(0),
        Sleep(Duration::from_millis(10)),
    ));

    let report = harness.scheduler.run().await.unwrap();
    let result = report.result(&id).unwrap();
    assert!(result.success, "result: {:?}", result);
}

/// Test: a huge retry delay keeps the retry gated instead of firing at once
#[tokio::test]
async fn test_huge_retry_delay_gates_retry() {
    let mut harness = SchedulerHarness::with_config(|config| {
        config.scheduler.retry_delay = 1e20;
        config.scheduler.max_retry_delay = 1e20;
    });
    let flaky = Flaky::new(1);
    let attempts = Arc::clone(&flaky.attempts);
    let id = harness.add(task_with(processing().with_max_retries(1), flaky));

    let scheduler = Arc::clone(&harness.scheduler);
    let run = tokio::spawn(async move { scheduler.run().await });
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    harness.scheduler.stop();
    let report = run.await.unwrap().unwrap();
    assert!(report.cancelled);

    let not_before = harness.drain_events().into_iter().find_map(|e| match e {
        SchedulerEvent::TaskRetrying {
            task_id,
            not_before,
            ..
        } if task_id == id => not_before,
        _ => None,
    });
    assert!(not_before.expect("retry should be gated") > chrono::Utc::now());
}
