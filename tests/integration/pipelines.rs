//! Pipelines: shared contexts and per-pipeline parallelism.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use taskflow::{ContextManagement, Pipeline, TaskProtocol};

use crate::fixtures::{processing, task_with, Concurrency, Occupy, Record, SchedulerHarness};

/// Test: pipeline tasks write into one shared context
/// Given a pipeline of three recording tasks
/// When the scheduler runs
/// Then the pipeline context holds every task's data and result
#[tokio::test]
async fn test_pipeline_shares_context() {
    let harness = SchedulerHarness::new(4);
    let log = Arc::new(Mutex::new(Vec::new()));
    let tasks = vec![
        task_with(processing(), Record::new("extract", &log)),
        task_with(processing(), Record::new("transform", &log)),
        task_with(processing(), Record::new("load", &log)),
    ];
    let ids: Vec<_> = tasks.iter().map(|t| t.task_id()).collect();
    let pipeline = Pipeline::new(tasks, 3).unwrap();
    let pipeline_id = pipeline.id;
    let context_id = harness.scheduler.schedule_pipeline(pipeline).unwrap();

    let report = harness.scheduler.run().await.unwrap();
    assert_eq!(report.succeeded(), 3);

    let contexts = harness.scheduler.contexts();
    let context = contexts.get_pipeline_context(&pipeline_id).unwrap();
    assert_eq!(context.id, context_id);
    for key in ["extract", "transform", "load"] {
        assert_eq!(context.data.get(key), Some(&json!(true)), "missing {}", key);
    }
    for id in &ids {
        assert_eq!(context.result(id), Some(&json!(true)));
        assert_eq!(contexts.get_context(id).unwrap().id, context_id);
    }
    // One accepted write-back per task on top of version 1.
    assert_eq!(context.version, 4);
    assert_eq!(context.metadata.version_history.len(), 3);
}

/// Test: max_parallel caps the pipeline but not other work
#[tokio::test]
async fn test_pipeline_max_parallel() {
    let harness = SchedulerHarness::new(8);
    let pipeline_gauge = Arc::new(Concurrency::default());
    let outside_gauge = Arc::new(Concurrency::default());

    let tasks = (0..4)
        .map(|_| {
            task_with(
                processing(),
                Occupy {
                    gauge: Arc::clone(&pipeline_gauge),
                    hold: Duration::from_millis(40),
                },
            )
        })
        .collect();
    harness
        .scheduler
        .schedule_pipeline(Pipeline::new(tasks, 2).unwrap())
        .unwrap();
    for _ in 0..3 {
        harness.add(task_with(
            processing(),
            Occupy {
                gauge: Arc::clone(&outside_gauge),
                hold: Duration::from_millis(40),
            },
        ));
    }

    let report = harness.scheduler.run().await.unwrap();
    assert_eq!(report.succeeded(), 7);
    assert_eq!(pipeline_gauge.peak(), 2);
    assert_eq!(outside_gauge.peak(), 3);
}

/// Test: the configured default parallelism is one
#[tokio::test]
async fn test_default_pipeline_is_sequential() {
    let harness = SchedulerHarness::new(4);
    let gauge = Arc::new(Concurrency::default());
    let tasks = (0..3)
        .map(|_| {
            task_with(
                processing(),
                Occupy {
                    gauge: Arc::clone(&gauge),
                    hold: Duration::from_millis(20),
                },
            )
        })
        .collect();
    let pipeline = harness.scheduler.new_pipeline(tasks).unwrap();
    assert_eq!(pipeline.max_parallel, 1);
    harness.scheduler.schedule_pipeline(pipeline).unwrap();

    let report = harness.scheduler.run().await.unwrap();
    assert_eq!(report.succeeded(), 3);
    assert_eq!(gauge.peak(), 1);
}

/// Test: cleanup_context drops the pipeline context and its task bindings
#[tokio::test]
async fn test_cleanup_pipeline_context() {
    let harness = SchedulerHarness::new(2);
    let log = Arc::new(Mutex::new(Vec::new()));
    let task = task_with(processing(), Record::new("only", &log));
    let id = task.task_id();
    let pipeline = Pipeline::new(vec![task], 1).unwrap();
    let pipeline_id = pipeline.id;
    harness.scheduler.schedule_pipeline(pipeline).unwrap();
    harness.scheduler.run().await.unwrap();

    let contexts = harness.scheduler.contexts();
    contexts.cleanup_context(&pipeline_id).unwrap();
    assert!(contexts.get_pipeline_context(&pipeline_id).is_err());
    assert!(contexts.get_context(&id).is_err());
    assert!(contexts.cleanup_context(&pipeline_id).is_err());
}
