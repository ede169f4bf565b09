//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scheduler wired to a state file in a temporary directory
//! - Scripted task bodies (recording, failing, sleeping, timing, lock holding)
//! - Draining the scheduler's event channel

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, EnvFilter};

use taskflow::state::StateLockGuard;
use taskflow::{
    Config, Context, Error, Result, Scheduler, SchedulerEvent, StateConfig, Task, TaskBody,
    TaskConfig, TaskId, TaskType,
};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// Logs are captured per test and only shown for failures. Enable levels
/// with e.g. `RUST_LOG=taskflow=debug`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

// ========================================
// Harness
// ========================================

/// A scheduler with its state file in a temporary directory.
pub struct SchedulerHarness {
    pub dir: TempDir,
    pub config: Config,
    pub scheduler: Arc<Scheduler>,
    pub event_rx: mpsc::Receiver<SchedulerEvent>,
}

impl SchedulerHarness {
    pub fn new(max_concurrent_tasks: usize) -> Self {
        Self::with_config(|config| config.scheduler.max_concurrent_tasks = max_concurrent_tasks)
    }

    /// Harness with test defaults adjusted by `tweak`.
    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        init_tracing();
        let dir = TempDir::new().expect("Failed to create temp directory");
        let mut config = test_config(dir.path().join("state.json"));
        tweak(&mut config);
        Self::build(dir, config)
    }

    /// A fresh scheduler on the same state file, as a restarted process
    /// would see it.
    pub fn restart(self) -> Self {
        let SchedulerHarness { dir, config, .. } = self;
        Self::build(dir, config)
    }

    fn build(dir: TempDir, config: Config) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        let scheduler = Scheduler::new(&config)
            .expect("Failed to build scheduler")
            .with_events(event_tx);
        Self {
            dir,
            config,
            scheduler: Arc::new(scheduler),
            event_rx,
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.config.state.file_path.clone()
    }

    pub fn add(&self, task: Task) -> TaskId {
        self.scheduler.add_task(task).expect("Failed to add task")
    }

    /// Every event emitted so far.
    pub fn drain_events(&mut self) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Fast-ticking config with the state file at `state_path`.
pub fn test_config(state_path: PathBuf) -> Config {
    let mut config = Config::default();
    config.scheduler.state_check_interval = 0.1;
    config.scheduler.default_task_timeout = 10.0;
    config.state = StateConfig {
        backups: false,
        lock_timeout: 2.0,
        ..StateConfig::at(state_path)
    };
    config
}

/// Position of the first event matching `pred`.
pub fn position(events: &[SchedulerEvent], pred: impl Fn(&SchedulerEvent) -> bool) -> usize {
    events
        .iter()
        .position(pred)
        .expect("expected event not emitted")
}

pub fn started(events: &[SchedulerEvent], id: TaskId) -> usize {
    position(events, |e| {
        matches!(e, SchedulerEvent::TaskStarted { task_id, .. } if *task_id == id)
    })
}

pub fn completed(events: &[SchedulerEvent], id: TaskId) -> usize {
    position(events, |e| {
        matches!(e, SchedulerEvent::TaskCompleted { task_id } if *task_id == id)
    })
}

pub fn was_started(events: &[SchedulerEvent], id: TaskId) -> bool {
    events
        .iter()
        .any(|e| matches!(e, SchedulerEvent::TaskStarted { task_id, .. } if *task_id == id))
}

// ========================================
// Task bodies
// ========================================

/// Build a task from a config and a body.
pub fn task_with(config: TaskConfig, body: impl TaskBody + 'static) -> Task {
    Task::new(config, Arc::new(body)).expect("valid task config")
}

pub fn processing() -> TaskConfig {
    TaskConfig::new(TaskType::Processing)
}

/// Appends its label to a shared log, then stores `value` under its label
/// in `context.data` and as its result.
pub struct Record {
    pub label: String,
    pub log: Arc<Mutex<Vec<String>>>,
    pub value: Value,
}

impl Record {
    pub fn new(label: &str, log: &Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            label: label.to_string(),
            log: Arc::clone(log),
            value: Value::Bool(true),
        }
    }
}

impl TaskBody for Record {
    fn execute<'a>(
        &'a self,
        config: &'a TaskConfig,
        context: &'a mut Context,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.log.lock().unwrap().push(self.label.clone());
            context.data.insert(self.label.clone(), self.value.clone());
            context.set_result(config.id, self.value.clone());
            Ok(())
        })
    }
}

/// Fails its first `failures` attempts, then succeeds.
pub struct Flaky {
    failures: u32,
    pub attempts: Arc<AtomicU32>,
}

impl Flaky {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn always() -> Self {
        Self::new(u32::MAX)
    }
}

impl TaskBody for Flaky {
    fn execute<'a>(
        &'a self,
        _config: &'a TaskConfig,
        _context: &'a mut Context,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures {
                return Err(Error::TaskExecution(format!("attempt {} failed", attempt)));
            }
            Ok(())
        })
    }
}

/// Sleeps for a fixed time, then succeeds.
pub struct Sleep(pub Duration);

impl TaskBody for Sleep {
    fn execute<'a>(
        &'a self,
        _config: &'a TaskConfig,
        _context: &'a mut Context,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            tokio::time::sleep(self.0).await;
            Ok(())
        })
    }
}

/// Tracks how many bodies sharing it run at the same time.
#[derive(Default)]
pub struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Concurrency {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Occupies a slot in a shared `Concurrency` gauge for `hold`.
pub struct Occupy {
    pub gauge: Arc<Concurrency>,
    pub hold: Duration,
}

impl TaskBody for Occupy {
    fn execute<'a>(
        &'a self,
        _config: &'a TaskConfig,
        _context: &'a mut Context,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let now = self.gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.gauge.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.gauge.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Sleeps for `sleep` and stores how long the sleep actually took.
pub struct Timed {
    pub sleep: Duration,
    pub measured: Arc<Mutex<Option<Duration>>>,
}

impl Timed {
    pub fn new(sleep: Duration) -> Self {
        Self {
            sleep,
            measured: Arc::new(Mutex::new(None)),
        }
    }
}

impl TaskBody for Timed {
    fn execute<'a>(
        &'a self,
        _config: &'a TaskConfig,
        _context: &'a mut Context,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let started = Instant::now();
            tokio::time::sleep(self.sleep).await;
            *self.measured.lock().unwrap() = Some(started.elapsed());
            Ok(())
        })
    }
}

/// Takes the state file lock, as another process would, and keeps it for
/// `hold`. Waits without blocking the runtime while the lock is busy.
pub struct HoldStateLock {
    pub lock_path: PathBuf,
    pub hold: Duration,
}

impl TaskBody for HoldStateLock {
    fn execute<'a>(
        &'a self,
        _config: &'a TaskConfig,
        _context: &'a mut Context,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let guard = loop {
                match StateLockGuard::try_acquire(&self.lock_path) {
                    Ok(guard) => break guard,
                    Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            };
            tokio::time::sleep(self.hold).await;
            drop(guard);
            Ok(())
        })
    }
}
