use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::{Error, Result};

/// Prefix of every environment override, e.g.
/// `TASKFLOW_SCHEDULER_MAX_CONCURRENT_TASKS`.
pub const ENV_PREFIX: &str = "TASKFLOW";

/// Engine configuration, built once and passed to every component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub state: StateConfig,
}

/// Scheduling loop and task pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on tasks in the running bucket.
    pub max_concurrent_tasks: usize,
    /// Timeout in seconds for tasks that do not set one. 0 disables.
    pub default_task_timeout: f64,
    /// Seconds between re-evaluations of time-gated tasks.
    pub state_check_interval: f64,
    /// Seconds between sweeps of finished tasks. 0 disables.
    pub cleanup_interval: f64,
    /// Score added per second of waiting.
    pub wait_time_weight: f64,
    /// Score added per retry.
    pub retry_weight: f64,
    /// Base delay in seconds before a failed task may run again.
    pub retry_delay: f64,
    pub max_retry_delay: f64,
    /// Double the delay on every retry instead of keeping it flat.
    pub exponential_backoff: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            default_task_timeout: 60.0,
            state_check_interval: 1.0,
            cleanup_interval: 3600.0,
            wait_time_weight: 0.1,
            retry_weight: 5.0,
            retry_delay: 0.0,
            max_retry_delay: 300.0,
            exponential_backoff: true,
        }
    }
}

impl SchedulerConfig {
    pub fn state_check_interval(&self) -> Duration {
        secs(self.state_check_interval)
    }

    pub fn cleanup_interval(&self) -> Option<Duration> {
        (self.cleanup_interval > 0.0).then(|| secs(self.cleanup_interval))
    }

    /// Effective timeout for a task, `None` meaning unlimited.
    pub fn task_timeout(&self, task_timeout: Option<f64>) -> Option<Duration> {
        let seconds = task_timeout.unwrap_or(self.default_task_timeout);
        (seconds > 0.0).then(|| secs(seconds))
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        if self.retry_delay <= 0.0 {
            return Duration::ZERO;
        }
        let delay = if self.exponential_backoff {
            let exponent = attempt.saturating_sub(1).min(62) as i32;
            self.retry_delay * 2f64.powi(exponent)
        } else {
            self.retry_delay
        };
        secs(delay.min(self.max_retry_delay))
    }
}

/// Defaults for pipelines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Tasks of one pipeline allowed to run at the same time.
    pub max_parallel: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { max_parallel: 1 }
    }
}

/// State file settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Schema version written to and expected in the state file.
    pub version: u32,
    /// Entries kept in the read cache.
    pub cache_size: usize,
    /// Minimum seconds between write-back saves.
    pub save_interval: f64,
    /// Seconds to keep retrying the lock file before giving up.
    pub lock_timeout: f64,
    /// Copy the previous state file aside before each save.
    pub backups: bool,
    pub file_path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            version: 1,
            cache_size: 100,
            save_interval: 60.0,
            lock_timeout: 10.0,
            backups: true,
            file_path: Config::default_state_path(),
        }
    }
}

impl StateConfig {
    /// Defaults with the state file at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: path.into(),
            ..Default::default()
        }
    }

    pub fn save_interval(&self) -> Duration {
        secs(self.save_interval)
    }

    pub fn lock_timeout(&self) -> Duration {
        secs(self.lock_timeout)
    }
}

/// Seconds as a `Duration`. Values beyond `Duration::MAX` saturate;
/// negative and NaN inputs, which validation rejects, map to zero.
fn secs(seconds: f64) -> Duration {
    match Duration::try_from_secs_f64(seconds) {
        Ok(duration) => duration,
        Err(_) if seconds > 0.0 => Duration::MAX,
        Err(_) => Duration::ZERO,
    }
}

impl Config {
    pub fn taskflow_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".taskflow"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::taskflow_dir()?.join("taskflow.toml"))
    }

    /// `~/.taskflow/state.json`, or `state.json` in the working directory
    /// when there is no home directory.
    pub fn default_state_path() -> PathBuf {
        Self::taskflow_dir()
            .map(|dir| dir.join("state.json"))
            .unwrap_or_else(|_| PathBuf::from("state.json"))
    }

    /// Load `~/.taskflow/taskflow.toml`, apply environment overrides and
    /// validate.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            Self::read(&path)?
        } else {
            debug!("Config file not found, using defaults");
            Self::default()
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file without environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                debug!(dir = %dir.display(), "Creating config directory");
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    /// Apply `TASKFLOW_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides using `lookup` to read variables.
    ///
    /// # Errors
    /// Returns `Validation` when a variable is set but cannot be parsed.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |section: &str, key: &str| {
            let name = format!("{}_{}_{}", ENV_PREFIX, section, key).to_uppercase();
            lookup(&name).map(|value| (name, value))
        };

        let s = &mut self.scheduler;
        override_parsed(get("scheduler", "max_concurrent_tasks"), &mut s.max_concurrent_tasks)?;
        override_parsed(get("scheduler", "default_task_timeout"), &mut s.default_task_timeout)?;
        override_parsed(get("scheduler", "state_check_interval"), &mut s.state_check_interval)?;
        override_parsed(get("scheduler", "cleanup_interval"), &mut s.cleanup_interval)?;
        override_parsed(get("scheduler", "wait_time_weight"), &mut s.wait_time_weight)?;
        override_parsed(get("scheduler", "retry_weight"), &mut s.retry_weight)?;
        override_parsed(get("scheduler", "retry_delay"), &mut s.retry_delay)?;
        override_parsed(get("scheduler", "max_retry_delay"), &mut s.max_retry_delay)?;
        override_parsed(get("scheduler", "exponential_backoff"), &mut s.exponential_backoff)?;

        override_parsed(get("pipeline", "max_parallel"), &mut self.pipeline.max_parallel)?;

        let st = &mut self.state;
        override_parsed(get("state", "version"), &mut st.version)?;
        override_parsed(get("state", "cache_size"), &mut st.cache_size)?;
        override_parsed(get("state", "save_interval"), &mut st.save_interval)?;
        override_parsed(get("state", "lock_timeout"), &mut st.lock_timeout)?;
        override_parsed(get("state", "backups"), &mut st.backups)?;
        if let Some((_, path)) = get("state", "file_path") {
            st.file_path = expand_tilde(&path);
        }
        Ok(())
    }

    /// Check every setting against its allowed range.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.max_concurrent_tasks < 1 {
            return Err(invalid("scheduler.max_concurrent_tasks", "must be >= 1"));
        }
        check_at_least("scheduler.default_task_timeout", s.default_task_timeout, 0.0)?;
        check_at_least("scheduler.state_check_interval", s.state_check_interval, 0.1)?;
        check_at_least("scheduler.cleanup_interval", s.cleanup_interval, 0.0)?;
        check_at_least("scheduler.wait_time_weight", s.wait_time_weight, 0.0)?;
        check_at_least("scheduler.retry_weight", s.retry_weight, 0.0)?;
        check_at_least("scheduler.retry_delay", s.retry_delay, 0.0)?;
        check_at_least("scheduler.max_retry_delay", s.max_retry_delay, s.retry_delay)?;

        if self.pipeline.max_parallel < 1 {
            return Err(invalid("pipeline.max_parallel", "must be >= 1"));
        }

        let st = &self.state;
        if st.version < 1 {
            return Err(invalid("state.version", "must be >= 1"));
        }
        if st.cache_size < 1 {
            return Err(invalid("state.cache_size", "must be >= 1"));
        }
        check_at_least("state.save_interval", st.save_interval, 0.0)?;
        check_at_least("state.lock_timeout", st.lock_timeout, 0.0)?;
        if st.file_path.as_os_str().is_empty() {
            return Err(invalid("state.file_path", "must not be empty"));
        }
        Ok(())
    }
}

fn invalid(key: &str, reason: &str) -> Error {
    Error::Validation(format!("{} {}", key, reason))
}

fn check_at_least(key: &str, value: f64, min: f64) -> Result<()> {
    if value.is_finite() && value >= min {
        Ok(())
    } else {
        Err(invalid(key, &format!("must be >= {}, got {}", min, value)))
    }
}

fn override_parsed<T: std::str::FromStr>(
    found: Option<(String, String)>,
    target: &mut T,
) -> Result<()> {
    if let Some((name, raw)) = found {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| Error::Validation(format!("{}: cannot parse {:?}", name, raw)))?;
    }
    Ok(())
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
