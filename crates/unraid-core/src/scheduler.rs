//! Per-job polling with exponential backoff.
//!
//! Each registered job owns at most one timer task. A running job executes
//! its work immediately, then sleeps for its current interval and repeats.
//! Failures stretch the interval by `backoff_multiplier` per consecutive
//! error, clamped to `[min_interval, max_interval]`; a success snaps it back
//! to `base_interval`. After `max_retries` consecutive failures the job stops
//! itself and stays registered until it is started again.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use unraid_core::{PollConfig, PollScheduler};
//!
//! # async fn example() -> Result<(), unraid_core::SchedulerError> {
//! let scheduler = PollScheduler::new();
//! let config = PollConfig::default().base_interval(Duration::from_secs(5));
//!
//! scheduler.register("array", || async { Ok::<_, String>(()) }, config)?;
//! scheduler.start("array")?;
//! // ...
//! scheduler.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Scheduler errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SchedulerError {
    /// No job with this id is registered.
    #[error("Unknown poll job: {0}")]
    UnknownJob(String),
    /// The poll configuration is invalid.
    #[error("Invalid poll configuration: {0}")]
    InvalidConfig(String),
}

/// Timing and retry settings for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// Interval after a success.
    pub base_interval: Duration,
    /// Lower bound for the current interval.
    pub min_interval: Duration,
    /// Upper bound for the current interval.
    pub max_interval: Duration,
    /// Consecutive failures after which the job stops itself.
    pub max_retries: u32,
    /// Growth factor per consecutive failure (1.0 = constant interval).
    pub backoff_multiplier: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(1),
            min_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            max_retries: 5,
            backoff_multiplier: 2.0,
        }
    }
}

impl PollConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base interval.
    #[must_use]
    pub fn base_interval(mut self, interval: Duration) -> Self {
        self.base_interval = interval;
        self
    }

    /// Set the minimum interval.
    #[must_use]
    pub fn min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set the maximum interval.
    #[must_use]
    pub fn max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the failure limit.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the backoff multiplier.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        let invalid = |message: &str| Err(SchedulerError::InvalidConfig(message.to_string()));

        if self.base_interval.is_zero() {
            return invalid("base_interval must be > 0");
        }
        if self.min_interval.is_zero() {
            return invalid("min_interval must be > 0");
        }
        if self.max_interval < self.min_interval {
            return invalid("max_interval must be >= min_interval");
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return invalid("backoff_multiplier must be >= 1.0");
        }
        if self.max_retries == 0 {
            return invalid("max_retries must be > 0");
        }
        Ok(())
    }

    /// Interval to wait after `consecutive_errors` failures in a row.
    ///
    /// `base × multiplier^consecutive_errors`, clamped to
    /// `[min_interval, max_interval]`.
    pub fn interval_for_errors(&self, consecutive_errors: u32) -> Duration {
        let max_ms = self.max_interval.as_secs_f64() * 1000.0;
        let exponent = i32::try_from(consecutive_errors).unwrap_or(i32::MAX);
        let ms = self.base_interval.as_secs_f64() * 1000.0 * self.backoff_multiplier.powi(exponent);
        let ms = if ms.is_finite() {
            ms.clamp(0.0, max_ms)
        } else {
            max_ms
        };
        Duration::from_secs_f64(ms / 1000.0)
            .max(self.min_interval)
            .min(self.max_interval)
    }
}

/// Observable state of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    /// Job id.
    pub id: String,
    /// Whether the job's timer is armed.
    pub is_running: bool,
    /// Failures since the last success.
    pub consecutive_errors: u32,
    /// Wait before the next scheduled run.
    pub current_interval_ms: u64,
    /// When the work last succeeded.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success_at: Option<OffsetDateTime>,
    /// When the work last failed.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_error_at: Option<OffsetDateTime>,
    /// Message of the last failure.
    pub last_error: Option<String>,
    /// Total successful runs.
    pub success_count: u64,
    /// Total failed runs.
    pub failure_count: u64,
}

impl JobSnapshot {
    /// Current interval as a duration.
    pub fn current_interval(&self) -> Duration {
        Duration::from_millis(self.current_interval_ms)
    }
}

type WorkFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Spawned timer task and the token that stops it.
struct TimerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct JobState {
    is_running: bool,
    consecutive_errors: u32,
    current_interval: Duration,
    last_success_at: Option<OffsetDateTime>,
    last_error_at: Option<OffsetDateTime>,
    last_error: Option<String>,
    success_count: u64,
    failure_count: u64,
    /// Bumped on every start so a stale timer task cannot stop a newer one.
    generation: u64,
    timer: Option<TimerHandle>,
}

struct Job {
    id: String,
    work: WorkFn,
    config: PollConfig,
    state: Mutex<JobState>,
    /// Serialises timer runs and forced runs.
    run_lock: tokio::sync::Mutex<()>,
}

impl Job {
    fn new(id: String, work: WorkFn, config: PollConfig) -> Self {
        let current_interval = config.interval_for_errors(0);
        Self {
            id,
            work,
            config,
            state: Mutex::new(JobState {
                is_running: false,
                consecutive_errors: 0,
                current_interval,
                last_success_at: None,
                last_error_at: None,
                last_error: None,
                success_count: 0,
                failure_count: 0,
                generation: 0,
                timer: None,
            }),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> JobSnapshot {
        let state = self.lock_state();
        JobSnapshot {
            id: self.id.clone(),
            is_running: state.is_running,
            consecutive_errors: state.consecutive_errors,
            current_interval_ms: u64::try_from(state.current_interval.as_millis())
                .unwrap_or(u64::MAX),
            last_success_at: state.last_success_at,
            last_error_at: state.last_error_at,
            last_error: state.last_error.clone(),
            success_count: state.success_count,
            failure_count: state.failure_count,
        }
    }

    /// Disarm the timer. Returns the task handle if one was live.
    fn halt(&self) -> Option<JoinHandle<()>> {
        let mut state = self.lock_state();
        state.is_running = false;
        let timer = state.timer.take()?;
        timer.token.cancel();
        Some(timer.task)
    }

    /// Run the work once and apply bookkeeping.
    ///
    /// `generation` is the starting generation for timer runs and `None`
    /// for forced runs. Returns whether the job is still running afterwards.
    async fn execute(&self, generation: Option<u64>) -> bool {
        let _guard = self.run_lock.lock().await;

        let outcome = AssertUnwindSafe((self.work)()).catch_unwind().await;
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => Err(panic_message(payload.as_ref())),
        };

        let mut state = self.lock_state();
        let now = OffsetDateTime::now_utc();
        match result {
            Ok(()) => {
                state.consecutive_errors = 0;
                state.current_interval = self.config.interval_for_errors(0);
                state.last_success_at = Some(now);
                state.success_count += 1;
                debug!("Poll job {} succeeded", self.id);
            }
            Err(message) => {
                state.consecutive_errors = state.consecutive_errors.saturating_add(1);
                state.current_interval = self.config.interval_for_errors(state.consecutive_errors);
                state.last_error_at = Some(now);
                state.failure_count += 1;
                warn!(
                    "Poll job {} failed: {} (attempt {}, next in {:?})",
                    self.id, message, state.consecutive_errors, state.current_interval
                );
                state.last_error = Some(message);

                let current = generation.is_none_or(|g| g == state.generation);
                if state.consecutive_errors >= self.config.max_retries && state.is_running && current
                {
                    error!(
                        "Poll job {} stopped after {} consecutive failures",
                        self.id, state.consecutive_errors
                    );
                    state.is_running = false;
                    if let Some(timer) = state.timer.take() {
                        timer.token.cancel();
                    }
                }
            }
        }
        state.is_running
    }
}

async fn run_timer(job: Arc<Job>, token: CancellationToken, generation: u64) {
    loop {
        if token.is_cancelled() {
            break;
        }
        let running = job.execute(Some(generation)).await;
        if !running || token.is_cancelled() {
            break;
        }

        let interval = job.lock_state().current_interval;
        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep(interval) => {}
        }
    }
    debug!("Timer for poll job {} exited", job.id);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("work panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("work panicked: {message}")
    } else {
        "work panicked".to_string()
    }
}

/// Runs registered jobs on independent timers.
///
/// Cloning yields another handle to the same set of jobs.
#[derive(Clone, Default)]
pub struct PollScheduler {
    jobs: Arc<Mutex<HashMap<String, Arc<Job>>>>,
}

impl fmt::Debug for PollScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollScheduler")
            .field("jobs", &self.job_ids())
            .finish()
    }
}

impl PollScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, Arc<Job>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn job(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs().get(id).cloned()
    }

    /// Register `work` under `id`, replacing any existing job with that id.
    ///
    /// The new job starts out stopped. A replaced job's timer is torn down
    /// first.
    pub fn register<F, Fut, E>(
        &self,
        id: impl Into<String>,
        work: F,
        config: PollConfig,
    ) -> Result<(), SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display,
    {
        config.validate()?;
        let id = id.into();

        let work = Arc::new(work);
        let work: WorkFn = Arc::new(move || {
            let work = Arc::clone(&work);
            async move { work().await.map_err(|e| e.to_string()) }.boxed()
        });

        let job = Arc::new(Job::new(id.clone(), work, config));
        let previous = self.jobs().insert(id.clone(), job);
        if let Some(previous) = previous {
            previous.halt();
            debug!("Replaced poll job {}", id);
        } else {
            debug!("Registered poll job {}", id);
        }
        Ok(())
    }

    /// Start a job's timer. The first run happens right away in the
    /// background.
    ///
    /// Starting a running job does nothing.
    pub fn start(&self, id: &str) -> Result<(), SchedulerError> {
        let job = self
            .job(id)
            .ok_or_else(|| SchedulerError::UnknownJob(id.to_string()))?;

        let mut state = job.lock_state();
        if state.is_running {
            return Ok(());
        }
        if let Some(stale) = state.timer.take() {
            stale.token.cancel();
        }

        state.generation += 1;
        state.is_running = true;
        let token = CancellationToken::new();
        let task = tokio::spawn(run_timer(Arc::clone(&job), token.clone(), state.generation));
        state.timer = Some(TimerHandle { token, task });
        info!(
            "Started poll job {} (interval: {:?})",
            id, state.current_interval
        );
        Ok(())
    }

    /// Stop a job's timer. The job stays registered.
    ///
    /// An in-flight run is allowed to finish. Unknown ids and stopped jobs
    /// are ignored.
    pub fn stop(&self, id: &str) {
        if let Some(job) = self.job(id)
            && job.halt().is_some()
        {
            info!("Stopped poll job {}", id);
        }
    }

    /// Stop and forget a job. Unknown ids are ignored.
    pub fn unregister(&self, id: &str) {
        let removed = self.jobs().remove(id);
        if let Some(job) = removed {
            job.halt();
            debug!("Unregistered poll job {}", id);
        }
    }

    /// Run a job once outside its cadence, with the usual bookkeeping.
    ///
    /// Works whether or not the job is running. Waits for any in-flight run
    /// of the same job first.
    pub async fn force_run(&self, id: &str) -> Result<JobSnapshot, SchedulerError> {
        let job = self
            .job(id)
            .ok_or_else(|| SchedulerError::UnknownJob(id.to_string()))?;
        job.execute(None).await;
        Ok(job.snapshot())
    }

    /// Current state of a job.
    pub fn get_state(&self, id: &str) -> Option<JobSnapshot> {
        self.job(id).map(|job| job.snapshot())
    }

    /// Ids of all registered jobs, sorted.
    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshots of all registered jobs, sorted by id.
    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        let jobs: Vec<Arc<Job>> = self.jobs().values().cloned().collect();
        let mut snapshots: Vec<JobSnapshot> = jobs.iter().map(|job| job.snapshot()).collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Stop every job and wait for their timer tasks to exit.
    ///
    /// Jobs stay registered. Waits for in-flight runs to finish.
    pub async fn shutdown(&self) {
        let jobs: Vec<Arc<Job>> = self.jobs().values().cloned().collect();
        let handles: Vec<JoinHandle<()>> = jobs.iter().filter_map(|job| job.halt()).collect();
        info!("Stopping {} poll job(s)", handles.len());
        join_all(handles).await;
    }
}
