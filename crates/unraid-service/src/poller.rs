//! Background poller.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use unraid_core::{ConnectionConfig, PollConfig, PollScheduler, QueryExecutor, SchedulerError};

use crate::config::Config;
use crate::state::PollerState;

/// Runs every configured job on the scheduler and records the results.
pub struct Poller {
    state: Arc<PollerState>,
    executor: QueryExecutor,
    connection: ConnectionConfig,
    scheduler: PollScheduler,
}

impl Poller {
    /// Create a poller for one server.
    ///
    /// `connection` should already be resolved; if it is not, every run
    /// falls back to the executor's cached discovery.
    pub fn new(
        state: Arc<PollerState>,
        executor: QueryExecutor,
        connection: ConnectionConfig,
    ) -> Self {
        Self {
            state,
            executor,
            connection,
            scheduler: PollScheduler::new(),
        }
    }

    /// The underlying scheduler.
    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }

    /// Register one job per `[[jobs]]` entry. Returns the number registered.
    pub fn register_jobs(&self, config: &Config) -> Result<usize, PollerError> {
        for job in &config.jobs {
            let settings = job.poll_settings(&config.defaults);
            self.register(&job.id, &job.query, job.variables.clone(), &settings.to_poll_config())?;
        }
        Ok(config.jobs.len())
    }

    /// Register a single query job.
    pub fn register(
        &self,
        id: &str,
        query: &str,
        variables: Map<String, Value>,
        poll: &PollConfig,
    ) -> Result<(), PollerError> {
        let job_id = id.to_string();
        let query = query.to_string();
        let variables = Value::Object(variables);
        let state = Arc::clone(&self.state);
        let executor = self.executor.clone();
        let connection = self.connection.clone();

        let work = move || {
            let job_id = job_id.clone();
            let query = query.clone();
            let variables = variables.clone();
            let state = Arc::clone(&state);
            let executor = executor.clone();
            let connection = connection.clone();
            async move {
                match executor.execute::<Value>(&connection, &query, variables).await {
                    Ok(data) => {
                        debug!("Job {} returned data", job_id);
                        state.record_success(&job_id, data).await;
                        Ok(())
                    }
                    Err(e) => {
                        state.record_failure(&job_id, e.clone()).await;
                        Err(e)
                    }
                }
            }
        };

        self.scheduler
            .register(id, work, poll.clone())
            .map_err(|source| PollerError::Register {
                id: id.to_string(),
                source,
            })
    }

    /// Start every registered job.
    pub fn start(&self) -> Result<(), PollerError> {
        let ids = self.scheduler.job_ids();
        if ids.is_empty() {
            info!("No jobs configured for polling");
            return Ok(());
        }

        info!("Starting poller for {} job(s)", ids.len());
        for id in ids {
            self.scheduler
                .start(&id)
                .map_err(|source| PollerError::Start { id, source })?;
        }
        Ok(())
    }

    /// Stop every job and wait for the timers to exit.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

/// Poller errors.
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("Failed to register job {id}: {source}")]
    Register { id: String, source: SchedulerError },
    #[error("Failed to start job {id}: {source}")]
    Start { id: String, source: SchedulerError },
}
