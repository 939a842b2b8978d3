//! Job runner boundary.
//!
//! The worker never executes build commands itself; it owns a
//! [`JobRunner`] for the duration of one job and lets it run. Cancellation
//! flows worker-to-runner only; completion is the return value of
//! [`JobRunner::run`], never a callback into the worker.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use buildkite_agent_api::{AgentRegistration, Job};

use crate::metrics::MetricsScope;

#[derive(Debug, Clone, Error)]
pub enum JobRunnerError {
    #[error("failed to initialize job {job_id}: {message}")]
    Setup { job_id: String, message: String },

    #[error("job {job_id} failed: {message}")]
    Execution { job_id: String, message: String },

    #[error("job {job_id} was canceled")]
    Canceled { job_id: String },
}

/// Options forwarded verbatim to the job runner.
#[derive(Debug, Clone, Default)]
pub struct JobRunnerConfig {
    /// Run the job with debug logging.
    pub debug: bool,
    /// Directory builds are checked out into.
    pub working_dir: Option<PathBuf>,
}

/// A job in flight.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Blocks until the job finishes or is canceled.
    async fn run(&self) -> Result<(), JobRunnerError>;

    /// Idempotent and safe to call from any task, including while `run`
    /// is in progress.
    fn cancel(&self);
}

/// Builds a runner for an accepted job.
pub trait JobRunnerFactory: Send + Sync {
    fn create(
        &self,
        metrics: MetricsScope,
        agent: &AgentRegistration,
        job: Job,
        config: &JobRunnerConfig,
    ) -> Result<Arc<dyn JobRunner>, JobRunnerError>;
}
