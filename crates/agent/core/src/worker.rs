//! The agent worker state machine.
//!
//! One worker owns one session against the service: it connects, pings on
//! the agent's interval for directives, heartbeats on an independent task,
//! runs at most one job at a time, and serialises every stop decision
//! behind a single mutex. Four time sources (ping ticker, heartbeat timer,
//! job-wait deadline, idle deadline) and two event sources (server
//! directives, operator stops) all funnel into the same two facts: whether
//! the worker is still running and whether it currently holds a job.
//!
//! The ping loop is the primary task and the only writer of the current
//! job and of the API client, which keeps the ordering story small: a job
//! is published before its `run` is awaited, a stop reads it under the
//! stop mutex, and the stop signal is a close-once token every task parks
//! on.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use buildkite_agent_api::{
    AgentApi, AgentRegistration, ApiClientConfig, ApiClientFactory, ApiError, Job,
};

use crate::metrics::{MetricsCollector, MetricsError, MetricsScope, Tags};
use crate::proctitle::ProcTitle;
use crate::retry::{retry, RetryPolicy};
use crate::runner::{JobRunner, JobRunnerConfig, JobRunnerFactory};
use crate::timer::{DeadlineTimer, TimerMode};

/// Settings for one worker; immutable for its life.
#[derive(Debug, Clone, Default)]
pub struct AgentWorkerConfig {
    /// Whether to enable debug for this worker. Embedders mirror it into
    /// the job runner options they configure.
    pub debug: bool,

    /// Endpoint used when the registration does not carry one.
    pub endpoint: String,

    /// Forwarded to the API client factory.
    pub disable_http2: bool,

    /// Stop after running a single job.
    pub disconnect_after_job: bool,

    /// Seconds to wait for a first job before giving up. Only meaningful
    /// with `disconnect_after_job`.
    pub disconnect_after_job_timeout: u64,

    /// Seconds of idleness (no running job) before giving up; 0 disables.
    pub disconnect_after_idle_timeout: u64,

    /// Forwarded opaquely to the job runner factory.
    pub job_runner: JobRunnerConfig,
}

/// Errors that abort [`AgentWorker::start`] before the ping loop.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

struct StopState {
    /// Latches on the first stop and never clears.
    stopping: bool,
    /// Written only by the ping loop; read here by the stop path.
    job: Option<Arc<dyn JobRunner>>,
}

struct Shared {
    conf: AgentWorkerConfig,
    agent: AgentRegistration,

    /// Replaced wholesale on endpoint switch, only ever from the ping
    /// loop. Other tasks clone a snapshot that may lag one switch behind.
    client: RwLock<Arc<dyn AgentApi>>,
    endpoint: RwLock<String>,
    client_factory: Arc<dyn ApiClientFactory>,
    runner_factory: Arc<dyn JobRunnerFactory>,

    metrics: MetricsCollector,
    proc_title: Arc<dyn ProcTitle>,

    running: AtomicBool,
    last_ping: AtomicI64,
    last_heartbeat: AtomicI64,

    stop_state: Mutex<StopState>,
    stop_signal: CancellationToken,
}

/// The worker state machine. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct AgentWorker {
    shared: Arc<Shared>,
}

impl AgentWorker {
    pub fn new(
        agent: AgentRegistration,
        conf: AgentWorkerConfig,
        client_factory: Arc<dyn ApiClientFactory>,
        runner_factory: Arc<dyn JobRunnerFactory>,
        metrics: MetricsCollector,
        proc_title: Arc<dyn ProcTitle>,
    ) -> Self {
        let endpoint = if agent.endpoint.is_empty() {
            conf.endpoint.clone()
        } else {
            agent.endpoint.clone()
        };

        let client = client_factory.create(ApiClientConfig {
            endpoint: endpoint.clone(),
            token: agent.access_token.clone(),
            disable_http2: conf.disable_http2,
        });

        Self {
            shared: Arc::new(Shared {
                conf,
                agent,
                client: RwLock::new(client),
                endpoint: RwLock::new(endpoint),
                client_factory,
                runner_factory,
                metrics,
                proc_title,
                running: AtomicBool::new(false),
                last_ping: AtomicI64::new(0),
                last_heartbeat: AtomicI64::new(0),
                stop_state: Mutex::new(StopState {
                    stopping: false,
                    job: None,
                }),
                stop_signal: CancellationToken::new(),
            }),
        }
    }

    /// Registers the session, retrying transient failures.
    pub async fn connect(&self) -> Result<(), ApiError> {
        info!("Connecting to Buildkite...");
        self.update_proc_title("connecting");

        retry(RetryPolicy::connect(), |stats| {
            let client = self.client();
            async move {
                if let Err(err) = client.connect().await {
                    warn!("{} ({})", err, stats);
                    return Err(err);
                }
                Ok(())
            }
        })
        .await
    }

    /// Runs the worker until it is stopped.
    ///
    /// This is the ping loop's task; heartbeats and the auto-disconnect
    /// timers run on tasks spawned here and end with the stop signal.
    /// Never returns while a job is running, and fails only when the
    /// metrics collector cannot start.
    pub async fn start(&self) -> Result<(), StartError> {
        let shared = &self.shared;

        // Scope the collector to this agent before starting it.
        let scope = shared.metrics.scope(Tags::from([(
            "agent_name".to_string(),
            shared.agent.name.clone(),
        )]));
        shared.metrics.start()?;
        let _collector = CollectorGuard(&shared.metrics);

        shared.running.store(true, Ordering::SeqCst);

        let ping_interval = Duration::from_secs(shared.agent.ping_interval);
        let heartbeat_interval = Duration::from_secs(shared.agent.heartbeat_interval);

        if !heartbeat_interval.is_zero() {
            let worker = self.clone();
            tokio::spawn(async move { worker.heartbeat_loop(heartbeat_interval).await });
        }

        // One-shot grace period for the first job to arrive.
        let job_wait_timer = if shared.conf.disconnect_after_job {
            let timeout_secs = shared.conf.disconnect_after_job_timeout;
            let worker = self.clone();
            Some(DeadlineTimer::spawn(
                "disconnect-after-job",
                Duration::from_secs(timeout_secs),
                TimerMode::OneShot,
                shared.stop_signal.clone(),
                move || {
                    debug!("No job was assigned within {timeout_secs} seconds");
                    worker.stop_if_idle();
                },
            ))
        } else {
            None
        };

        let idle_timer = if shared.conf.disconnect_after_idle_timeout > 0 {
            let timeout_secs = shared.conf.disconnect_after_idle_timeout;
            let worker = self.clone();
            Some(DeadlineTimer::spawn(
                "idle",
                Duration::from_secs(timeout_secs),
                TimerMode::Rearm,
                shared.stop_signal.clone(),
                move || {
                    info!("Agent has been idle for {timeout_secs} seconds");
                    worker.stop_if_idle();
                },
            ))
        } else {
            None
        };

        if shared.conf.disconnect_after_job {
            info!("Waiting for job to be assigned...");
            info!(
                "The agent will automatically disconnect after {} seconds if no job is assigned",
                shared.conf.disconnect_after_job_timeout
            );
        } else if shared.conf.disconnect_after_idle_timeout > 0 {
            info!("Waiting for job to be assigned...");
            info!(
                "The agent will automatically disconnect after {} seconds of inactivity",
                shared.conf.disconnect_after_idle_timeout
            );
        } else {
            info!("Waiting for work...");
        }

        self.update_proc_title("waiting");

        // A ping interval of zero schedules nothing; park until stopped.
        if ping_interval.is_zero() {
            shared.stop_signal.cancelled().await;
            shared.running.store(false, Ordering::SeqCst);
            return Ok(());
        }

        let mut ticker = tokio::time::interval(ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            if !self.is_stopping() {
                self.ping(&scope, job_wait_timer.as_ref(), idle_timer.as_ref())
                    .await;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = shared.stop_signal.cancelled() => {
                    shared.running.store(false, Ordering::SeqCst);
                    return Ok(());
                }
            }
        }
    }

    /// Stops the worker from accepting new work.
    ///
    /// Graceful lets an in-progress job finish on its own; forceful
    /// cancels it first. The first call closes the stop signal; later
    /// calls only log (and, when forceful, re-cancel, which the runner
    /// contract makes safe).
    pub fn stop(&self, graceful: bool) {
        let mut state = self.lock_stop();

        if graceful {
            if state.stopping {
                warn!("Agent is already gracefully stopping...");
            } else if state.job.is_some() {
                info!("Gracefully stopping agent. Waiting for current job to finish before disconnecting...");
            } else {
                info!("Gracefully stopping agent. Since there is no job running, the agent will disconnect immediately");
            }
        } else if let Some(job) = &state.job {
            info!("Forcefully stopping agent. The current job will be canceled before disconnecting...");
            job.cancel();
        } else {
            info!("Forcefully stopping agent. Since there is no job running, the agent will disconnect immediately");
        }

        if state.stopping {
            return;
        }

        self.update_proc_title("stopping");

        // Closing the signal is the canonical transition into stopping;
        // `stopping` latches under the mutex so this happens exactly once.
        self.shared.stop_signal.cancel();
        state.stopping = true;
    }

    /// Ends the session. Never retried: a worker on its way out should
    /// disconnect as fast as it can.
    pub async fn disconnect(&self) -> Result<(), ApiError> {
        info!("Disconnecting...");
        self.update_proc_title("disconnecting");

        if let Err(err) = self.client().disconnect().await {
            warn!(
                "There was an error sending the disconnect API call. If this agent still appears online, you may have to manually stop it ({})",
                err
            );
            return Err(err);
        }
        Ok(())
    }

    /// Delivers one heartbeat, retrying transient failures.
    pub async fn heartbeat(&self) -> Result<(), ApiError> {
        let beat = retry(RetryPolicy::heartbeat(), |stats| {
            let client = self.client();
            async move {
                match client.heartbeat().await {
                    Ok(beat) => Ok(beat),
                    Err(err) => {
                        warn!("{} ({})", err, stats);
                        Err(err)
                    }
                }
            }
        })
        .await?;

        self.shared
            .last_heartbeat
            .store(unix_now(), Ordering::SeqCst);
        debug!(
            "Heartbeat sent at {} and received at {}",
            beat.sent_at, beat.received_at
        );
        Ok(())
    }

    /// The endpoint the worker is currently talking to.
    pub fn endpoint(&self) -> String {
        self.read_lock(&self.shared.endpoint).clone()
    }

    /// True from start entry until the ping loop exits.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// True once a stop has been initiated; never clears.
    pub fn is_stopping(&self) -> bool {
        self.lock_stop().stopping
    }

    /// Unix seconds of the last successful ping; 0 when none yet.
    pub fn last_ping_unix(&self) -> i64 {
        self.shared.last_ping.load(Ordering::SeqCst)
    }

    /// Unix seconds of the last successful heartbeat; 0 when none yet.
    pub fn last_heartbeat_unix(&self) -> i64 {
        self.shared.last_heartbeat.load(Ordering::SeqCst)
    }

    async fn heartbeat_loop(&self, interval: Duration) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = self.heartbeat().await {
                        match elapsed_since(&self.shared.last_heartbeat) {
                            Some(ago) => error!(
                                "Failed to heartbeat {}. Will try again in {:?}. (Last successful was {:?} ago)",
                                err, interval, ago
                            ),
                            None => error!(
                                "Failed to heartbeat {}. Will try again in {:?}. (No successful heartbeat yet)",
                                err, interval
                            ),
                        }
                    }
                }
                _ = self.shared.stop_signal.cancelled() => {
                    debug!("Stopping heartbeats");
                    return;
                }
            }
        }
    }

    /// One ping cycle: fetch the next directive and act on it.
    async fn ping(
        &self,
        scope: &MetricsScope,
        job_wait: Option<&DeadlineTimer>,
        idle: Option<&DeadlineTimer>,
    ) {
        self.update_proc_title("pinging");

        let client = self.client();
        let mut ping = match client.ping().await {
            Ok(ping) => {
                self.shared.last_ping.store(unix_now(), Ordering::SeqCst);
                ping
            }
            Err(err) => {
                match elapsed_since(&self.shared.last_ping) {
                    Some(ago) => warn!("Failed to ping: {} (Last successful was {:?} ago)", err, ago),
                    None => warn!("Failed to ping: {} (No successful ping yet)", err),
                }

                // A flaky connection must not eat into the wait-for-job
                // grace period.
                if let Some(timer) = job_wait {
                    timer.reset();
                    debug!(
                        "Disconnect-after-job timer reset to {} seconds after ping failure",
                        self.shared.conf.disconnect_after_job_timeout
                    );
                }
                return;
            }
        };

        // Server-requested endpoint switch: probe the candidate with a
        // fresh client and adopt its response, or ignore the switch.
        if let Some(new_endpoint) = ping.endpoint.clone().filter(|e| !e.is_empty()) {
            if new_endpoint != self.endpoint() {
                let probe = self.shared.client_factory.create(ApiClientConfig {
                    endpoint: new_endpoint.clone(),
                    token: self.shared.agent.access_token.clone(),
                    disable_http2: self.shared.conf.disable_http2,
                });

                match probe.ping().await {
                    Ok(probed) => {
                        *self.write_lock(&self.shared.client) = probe;
                        *self.write_lock(&self.shared.endpoint) = new_endpoint;
                        ping = probed;
                    }
                    Err(err) => {
                        warn!(
                            "Failed to ping the new endpoint {} - ignoring switch for now ({})",
                            new_endpoint, err
                        );
                    }
                }
            }
        }

        if let Some(message) = ping.message.as_deref().filter(|m| !m.is_empty()) {
            info!("{message}");
        }

        if ping.wants_disconnect() {
            self.stop(false);
            return;
        }

        let Some(job) = ping.job else {
            self.update_proc_title("idle");
            return;
        };

        self.accept_and_run(job, scope, job_wait, idle).await;
    }

    async fn accept_and_run(
        &self,
        job: Job,
        scope: &MetricsScope,
        job_wait: Option<&DeadlineTimer>,
        idle: Option<&DeadlineTimer>,
    ) {
        self.update_proc_title(&format!("job {}", job.short_id()));
        info!("Assigned job {}. Accepting...", job.id);

        // Transient errors are retried; a server rejection is final, so
        // break out and let the next ping start the cycle over.
        let accepted = retry(RetryPolicy::accept_job(), |stats| {
            let client = self.client();
            let job = job.clone();
            async move {
                match client.accept_job(&job).await {
                    Ok(accepted) => Ok(accepted),
                    Err(err) => {
                        if err.is_retryable() {
                            warn!("{} ({})", err, stats);
                        } else {
                            warn!("The server rejected the call to accept the job ({})", err);
                            stats.break_out();
                        }
                        Err(err)
                    }
                }
            }
        })
        .await;

        let accepted = match accepted {
            Ok(accepted) => accepted,
            Err(_) => {
                error!("Failed to accept job");
                return;
            }
        };

        // The job is ours; the wait-for-job grace period no longer applies.
        if let Some(timer) = job_wait {
            debug!("A job was assigned and accepted, disarming the disconnect-after-job timer");
            timer.disarm();
        }

        let job_scope = scope.with(job_tags(&accepted));

        // The runner options are opaque to the worker; forward them as
        // configured.
        let runner = match self.shared.runner_factory.create(
            job_scope,
            &self.shared.agent,
            accepted,
            &self.shared.conf.job_runner,
        ) {
            Ok(runner) => runner,
            Err(err) => {
                error!("Failed to initialize job: {}", err);
                return;
            }
        };

        // Publish before running so a forceful stop can see and cancel it.
        self.lock_stop().job = Some(runner.clone());

        if let Err(err) = runner.run().await {
            error!("Failed to run job: {}", err);
        }

        self.lock_stop().job = None;

        if self.shared.conf.disconnect_after_job {
            info!("Job finished. Disconnecting...");
            self.stop(true);
            return;
        }

        if let Some(timer) = idle {
            info!("Job finished. Resetting idle timer...");
            timer.reset();
        }
    }

    /// Stop only when no job is running; a running job gets to finish.
    fn stop_if_idle(&self) {
        let idle = {
            let state = self.lock_stop();
            state.job.is_none() && !state.stopping
        };

        if idle {
            self.stop(true);
        } else {
            debug!("Agent is running a job, going to let it finish its work");
        }
    }

    fn client(&self) -> Arc<dyn AgentApi> {
        self.read_lock(&self.shared.client).clone()
    }

    fn lock_stop(&self) -> MutexGuard<'_, StopState> {
        self.shared
            .stop_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_lock<'a, T>(&self, lock: &'a RwLock<T>) -> std::sync::RwLockReadGuard<'a, T> {
        lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_lock<'a, T>(&self, lock: &'a RwLock<T>) -> std::sync::RwLockWriteGuard<'a, T> {
        lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update_proc_title(&self, action: &str) {
        let title = format!(
            "buildkite-agent v{} [{}]",
            env!("CARGO_PKG_VERSION"),
            action
        );
        self.shared.proc_title.replace(&title);
    }
}

/// Stops the collector on every exit path out of `start`.
struct CollectorGuard<'a>(&'a MetricsCollector);

impl Drop for CollectorGuard<'_> {
    fn drop(&mut self) {
        self.0.stop();
    }
}

fn job_tags(job: &Job) -> Tags {
    let mut tags = Tags::new();
    for (tag, key) in [
        ("pipeline", "BUILDKITE_PIPELINE_SLUG"),
        ("org", "BUILDKITE_ORGANIZATION_SLUG"),
        ("branch", "BUILDKITE_BRANCH"),
        ("source", "BUILDKITE_SOURCE"),
    ] {
        if let Some(value) = job.env.get(key) {
            tags.insert(tag.to_string(), value.clone());
        }
    }
    tags
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn elapsed_since(stamp: &AtomicI64) -> Option<Duration> {
    let secs = stamp.load(Ordering::SeqCst);
    if secs == 0 {
        return None;
    }
    Some(Duration::from_secs(
        unix_now().saturating_sub(secs).max(0) as u64
    ))
}
