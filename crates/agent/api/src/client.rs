use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ApiError;
use crate::types::{Heartbeat, Job, PingResponse};

/// Connection settings for building a client against one endpoint.
#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub endpoint: String,
    pub token: String,
    pub disable_http2: bool,
}

/// Capability surface the agent worker consumes.
///
/// One client talks to one endpoint with one credential. Per-call network
/// timeouts are the client's responsibility; callers never wrap these calls
/// in their own timers.
#[async_trait]
pub trait AgentApi: Send + Sync {
    /// Registers this session with the service.
    async fn connect(&self) -> Result<(), ApiError>;

    /// Ends the session. Callers never retry this.
    async fn disconnect(&self) -> Result<(), ApiError>;

    /// Polls the service for the next directive.
    async fn ping(&self) -> Result<PingResponse, ApiError>;

    /// Liveness call; the reply is advisory.
    async fn heartbeat(&self) -> Result<Heartbeat, ApiError>;

    /// Upgrades a pinged job into one owned by this agent.
    async fn accept_job(&self, job: &Job) -> Result<Job, ApiError>;

    /// The endpoint this client talks to.
    fn endpoint(&self) -> &str;
}

/// Builds [`AgentApi`] clients.
///
/// The worker uses this once at construction and again whenever the server
/// requests an endpoint switch, probing the candidate endpoint with a fresh
/// client before adopting it.
pub trait ApiClientFactory: Send + Sync {
    fn create(&self, config: ApiClientConfig) -> Arc<dyn AgentApi>;
}
