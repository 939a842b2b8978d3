//! Client-side contract of the Buildkite agent API.
//!
//! This crate defines the capability surface an agent worker consumes:
//! the wire DTOs exchanged with the service, the [`AgentApi`] trait a
//! transport implements, and the [`ApiError`] classification that decides
//! which failures are worth retrying. It deliberately contains no HTTP
//! code; transports live with the embedder.

pub mod client;
pub mod error;
pub mod types;

pub use client::{AgentApi, ApiClientConfig, ApiClientFactory};
pub use error::ApiError;
pub use types::{AgentRegistration, Heartbeat, Job, PingResponse};
