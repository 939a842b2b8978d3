use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The agent record handed back by registration.
///
/// Immutable once received. The worker tracks its *effective* endpoint
/// separately, so a server-requested endpoint switch never rewrites this
/// record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    /// Stable agent name, e.g. `my-agent-1`.
    pub name: String,
    /// Access token scoped to this agent.
    pub access_token: String,
    /// Preferred endpoint URL; empty means "use the configured default".
    #[serde(default)]
    pub endpoint: String,
    /// Seconds between pings.
    pub ping_interval: u64,
    /// Seconds between heartbeats.
    pub heartbeat_interval: u64,
}

/// One unit of work handed out by a ping and owned after a successful
/// accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// UUID string assigned by the server.
    pub id: String,
    /// Environment the job will run with. The worker lifts the
    /// `BUILDKITE_*` slugs out of here for metrics tags.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Job {
    /// First hyphen-delimited component of the id, used in proc titles.
    pub fn short_id(&self) -> &str {
        self.id.split('-').next().unwrap_or(&self.id)
    }
}

/// The directive returned by each ping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingResponse {
    /// When present and different from the current endpoint, the server is
    /// asking the agent to switch.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Advisory text to surface in the operator log.
    #[serde(default)]
    pub message: Option<String>,
    /// The only action with semantics is [`PingResponse::ACTION_DISCONNECT`].
    #[serde(default)]
    pub action: Option<String>,
    /// Job waiting to be accepted, if any.
    #[serde(default)]
    pub job: Option<Job>,
}

impl PingResponse {
    pub const ACTION_DISCONNECT: &'static str = "disconnect";

    /// Whether the server directed the agent to disconnect.
    pub fn wants_disconnect(&self) -> bool {
        self.action.as_deref() == Some(Self::ACTION_DISCONNECT)
    }
}

/// Reply to a heartbeat. Timestamps are advisory and only ever logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub sent_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_is_first_hyphen_component() {
        let job = Job {
            id: "0183c4a6-ab7e-4ba4-8c3f-2e0e5ddd38f1".to_string(),
            env: HashMap::new(),
        };
        assert_eq!(job.short_id(), "0183c4a6");
    }

    #[test]
    fn short_id_without_hyphens_is_whole_id() {
        let job = Job {
            id: "plain".to_string(),
            env: HashMap::new(),
        };
        assert_eq!(job.short_id(), "plain");
    }

    #[test]
    fn sparse_ping_response_deserializes_with_defaults() {
        let ping: PingResponse = serde_json::from_str(r#"{"message":"hello"}"#).unwrap();
        assert_eq!(ping.message.as_deref(), Some("hello"));
        assert!(ping.endpoint.is_none());
        assert!(ping.job.is_none());
        assert!(!ping.wants_disconnect());
    }

    #[test]
    fn disconnect_action_is_recognised() {
        let ping = PingResponse {
            action: Some("disconnect".to_string()),
            ..Default::default()
        };
        assert!(ping.wants_disconnect());

        let ping = PingResponse {
            action: Some("pause".to_string()),
            ..Default::default()
        };
        assert!(!ping.wants_disconnect());
    }
}
