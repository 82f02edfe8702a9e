//! Agent dispatch: runs one plan step on a worker and returns its payload.
//!
//! The engine only sees [`AgentDispatcher`]. The production implementation,
//! [`ProcessDispatcher`], launches the worker as a docker container, a
//! systemd-nspawn container, or a plain host process, and reads the worker's
//! JSON result document from a scratch file.

mod process;
mod registry;

pub use process::ProcessDispatcher;
pub use registry::{AgentRegistry, AgentSpec, RegistryError, BUILTIN_AGENTS};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::error::MissionError;

/// Where agent workers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRuntime {
    /// `docker run --rm` per step
    Docker,
    /// `systemd-nspawn --ephemeral` against a prepared root filesystem
    Nspawn,
    /// Direct child process; development and tests
    Host,
}

impl AgentRuntime {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "docker" => Some(Self::Docker),
            "nspawn" | "systemd-nspawn" | "container" => Some(Self::Nspawn),
            "host" | "local" => Some(Self::Host),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Nspawn => "nspawn",
            Self::Host => "host",
        }
    }
}

/// Infrastructure-level dispatch failures. None of these are retried.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Failed to launch {agent}: {message}")]
    Spawn { agent: String, message: String },

    #[error("{agent} exited abnormally (code {code:?}): {stderr_tail}")]
    AbnormalExit {
        agent: String,
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("{agent} did not finish within {}s", .after.as_secs())]
    Timeout { agent: String, after: Duration },

    #[error("{agent} exited without writing a result document")]
    MissingResult { agent: String },

    #[error("{agent} wrote an invalid result document: {message}")]
    InvalidResult { agent: String, message: String },

    #[error("Failed to prepare worker scratch directory: {0}")]
    Scratch(#[from] std::io::Error),
}

/// Why a step did not produce a payload.
#[derive(Debug)]
pub enum DispatchFailure {
    /// The worker could not be run or its output could not be read.
    Dispatch(DispatchError),
    /// The worker ran to completion and reported failure in its result document.
    AgentReported { message: String },
}

impl From<DispatchError> for DispatchFailure {
    fn from(err: DispatchError) -> Self {
        Self::Dispatch(err)
    }
}

impl DispatchFailure {
    pub fn into_mission_error(self, agent: &str) -> MissionError {
        match self {
            Self::Dispatch(err) => MissionError::Dispatch(err),
            Self::AgentReported { message } => MissionError::AgentReportedFailure {
                agent: agent.to_string(),
                message,
            },
        }
    }
}

/// Runs a single agent invocation to completion.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    /// Runtime name reported by the health endpoint.
    fn runtime_name(&self) -> &str;

    async fn dispatch(
        &self,
        agent: &str,
        params: &Value,
        mission_id: Uuid,
        step: u32,
    ) -> Result<Value, DispatchFailure>;
}

pub type DispatcherRef = Arc<dyn AgentDispatcher>;

/// Split a worker's result document into payload or agent-reported failure.
/// Only a top-level `"status": "failed"` counts as failure.
pub fn interpret_result_document(document: Value) -> Result<Value, DispatchFailure> {
    let failed = document
        .get("status")
        .and_then(Value::as_str)
        .is_some_and(|s| s.eq_ignore_ascii_case("failed"));
    if !failed {
        return Ok(document);
    }
    let message = match document.get("error") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "agent reported failure without a message".to_string(),
        Some(other) => other.to_string(),
    };
    Err(DispatchFailure::AgentReported { message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_runtime_parse() {
        assert_eq!(AgentRuntime::parse("Docker"), Some(AgentRuntime::Docker));
        assert_eq!(AgentRuntime::parse("systemd-nspawn"), Some(AgentRuntime::Nspawn));
        assert_eq!(AgentRuntime::parse("host"), Some(AgentRuntime::Host));
        assert_eq!(AgentRuntime::parse("kubernetes"), None);
    }

    #[test]
    fn test_failed_status_is_agent_reported() {
        let err = interpret_result_document(json!({"status": "failed", "error": "quota hit"}))
            .unwrap_err();
        match err {
            DispatchFailure::AgentReported { message } => assert_eq!(message, "quota hit"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_other_documents_are_payloads() {
        let doc = json!({"status": "ok", "leads": [1, 2]});
        assert_eq!(interpret_result_document(doc.clone()).unwrap(), doc);
        let nested = json!({"result": {"status": "failed"}});
        assert_eq!(interpret_result_document(nested.clone()).unwrap(), nested);
        assert_eq!(interpret_result_document(json!([1, 2])).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_failure_maps_to_mission_error() {
        let reported = DispatchFailure::AgentReported {
            message: "no results".into(),
        };
        assert_eq!(
            reported.into_mission_error("scout-warn").kind(),
            "agent_reported_failure"
        );
        let infra = DispatchFailure::from(DispatchError::UnknownAgent("ghost".into()));
        assert_eq!(infra.into_mission_error("ghost").kind(), "dispatch_error");
    }
}
