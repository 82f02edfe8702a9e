//! Error taxonomy shared by the planner, store, engine and API.

use thiserror::Error;
use uuid::Uuid;

use crate::dispatch::DispatchError;

/// Failures the orchestration core can report.
#[derive(Debug, Error)]
pub enum MissionError {
    /// The brief lacks a persona or action, or names an action with no plan template.
    #[error("Malformed brief: {0}")]
    MalformedBrief(String),

    /// The plan violates its structural invariants or references an unknown output key.
    #[error("Malformed plan: {0}")]
    MalformedPlan(String),

    /// Infrastructure-level dispatch failure (unknown agent, spawn failure, abnormal exit).
    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    /// The worker ran to completion but reported failure itself.
    #[error("Agent {agent} reported failure: {message}")]
    AgentReportedFailure { agent: String, message: String },

    #[error("Mission store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Mission {0} not found")]
    NotFound(Uuid),

    /// Another run already moved the mission out of `queued`.
    #[error("Mission {0} was already claimed by another run")]
    AlreadyClaimed(Uuid),
}

impl MissionError {
    /// Short machine-readable tag used in API error bodies and failure payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedBrief(_) => "malformed_brief",
            Self::MalformedPlan(_) => "malformed_plan",
            Self::Dispatch(_) => "dispatch_error",
            Self::AgentReportedFailure { .. } => "agent_reported_failure",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::NotFound(_) => "not_found",
            Self::AlreadyClaimed(_) => "already_claimed",
        }
    }
}
