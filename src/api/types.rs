//! API request and response types.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::mission_store::{Mission, MissionStatus, StoreError};
use crate::brief::MissionBrief;
use crate::error::MissionError;
use crate::planner::BlueprintStep;

/// Request to turn a prompt into a brief.
#[derive(Debug, Clone, Deserialize)]
pub struct ParseRequest {
    pub prompt: String,
}

/// Parsed brief plus where it came from.
#[derive(Debug, Clone, Serialize)]
pub struct ParseResponse {
    #[serde(flatten)]
    pub brief: MissionBrief,

    /// Provider name, or "rules" when the keyword extractor produced the brief
    pub source: String,
}

/// Body of `POST /missions/execute`: a free-text prompt or an explicit blueprint.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExecuteRequest {
    Blueprint(BlueprintRequest),
    Prompt(ParseRequest),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintRequest {
    pub mission_name: String,
    pub steps: Vec<BlueprintStep>,
}

/// Response after accepting a mission for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub mission_id: Uuid,
    pub plan_id: String,
    pub message: String,
}

/// Listing view of a mission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionSummary {
    pub id: Uuid,
    pub prompt: String,
    pub status: MissionStatus,
    pub plan_id: String,
    pub step_count: usize,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl From<&Mission> for MissionSummary {
    fn from(mission: &Mission) -> Self {
        Self {
            id: mission.id,
            prompt: mission.prompt.clone(),
            status: mission.status,
            plan_id: mission.plan.plan_id.clone(),
            step_count: mission.plan.steps.len(),
            created_at: mission.created_at,
            completed_at: mission.completed_at,
            failure_reason: mission.failure_reason.clone(),
        }
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Mission store backend
    pub store: String,

    /// Agent runtime
    pub runtime: String,

    /// Missions executing in this process
    pub running_missions: usize,
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

/// Handler error carrying the HTTP status and taxonomy tag.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                error: message.into(),
                kind: "invalid_request".to_string(),
            },
        }
    }

    /// The task runner is gone; the mission stays queued until re-triggered.
    pub fn runner_unavailable(mission_id: Uuid) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: ErrorBody {
                error: format!("Mission {} is queued but the task runner is not accepting work", mission_id),
                kind: "runner_unavailable".to_string(),
            },
        }
    }
}

/// Bodies that are not JSON or do not match the request shape.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            body: ErrorBody {
                error: rejection.body_text(),
                kind: "invalid_request".to_string(),
            },
        }
    }
}

impl From<MissionError> for ApiError {
    fn from(err: MissionError) -> Self {
        let status = match &err {
            MissionError::MalformedBrief(_) | MissionError::MalformedPlan(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            MissionError::NotFound(_) => StatusCode::NOT_FOUND,
            MissionError::AlreadyClaimed(_) => StatusCode::CONFLICT,
            MissionError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            MissionError::Dispatch(_) | MissionError::AgentReportedFailure { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", err);
        }
        Self {
            status,
            body: ErrorBody {
                error: err.to_string(),
                kind: err.kind().to_string(),
            },
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        MissionError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_execute_request_accepts_both_shapes() {
        let prompt: ExecuteRequest =
            serde_json::from_value(json!({"prompt": "tech layoffs in ohio"})).unwrap();
        assert!(matches!(prompt, ExecuteRequest::Prompt(p) if p.prompt == "tech layoffs in ohio"));

        let blueprint: ExecuteRequest = serde_json::from_value(json!({
            "missionName": "WARN sweep",
            "steps": [{"agent": "scout-warn"}]
        }))
        .unwrap();
        assert!(matches!(blueprint, ExecuteRequest::Blueprint(b) if b.steps.len() == 1));
    }

    #[test]
    fn test_error_status_mapping() {
        let id = Uuid::new_v4();
        let cases = [
            (MissionError::MalformedBrief("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (MissionError::MalformedPlan("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (MissionError::NotFound(id), StatusCode::NOT_FOUND),
            (MissionError::AlreadyClaimed(id), StatusCode::CONFLICT),
            (MissionError::StoreUnavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, status) in cases {
            let kind = err.kind();
            let api = ApiError::from(err);
            assert_eq!(api.status, status);
            assert_eq!(api.body.kind, kind);
        }
    }
}
