//! Mission storage module with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database, the default durable backend

mod memory;
mod sqlite;

pub use memory::InMemoryMissionStore;
pub use sqlite::SqliteMissionStore;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::brief::MissionBrief;
use crate::error::MissionError;
use crate::planner::ExecutionPlan;

/// Reason recorded on missions that were still running when the process died.
pub const INTERRUPTED_REASON: &str = "interrupted by orchestrator restart";

/// Mission lifecycle: `queued → running → {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl MissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step's result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted mission: the prompt, the brief parsed from it, and the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mission {
    pub id: Uuid,
    pub prompt: String,
    pub brief: MissionBrief,
    pub plan: ExecutionPlan,
    pub status: MissionStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Short text of the failure that ended the run
    pub failure_reason: Option<String>,
}

/// Outcome of one step of one mission. At most one row per (mission, step).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub id: i64,
    pub mission_id: Uuid,
    pub step: u32,
    pub agent_name: String,
    pub status: ResultStatus,
    pub payload: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Mission {0} not found")]
    MissionNotFound(Uuid),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for MissionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MissionNotFound(id) => MissionError::NotFound(id),
            other => MissionError::StoreUnavailable(other.to_string()),
        }
    }
}

/// Timestamp encoding used by persistent backends. Fixed-width UTC, so
/// lexicographic order equals chronological order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{}': {}", s, e)))
}

/// Mission store trait - implemented by all storage backends.
#[async_trait]
pub trait MissionStore: Send + Sync {
    /// Backend name reported by the health endpoint.
    fn backend_name(&self) -> &'static str;

    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// Create a queued mission. The mission is visible to readers only once
    /// this returns.
    async fn create_mission(
        &self,
        prompt: &str,
        brief: &MissionBrief,
        plan: &ExecutionPlan,
    ) -> Result<Mission, StoreError>;

    /// Atomically move a mission from `queued` to `running`. Returns false
    /// when the mission is unknown or no longer queued.
    async fn claim_mission(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn set_mission_status(
        &self,
        id: Uuid,
        status: MissionStatus,
        completed_at: Option<DateTime<Utc>>,
        failure_reason: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Insert or update the result row for (mission, step).
    async fn upsert_result(
        &self,
        mission_id: Uuid,
        step: u32,
        agent_name: &str,
        status: ResultStatus,
        payload: Option<&Value>,
    ) -> Result<StepResult, StoreError>;

    async fn get_mission(&self, id: Uuid) -> Result<Option<Mission>, StoreError>;

    /// All missions, newest first.
    async fn list_missions(&self) -> Result<Vec<Mission>, StoreError>;

    /// Results for a mission, most recently updated first.
    async fn get_results(&self, mission_id: Uuid) -> Result<Vec<StepResult>, StoreError>;

    /// Fail every mission left `running` by a previous process, along with
    /// its running result rows. Returns the ids that were recovered.
    async fn recover_interrupted(&self) -> Result<Vec<Uuid>, StoreError>;
}

pub type MissionStoreRef = Arc<dyn MissionStore>;

/// Payload written into result rows failed by startup recovery.
pub(crate) fn interrupted_payload() -> Value {
    serde_json::json!({ "error": INTERRUPTED_REASON, "kind": "interrupted" })
}

/// Mission store type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissionStoreType {
    Memory,
    #[default]
    Sqlite,
}

impl MissionStoreType {
    /// Parse from environment variable value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "sqlite" | "db" => Some(Self::Sqlite),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
        }
    }
}

/// Create a mission store based on type and configuration.
pub async fn create_mission_store(
    store_type: MissionStoreType,
    base_dir: PathBuf,
) -> Result<MissionStoreRef, StoreError> {
    match store_type {
        MissionStoreType::Memory => Ok(Arc::new(InMemoryMissionStore::new())),
        MissionStoreType::Sqlite => {
            let store = SqliteMissionStore::new(base_dir).await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::brief::rules;
    use crate::brief::MissionBrief;
    use crate::planner::{self, ExecutionPlan};

    pub fn layoff_fixture() -> (String, MissionBrief, ExecutionPlan) {
        let prompt = "tech layoffs in california last month".to_string();
        let brief = rules::extract(&prompt);
        let plan = planner::plan(&brief).expect("fixture plan");
        (prompt, brief, plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_text() {
        for status in [
            MissionStatus::Queued,
            MissionStatus::Running,
            MissionStatus::Completed,
            MissionStatus::Failed,
        ] {
            assert_eq!(MissionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MissionStatus::parse("active"), None);
        assert_eq!(format!("{}", ResultStatus::Running), "running");
    }

    #[test]
    fn test_store_type_parse() {
        assert_eq!(MissionStoreType::parse("Memory"), Some(MissionStoreType::Memory));
        assert_eq!(MissionStoreType::parse("db"), Some(MissionStoreType::Sqlite));
        assert_eq!(MissionStoreType::parse("json"), None);
    }

    #[test]
    fn test_timestamp_encoding_sorts_chronologically() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::microseconds(1500);
        assert!(format_timestamp(&earlier) < format_timestamp(&later));
        let parsed = parse_timestamp(&format_timestamp(&earlier)).unwrap();
        assert_eq!(parsed.timestamp_micros(), earlier.timestamp_micros());
    }

    #[test]
    fn test_store_error_maps_to_mission_error() {
        let id = Uuid::new_v4();
        assert!(matches!(
            MissionError::from(StoreError::MissionNotFound(id)),
            MissionError::NotFound(found) if found == id
        ));
        assert!(matches!(
            MissionError::from(StoreError::Database("locked".into())),
            MissionError::StoreUnavailable(_)
        ));
    }
}
