//! SQLite-based mission store.

use super::{
    format_timestamp, interrupted_payload, parse_timestamp, Mission, MissionStatus, MissionStore,
    ResultStatus, StepResult, StoreError, INTERRUPTED_REASON,
};
use crate::brief::MissionBrief;
use crate::planner::ExecutionPlan;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

const DB_FILE: &str = "missions.db";

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS missions (
    id TEXT PRIMARY KEY NOT NULL,
    prompt TEXT NOT NULL,
    parsed_intent TEXT NOT NULL,
    mission_plan TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    created_at TEXT NOT NULL,
    completed_at TEXT,
    failure_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_missions_created_at ON missions(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_missions_status ON missions(status);

CREATE TABLE IF NOT EXISTS mission_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mission_id TEXT NOT NULL,
    step_number INTEGER NOT NULL,
    agent_name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    result_data TEXT,
    started_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    finished_at TEXT,
    UNIQUE (mission_id, step_number),
    FOREIGN KEY (mission_id) REFERENCES missions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_results_mission_updated ON mission_results(mission_id, updated_at DESC);
"#;

const MISSION_COLUMNS: &str =
    "id, prompt, parsed_intent, mission_plan, status, created_at, completed_at, failure_reason";

const RESULT_COLUMNS: &str =
    "id, mission_id, step_number, agent_name, status, result_data, started_at, updated_at, finished_at";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Database(format!("Task join error: {}", err))
    }
}

pub struct SqliteMissionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMissionStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&base_dir).await?;
        let db_path = base_dir.join(DB_FILE);

        // Open database in blocking task
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            conn.execute_batch(SCHEMA)?;
            Self::run_migrations(&conn)?;
            tracing::debug!("Opened mission database at {}", db_path.display());
            Ok::<_, StoreError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run database migrations for existing databases.
    /// CREATE TABLE IF NOT EXISTS doesn't add columns to existing tables,
    /// so databases created before `failure_reason` existed are patched here.
    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        let has_failure_reason: bool = conn
            .prepare("SELECT 1 FROM pragma_table_info('missions') WHERE name = 'failure_reason'")?
            .exists([])?;

        if !has_failure_reason {
            tracing::info!("Running migration: adding 'failure_reason' column to missions table");
            conn.execute("ALTER TABLE missions ADD COLUMN failure_reason TEXT", [])?;
        }

        Ok(())
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut conn)
        })
        .await?
    }
}

/// Raw row values; decoded outside the rusqlite closure so JSON and
/// timestamp errors surface as `StoreError::Corrupt`.
struct MissionRow {
    id: String,
    prompt: String,
    parsed_intent: String,
    mission_plan: String,
    status: String,
    created_at: String,
    completed_at: Option<String>,
    failure_reason: Option<String>,
}

impl MissionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            prompt: row.get(1)?,
            parsed_intent: row.get(2)?,
            mission_plan: row.get(3)?,
            status: row.get(4)?,
            created_at: row.get(5)?,
            completed_at: row.get(6)?,
            failure_reason: row.get(7)?,
        })
    }

    fn decode(self) -> Result<Mission, StoreError> {
        Ok(Mission {
            id: Uuid::parse_str(&self.id)
                .map_err(|e| StoreError::Corrupt(format!("bad mission id '{}': {}", self.id, e)))?,
            prompt: self.prompt,
            brief: serde_json::from_str(&self.parsed_intent)
                .map_err(|e| StoreError::Corrupt(format!("bad parsed_intent: {}", e)))?,
            plan: serde_json::from_str(&self.mission_plan)
                .map_err(|e| StoreError::Corrupt(format!("bad mission_plan: {}", e)))?,
            status: MissionStatus::parse(&self.status).ok_or_else(|| {
                StoreError::Corrupt(format!("unknown mission status '{}'", self.status))
            })?,
            created_at: parse_timestamp(&self.created_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            failure_reason: self.failure_reason,
        })
    }
}

struct ResultRow {
    id: i64,
    mission_id: String,
    step_number: i64,
    agent_name: String,
    status: String,
    result_data: Option<String>,
    started_at: String,
    updated_at: String,
    finished_at: Option<String>,
}

impl ResultRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            mission_id: row.get(1)?,
            step_number: row.get(2)?,
            agent_name: row.get(3)?,
            status: row.get(4)?,
            result_data: row.get(5)?,
            started_at: row.get(6)?,
            updated_at: row.get(7)?,
            finished_at: row.get(8)?,
        })
    }

    fn decode(self) -> Result<StepResult, StoreError> {
        Ok(StepResult {
            id: self.id,
            mission_id: Uuid::parse_str(&self.mission_id)
                .map_err(|e| StoreError::Corrupt(format!("bad mission id: {}", e)))?,
            step: u32::try_from(self.step_number)
                .map_err(|_| StoreError::Corrupt(format!("bad step {}", self.step_number)))?,
            agent_name: self.agent_name,
            status: ResultStatus::parse(&self.status).ok_or_else(|| {
                StoreError::Corrupt(format!("unknown result status '{}'", self.status))
            })?,
            payload: self
                .result_data
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|e| StoreError::Corrupt(format!("bad result_data: {}", e)))?,
            started_at: parse_timestamp(&self.started_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            finished_at: self
                .finished_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, StoreError> {
    serde_json::to_string(value)
        .map_err(|e| StoreError::Corrupt(format!("failed to encode {}: {}", what, e)))
}

fn fetch_result(
    conn: &Connection,
    mission_id: &str,
    step: u32,
) -> Result<Option<StepResult>, StoreError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM mission_results WHERE mission_id = ?1 AND step_number = ?2",
                RESULT_COLUMNS
            ),
            params![mission_id, step as i64],
            ResultRow::from_row,
        )
        .optional()?;
    row.map(ResultRow::decode).transpose()
}

#[async_trait]
impl MissionStore for SqliteMissionStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn create_mission(
        &self,
        prompt: &str,
        brief: &MissionBrief,
        plan: &ExecutionPlan,
    ) -> Result<Mission, StoreError> {
        let mission = Mission {
            id: Uuid::new_v4(),
            prompt: prompt.to_string(),
            brief: brief.clone(),
            plan: plan.clone(),
            status: MissionStatus::Queued,
            created_at: Utc::now(),
            completed_at: None,
            failure_reason: None,
        };
        let parsed_intent = to_json(&mission.brief, "brief")?;
        let mission_plan = to_json(&mission.plan, "plan")?;
        let id_str = mission.id.to_string();
        let prompt = mission.prompt.clone();
        let created_at = format_timestamp(&mission.created_at);

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO missions (id, prompt, parsed_intent, mission_plan, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'queued', ?5)",
                params![id_str, prompt, parsed_intent, mission_plan, created_at],
            )?;
            Ok(())
        })
        .await?;

        Ok(mission)
    }

    async fn claim_mission(&self, id: Uuid) -> Result<bool, StoreError> {
        let id_str = id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE missions SET status = 'running' WHERE id = ?1 AND status = 'queued'",
                params![id_str],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn set_mission_status(
        &self,
        id: Uuid,
        status: MissionStatus,
        completed_at: Option<DateTime<Utc>>,
        failure_reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let id_str = id.to_string();
        let completed_at = completed_at.as_ref().map(format_timestamp);
        let failure_reason = failure_reason.map(|s| s.to_string());
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE missions SET status = ?1, completed_at = ?2, failure_reason = ?3 WHERE id = ?4",
                params![status.as_str(), completed_at, failure_reason, id_str],
            )?;
            if changed == 0 {
                return Err(StoreError::MissionNotFound(id));
            }
            Ok(())
        })
        .await
    }

    async fn upsert_result(
        &self,
        mission_id: Uuid,
        step: u32,
        agent_name: &str,
        status: ResultStatus,
        payload: Option<&Value>,
    ) -> Result<StepResult, StoreError> {
        let id_str = mission_id.to_string();
        let agent_name = agent_name.to_string();
        let result_data = payload.map(|p| to_json(p, "result payload")).transpose()?;
        let now = format_timestamp(&Utc::now());
        let finished_at = status.is_terminal().then(|| now.clone());

        self.with_conn(move |conn| {
            let exists: bool = conn
                .prepare("SELECT 1 FROM missions WHERE id = ?1")?
                .exists(params![id_str])?;
            if !exists {
                return Err(StoreError::MissionNotFound(mission_id));
            }
            conn.execute(
                "INSERT INTO mission_results
                     (mission_id, step_number, agent_name, status, result_data, started_at, updated_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)
                 ON CONFLICT(mission_id, step_number) DO UPDATE SET
                     agent_name = excluded.agent_name,
                     status = excluded.status,
                     result_data = excluded.result_data,
                     updated_at = excluded.updated_at,
                     finished_at = excluded.finished_at",
                params![
                    id_str,
                    step as i64,
                    agent_name,
                    status.as_str(),
                    result_data,
                    now,
                    finished_at
                ],
            )?;
            fetch_result(conn, &id_str, step)?.ok_or_else(|| {
                StoreError::Database(format!("result {}#{} vanished after upsert", id_str, step))
            })
        })
        .await
    }

    async fn get_mission(&self, id: Uuid) -> Result<Option<Mission>, StoreError> {
        let id_str = id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM missions WHERE id = ?1", MISSION_COLUMNS),
                    params![id_str],
                    MissionRow::from_row,
                )
                .optional()?;
            row.map(MissionRow::decode).transpose()
        })
        .await
    }

    async fn list_missions(&self) -> Result<Vec<Mission>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM missions ORDER BY created_at DESC, rowid DESC",
                MISSION_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], MissionRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(MissionRow::decode).collect()
        })
        .await
    }

    async fn get_results(&self, mission_id: Uuid) -> Result<Vec<StepResult>, StoreError> {
        let id_str = mission_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM mission_results WHERE mission_id = ?1
                 ORDER BY updated_at DESC, id DESC",
                RESULT_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![id_str], ResultRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(ResultRow::decode).collect()
        })
        .await
    }

    async fn recover_interrupted(&self) -> Result<Vec<Uuid>, StoreError> {
        let now = format_timestamp(&Utc::now());
        let payload = to_json(&interrupted_payload(), "recovery payload")?;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let ids: Vec<String> = {
                let mut stmt = tx.prepare("SELECT id FROM missions WHERE status = 'running'")?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                ids
            };
            for id in &ids {
                tx.execute(
                    "UPDATE mission_results
                     SET status = 'failed', result_data = ?1, updated_at = ?2, finished_at = ?2
                     WHERE mission_id = ?3 AND status = 'running'",
                    params![payload, now, id],
                )?;
                tx.execute(
                    "UPDATE missions SET status = 'failed', completed_at = ?1, failure_reason = ?2
                     WHERE id = ?3",
                    params![now, INTERRUPTED_REASON, id],
                )?;
            }
            tx.commit()?;
            ids.iter()
                .map(|id| {
                    Uuid::parse_str(id)
                        .map_err(|e| StoreError::Corrupt(format!("bad mission id '{}': {}", id, e)))
                })
                .collect()
        })
        .await
    }
}
