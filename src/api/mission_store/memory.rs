//! In-memory mission store (non-persistent).

use super::{
    interrupted_payload, Mission, MissionStatus, MissionStore, ResultStatus, StepResult,
    StoreError, INTERRUPTED_REASON,
};
use crate::brief::MissionBrief;
use crate::planner::ExecutionPlan;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Row plus the insertion/update sequence used to break timestamp ties.
#[derive(Clone)]
struct Sequenced<T> {
    seq: u64,
    row: T,
}

#[derive(Default)]
struct State {
    missions: HashMap<Uuid, Sequenced<Mission>>,
    results: HashMap<(Uuid, u32), Sequenced<StepResult>>,
    next_seq: u64,
    next_result_id: i64,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

#[derive(Clone, Default)]
pub struct InMemoryMissionStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryMissionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MissionStore for InMemoryMissionStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn is_persistent(&self) -> bool {
        false
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
        let mut state = self.state.write().await;
        let seq = state.bump();
        state.missions.insert(
            mission.id,
            Sequenced {
                seq,
                row: mission.clone(),
            },
        );
        Ok(mission)
    }

    async fn claim_mission(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.missions.get_mut(&id) {
            Some(entry) if entry.row.status == MissionStatus::Queued => {
                entry.row.status = MissionStatus::Running;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_mission_status(
        &self,
        id: Uuid,
        status: MissionStatus,
        completed_at: Option<DateTime<Utc>>,
        failure_reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let entry = state
            .missions
            .get_mut(&id)
            .ok_or(StoreError::MissionNotFound(id))?;
        entry.row.status = status;
        entry.row.completed_at = completed_at;
        entry.row.failure_reason = failure_reason.map(|s| s.to_string());
        Ok(())
    }

    async fn upsert_result(
        &self,
        mission_id: Uuid,
        step: u32,
        agent_name: &str,
        status: ResultStatus,
        payload: Option<&Value>,
    ) -> Result<StepResult, StoreError> {
        let mut state = self.state.write().await;
        if !state.missions.contains_key(&mission_id) {
            return Err(StoreError::MissionNotFound(mission_id));
        }
        let now = Utc::now();
        let seq = state.bump();
        let finished_at = status.is_terminal().then_some(now);

        let existing = state
            .results
            .get(&(mission_id, step))
            .map(|e| e.row.clone());
        let row = match existing {
            Some(existing) => StepResult {
                agent_name: agent_name.to_string(),
                status,
                payload: payload.cloned(),
                updated_at: now,
                finished_at,
                ..existing
            },
            None => {
                state.next_result_id += 1;
                StepResult {
                    id: state.next_result_id,
                    mission_id,
                    step,
                    agent_name: agent_name.to_string(),
                    status,
                    payload: payload.cloned(),
                    started_at: now,
                    updated_at: now,
                    finished_at,
                }
            }
        };
        state.results.insert(
            (mission_id, step),
            Sequenced {
                seq,
                row: row.clone(),
            },
        );
        Ok(row)
    }

    async fn get_mission(&self, id: Uuid) -> Result<Option<Mission>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .missions
            .get(&id)
            .map(|e| e.row.clone()))
    }

    async fn list_missions(&self) -> Result<Vec<Mission>, StoreError> {
        let state = self.state.read().await;
        let mut entries: Vec<&Sequenced<Mission>> = state.missions.values().collect();
        entries.sort_by(|a, b| {
            b.row
                .created_at
                .cmp(&a.row.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        Ok(entries.into_iter().map(|e| e.row.clone()).collect())
    }

    async fn get_results(&self, mission_id: Uuid) -> Result<Vec<StepResult>, StoreError> {
        let state = self.state.read().await;
        let mut entries: Vec<&Sequenced<StepResult>> = state
            .results
            .values()
            .filter(|e| e.row.mission_id == mission_id)
            .collect();
        entries.sort_by(|a, b| {
            b.row
                .updated_at
                .cmp(&a.row.updated_at)
                .then(b.seq.cmp(&a.seq))
        });
        Ok(entries.into_iter().map(|e| e.row.clone()).collect())
    }

    async fn recover_interrupted(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut recovered = Vec::new();
        for entry in state.missions.values_mut() {
            if entry.row.status == MissionStatus::Running {
                entry.row.status = MissionStatus::Failed;
                entry.row.completed_at = Some(now);
                entry.row.failure_reason = Some(INTERRUPTED_REASON.to_string());
                recovered.push(entry.row.id);
            }
        }
        let payload = interrupted_payload();
        for entry in state.results.values_mut() {
            if recovered.contains(&entry.row.mission_id)
                && entry.row.status == ResultStatus::Running
            {
                entry.row.status = ResultStatus::Failed;
                entry.row.payload = Some(payload.clone());
                entry.row.updated_at = now;
                entry.row.finished_at = Some(now);
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mission_store::test_support::layoff_fixture;
    use serde_json::json;

    #[tokio::test]
    async fn test_mission_created_queued() {
        let store = InMemoryMissionStore::new();
        let (prompt, brief, plan) = layoff_fixture();
        let mission = store.create_mission(&prompt, &brief, &plan).await.unwrap();

        assert_eq!(mission.status, MissionStatus::Queued);
        assert!(mission.completed_at.is_none());
        let fetched = store.get_mission(mission.id).await.unwrap().unwrap();
        assert_eq!(fetched, mission);
    }

    #[tokio::test]
    async fn test_claim_succeeds_once() {
        let store = InMemoryMissionStore::new();
        let (prompt, brief, plan) = layoff_fixture();
        let mission = store.create_mission(&prompt, &brief, &plan).await.unwrap();

        assert!(store.claim_mission(mission.id).await.unwrap());
        assert!(!store.claim_mission(mission.id).await.unwrap());
        assert!(!store.claim_mission(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_per_step() {
        let store = InMemoryMissionStore::new();
        let (prompt, brief, plan) = layoff_fixture();
        let mission = store.create_mission(&prompt, &brief, &plan).await.unwrap();

        let first = store
            .upsert_result(mission.id, 1, "scout-warn", ResultStatus::Running, None)
            .await
            .unwrap();
        let payload = json!({"notices": 3});
        let second = store
            .upsert_result(
                mission.id,
                1,
                "scout-warn",
                ResultStatus::Completed,
                Some(&payload),
            )
            .await
            .unwrap();

        let results = store.get_results(mission.id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(second.id, first.id);
        assert_eq!(second.started_at, first.started_at);
        assert_eq!(results[0].payload, Some(payload));
        assert!(results[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn test_results_newest_updated_first() {
        let store = InMemoryMissionStore::new();
        let (prompt, brief, plan) = layoff_fixture();
        let mission = store.create_mission(&prompt, &brief, &plan).await.unwrap();

        for step in 1..=3 {
            store
                .upsert_result(mission.id, step, "agent", ResultStatus::Completed, None)
                .await
                .unwrap();
        }
        store
            .upsert_result(mission.id, 1, "agent", ResultStatus::Failed, None)
            .await
            .unwrap();

        let steps: Vec<u32> = store
            .get_results(mission.id)
            .await
            .unwrap()
            .iter()
            .map(|r| r.step)
            .collect();
        assert_eq!(steps, vec![1, 3, 2]);
    }

    #[tokio::test]
    async fn test_upsert_for_unknown_mission_fails() {
        let store = InMemoryMissionStore::new();
        let err = store
            .upsert_result(Uuid::new_v4(), 1, "agent", ResultStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissionNotFound(_)));
    }

    #[tokio::test]
    async fn test_recover_interrupted_fails_running_missions() {
        let store = InMemoryMissionStore::new();
        let (prompt, brief, plan) = layoff_fixture();
        let running = store.create_mission(&prompt, &brief, &plan).await.unwrap();
        let queued = store.create_mission(&prompt, &brief, &plan).await.unwrap();
        store.claim_mission(running.id).await.unwrap();
        store
            .upsert_result(running.id, 1, "scout-warn", ResultStatus::Running, None)
            .await
            .unwrap();

        let recovered = store.recover_interrupted().await.unwrap();
        assert_eq!(recovered, vec![running.id]);

        let failed = store.get_mission(running.id).await.unwrap().unwrap();
        assert_eq!(failed.status, MissionStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some(INTERRUPTED_REASON));
        let results = store.get_results(running.id).await.unwrap();
        assert_eq!(results[0].status, ResultStatus::Failed);

        let untouched = store.get_mission(queued.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, MissionStatus::Queued);
    }
}
