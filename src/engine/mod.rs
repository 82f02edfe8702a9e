//! Execution engine: drives one mission through its plan.
//!
//! A run claims the mission (queued → running), then executes steps strictly
//! in ascending order. Each step's result row is written `running` before
//! dispatch and updated in place afterwards. The first failing step ends the
//! run; nothing is rolled back. Step failures are recorded outcomes, so
//! [`ExecutionEngine::execute`] returns `Ok(MissionStatus::Failed)` for them
//! and reserves `Err` for lost claims and store outages.

mod runner;

pub use runner::MissionRunner;

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::api::mission_store::{Mission, MissionStatus, MissionStoreRef, ResultStatus, StoreError};
use crate::dispatch::DispatcherRef;
use crate::error::MissionError;
use crate::planner::Step;

pub struct ExecutionEngine {
    store: MissionStoreRef,
    dispatcher: DispatcherRef,
    /// Missions whose claim this process holds
    in_flight: RwLock<HashSet<Uuid>>,
}

/// Key under which a consumed output is handed to the next agent.
pub const INPUT_PARAM: &str = "input";

/// Build the parameter object for a step, injecting the payload named by
/// `input_source` under [`INPUT_PARAM`].
pub fn resolve_params(step: &Step, outputs: &HashMap<String, Value>) -> Result<Value, MissionError> {
    let mut values: Map<String, Value> = step.params.values.clone();
    if let Some(source) = step.params.input_source.as_deref() {
        let payload = outputs.get(source).ok_or_else(|| {
            MissionError::MalformedPlan(format!(
                "step {} reads '{}' which no completed step produced",
                step.step, source
            ))
        })?;
        values.insert(INPUT_PARAM.to_string(), payload.clone());
    }
    Ok(Value::Object(values))
}

fn failure_payload(err: &MissionError) -> Value {
    json!({ "error": err.to_string(), "kind": err.kind() })
}

impl ExecutionEngine {
    pub fn new(store: MissionStoreRef, dispatcher: DispatcherRef) -> Self {
        Self {
            store,
            dispatcher,
            in_flight: RwLock::new(HashSet::new()),
        }
    }

    /// Number of missions this engine has claimed and not yet finished.
    pub async fn running_count(&self) -> usize {
        self.in_flight.read().await.len()
    }

    /// Load a persisted mission and execute it.
    pub async fn run(&self, mission_id: Uuid) -> Result<MissionStatus, MissionError> {
        let mission = self
            .store
            .get_mission(mission_id)
            .await?
            .ok_or(MissionError::NotFound(mission_id))?;
        self.execute(&mission).await
    }

    /// Execute a mission to a terminal state.
    pub async fn execute(&self, mission: &Mission) -> Result<MissionStatus, MissionError> {
        if !self.store.claim_mission(mission.id).await? {
            tracing::info!("Mission {} already claimed, skipping", mission.id);
            return Err(MissionError::AlreadyClaimed(mission.id));
        }
        tracing::info!(
            "Mission {} running plan {} ({} steps)",
            mission.id,
            mission.plan.plan_id,
            mission.plan.steps.len()
        );

        self.in_flight.write().await.insert(mission.id);
        let outcome = self.drive(mission).await;
        self.in_flight.write().await.remove(&mission.id);

        match outcome {
            Ok(status) => Ok(status),
            Err(err) => {
                tracing::error!("Mission {} aborted, store unavailable: {}", mission.id, err);
                let reason = format!("store unavailable: {}", err);
                if let Err(mark_err) = self
                    .store
                    .set_mission_status(mission.id, MissionStatus::Failed, Some(Utc::now()), Some(reason.as_str()))
                    .await
                {
                    tracing::warn!("Could not mark mission {} failed: {}", mission.id, mark_err);
                }
                Err(err.into())
            }
        }
    }

    async fn drive(&self, mission: &Mission) -> Result<MissionStatus, StoreError> {
        let mut steps: Vec<&Step> = mission.plan.steps.iter().collect();
        steps.sort_by_key(|s| s.step);
        let mut outputs: HashMap<String, Value> = HashMap::new();

        for step in steps {
            self.store
                .upsert_result(mission.id, step.step, &step.agent, ResultStatus::Running, None)
                .await?;
            tracing::info!("Mission {} step {} -> {}", mission.id, step.step, step.agent);

            let outcome = match resolve_params(step, &outputs) {
                Ok(params) => self
                    .dispatcher
                    .dispatch(&step.agent, &params, mission.id, step.step)
                    .await
                    .map_err(|failure| failure.into_mission_error(&step.agent)),
                Err(err) => Err(err),
            };

            match outcome {
                Ok(payload) => {
                    self.store
                        .upsert_result(
                            mission.id,
                            step.step,
                            &step.agent,
                            ResultStatus::Completed,
                            Some(&payload),
                        )
                        .await?;
                    outputs.insert(step.output_key.clone(), payload);
                }
                Err(err) => {
                    tracing::warn!(
                        "Mission {} step {} ({}) failed: {}",
                        mission.id,
                        step.step,
                        step.agent,
                        err
                    );
                    self.store
                        .upsert_result(
                            mission.id,
                            step.step,
                            &step.agent,
                            ResultStatus::Failed,
                            Some(&failure_payload(&err)),
                        )
                        .await?;
                    let reason = err.to_string();
                    self.store
                        .set_mission_status(
                            mission.id,
                            MissionStatus::Failed,
                            Some(Utc::now()),
                            Some(reason.as_str()),
                        )
                        .await?;
                    return Ok(MissionStatus::Failed);
                }
            }
        }

        self.store
            .set_mission_status(mission.id, MissionStatus::Completed, Some(Utc::now()), None)
            .await?;
        tracing::info!("Mission {} completed", mission.id);
        Ok(MissionStatus::Completed)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    use crate::dispatch::{AgentDispatcher, DispatchError, DispatchFailure};

    /// How the scripted dispatcher answers one step.
    #[derive(Clone)]
    pub enum Scripted {
        Payload(Value),
        Reported(&'static str),
        Crash,
    }

    /// Dispatcher that answers from a script and records every call.
    #[derive(Default)]
    pub struct ScriptedDispatcher {
        script: Vec<(u32, Scripted)>,
        delay: Option<Duration>,
        pub calls: Mutex<Vec<(String, Value, u32)>>,
    }

    impl ScriptedDispatcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on_step(mut self, step: u32, answer: Scripted) -> Self {
            self.script.push((step, answer));
            self
        }

        /// Hold every dispatch for `delay` before answering.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn calls(&self) -> Vec<(String, Value, u32)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentDispatcher for ScriptedDispatcher {
        fn runtime_name(&self) -> &str {
            "scripted"
        }

        async fn dispatch(
            &self,
            agent: &str,
            params: &Value,
            _mission_id: Uuid,
            step: u32,
        ) -> Result<Value, DispatchFailure> {
            self.calls
                .lock()
                .unwrap()
                .push((agent.to_string(), params.clone(), step));
            match self.delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => tokio::task::yield_now().await,
            }
            let answer = self
                .script
                .iter()
                .find(|(s, _)| *s == step)
                .map(|(_, a)| a.clone())
                .unwrap_or_else(|| Scripted::Payload(json!({ "agent": agent, "step": step })));
            match answer {
                Scripted::Payload(v) => Ok(v),
                Scripted::Reported(msg) => Err(DispatchFailure::AgentReported {
                    message: msg.to_string(),
                }),
                Scripted::Crash => Err(DispatchError::AbnormalExit {
                    agent: agent.to_string(),
                    code: Some(1),
                    stderr_tail: "segfault".to_string(),
                }
                .into()),
            }
        }
    }
}
