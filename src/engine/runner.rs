//! Task runner: fire-and-forget mission execution.
//!
//! Triggers push a mission id onto a channel; a single loop spawns one tokio
//! task per id. Completion is observable only through the store.

use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::ExecutionEngine;
use crate::error::MissionError;

#[derive(Clone)]
pub struct MissionRunner {
    tx: mpsc::UnboundedSender<Uuid>,
    engine: Arc<ExecutionEngine>,
}

impl MissionRunner {
    /// Start the runner loop. Must be called from within a tokio runtime.
    pub fn start(engine: Arc<ExecutionEngine>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Uuid>();
        tokio::spawn(runner_loop(engine.clone(), rx));
        Self { tx, engine }
    }

    /// Runner whose loop has already exited; every enqueue fails.
    #[cfg(test)]
    pub(crate) fn stopped(engine: Arc<ExecutionEngine>) -> Self {
        let (tx, _) = mpsc::unbounded_channel::<Uuid>();
        Self { tx, engine }
    }

    /// Queue a mission for execution. Returns false if the runner loop is gone.
    pub fn enqueue(&self, mission_id: Uuid) -> bool {
        match self.tx.send(mission_id) {
            Ok(()) => true,
            Err(_) => {
                tracing::error!("Mission runner stopped; dropping mission {}", mission_id);
                false
            }
        }
    }

    /// Number of runs currently in flight in this process. Duplicate triggers
    /// that lose the claim are not counted.
    pub async fn running_count(&self) -> usize {
        self.engine.running_count().await
    }
}

async fn runner_loop(engine: Arc<ExecutionEngine>, mut rx: mpsc::UnboundedReceiver<Uuid>) {
    while let Some(mission_id) = rx.recv().await {
        let engine = engine.clone();
        tokio::spawn(async move {
            match engine.run(mission_id).await {
                Ok(status) => {
                    tracing::info!("Mission {} finished: {}", mission_id, status)
                }
                Err(MissionError::AlreadyClaimed(_)) => {
                    tracing::debug!("Mission {} trigger ignored, already claimed", mission_id)
                }
                Err(e) => tracing::error!("Mission {} run failed: {}", mission_id, e),
            }
        });
    }
    tracing::debug!("Mission runner channel closed");
}
