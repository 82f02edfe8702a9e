//! HTTP API for the mission orchestrator.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `POST /missions/parse` - Extract a brief from a prompt
//! - `POST /missions/plan` - Preview the plan for a brief; nothing is stored
//! - `POST /missions/execute` - Plan, persist and trigger a mission (prompt or blueprint)
//! - `POST /missions/{id}/execute` - Trigger a persisted queued mission
//! - `GET /missions` - List mission summaries, newest first
//! - `GET /missions/{id}` - Get a full mission
//! - `GET /missions/{id}/results` - Get step results, most recently updated first

pub mod mission_store;
mod routes;
pub mod types;

pub use routes::{router, serve, AppState};
pub use types::*;
