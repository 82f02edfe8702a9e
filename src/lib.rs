//! # Mission Orchestrator
//!
//! Turns free-text prospecting requests into executed multi-agent missions.
//!
//! This library provides:
//! - Brief extraction from prompts (LLM provider cascade with a keyword fallback)
//! - A deterministic planner mapping briefs to ordered agent steps
//! - Durable mission and step-result storage
//! - A sequential execution engine that dispatches each step to a worker
//! - An HTTP API to parse, execute and inspect missions
//!
//! ## Architecture
//!
//! ```text
//!   prompt ──▶ BriefExtractor ──▶ planner ──▶ MissionStore (queued)
//!                                                  │
//!                                         MissionRunner (tokio task)
//!                                                  │
//!                                                  ▼
//!                                   ExecutionEngine ──▶ AgentDispatcher
//!                                                  │         (docker / nspawn / host)
//!                                                  ▼
//!                                   MissionStore (results, terminal status)
//! ```
//!
//! ## Modules
//! - `brief`: Brief types and extraction
//! - `llm`: Text-generation provider clients
//! - `planner`: Execution plans
//! - `engine`: Mission execution and the background runner
//! - `dispatch`: Agent registry and worker process launching
//! - `api`: HTTP routes and the mission store

pub mod api;
pub mod brief;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod llm;
pub mod planner;

pub use config::Config;
pub use error::MissionError;
