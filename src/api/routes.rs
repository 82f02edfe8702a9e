//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderValue, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::brief::{BriefExtractor, MissionBrief};
use crate::config::Config;
use crate::dispatch::{AgentRegistry, DispatcherRef, ProcessDispatcher};
use crate::engine::{ExecutionEngine, MissionRunner};
use crate::error::MissionError;
use crate::llm::providers_from_config;
use crate::planner::{self, ExecutionPlan};

use super::mission_store::{
    create_mission_store, Mission, MissionStatus, MissionStoreRef, StepResult,
};
use super::types::*;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Mission persistence
    pub store: MissionStoreRef,
    /// Prompt-to-brief extraction (provider cascade with rule fallback)
    pub extractor: BriefExtractor,
    /// Background execution of accepted missions
    pub runner: MissionRunner,
    runtime_name: String,
}

impl AppState {
    /// Wire the engine and runner around an existing store and dispatcher.
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: Config,
        store: MissionStoreRef,
        dispatcher: DispatcherRef,
        extractor: BriefExtractor,
    ) -> Self {
        let runtime_name = dispatcher.runtime_name().to_string();
        let engine = Arc::new(ExecutionEngine::new(store.clone(), dispatcher));
        let runner = MissionRunner::start(engine);
        Self {
            config,
            store,
            extractor,
            runner,
            runtime_name,
        }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Ignoring invalid CORS origin {}: {}", origin, e);
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build the router over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/missions", get(list_missions))
        .route("/missions/parse", post(parse_mission))
        .route("/missions/plan", post(plan_mission))
        .route("/missions/execute", post(execute_mission))
        .route("/missions/:id", get(get_mission))
        .route("/missions/:id/execute", post(execute_existing))
        .route("/missions/:id/results", get(get_results))
        .layer(cors_layer(&state.config.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store = create_mission_store(config.store_type, config.data_dir.clone()).await?;
    tracing::info!(
        "Mission store: {} ({})",
        store.backend_name(),
        if store.is_persistent() { "persistent" } else { "in-memory" }
    );
    let recovered = store.recover_interrupted().await?;
    if recovered.is_empty() {
        tracing::info!("No interrupted missions to recover");
    } else {
        tracing::warn!(
            "Marked {} interrupted missions as failed: {:?}",
            recovered.len(),
            recovered
        );
    }

    let registry = match &config.dispatch.registry_path {
        Some(path) => AgentRegistry::load(path)?,
        None => AgentRegistry::builtin(),
    };
    tracing::info!(
        "Agent runtime {} with {} registered agents",
        config.dispatch.runtime.as_str(),
        registry.names().len()
    );
    let dispatcher: DispatcherRef = Arc::new(ProcessDispatcher::new(
        config.dispatch.clone(),
        registry,
        &config.data_dir,
    ));

    let extractor = BriefExtractor::new(providers_from_config(&config.providers));
    if extractor.provider_names().is_empty() {
        tracing::warn!("No text-generation providers configured; using keyword rules only");
    } else {
        tracing::info!("Provider cascade: {}", extractor.provider_names().join(" -> "));
    }

    let state = Arc::new(AppState::new(config.clone(), store, dispatcher, extractor));
    let app = router(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    // Setup graceful shutdown on SIGTERM/SIGINT
    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal(shutdown_state).await;
        })
        .await?;

    Ok(())
}

/// Wait for a shutdown signal. Missions still running are failed by startup
/// recovery on the next boot.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let running = state.runner.running_count().await;
    if running == 0 {
        tracing::info!("Shutdown signal received, no missions running");
    } else {
        tracing::warn!(
            "Shutdown signal received with {} missions running; they will be failed on restart",
            running
        );
    }
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: state.store.backend_name().to_string(),
        runtime: state.runtime_name.clone(),
        running_missions: state.runner.running_count().await,
    })
}

fn require_prompt(prompt: &str) -> Result<&str, ApiError> {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return Err(ApiError::bad_request("prompt must not be empty"));
    }
    Ok(trimmed)
}

/// Extract a brief without planning or persisting anything.
async fn parse_mission(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ParseRequest>, JsonRejection>,
) -> Result<Json<ParseResponse>, ApiError> {
    let Json(req) = payload?;
    let prompt = require_prompt(&req.prompt)?;
    let extraction = state.extractor.extract(prompt).await;
    Ok(Json(ParseResponse {
        brief: extraction.brief,
        source: extraction.source.to_string(),
    }))
}

/// Plan a brief without persisting or running anything.
async fn plan_mission(
    payload: Result<Json<MissionBrief>, JsonRejection>,
) -> Result<Json<ExecutionPlan>, ApiError> {
    let Json(brief) = payload?;
    let plan = planner::plan(&brief)?;
    Ok(Json(plan))
}

async fn accept(
    state: &AppState,
    prompt: &str,
    brief: &MissionBrief,
    plan: &ExecutionPlan,
) -> Result<(StatusCode, Json<ExecuteResponse>), ApiError> {
    let mission = state.store.create_mission(prompt, brief, plan).await?;
    tracing::info!(
        "Mission {} queued with plan {} ({} steps)",
        mission.id,
        plan.plan_id,
        plan.steps.len()
    );
    if !state.runner.enqueue(mission.id) {
        return Err(ApiError::runner_unavailable(mission.id));
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(ExecuteResponse {
            mission_id: mission.id,
            plan_id: plan.plan_id.clone(),
            message: format!("Mission accepted: {}", plan.summary),
        }),
    ))
}

/// Plan, persist and trigger a mission from a prompt or blueprint.
async fn execute_mission(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ExecuteResponse>), ApiError> {
    let Json(req) = payload?;
    match req {
        ExecuteRequest::Prompt(req) => {
            let prompt = require_prompt(&req.prompt)?;
            let extraction = state.extractor.extract(prompt).await;
            tracing::debug!("Brief for mission prompt came from {}", extraction.source);
            let plan = planner::plan(&extraction.brief)?;
            accept(&state, prompt, &extraction.brief, &plan).await
        }
        ExecuteRequest::Blueprint(req) => {
            let plan = planner::plan_from_blueprint(&req.mission_name, &req.steps)?;
            let brief = planner::blueprint_brief(req.mission_name.trim());
            accept(&state, req.mission_name.trim(), &brief, &plan).await
        }
    }
}

async fn load_mission(state: &AppState, id: Uuid) -> Result<Mission, ApiError> {
    state
        .store
        .get_mission(id)
        .await?
        .ok_or_else(|| MissionError::NotFound(id).into())
}

/// Re-trigger a persisted mission. Only queued missions can run.
async fn execute_existing(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<ExecuteResponse>), ApiError> {
    let mission = load_mission(&state, id).await?;
    if mission.status != MissionStatus::Queued {
        return Err(MissionError::AlreadyClaimed(id).into());
    }
    if !state.runner.enqueue(id) {
        return Err(ApiError::runner_unavailable(id));
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(ExecuteResponse {
            mission_id: id,
            plan_id: mission.plan.plan_id,
            message: "Mission triggered".to_string(),
        }),
    ))
}

async fn get_mission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Mission>, ApiError> {
    load_mission(&state, id).await.map(Json)
}

async fn list_missions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<MissionSummary>>, ApiError> {
    let missions = state.store.list_missions().await?;
    Ok(Json(missions.iter().map(MissionSummary::from).collect()))
}

async fn get_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<StepResult>>, ApiError> {
    load_mission(&state, id).await?;
    let results = state.store.get_results(id).await?;
    Ok(Json(results))
}
