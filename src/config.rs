//! Configuration management for the mission orchestrator.
//!
//! Configuration is read from environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `8080`.
//! - `DATA_DIR` - Optional. Directory for the mission database and worker scratch files.
//!   Defaults to `./.mission-orchestrator`.
//! - `MISSION_STORE` - Optional. `sqlite` (default) or `memory`.
//! - `AGENT_RUNTIME` - Optional. `docker` (default), `nspawn` or `host`.
//! - `AGENT_IMAGE_PREFIX` / `AGENT_IMAGE_TAG` - Optional. Docker image naming for agents.
//! - `AGENT_NETWORK` - Optional. Docker network agents join.
//! - `AGENT_ENV_FILE` - Optional. Env file passed to `docker run --env-file`.
//! - `AGENT_ROOTFS` - Optional. Container root for the nspawn runtime.
//! - `AGENT_REGISTRY_PATH` - Optional. YAML file overriding the built-in agent registry.
//! - `DISPATCH_TIMEOUT_SECS` - Optional. Kill a worker after this many seconds. Unset means no limit.
//! - `PROVIDER_ORDER` - Optional. Comma-separated provider cascade. Defaults to `openai,gemini,venice`.
//! - `OPENAI_API_KEY`, `OPENAI_MODEL` - Optional. Primary text-generation provider.
//! - `GEMINI_API_KEY`, `GEMINI_MODEL` - Optional. Secondary provider.
//! - `VENICE_API_KEY`, `VENICE_MODEL`, `VENICE_API_URL` - Optional. Tertiary provider.
//! - `CORS_ALLOWED_ORIGINS` - Optional. Comma-separated origins. Unset means permissive.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::api::mission_store::MissionStoreType;
use crate::dispatch::AgentRuntime;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Credentials and model for one text-generation provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Provider name as used in `PROVIDER_ORDER` ("openai", "gemini", "venice")
    pub name: String,
    pub api_key: String,
    pub model: String,
    /// Endpoint override (only Venice needs one in practice)
    pub base_url: Option<String>,
}

/// Agent dispatch configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub runtime: AgentRuntime,
    pub image_prefix: String,
    pub image_tag: String,
    pub network: Option<String>,
    pub env_file: Option<PathBuf>,
    /// Root filesystem used with `systemd-nspawn -D`
    pub rootfs: Option<PathBuf>,
    pub registry_path: Option<PathBuf>,
    /// No limit when `None`; the engine itself never times out a step.
    pub timeout: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            runtime: AgentRuntime::Docker,
            image_prefix: "mission-agents".to_string(),
            image_tag: "1.0.0".to_string(),
            network: None,
            env_file: None,
            rootfs: None,
            registry_path: None,
            timeout: None,
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Directory holding the mission database and per-step scratch dirs
    pub data_dir: PathBuf,

    /// Mission store backend
    pub store_type: MissionStoreType,

    /// Agent dispatch settings
    pub dispatch: DispatchConfig,

    /// Text-generation providers in cascade order (only those with credentials)
    pub providers: Vec<ProviderConfig>,

    /// Allowed CORS origins; empty means permissive
    pub cors_origins: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparsable ports, timeouts, runtimes,
    /// store types or unknown provider names.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?;

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".mission-orchestrator"));

        let store_type = match std::env::var("MISSION_STORE") {
            Ok(value) => MissionStoreType::parse(&value).ok_or_else(|| {
                ConfigError::InvalidValue("MISSION_STORE".to_string(), value.clone())
            })?,
            Err(_) => MissionStoreType::default(),
        };

        let runtime = match std::env::var("AGENT_RUNTIME") {
            Ok(value) => AgentRuntime::parse(&value).ok_or_else(|| {
                ConfigError::InvalidValue("AGENT_RUNTIME".to_string(), value.clone())
            })?,
            Err(_) => AgentRuntime::Docker,
        };

        let timeout = match std::env::var("DISPATCH_TIMEOUT_SECS") {
            Ok(value) => {
                let secs: u64 = value.parse().map_err(|e| {
                    ConfigError::InvalidValue("DISPATCH_TIMEOUT_SECS".to_string(), format!("{}", e))
                })?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
            Err(_) => None,
        };

        let defaults = DispatchConfig::default();
        let dispatch = DispatchConfig {
            runtime,
            image_prefix: std::env::var("AGENT_IMAGE_PREFIX").unwrap_or(defaults.image_prefix),
            image_tag: std::env::var("AGENT_IMAGE_TAG").unwrap_or(defaults.image_tag),
            network: non_empty_env("AGENT_NETWORK"),
            env_file: non_empty_env("AGENT_ENV_FILE").map(PathBuf::from),
            rootfs: non_empty_env("AGENT_ROOTFS").map(PathBuf::from),
            registry_path: non_empty_env("AGENT_REGISTRY_PATH").map(PathBuf::from),
            timeout,
        };

        if dispatch.runtime == AgentRuntime::Nspawn && dispatch.rootfs.is_none() {
            return Err(ConfigError::MissingEnvVar("AGENT_ROOTFS".to_string()));
        }

        let order = std::env::var("PROVIDER_ORDER")
            .unwrap_or_else(|_| "openai,gemini,venice".to_string());
        let providers = load_providers(&order)?;

        let cors_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .map(|v| split_list(&v))
            .unwrap_or_default();

        Ok(Self {
            host,
            port,
            data_dir,
            store_type,
            dispatch,
            providers,
            cors_origins,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            data_dir,
            store_type: MissionStoreType::Memory,
            dispatch: DispatchConfig {
                runtime: AgentRuntime::Host,
                ..DispatchConfig::default()
            },
            providers: Vec::new(),
            cors_origins: Vec::new(),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Resolve the provider cascade. Providers without an API key are skipped.
fn load_providers(order: &str) -> Result<Vec<ProviderConfig>, ConfigError> {
    let mut providers = Vec::new();
    for name in split_list(order) {
        let name = name.to_lowercase();
        let (key_var, model_var, default_model) = match name.as_str() {
            "openai" => ("OPENAI_API_KEY", "OPENAI_MODEL", "gpt-4o-mini"),
            "gemini" => ("GEMINI_API_KEY", "GEMINI_MODEL", "gemini-2.0-flash"),
            "venice" => ("VENICE_API_KEY", "VENICE_MODEL", "llama-3.3-70b"),
            other => {
                return Err(ConfigError::InvalidValue(
                    "PROVIDER_ORDER".to_string(),
                    format!("unknown provider '{}'", other),
                ))
            }
        };
        let Some(api_key) = non_empty_env(key_var) else {
            tracing::debug!("Provider {} has no {}; skipping", name, key_var);
            continue;
        };
        let base_url = if name == "venice" {
            non_empty_env("VENICE_API_URL")
        } else {
            None
        };
        providers.push(ProviderConfig {
            model: std::env::var(model_var).unwrap_or_else(|_| default_model.to_string()),
            name,
            api_key,
            base_url,
        });
    }
    Ok(providers)
}
