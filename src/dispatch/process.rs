//! Process-backed dispatcher.
//!
//! Every step gets a scratch directory under `<data_dir>/runs/<mission>/`.
//! The worker sees it as `/mission` inside a container (or at its host path
//! for the host runtime) and must write its result document to
//! `MISSION_RESULT_PATH`. Console output is logged but never parsed. The
//! directory is removed when the step ends, whatever the outcome; the store
//! keeps the payload or failure.
//!
//! Container workers are named `mission-<id>-step-<n>` so a timed-out worker
//! can be stopped through its runtime. Killing the local `docker` or
//! `systemd-nspawn` client alone leaves the container running.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use uuid::Uuid;

use super::registry::{AgentRegistry, AgentSpec};
use super::{interpret_result_document, AgentDispatcher, AgentRuntime, DispatchError, DispatchFailure};
use crate::config::DispatchConfig;

const CONTAINER_SCRATCH: &str = "/mission";
const RESULT_FILE: &str = "result.json";
const STDERR_TAIL_LINES: usize = 20;

pub struct ProcessDispatcher {
    config: DispatchConfig,
    registry: AgentRegistry,
    scratch_root: PathBuf,
}

impl ProcessDispatcher {
    pub fn new(config: DispatchConfig, registry: AgentRegistry, data_dir: &Path) -> Self {
        Self {
            config,
            registry,
            scratch_root: data_dir.join("runs"),
        }
    }

    fn image_for(&self, agent: &str, spec: &AgentSpec) -> String {
        spec.image.clone().unwrap_or_else(|| {
            format!(
                "{}/{}:{}",
                self.config.image_prefix, agent, self.config.image_tag
            )
        })
    }

    fn build_env(
        spec: &AgentSpec,
        agent: &str,
        params: &Value,
        mission_id: Uuid,
        step: u32,
        result_path: &str,
    ) -> BTreeMap<String, String> {
        let mut merged = spec.env.clone();
        merged.insert("MISSION_ID".to_string(), mission_id.to_string());
        merged.insert("MISSION_STEP".to_string(), step.to_string());
        merged.insert("MISSION_AGENT".to_string(), agent.to_string());
        merged.insert("MISSION_PARAMS".to_string(), params.to_string());
        merged.insert("MISSION_RESULT_PATH".to_string(), result_path.to_string());
        merged
    }

    /// Arguments for `docker run`, image and command included.
    fn docker_args(
        &self,
        image: &str,
        name: &str,
        spec: &AgentSpec,
        scratch: &Path,
        env: &BTreeMap<String, String>,
    ) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];
        if let Some(network) = &self.config.network {
            args.push(format!("--network={}", network));
        }
        if let Some(env_file) = &self.config.env_file {
            args.push("--env-file".to_string());
            args.push(env_file.display().to_string());
        }
        args.push("-v".to_string());
        args.push(format!("{}:{}", scratch.display(), CONTAINER_SCRATCH));
        for (k, v) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", k, v));
        }
        args.push(image.to_string());
        args.extend(spec.command.iter().cloned());
        args
    }

    /// Arguments for `systemd-nspawn`, program included.
    fn nspawn_args(
        rootfs: &Path,
        machine: &str,
        agent: &str,
        spec: &AgentSpec,
        scratch: &Path,
        env: &BTreeMap<String, String>,
    ) -> Vec<String> {
        let mut args = vec![
            "-D".to_string(),
            rootfs.display().to_string(),
            "--quiet".to_string(),
            "--ephemeral".to_string(),
            format!("--machine={}", machine),
            "--timezone=off".to_string(),
            "--console=pipe".to_string(),
            "--bind-ro=/etc/resolv.conf".to_string(),
            format!("--bind={}:{}", scratch.display(), CONTAINER_SCRATCH),
        ];
        for (k, v) in env {
            if k.trim().is_empty() {
                continue;
            }
            args.push(format!("--setenv={}={}", k, v));
        }
        if spec.command.is_empty() {
            args.push(agent.to_string());
        } else {
            args.extend(spec.command.iter().cloned());
        }
        args
    }

    fn build_command(
        &self,
        agent: &str,
        spec: &AgentSpec,
        params: &Value,
        mission_id: Uuid,
        step: u32,
        scratch: &Path,
    ) -> Result<Command, DispatchError> {
        let name = worker_name(mission_id, step);
        let mut cmd = match self.config.runtime {
            AgentRuntime::Docker => {
                let result_path = format!("{}/{}", CONTAINER_SCRATCH, RESULT_FILE);
                let env = Self::build_env(spec, agent, params, mission_id, step, &result_path);
                let image = self.image_for(agent, spec);
                tracing::debug!(agent = %agent, image = %image, "Dispatching via docker");
                let mut cmd = Command::new("docker");
                cmd.args(self.docker_args(&image, &name, spec, scratch, &env));
                cmd
            }
            AgentRuntime::Nspawn => {
                let rootfs = self.config.rootfs.as_deref().ok_or_else(|| DispatchError::Spawn {
                    agent: agent.to_string(),
                    message: "nspawn runtime has no root filesystem configured".to_string(),
                })?;
                let result_path = format!("{}/{}", CONTAINER_SCRATCH, RESULT_FILE);
                let env = Self::build_env(spec, agent, params, mission_id, step, &result_path);
                tracing::debug!(agent = %agent, rootfs = %rootfs.display(), "Dispatching via systemd-nspawn");
                let mut cmd = Command::new("systemd-nspawn");
                cmd.args(Self::nspawn_args(rootfs, &name, agent, spec, scratch, &env));
                cmd
            }
            AgentRuntime::Host => {
                let result_path = scratch.join(RESULT_FILE);
                let env = Self::build_env(
                    spec,
                    agent,
                    params,
                    mission_id,
                    step,
                    &result_path.to_string_lossy(),
                );
                let (program, args) = match spec.command.split_first() {
                    Some((program, args)) => (program.clone(), args.to_vec()),
                    None => (agent.to_string(), Vec::new()),
                };
                tracing::debug!(agent = %agent, program = %program, "Dispatching on host");
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd.envs(env);
                cmd.current_dir(scratch);
                cmd
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    async fn prepare_scratch(&self, mission_id: Uuid, step: u32, agent: &str) -> Result<PathBuf, DispatchError> {
        let dir = self
            .scratch_root
            .join(mission_id.to_string())
            .join(format!("step-{}-{}", step, sanitize(agent)));
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Remove a step's scratch dir, and the mission dir once it is empty.
    async fn discard_scratch(scratch: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(scratch).await {
            tracing::debug!("Failed to clean scratch dir {}: {}", scratch.display(), e);
        }
        if let Some(mission_dir) = scratch.parent() {
            // fails while other step dirs remain
            let _ = tokio::fs::remove_dir(mission_dir).await;
        }
    }

    /// Runtime command that stops a named worker. None for the host runtime,
    /// where dropping the child kills the worker itself.
    fn stop_args(&self, name: &str) -> Option<(&'static str, Vec<String>)> {
        match self.config.runtime {
            AgentRuntime::Docker => Some(("docker", vec!["kill".to_string(), name.to_string()])),
            AgentRuntime::Nspawn => Some((
                "machinectl",
                vec!["terminate".to_string(), name.to_string()],
            )),
            AgentRuntime::Host => None,
        }
    }

    async fn stop_worker(&self, agent: &str, name: &str) {
        let (program, args) = match self.stop_args(name) {
            Some(stop) => stop,
            None => {
                tracing::warn!(agent = %agent, "Timed-out worker process killed");
                return;
            }
        };
        match Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                tracing::warn!(agent = %agent, worker = %name, "Timed-out worker stopped via {}", program)
            }
            Ok(output) => tracing::error!(
                agent = %agent,
                worker = %name,
                "{} could not stop timed-out worker: {}",
                program,
                stderr_tail(&output.stderr)
            ),
            Err(e) => tracing::error!(
                agent = %agent,
                worker = %name,
                "Failed to run {} for timed-out worker: {}",
                program,
                e
            ),
        }
    }

    async fn run_worker(
        &self,
        agent: &str,
        spec: &AgentSpec,
        params: &Value,
        mission_id: Uuid,
        step: u32,
        scratch: &Path,
    ) -> Result<Value, DispatchFailure> {
        let name = worker_name(mission_id, step);
        let mut cmd = self.build_command(agent, spec, params, mission_id, step, scratch)?;

        let child = cmd.spawn().map_err(|e| DispatchError::Spawn {
            agent: agent.to_string(),
            message: e.to_string(),
        })?;
        let output = match self.config.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output,
                Err(_) => {
                    tracing::warn!(agent = %agent, "Worker exceeded {:?}", limit);
                    self.stop_worker(agent, &name).await;
                    return Err(DispatchError::Timeout {
                        agent: agent.to_string(),
                        after: limit,
                    }
                    .into());
                }
            },
            None => child.wait_with_output().await,
        }
        .map_err(|e| DispatchError::Spawn {
            agent: agent.to_string(),
            message: e.to_string(),
        })?;

        if !output.stdout.is_empty() {
            tracing::debug!(
                agent = %agent,
                "Worker stdout: {}",
                String::from_utf8_lossy(&output.stdout).trim_end()
            );
        }
        if !output.status.success() {
            return Err(DispatchError::AbnormalExit {
                agent: agent.to_string(),
                code: output.status.code(),
                stderr_tail: stderr_tail(&output.stderr),
            }
            .into());
        }

        let document = Self::read_result(agent, &scratch.join(RESULT_FILE)).await?;
        interpret_result_document(document)
    }

    async fn read_result(agent: &str, path: &Path) -> Result<Value, DispatchError> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DispatchError::MissingResult {
                    agent: agent.to_string(),
                })
            }
            Err(e) => return Err(DispatchError::Scratch(e)),
        };
        serde_json::from_slice(&raw).map_err(|e| DispatchError::InvalidResult {
            agent: agent.to_string(),
            message: e.to_string(),
        })
    }
}

/// Container or machine name for one step's worker.
fn worker_name(mission_id: Uuid, step: u32) -> String {
    format!("mission-{}-step-{}", mission_id.simple(), step)
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// Last few lines of a worker's stderr, for error messages.
fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[async_trait]
impl AgentDispatcher for ProcessDispatcher {
    fn runtime_name(&self) -> &str {
        self.config.runtime.as_str()
    }

    async fn dispatch(
        &self,
        agent: &str,
        params: &Value,
        mission_id: Uuid,
        step: u32,
    ) -> Result<Value, DispatchFailure> {
        let spec = self
            .registry
            .get(agent)
            .ok_or_else(|| DispatchError::UnknownAgent(agent.to_string()))?;
        let scratch = self.prepare_scratch(mission_id, step, agent).await?;
        let outcome = self
            .run_worker(agent, spec, params, mission_id, step, &scratch)
            .await;
        Self::discard_scratch(&scratch).await;
        outcome
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn shell_agent(script: &str) -> AgentSpec {
        AgentSpec {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            ..AgentSpec::default()
        }
    }

    fn host_dispatcher(dir: &TempDir, agents: Vec<(&str, AgentSpec)>) -> ProcessDispatcher {
        let mut registry = AgentRegistry::empty();
        for (name, spec) in agents {
            registry.insert(name, spec);
        }
        let config = DispatchConfig {
            runtime: AgentRuntime::Host,
            ..DispatchConfig::default()
        };
        ProcessDispatcher::new(config, registry, dir.path())
    }

    #[tokio::test]
    async fn test_worker_sees_contract_env() {
        let dir = TempDir::new().unwrap();
        let dispatcher = host_dispatcher(
            &dir,
            vec![(
                "echo-params",
                shell_agent(
                    r#"printf '{"params":%s,"step":"%s","agent":"%s"}' "$MISSION_PARAMS" "$MISSION_STEP" "$MISSION_AGENT" > "$MISSION_RESULT_PATH""#,
                ),
            )],
        );
        let params = json!({"location": "California"});
        let payload = dispatcher
            .dispatch("echo-params", &params, Uuid::new_v4(), 2)
            .await
            .unwrap();
        assert_eq!(payload["params"], params);
        assert_eq!(payload["step"], "2");
        assert_eq!(payload["agent"], "echo-params");
    }

    #[tokio::test]
    async fn test_reported_failure_is_distinct_from_dispatch_error() {
        let dir = TempDir::new().unwrap();
        let dispatcher = host_dispatcher(
            &dir,
            vec![(
                "grumpy",
                shell_agent(r#"echo '{"status":"failed","error":"no notices"}' > "$MISSION_RESULT_PATH""#),
            )],
        );
        let err = dispatcher
            .dispatch("grumpy", &json!({}), Uuid::new_v4(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchFailure::AgentReported { ref message } if message == "no notices"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr_tail() {
        let dir = TempDir::new().unwrap();
        let dispatcher = host_dispatcher(&dir, vec![("crash", shell_agent("echo boom >&2; exit 3"))]);
        let err = dispatcher
            .dispatch("crash", &json!({}), Uuid::new_v4(), 1)
            .await
            .unwrap_err();
        match err {
            DispatchFailure::Dispatch(DispatchError::AbnormalExit {
                code, stderr_tail, ..
            }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr_tail, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_and_invalid_result_documents() {
        let dir = TempDir::new().unwrap();
        let dispatcher = host_dispatcher(
            &dir,
            vec![
                ("silent", shell_agent("echo '{\"only\":\"stdout\"}'")),
                ("garbled", shell_agent(r#"echo 'not json' > "$MISSION_RESULT_PATH""#)),
            ],
        );
        let missing = dispatcher
            .dispatch("silent", &json!({}), Uuid::new_v4(), 1)
            .await
            .unwrap_err();
        assert!(matches!(
            missing,
            DispatchFailure::Dispatch(DispatchError::MissingResult { .. })
        ));
        let invalid = dispatcher
            .dispatch("garbled", &json!({}), Uuid::new_v4(), 1)
            .await
            .unwrap_err();
        assert!(matches!(
            invalid,
            DispatchFailure::Dispatch(DispatchError::InvalidResult { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_agent_and_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let dispatcher = host_dispatcher(
            &dir,
            vec![(
                "ghost-binary",
                AgentSpec {
                    command: vec!["/nonexistent/agent-binary".to_string()],
                    ..AgentSpec::default()
                },
            )],
        );
        let unknown = dispatcher
            .dispatch("nobody", &json!({}), Uuid::new_v4(), 1)
            .await
            .unwrap_err();
        assert!(matches!(
            unknown,
            DispatchFailure::Dispatch(DispatchError::UnknownAgent(_))
        ));
        let spawn = dispatcher
            .dispatch("ghost-binary", &json!({}), Uuid::new_v4(), 1)
            .await
            .unwrap_err();
        assert!(matches!(
            spawn,
            DispatchFailure::Dispatch(DispatchError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn test_optional_timeout_kills_worker() {
        let dir = TempDir::new().unwrap();
        let mut registry = AgentRegistry::empty();
        registry.insert("sleepy", shell_agent("sleep 5"));
        let config = DispatchConfig {
            runtime: AgentRuntime::Host,
            timeout: Some(Duration::from_millis(200)),
            ..DispatchConfig::default()
        };
        let dispatcher = ProcessDispatcher::new(config, registry, dir.path());
        let mission_id = Uuid::new_v4();
        let err = dispatcher
            .dispatch("sleepy", &json!({}), mission_id, 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchFailure::Dispatch(DispatchError::Timeout { .. })
        ));
        assert!(!dir.path().join("runs").join(mission_id.to_string()).exists());
    }

    #[test]
    fn test_container_runtimes_stop_workers_by_name() {
        let dir = TempDir::new().unwrap();
        let docker = ProcessDispatcher::new(DispatchConfig::default(), AgentRegistry::empty(), dir.path());
        let (program, args) = docker.stop_args("mission-abc-step-2").unwrap();
        assert_eq!(program, "docker");
        assert_eq!(args, vec!["kill", "mission-abc-step-2"]);

        let nspawn_config = DispatchConfig {
            runtime: AgentRuntime::Nspawn,
            ..DispatchConfig::default()
        };
        let nspawn = ProcessDispatcher::new(nspawn_config, AgentRegistry::empty(), dir.path());
        let (program, args) = nspawn.stop_args("mission-abc-step-2").unwrap();
        assert_eq!(program, "machinectl");
        assert_eq!(args, vec!["terminate", "mission-abc-step-2"]);

        let host = host_dispatcher(&dir, Vec::new());
        assert!(host.stop_args("mission-abc-step-2").is_none());
    }

    #[tokio::test]
    async fn test_scratch_removed_after_failed_and_successful_steps() {
        let dir = TempDir::new().unwrap();
        let dispatcher = host_dispatcher(
            &dir,
            vec![
                ("crash", shell_agent("echo partial > partial.txt; exit 1")),
                ("ok", shell_agent(r#"echo '{"done":true}' > "$MISSION_RESULT_PATH""#)),
            ],
        );
        let mission_id = Uuid::new_v4();
        let mission_dir = dir.path().join("runs").join(mission_id.to_string());

        dispatcher
            .dispatch("ok", &json!({}), mission_id, 1)
            .await
            .unwrap();
        assert!(!mission_dir.join("step-1-ok").exists());

        dispatcher
            .dispatch("crash", &json!({}), mission_id, 2)
            .await
            .unwrap_err();
        assert!(!mission_dir.exists());
    }

    #[test]
    fn test_docker_args_follow_worker_contract() {
        let dir = TempDir::new().unwrap();
        let config = DispatchConfig {
            network: Some("agents_default".to_string()),
            env_file: Some(PathBuf::from(".env")),
            ..DispatchConfig::default()
        };
        let dispatcher = ProcessDispatcher::new(config, AgentRegistry::builtin(), dir.path());
        let spec = AgentSpec::default();
        let image = dispatcher.image_for("scout-warn", &spec);
        assert_eq!(image, "mission-agents/scout-warn:1.0.0");

        let env = ProcessDispatcher::build_env(
            &spec,
            "scout-warn",
            &json!({}),
            Uuid::nil(),
            1,
            "/mission/result.json",
        );
        let name = worker_name(Uuid::nil(), 1);
        let args = dispatcher.docker_args(&image, &name, &spec, Path::new("/tmp/scratch"), &env);
        assert_eq!(
            &args[..5],
            &[
                "run",
                "--rm",
                "--name",
                "mission-00000000000000000000000000000000-step-1",
                "--network=agents_default"
            ]
        );
        assert!(args.contains(&"/tmp/scratch:/mission".to_string()));
        assert!(args.contains(&"MISSION_RESULT_PATH=/mission/result.json".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("mission-agents/scout-warn:1.0.0"));
    }

    #[test]
    fn test_nspawn_args_bind_scratch_and_set_env() {
        let spec = AgentSpec::default();
        let mut env = BTreeMap::new();
        env.insert("MISSION_STEP".to_string(), "1".to_string());
        let args = ProcessDispatcher::nspawn_args(
            Path::new("/var/lib/agents/rootfs"),
            "mission-abc-step-3",
            "lead-scorer",
            &spec,
            Path::new("/tmp/scratch"),
            &env,
        );
        assert_eq!(&args[..2], &["-D", "/var/lib/agents/rootfs"]);
        assert!(args.contains(&"--ephemeral".to_string()));
        assert!(args.contains(&"--machine=mission-abc-step-3".to_string()));
        assert!(args.contains(&"--bind=/tmp/scratch:/mission".to_string()));
        assert!(args.contains(&"--setenv=MISSION_STEP=1".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("lead-scorer"));
    }
}
