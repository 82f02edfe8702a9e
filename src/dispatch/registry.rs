//! Agent registry: which workers exist and how to launch them.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;

/// Agents every deployment knows about.
pub const BUILTIN_AGENTS: &[&str] = &[
    "scout-warn",
    "marketer-agent",
    "google-search",
    "scout-selenium-py",
    "lead-scorer",
    "campaign-crafter",
    "scout-salesnav",
    "marketer-enrich",
];

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to read agent registry {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid agent registry {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}

/// Launch description for one agent.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AgentSpec {
    /// Container image; derived from the image prefix and tag when unset
    #[serde(default)]
    pub image: Option<String>,
    /// Command to run. Empty means the image entrypoint (docker) or a program
    /// named after the agent (nspawn, host).
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    agents: HashMap<String, AgentSpec>,
}

#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentSpec>,
}

impl AgentRegistry {
    /// Registry holding the built-in agents with default launch settings.
    pub fn builtin() -> Self {
        let agents = BUILTIN_AGENTS
            .iter()
            .map(|name| (name.to_string(), AgentSpec::default()))
            .collect();
        Self { agents }
    }

    pub fn empty() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    /// Built-in agents overlaid with entries from a YAML file of the form
    /// `agents: { <name>: { image, command, env } }`.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let raw = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut registry = Self::builtin();
        registry.merge_yaml(&raw).map_err(|source| RegistryError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(registry)
    }

    fn merge_yaml(&mut self, raw: &str) -> Result<(), serde_yaml::Error> {
        let file: RegistryFile = serde_yaml::from_str(raw)?;
        for (name, spec) in file.agents {
            tracing::debug!("Agent registry entry for {}", name);
            self.agents.insert(name, spec);
        }
        Ok(())
    }

    pub fn insert(&mut self, name: impl Into<String>, spec: AgentSpec) {
        self.agents.insert(name.into(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&AgentSpec> {
        self.agents.get(name)
    }

    /// Registered agent names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builtin_covers_every_plan_agent() {
        let registry = AgentRegistry::builtin();
        assert_eq!(registry.names().len(), 8);
        assert!(registry.get("scout-warn").is_some());
        assert!(registry.get("campaign-crafter").is_some());
        assert!(registry.get("ghost").is_none());
    }

    #[test]
    fn test_yaml_overrides_and_extends_builtin() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"agents:
  scout-warn:
    image: registry.local/scout-warn:2.1.0
    env:
      WARN_STATES: CA,NY
  csv-export:
    command: ["python3", "/opt/agents/csv_export.py"]
"#
        )
        .unwrap();

        let registry = AgentRegistry::load(file.path()).unwrap();
        let scout = registry.get("scout-warn").unwrap();
        assert_eq!(scout.image.as_deref(), Some("registry.local/scout-warn:2.1.0"));
        assert_eq!(scout.env.get("WARN_STATES").map(String::as_str), Some("CA,NY"));
        assert_eq!(
            registry.get("csv-export").unwrap().command,
            vec!["python3", "/opt/agents/csv_export.py"]
        );
        assert!(registry.get("lead-scorer").is_some());
    }

    #[test]
    fn test_invalid_yaml_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "agents: [not, a, map]").unwrap();
        assert!(matches!(
            AgentRegistry::load(file.path()),
            Err(RegistryError::Parse { .. })
        ));
    }
}
