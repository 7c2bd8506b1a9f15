//! Per-agent tool authorization with hot-reloadable policy files.
//!
//! Each agent carries `agents/<id>/tools/tools.json`. The service caches
//! `(path, mtime, parsed)` and stats before every use; a newer mtime reloads
//! the file, so no watcher is needed. Unknown agents are denied by default.

use crate::config::ConfigHandle;
use crate::error::{PolicyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Policy applied when a tool has no explicit override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDefault {
    Allow,
    Deny,
}

/// Web-tool guardrails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct WebGuardrails {
    pub enabled: bool,
    pub fetch_timeout_secs: u64,
    pub max_fetch_bytes: u64,
}

impl Default for WebGuardrails {
    fn default() -> Self {
        Self {
            enabled: false,
            fetch_timeout_secs: 30,
            max_fetch_bytes: 1024 * 1024,
        }
    }
}

/// Numeric/enum caps attached to every tool invocation context.
///
/// Enforcement is by the caller (worker and session engines). Write and exec
/// roots start empty, which denies everything until policy populates them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Guardrails {
    pub max_output_bytes: u64,
    pub exec_timeout_secs: u64,
    pub max_processes: u32,
    pub max_tool_calls_per_minute: u32,
    pub denied_command_prefixes: Vec<String>,
    pub allowed_write_roots: Vec<PathBuf>,
    pub allowed_exec_roots: Vec<PathBuf>,
    pub web: WebGuardrails,
}

impl Default for Guardrails {
    fn default() -> Self {
        Self {
            max_output_bytes: 256 * 1024,
            exec_timeout_secs: 60,
            max_processes: 4,
            max_tool_calls_per_minute: 60,
            denied_command_prefixes: Vec::new(),
            allowed_write_roots: Vec::new(),
            allowed_exec_roots: Vec::new(),
            web: WebGuardrails::default(),
        }
    }
}

/// One agent's tool policy, as stored in `tools/tools.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentToolsPolicy {
    pub version: u64,
    pub default_policy: PolicyDefault,
    /// Per-tool overrides; checked before the default.
    #[serde(default)]
    pub tools: BTreeMap<String, bool>,
    #[serde(default)]
    pub guardrails: Guardrails,
}

impl AgentToolsPolicy {
    /// Scaffold policy written when an agent is created: everything allowed,
    /// conservative guardrails.
    pub fn scaffold() -> Self {
        Self {
            version: 1,
            default_policy: PolicyDefault::Allow,
            tools: BTreeMap::new(),
            guardrails: Guardrails::default(),
        }
    }
}

/// Authorization verdict plus the guardrails for the invocation context.
#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub guardrails: Arc<Guardrails>,
}

struct CachedPolicy {
    path: PathBuf,
    mtime: SystemTime,
    policy: Arc<AgentToolsPolicy>,
}

/// Stat-before-use policy cache.
pub struct PolicyService {
    config: Arc<ConfigHandle>,
    cache: std::sync::Mutex<HashMap<String, CachedPolicy>>,
}

impl PolicyService {
    pub fn new(config: Arc<ConfigHandle>) -> Self {
        Self {
            config,
            cache: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Policy file path for an agent.
    pub fn policy_path(&self, agent_id: &str) -> PathBuf {
        self.config
            .load()
            .agent_dir(agent_id)
            .join("tools")
            .join("tools.json")
    }

    fn load_policy(&self, agent_id: &str) -> Result<Option<Arc<AgentToolsPolicy>>> {
        let path = self.policy_path(agent_id);
        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                let mut cache = self
                    .cache
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                cache.remove(agent_id);
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        };
        let mtime = metadata.modified()?;

        {
            let cache = self
                .cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(cached) = cache.get(agent_id)
                && cached.path == path
                && cached.mtime == mtime
            {
                return Ok(Some(cached.policy.clone()));
            }
        }

        let raw = std::fs::read_to_string(&path)?;
        let policy: AgentToolsPolicy = serde_json::from_str(&raw).map_err(|error| {
            PolicyError::Other(anyhow::anyhow!(
                "invalid tools.json for agent {agent_id}: {error}"
            ))
        })?;
        let policy = Arc::new(policy);

        tracing::debug!(agent_id, path = %path.display(), "tool policy (re)loaded");

        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.insert(
            agent_id.to_string(),
            CachedPolicy {
                path,
                mtime,
                policy: policy.clone(),
            },
        );
        Ok(Some(policy))
    }

    /// Authorize `tool_id` for `agent_id`.
    ///
    /// Order: explicit per-tool override, then the default policy. A missing
    /// policy file is `policy_missing` and denies. Tools outside the catalog
    /// are `tool_unknown`.
    pub fn authorize(&self, agent_id: &str, tool_id: &str) -> Result<Decision> {
        if !super::catalog::is_known(tool_id) {
            return Ok(Decision {
                allowed: false,
                reason: Some("tool_unknown".to_string()),
                guardrails: Arc::new(Guardrails::default()),
            });
        }

        let Some(policy) = self.load_policy(agent_id)? else {
            return Ok(Decision {
                allowed: false,
                reason: Some("policy_missing".to_string()),
                guardrails: Arc::new(Guardrails::default()),
            });
        };

        let guardrails = Arc::new(policy.guardrails.clone());
        let allowed = match policy.tools.get(tool_id) {
            Some(explicit) => *explicit,
            None => policy.default_policy == PolicyDefault::Allow,
        };

        Ok(Decision {
            allowed,
            reason: (!allowed).then(|| "tool_forbidden".to_string()),
            guardrails,
        })
    }

    /// Authorize and convert a denial into the matching typed error.
    pub fn require(&self, agent_id: &str, tool_id: &str) -> Result<Arc<Guardrails>> {
        let decision = self.authorize(agent_id, tool_id)?;
        if decision.allowed {
            return Ok(decision.guardrails);
        }
        let error = match decision.reason.as_deref() {
            Some("tool_unknown") => PolicyError::ToolUnknown {
                tool_id: tool_id.to_string(),
            },
            Some("policy_missing") => PolicyError::PolicyMissing {
                agent_id: agent_id.to_string(),
            },
            _ => PolicyError::ToolForbidden {
                tool_id: tool_id.to_string(),
            },
        };
        Err(error.into())
    }

    /// The agent's guardrails regardless of any single tool verdict.
    /// Falls back to defaults when the policy file is absent.
    pub fn guardrails(&self, agent_id: &str) -> Arc<Guardrails> {
        match self.load_policy(agent_id) {
            Ok(Some(policy)) => Arc::new(policy.guardrails.clone()),
            _ => Arc::new(Guardrails::default()),
        }
    }

    /// Write a policy file (used by agent scaffolding).
    pub fn write_policy(&self, agent_id: &str, policy: &AgentToolsPolicy) -> Result<()> {
        let path = self.policy_path(agent_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(policy)
            .map_err(|error| PolicyError::Other(anyhow::anyhow!("serialize policy: {error}")))?;
        std::fs::write(&path, raw)?;
        Ok(())
    }
}

/// Check a command line against denied prefixes.
pub fn check_command_prefix(command: &str, guardrails: &Guardrails) -> Result<()> {
    let trimmed = command.trim_start();
    for prefix in &guardrails.denied_command_prefixes {
        if trimmed.starts_with(prefix.as_str()) {
            return Err(PolicyError::DeniedCommandPrefix {
                prefix: prefix.clone(),
            }
            .into());
        }
    }
    Ok(())
}

/// Check that `path` is inside one of `roots`. Empty roots deny everything.
pub fn check_path_in_roots(path: &Path, roots: &[PathBuf]) -> Result<()> {
    let inside = roots.iter().any(|root| path.starts_with(root));
    if inside {
        Ok(())
    } else {
        Err(PolicyError::PathOutsideAllowedRoots {
            path: path.display().to_string(),
        }
        .into())
    }
}
