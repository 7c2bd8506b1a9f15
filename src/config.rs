//! Runtime configuration: JSON file loading, defaults, and the hot-swappable
//! snapshot every subsystem reads through [`ConfigHandle`].
//!
//! The process takes `--config <path>`; without it the loader tries
//! `<workspaceRoot>/slopoverlord.json` and then the legacy
//! `slopoverlord.config.json` in the current directory. A missing file yields
//! defaults (in-memory friendly, no provider).

use crate::error::{ConfigError, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Legacy config filename probed in the current directory.
pub const LEGACY_CONFIG_FILENAME: &str = "slopoverlord.config.json";

/// Default config filename under the workspace root.
pub const CONFIG_FILENAME: &str = "slopoverlord.json";

/// Persistence backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Resolved relative to the workspace root unless absolute.
    pub sqlite_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            sqlite_path: PathBuf::from("slopoverlord.db"),
        }
    }
}

/// Channel context budget used for utilization estimation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelConfig {
    /// Token budget a channel's visible history is measured against.
    pub context_window_tokens: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            context_window_tokens: 32_768,
        }
    }
}

/// Compaction thresholds; utilization is in `[0, 1]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompactionConfig {
    pub soft_threshold: f64,
    pub aggressive_threshold: f64,
    pub emergency_threshold: f64,
    /// Soft compaction removes the oldest run until utilization is below this.
    pub target_utilization: f64,
    /// Quarantined channels reopen once utilization drops below this.
    pub quarantine_release: f64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            soft_threshold: 0.80,
            aggressive_threshold: 0.85,
            emergency_threshold: 0.95,
            target_utilization: 0.70,
            quarantine_release: 0.60,
        }
    }
}

/// Route decider tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoutingConfig {
    /// Default per-decision token budget; doubled for worker spawns.
    pub token_budget: u32,
    /// Messages at or below this length count as "short".
    pub short_message_max_chars: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            token_budget: 1200,
            short_message_max_chars: 240,
        }
    }
}

/// Model provider selection. `models` empty means unconfigured: channels fall
/// back to the inline acknowledgement and branches/workers run mechanical
/// paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub base_url: Option<String>,
    /// Taken from the environment (`OPENAI_API_KEY`) when unset.
    pub api_key: Option<String>,
    pub models: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Openai,
            base_url: None,
            api_key: None,
            models: Vec::new(),
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Openai,
    Ollama,
}

/// Agent session engine tunables.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Attachments above this size are stored without inline content.
    pub attachment_inline_cap_bytes: u64,
    /// Bounded per-subscriber stream queue depth.
    pub stream_queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            attachment_inline_cap_bytes: 2 * 1024 * 1024,
            stream_queue_depth: 256,
        }
    }
}

/// Visor loop cadence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VisorConfig {
    pub ready_poll_interval_ms: u64,
}

impl Default for VisorConfig {
    fn default() -> Self {
        Self {
            ready_poll_interval_ms: 500,
        }
    }
}

/// The whole runtime configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub workspace_root: PathBuf,
    pub bind: SocketAddr,
    /// Agent identity channels run under when no task claim overrides it.
    pub default_agent_id: String,
    pub storage: StorageConfig,
    pub channel: ChannelConfig,
    pub compaction: CompactionConfig,
    pub routing: RoutingConfig,
    pub provider: ProviderConfig,
    pub session: SessionConfig,
    pub visor: VisorConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            bind: "127.0.0.1:8818".parse().expect("static addr parses"),
            default_agent_id: "overlord".to_string(),
            storage: StorageConfig::default(),
            channel: ChannelConfig::default(),
            compaction: CompactionConfig::default(),
            routing: RoutingConfig::default(),
            provider: ProviderConfig::default(),
            session: SessionConfig::default(),
            visor: VisorConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// The SQLite file path, resolved against the workspace root.
    pub fn sqlite_path(&self) -> PathBuf {
        if self.storage.sqlite_path.is_absolute() {
            self.storage.sqlite_path.clone()
        } else {
            self.workspace_root.join(&self.storage.sqlite_path)
        }
    }

    /// Per-agent scaffold directory.
    pub fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.workspace_root.join("agents").join(agent_id)
    }

    /// Per-project directory (artifacts/, logs/).
    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.workspace_root.join("projects").join(project_id)
    }
}

/// Default workspace root: the platform data dir, falling back to `./workspace`.
pub fn default_workspace_root() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("slopoverlord"))
        .unwrap_or_else(|| PathBuf::from("./workspace"))
}

/// Hot-swappable configuration shared across the runtime.
pub struct ConfigHandle {
    inner: ArcSwap<RuntimeConfig>,
}

impl ConfigHandle {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: ArcSwap::from_pointee(config),
        })
    }

    /// The current snapshot. Cheap; callers must not cache across awaits when
    /// they care about hot reloads.
    pub fn load(&self) -> Arc<RuntimeConfig> {
        self.inner.load_full()
    }

    /// Atomically replace the snapshot.
    pub fn store(&self, config: RuntimeConfig) {
        self.inner.store(Arc::new(config));
    }
}

/// Resolve the config file path from the CLI flag and the documented probe
/// order. Returns `None` when no file exists (defaults apply).
pub fn resolve_config_path(cli: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli {
        return Some(path.to_path_buf());
    }
    let workspace_default = default_workspace_root().join(CONFIG_FILENAME);
    if workspace_default.is_file() {
        return Some(workspace_default);
    }
    let legacy = PathBuf::from(LEGACY_CONFIG_FILENAME);
    if legacy.is_file() {
        return Some(legacy);
    }
    None
}

/// Load configuration from `path`, or defaults when `path` is `None`.
pub fn load(path: Option<&Path>) -> Result<RuntimeConfig> {
    let Some(path) = path else {
        return Ok(RuntimeConfig::default());
    };

    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
        path: path.display().to_string(),
        source: Arc::new(source),
    })?;

    let config: RuntimeConfig = serde_json::from_str(&raw)
        .map_err(|error| ConfigError::Invalid(format!("{}: {error}", path.display())))?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &RuntimeConfig) -> Result<()> {
    let c = &config.compaction;
    if !(c.soft_threshold < c.aggressive_threshold
        && c.aggressive_threshold < c.emergency_threshold)
    {
        return Err(ConfigError::Invalid(
            "compaction thresholds must be strictly increasing".to_string(),
        )
        .into());
    }
    if config.routing.token_budget == 0 {
        return Err(ConfigError::Invalid("routing.tokenBudget must be positive".to_string()).into());
    }
    if config.default_agent_id.is_empty() {
        return Err(ConfigError::Invalid("defaultAgentId must not be empty".to_string()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();
        assert_eq!(config.routing.token_budget, 1200);
        assert_eq!(config.compaction.soft_threshold, 0.80);
        assert_eq!(config.compaction.quarantine_release, 0.60);
        assert!(config.provider.models.is_empty());
    }

    #[test]
    fn loads_partial_json_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("slopoverlord.json");
        std::fs::write(
            &path,
            indoc! {r#"
                {
                  "defaultAgentId": "captain",
                  "provider": { "kind": "ollama", "models": ["llama3"] }
                }
            "#},
        )
        .expect("write config");

        let config = load(Some(&path)).expect("config should load");
        assert_eq!(config.default_agent_id, "captain");
        assert_eq!(config.provider.kind, ProviderKind::Ollama);
        assert_eq!(config.provider.models, vec!["llama3".to_string()]);
        // Untouched sections keep their defaults.
        assert_eq!(config.session.stream_queue_depth, 256);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config = RuntimeConfig::default();
        config.compaction.soft_threshold = 0.9;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn sqlite_path_resolves_relative_to_workspace() {
        let mut config = RuntimeConfig::default();
        config.workspace_root = PathBuf::from("/srv/overlord");
        assert_eq!(
            config.sqlite_path(),
            PathBuf::from("/srv/overlord/slopoverlord.db")
        );
        config.storage.sqlite_path = PathBuf::from("/var/db/events.db");
        assert_eq!(config.sqlite_path(), PathBuf::from("/var/db/events.db"));
    }
}
