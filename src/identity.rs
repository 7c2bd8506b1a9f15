//! Agent identities: the registry aggregate plus the on-disk scaffold each
//! agent carries.

pub mod files;

pub use files::{AgentConfigFile, ScaffoldBundle};

use crate::error::{Result, SessionError};
use crate::persist::{AggregateKind, Backend};
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// A registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    /// Kebab-case, unique.
    pub id: String,
    pub display_name: String,
    pub role: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn is_kebab_case(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('-')
        && !id.ends_with('-')
        && !id.contains("--")
        && id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Registry over the `agents` aggregate plus scaffold management.
pub struct AgentStore {
    backend: Arc<dyn Backend>,
    workspace_root: PathBuf,
}

impl AgentStore {
    pub fn new(backend: Arc<dyn Backend>, workspace_root: PathBuf) -> Self {
        Self {
            backend,
            workspace_root,
        }
    }

    pub fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.workspace_root.join("agents").join(agent_id)
    }

    /// Create an agent and write its scaffold. Duplicate ids are rejected.
    pub async fn create(&self, id: &str, display_name: &str, role: &str) -> Result<Agent> {
        if !is_kebab_case(id) {
            return Err(SessionError::Invalid(format!(
                "agent id must be kebab-case: {id}"
            ))
            .into());
        }
        if self
            .backend
            .get_aggregate(AggregateKind::Agents, id)
            .await?
            .is_some()
        {
            return Err(SessionError::AgentExists { id: id.to_string() }.into());
        }

        let now = Utc::now();
        let agent = Agent {
            id: id.to_string(),
            display_name: display_name.to_string(),
            role: role.to_string(),
            version: 1,
            created_at: now,
            updated_at: now,
        };

        files::scaffold(&self.agent_dir(id), &agent).await?;
        self.backend
            .put_aggregate(
                AggregateKind::Agents,
                id,
                serde_json::to_value(&agent).context("serialize agent")?,
            )
            .await?;

        tracing::info!(agent_id = id, "agent created");
        Ok(agent)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Agent>> {
        let Some(body) = self.backend.get_aggregate(AggregateKind::Agents, id).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_value(body).ok())
    }

    /// The agent, or `not_found`.
    pub async fn require(&self, id: &str) -> Result<Agent> {
        self.get(id)
            .await?
            .ok_or_else(|| SessionError::AgentNotFound { id: id.to_string() }.into())
    }

    pub async fn list(&self) -> Result<Vec<Agent>> {
        let rows = self.backend.list_aggregates(AggregateKind::Agents).await?;
        Ok(rows
            .into_iter()
            .filter_map(|(_, body)| serde_json::from_value(body).ok())
            .collect())
    }

    /// Agent config: selected model + markdown bundle.
    pub async fn read_config(&self, id: &str) -> Result<AgentConfigFile> {
        self.require(id).await?;
        files::read_config(&self.agent_dir(id)).await
    }

    pub async fn write_config(&self, id: &str, config: &AgentConfigFile) -> Result<()> {
        let mut agent = self.require(id).await?;
        files::write_config(&self.agent_dir(id), config).await?;
        agent.version += 1;
        agent.updated_at = Utc::now();
        self.backend
            .put_aggregate(
                AggregateKind::Agents,
                id,
                serde_json::to_value(&agent).context("serialize agent")?,
            )
            .await?;
        Ok(())
    }

    /// The scaffold docs used to bootstrap sessions.
    pub async fn read_bundle(&self, id: &str) -> Result<ScaffoldBundle> {
        files::read_bundle(&self.agent_dir(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};
    use crate::persist::MemoryBackend;

    fn store(dir: &std::path::Path) -> AgentStore {
        AgentStore::new(MemoryBackend::new(), dir.to_path_buf())
    }

    #[test]
    fn kebab_case_validation() {
        assert!(is_kebab_case("overlord"));
        assert!(is_kebab_case("scribe-2"));
        assert!(!is_kebab_case("Overlord"));
        assert!(!is_kebab_case("-lead"));
        assert!(!is_kebab_case("a--b"));
        assert!(!is_kebab_case(""));
    }

    #[tokio::test]
    async fn create_scaffolds_and_rejects_duplicates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());

        let agent = store
            .create("overlord", "Overlord", "orchestrator")
            .await
            .expect("create");
        assert_eq!(agent.version, 1);

        for name in ["Agents.md", "User.md", "Identity.md", "Soul.md", "Identity.id"] {
            assert!(
                dir.path().join("agents/overlord").join(name).is_file(),
                "{name} should be scaffolded"
            );
        }
        assert!(dir
            .path()
            .join("agents/overlord/tools/tools.json")
            .is_file());

        let error = store
            .create("overlord", "Overlord", "orchestrator")
            .await
            .expect_err("duplicate id");
        assert!(matches!(error, Error::Session(SessionError::AgentExists { .. })));
        assert_eq!(error.kind(), ErrorKind::Duplicate);
    }

    #[tokio::test]
    async fn config_round_trip_bumps_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        store
            .create("overlord", "Overlord", "orchestrator")
            .await
            .expect("create");

        let mut config = store.read_config("overlord").await.expect("read config");
        assert!(config.selected_model.is_none());

        config.selected_model = Some("gpt-4o-mini".to_string());
        config.markdown.soul_md = "Be kind.".to_string();
        store
            .write_config("overlord", &config)
            .await
            .expect("write config");

        let reread = store.read_config("overlord").await.expect("reread");
        assert_eq!(reread.selected_model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(reread.markdown.soul_md, "Be kind.");

        let agent = store.require("overlord").await.expect("agent");
        assert_eq!(agent.version, 2);
    }
}
