//! On-disk agent scaffold:
//! `agents/<id>/{Agents.md, User.md, Soul.md, Identity.md, Identity.id,
//! config.json, agent.json, sessions/, tools/tools.json}`.

use super::Agent;
use crate::error::Result;
use crate::tools::AgentToolsPolicy;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The markdown bundle bootstrapped into every session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaffoldBundle {
    pub agents_md: String,
    pub user_md: String,
    pub identity_md: String,
    pub soul_md: String,
}

impl ScaffoldBundle {
    /// Render the labeled bootstrap sections for the session's first system
    /// message.
    pub fn bootstrap_content(&self) -> String {
        format!(
            "[agent_session_context_bootstrap_v1]\n\
             ## Agents.md\n{}\n\n\
             ## User.md\n{}\n\n\
             ## Identity.md\n{}\n\n\
             ## Soul.md\n{}\n",
            self.agents_md, self.user_md, self.identity_md, self.soul_md
        )
    }
}

/// `config.json`: selected model plus the markdown bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfigFile {
    #[serde(default)]
    pub selected_model: Option<String>,
    #[serde(default)]
    pub markdown: ScaffoldBundle,
}

async fn write(path: &Path, contents: &str) -> Result<()> {
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

async fn read_or_default(path: &Path) -> String {
    tokio::fs::read_to_string(path).await.unwrap_or_default()
}

/// Create the agent's directory layout with starter documents.
pub async fn scaffold(dir: &Path, agent: &Agent) -> Result<()> {
    tokio::fs::create_dir_all(dir.join("sessions"))
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    tokio::fs::create_dir_all(dir.join("tools"))
        .await
        .with_context(|| format!("failed to create {}/tools", dir.display()))?;

    write(
        &dir.join("Agents.md"),
        &format!(
            "# {}\n\nRole: {}\n\nOperating notes for this agent live here.\n",
            agent.display_name, agent.role
        ),
    )
    .await?;
    write(
        &dir.join("User.md"),
        "# User\n\nWhat this agent knows about its operator.\n",
    )
    .await?;
    write(
        &dir.join("Identity.md"),
        &format!("# Identity\n\nI am {}, {}.\n", agent.display_name, agent.role),
    )
    .await?;
    write(&dir.join("Soul.md"), "# Soul\n\nVoice and disposition.\n").await?;
    write(&dir.join("Identity.id"), &uuid::Uuid::new_v4().to_string()).await?;

    write(
        &dir.join("agent.json"),
        &serde_json::to_string_pretty(agent).context("serialize agent.json")?,
    )
    .await?;
    write(
        &dir.join("config.json"),
        &serde_json::to_string_pretty(&AgentConfigFile::default())
            .context("serialize config.json")?,
    )
    .await?;
    write(
        &dir.join("tools").join("tools.json"),
        &serde_json::to_string_pretty(&AgentToolsPolicy::scaffold())
            .context("serialize tools.json")?,
    )
    .await?;

    Ok(())
}

/// Load the markdown bundle; missing files read as empty sections.
pub async fn read_bundle(dir: &Path) -> Result<ScaffoldBundle> {
    Ok(ScaffoldBundle {
        agents_md: read_or_default(&dir.join("Agents.md")).await,
        user_md: read_or_default(&dir.join("User.md")).await,
        identity_md: read_or_default(&dir.join("Identity.md")).await,
        soul_md: read_or_default(&dir.join("Soul.md")).await,
    })
}

/// Load `config.json`, with the bundle refreshed from the markdown files.
pub async fn read_config(dir: &Path) -> Result<AgentConfigFile> {
    let raw = read_or_default(&dir.join("config.json")).await;
    let mut config: AgentConfigFile = if raw.is_empty() {
        AgentConfigFile::default()
    } else {
        serde_json::from_str(&raw).unwrap_or_default()
    };
    config.markdown = read_bundle(dir).await?;
    Ok(config)
}

/// Persist `config.json` and spread the bundle back to the markdown files.
pub async fn write_config(dir: &Path, config: &AgentConfigFile) -> Result<()> {
    write(
        &dir.join("config.json"),
        &serde_json::to_string_pretty(config).context("serialize config.json")?,
    )
    .await?;
    write(&dir.join("Agents.md"), &config.markdown.agents_md).await?;
    write(&dir.join("User.md"), &config.markdown.user_md).await?;
    write(&dir.join("Identity.md"), &config.markdown.identity_md).await?;
    write(&dir.join("Soul.md"), &config.markdown.soul_md).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_content_carries_the_tag_and_sections() {
        let bundle = ScaffoldBundle {
            agents_md: "agents".into(),
            user_md: "user".into(),
            identity_md: "identity".into(),
            soul_md: "soul".into(),
        };
        let content = bundle.bootstrap_content();
        assert!(content.starts_with("[agent_session_context_bootstrap_v1]"));
        for section in ["## Agents.md", "## User.md", "## Identity.md", "## Soul.md"] {
            assert!(content.contains(section), "missing {section}");
        }
    }
}
