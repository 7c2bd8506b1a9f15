//! Types for the actor graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a node on the board represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Agent,
    Human,
    Action,
}

/// Direction policy for a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkDirection {
    /// Source may reach target, but not vice versa.
    OneWay,
    /// Both endpoints may reach each other through this link.
    TwoWay,
}

impl LinkDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkDirection::OneWay => "one_way",
            LinkDirection::TwoWay => "two_way",
        }
    }
}

impl std::fmt::Display for LinkDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LinkDirection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "one_way" => Ok(LinkDirection::OneWay),
            "two_way" => Ok(LinkDirection::TwoWay),
            other => Err(format!(
                "invalid link direction: '{other}', expected 'one_way' or 'two_way'"
            )),
        }
    }
}

/// What kind of traffic a link permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationType {
    Chat,
    Task,
    Event,
}

impl CommunicationType {
    pub fn as_str(self) -> &'static str {
        match self {
            CommunicationType::Chat => "chat",
            CommunicationType::Task => "task",
            CommunicationType::Event => "event",
        }
    }
}

impl std::fmt::Display for CommunicationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CommunicationType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "chat" => Ok(CommunicationType::Chat),
            "task" => Ok(CommunicationType::Task),
            "event" => Ok(CommunicationType::Event),
            other => Err(format!(
                "invalid communication type: '{other}', expected 'chat', 'task', or 'event'"
            )),
        }
    }
}

/// A node: an agent, a human, or an automated action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorNode {
    pub id: String,
    pub kind: ActorKind,
    pub label: String,
    /// Runtime agent backing this node, for `agent` kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorLink {
    pub source: String,
    pub target: String,
    pub direction: LinkDirection,
    pub communication_type: CommunicationType,
    /// Socket positions are cosmetic (dashboard layout) but persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_socket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_socket: Option<String>,
}

/// A named set of node ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorTeam {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub member_ids: Vec<String>,
}

/// The root aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorBoard {
    #[serde(default)]
    pub nodes: Vec<ActorNode>,
    #[serde(default)]
    pub links: Vec<ActorLink>,
    #[serde(default)]
    pub teams: Vec<ActorTeam>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ActorBoard {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            nodes: Vec::new(),
            links: Vec::new(),
            teams: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

impl ActorBoard {
    pub fn node(&self, id: &str) -> Option<&ActorNode> {
        self.nodes.iter().find(|node| node.id == id)
    }
}
