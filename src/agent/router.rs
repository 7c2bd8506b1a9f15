//! Route decider: maps an incoming message to an action.
//!
//! A pure, synchronous function of the latest message and a rolling feature
//! vector for the channel. No I/O; the dispatcher owns execution.

use crate::config::RoutingConfig;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// What to do with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteAction {
    Respond,
    SpawnBranch,
    SpawnWorker,
}

impl RouteAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteAction::Respond => "respond",
            RouteAction::SpawnBranch => "spawn_branch",
            RouteAction::SpawnWorker => "spawn_worker",
        }
    }
}

impl std::fmt::Display for RouteAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The decider's verdict for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDecision {
    pub action: RouteAction,
    /// Short, machine-grepable reason tag.
    pub reason: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Positive token budget for executing the decision.
    pub token_budget: u32,
}

impl RouteDecision {
    /// Fallback decision when the decider itself errors.
    pub fn degraded(config: &RoutingConfig) -> Self {
        Self {
            action: RouteAction::Respond,
            reason: "router_degraded".to_string(),
            confidence: 0.1,
            token_budget: config.token_budget,
        }
    }
}

/// Rolling per-channel features the dispatcher derives from the snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelFeatures {
    pub prior_action: Option<RouteAction>,
    pub open_workers: usize,
    pub utilization: f64,
}

/// Keyword groups. Hits are counted case-insensitively on the lowered text.
const WORKER_KEYWORDS: &[&str] = &[
    "run", "build", "deploy", "install", "execute", "fix", "implement", "migrate", "scrape",
    "download", "upload", "create file", "write file", "fetch",
];

const BRANCH_KEYWORDS: &[&str] = &[
    "analyze",
    "analyse",
    "compare",
    "plan",
    "summarize",
    "summarise",
    "research",
    "evaluate",
    "synthesize",
    "think through",
    "brainstorm",
    "pros and cons",
];

fn approval_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?i)\bpick\s+up\s+#\s*([0-9]+|[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})\b")
            .expect("static regex compiles")
    })
}

/// Whether `content` carries an approval command (`pick up #N` / `pick up #<uuid>`).
pub fn is_approval_command(content: &str) -> bool {
    approval_regex().is_match(content)
}

fn keyword_hits(haystack: &str, keywords: &[&str]) -> usize {
    keywords
        .iter()
        .filter(|keyword| haystack.contains(*keyword))
        .count()
}

/// Decide how to handle `content` on a channel with `features`.
///
/// Tie-breaks favor `respond` over `spawn_branch` and `spawn_branch` over
/// `spawn_worker`: a worker is only spawned when its signal strictly
/// dominates, a branch only when there is a reasoning signal at all.
pub fn decide(content: &str, features: &ChannelFeatures, config: &RoutingConfig) -> RouteDecision {
    let trimmed = content.trim();
    let lowered = trimmed.to_lowercase();

    if is_approval_command(trimmed) {
        return RouteDecision {
            action: RouteAction::Respond,
            reason: "task_approved_command".to_string(),
            confidence: 0.95,
            token_budget: config.token_budget,
        };
    }

    let worker_hits = keyword_hits(&lowered, WORKER_KEYWORDS);
    let branch_hits = keyword_hits(&lowered, BRANCH_KEYWORDS);
    let is_short = trimmed.chars().count() <= config.short_message_max_chars;
    let is_long = trimmed.chars().count() > config.short_message_max_chars * 4;

    if worker_hits > branch_hits && worker_hits > 0 {
        let confidence = (0.55 + 0.1 * worker_hits.min(3) as f64).min(0.9);
        return RouteDecision {
            action: RouteAction::SpawnWorker,
            reason: "objective_requires_tools".to_string(),
            confidence,
            token_budget: config.token_budget.saturating_mul(2),
        };
    }

    if branch_hits > 0 || is_long {
        let confidence = if branch_hits > 0 { 0.7 } else { 0.5 };
        return RouteDecision {
            action: RouteAction::SpawnBranch,
            reason: "multi_step_reasoning".to_string(),
            confidence,
            token_budget: config.token_budget,
        };
    }

    // Inline reply: short, conversational, nothing pending.
    let confidence = if is_short && features.open_workers == 0 {
        0.8
    } else {
        0.6
    };
    RouteDecision {
        action: RouteAction::Respond,
        reason: "short_conversational".to_string(),
        confidence,
        token_budget: config.token_budget,
    }
}
