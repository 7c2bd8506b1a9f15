//! slopoverlord: a multi-agent orchestration runtime.
//!
//! Inbound messages land on named channels. A route decider picks, per
//! message, between an inline reply, an ephemeral reasoning branch, or a
//! durable tool-wielding worker. Workers drive project tasks through a Kanban
//! lifecycle, a visor extracts TODOs and approval commands from conversation,
//! and a compactor keeps each channel's context under its token budget.

pub mod agent;
pub mod api;
pub mod artifacts;
pub mod board;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod llm;
pub mod persist;
pub mod plugins;
pub mod projects;
pub mod sessions;
pub mod tools;

pub use error::{Error, ErrorKind, Result};

use std::sync::Arc;

/// Agent identifier type (kebab-case, unique).
pub type AgentId = Arc<str>;

/// Channel identifier type.
pub type ChannelId = Arc<str>;

/// Worker identifier type.
pub type WorkerId = uuid::Uuid;

/// Branch identifier type.
pub type BranchId = uuid::Uuid;

/// Project identifier type.
pub type ProjectId = String;

/// Task identifier type.
pub type TaskId = String;

/// Session identifier type.
pub type SessionId = String;

/// The assembled runtime: one root value threaded into constructors.
///
/// Subsystems hold `Arc`s to the ones below them; references across
/// aggregates are by id only, joined through the persistence adapter.
pub struct Runtime {
    pub config: Arc<config::ConfigHandle>,
    pub backend: Arc<dyn persist::Backend>,
    pub store: Arc<events::EventStore>,
    pub llm: Arc<llm::LlmManager>,
    pub policy: Arc<tools::PolicyService>,
    pub artifacts: Arc<artifacts::ArtifactStore>,
    pub agents: Arc<identity::AgentStore>,
    pub board: Arc<board::BoardStore>,
    pub projects: Arc<projects::ProjectStore>,
    pub plugins: Arc<plugins::PluginManager>,
    pub compactor: Arc<agent::Compactor>,
    pub scheduler: Arc<agent::WorkerScheduler>,
    pub visor: Arc<projects::Visor>,
    pub sessions: Arc<sessions::SessionEngine>,
    pub dispatcher: Arc<agent::Dispatcher>,
}

impl Runtime {
    /// Assemble the runtime from a config handle and a persistence backend.
    ///
    /// Spawns the visor's observation and ready-task loops; everything else
    /// is demand-driven.
    pub fn assemble(
        config: Arc<config::ConfigHandle>,
        backend: Arc<dyn persist::Backend>,
    ) -> Arc<Self> {
        let store = Arc::new(events::EventStore::new(
            backend.clone(),
            config.clone(),
        ));
        let llm = Arc::new(llm::LlmManager::new(config.clone()));
        let policy = Arc::new(tools::PolicyService::new(config.clone()));
        let artifacts = Arc::new(artifacts::ArtifactStore::new(
            config.load().workspace_root.clone(),
            backend.clone(),
        ));
        let agents = Arc::new(identity::AgentStore::new(
            backend.clone(),
            config.load().workspace_root.clone(),
        ));
        let board = Arc::new(board::BoardStore::new(backend.clone()));
        let projects = Arc::new(projects::ProjectStore::new(backend.clone()));
        let plugins = Arc::new(plugins::PluginManager::new(backend.clone()));
        let compactor = Arc::new(agent::Compactor::new(
            store.clone(),
            llm.clone(),
            config.clone(),
        ));
        let scheduler = Arc::new(agent::WorkerScheduler::new(
            store.clone(),
            backend.clone(),
            llm.clone(),
            policy.clone(),
        ));
        let visor = Arc::new(projects::Visor::new(
            projects.clone(),
            board.clone(),
            scheduler.clone(),
            store.clone(),
            artifacts.clone(),
            config.clone(),
        ));
        let sessions = Arc::new(sessions::SessionEngine::new(
            agents.clone(),
            backend.clone(),
            llm.clone(),
            policy.clone(),
            config.clone(),
        ));
        let dispatcher = Arc::new(agent::Dispatcher::new(
            store.clone(),
            compactor.clone(),
            scheduler.clone(),
            llm.clone(),
            policy.clone(),
            plugins.clone(),
            artifacts.clone(),
            config.clone(),
        ));

        visor.clone().spawn_loops();

        Arc::new(Self {
            config,
            backend,
            store,
            llm,
            policy,
            artifacts,
            agents,
            board,
            projects,
            plugins,
            compactor,
            scheduler,
            visor,
            sessions,
            dispatcher,
        })
    }
}
