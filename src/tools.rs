//! Tool layer: catalog of built-in tools, per-agent authorization, and
//! guardrail enforcement.

pub mod catalog;
pub mod exec;
pub mod file;
pub mod policy;
pub mod web;

pub use catalog::{ToolCatalog, ToolSpec};
pub use policy::{AgentToolsPolicy, Decision, Guardrails, PolicyDefault, PolicyService, WebGuardrails};
