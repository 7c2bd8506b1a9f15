//! Orchestration core: route decider, dispatcher, branches, workers, and the
//! compactor.

pub mod branch;
pub mod compactor;
pub mod dispatcher;
pub mod router;
pub mod worker;

pub use branch::BranchRuntime;
pub use compactor::Compactor;
pub use dispatcher::Dispatcher;
pub use router::{ChannelFeatures, RouteAction, RouteDecision};
pub use worker::{Worker, WorkerMode, WorkerScheduler, WorkerSpec, WorkerStatus};
