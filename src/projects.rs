//! Projects, tasks, and the visor that drives them.

pub mod store;
pub mod visor;

pub use store::{
    Project, ProjectChannel, ProjectStore, Task, TaskPriority, TaskStatus, TaskUpdate,
};
pub use visor::{Bulletin, Visor};
