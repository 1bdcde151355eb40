//! expipe - run experiment action sequences on a worker pool

pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;
pub mod project;

// Re-export commonly used types
pub use crate::core::{Action, ActionError, ActionResult, ActionStatus, Subject};
pub use crate::execution::{ExperimentEvent, ExperimentPipeline, ProcessPoolScheduler, Scheduler};
pub use crate::persistence::{ExperimentRecord, ExperimentStore, InMemoryStore};
pub use crate::project::CommandProject;
