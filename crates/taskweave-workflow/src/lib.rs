//! Workflow execution: reference-derived dependency graphs, a ready-set
//! scheduler with pause/resume/cancel, and the retrying node contract.

pub mod context;
pub mod graph;
pub mod manager;
pub mod reference;
pub mod retry;
pub mod scheduler;
pub mod step;

pub use context::{ExecutionContext, NodeState};
pub use graph::DependencyGraph;
pub use manager::RunManager;
pub use reference::{references, resolve};
pub use retry::execute_node;
pub use scheduler::{RunHandle, RunState};
pub use step::StepRegistry;
