//! Agent execution: a bounded think/act/observe loop per conversation,
//! and teams of role-named loops connected by handoffs.

pub mod agent_loop;
pub mod completion;
pub mod parser;
pub mod prompt;
pub mod service;
pub mod team;

pub use agent_loop::{AgentLoop, HandoffRouter, LoopOutcome};
pub use completion::RetryingCompletion;
pub use parser::{AgentAction, ParsedResponse};
pub use service::AgentService;
pub use team::{HandoffPolicy, IterationBudget, Team, TeamBuilder, TeamOutcome};
