//! Agent framework: goal planning, step decomposition, feasibility gating and command dispatch.
//!
//! Collaborators (world connection, oracle backend, memory, history persistence) are traits; the
//! runner wires concrete implementations in.

use std::future::Future;
use std::pin::Pin;

pub mod commands;
pub mod conversation;
pub mod decompose;
pub mod error;
pub mod executor;
pub mod feasibility;
pub mod game_api;
pub mod goal;
pub mod history;
pub mod r#loop;
pub mod memory;
pub mod oracle;
pub mod parser;
pub mod plan;
pub mod prompt;
pub mod state;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

/// Boxed future returned by collaborator traits so they stay object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use commands::{CommandHandler, CommandRegistry, CommandSpec, ParamKind};
pub use conversation::Conversation;
pub use error::{AgentError, AgentResult};
pub use game_api::World;
pub use goal::{Agenda, Goal, GoalOutcome};
pub use history::{HistoryLog, Speaker, Turn};
pub use memory::MemoryStore;
pub use oracle::{GatedOracle, Oracle};
pub use r#loop::{CycleReport, PlanningLoop};
pub use state::{AgentFlags, AgentServices, AgentState, RetryLimits};
pub use wire::{ArgValue, Invocation};
