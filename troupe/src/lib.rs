#![cfg_attr(docsrs, feature(doc_cfg))]
//! Troupe is a runtime for composing, executing, and resuming hierarchies of
//! LLM-driven agents.
//!
//! A reasoning agent ([`agent::ChatModelAgent`]), the workflow composites
//! ([`agent::SequentialAgent`], [`agent::ParallelAgent`],
//! [`agent::LoopAgent`]), the agent-as-tool adapter ([`agent::AgentTool`]),
//! and the deterministic transfer wrappers all share one contract: an
//! [`agent::Agent`] produces a lazy stream of [`event::AgentEvent`]s, and
//! agents nest arbitrarily under the flow layer that maintains the sub-agent
//! tree, the shared session, and transfer dispatch.
//!
//! Runs can suspend mid-flight — a tool returns
//! [`error::ToolError::InterruptAndRerun`] — and the [`runner::Runner`]
//! persists the suspended state through a caller-supplied
//! [`checkpoint::CheckPointStore`], so execution continues later from a
//! durable checkpoint, even across processes.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use troupe::prelude::*;
//!
//! let agent = ChatModelAgent::new(
//!     ChatModelAgentConfig::new("assistant", "Answers questions.", model)
//!         .with_instruction("You are helpful."),
//! )?;
//! let runner = Runner::new(RunnerConfig {
//!     agent: Arc::new(agent),
//!     enable_streaming: false,
//!     store: Some(Arc::new(InMemoryStore::new())),
//! });
//!
//! let mut events = runner.query(&Context::new(), "Hello!", RunOptions::new()).await;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

// Core data model
pub mod error;
pub mod event;
pub mod message;
pub mod stream;

// Consumed interfaces
pub mod model;
pub mod tool;

// Per-run state and persistence
pub mod checkpoint;
pub mod interrupt;
pub mod session;

// Agents and the runner
pub mod agent;
pub mod prelude;
pub mod runner;

// Re-export the working set at the crate root
pub use agent::{Agent, AgentInput, EventStream, ResumableAgent, RunOptions};
pub use error::{Error, Result, ToolError, ToolResult};
pub use event::{AgentAction, AgentEvent, AgentOutput};
pub use message::{Message, Role, concat_messages};
pub use runner::{Runner, RunnerConfig};
pub use session::{Context, add_session_value, get_session_value};
