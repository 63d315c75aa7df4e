//! Prelude module for convenient imports.
//!
//! Re-exports the most commonly used types and traits so you can get
//! started with a single `use` statement.
//!
//! ```rust,ignore
//! use troupe::prelude::*;
//!
//! let agent = ChatModelAgent::new(
//!     ChatModelAgentConfig::new("assistant", "Answers questions.", model),
//! )?;
//! let runner = Runner::new(RunnerConfig {
//!     agent: std::sync::Arc::new(agent),
//!     enable_streaming: false,
//!     store: None,
//! });
//! ```

pub use crate::agent::flow::{FlowAgent, HistoryEntry, HistoryRewriter, set_sub_agents};
pub use crate::agent::options::{
    RunOption, RunOptions, with_agent_tool_options, with_checkpoint_id, with_history_modifier,
    with_model_options, with_session_values, with_skip_transfer_messages, with_tool_params,
};
pub use crate::agent::react::{
    ChatModelAgent, ChatModelAgentConfig, ChatModelHook, GenModelInput, ReactState,
};
pub use crate::agent::{
    Agent, AgentInput, AgentMeta, AgentTool, EventStream, LoopAgent, ParallelAgent,
    ResumableAgent, ResumeInfo, SequentialAgent, agent_with_deterministic_transfer_to,
    agent_with_options,
};
pub use crate::agent::transfer::gen_transfer_messages;
pub use crate::checkpoint::{CheckPointStore, Checkpoint, InMemoryStore};
pub use crate::error::{Error, Result, ToolError, ToolResult};
pub use crate::event::{
    AgentAction, AgentEvent, AgentOutput, BreakLoopInfo, RunStep, SessionEvent,
};
pub use crate::interrupt::{
    AgentToolInterruptInfo, InterruptData, InterruptInfo, ReactInterruptInfo,
    WorkflowInterruptInfo, WorkflowProgress,
};
pub use crate::message::{
    ContentPart, FunctionCall, Message, Role, TokenUsage, ToolCall, concat_messages,
};
pub use crate::model::{ChatModel, GenerateOptions, MockChatModel, ToolChoice};
pub use crate::runner::{Runner, RunnerConfig};
pub use crate::session::{
    Context, RunContext, Session, add_session_value, get_session_value,
};
pub use crate::stream::{StreamReader, StreamWriter, convert, merge, merge_named, pipe};
pub use crate::tool::{
    FnTool, Tool, ToolCallMiddleware, ToolContext, ToolInfo, ToolState, ToolsConfig, parse_args,
};
