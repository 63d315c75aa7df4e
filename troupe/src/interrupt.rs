//! Interrupt payloads: what a suspended agent leaves behind.
//!
//! When an agent suspends mid-flight it emits an `Interrupted` action whose
//! [`InterruptInfo`] describes exactly where execution stopped. The payload
//! is a closed tagged union — every variant carries a stable name on the
//! wire, so checkpoints round-trip across processes, and payloads from
//! application-defined agents ride through untouched as [`InterruptData::Custom`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::AgentInput;
use crate::agent::react::ReactState;
use crate::event::SessionEvent;

/// The payload of an `Interrupted` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptInfo {
    /// The variant describing which engine suspended and how to resume it.
    pub data: InterruptData,
}

impl InterruptInfo {
    /// Wrap engine-specific interrupt data.
    #[must_use]
    pub const fn new(data: InterruptData) -> Self {
        Self { data }
    }
}

/// Engine-specific interrupt payloads, tagged with stable wire names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type")]
#[non_exhaustive]
pub enum InterruptData {
    /// A chat-model agent suspended inside its reasoning loop.
    #[serde(rename = "troupe.chat_model_agent")]
    React(ReactInterruptInfo),
    /// A workflow composite suspended in one of its children.
    #[serde(rename = "troupe.workflow")]
    Workflow(WorkflowInterruptInfo),
    /// An agent-as-tool adapter suspended its inner agent.
    #[serde(rename = "troupe.agent_tool")]
    AgentTool(Box<AgentToolInterruptInfo>),
    /// An application-defined payload, preserved verbatim.
    #[serde(rename = "troupe.custom")]
    Custom {
        /// Registered name of the payload type.
        name: String,
        /// The payload itself.
        payload: Value,
    },
}

/// Where a chat-model agent stopped: its accumulated running state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactInterruptInfo {
    /// The reasoning-loop state captured at the suspension point.
    pub state: ReactState,
}

/// Where a workflow composite stopped.
///
/// The progress variant records which execution mode was active; loop runs
/// reuse the sequential shape with a non-zero iteration count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInterruptInfo {
    /// The input the workflow was originally started with.
    pub orig_input: AgentInput,
    /// Per-mode progress at the suspension point.
    pub progress: WorkflowProgress,
}

/// Per-mode workflow progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
#[non_exhaustive]
pub enum WorkflowProgress {
    /// A sequential pass (possibly one iteration of a loop) suspended at
    /// the child with the given index.
    Sequential {
        /// Index of the interrupted child.
        index: usize,
        /// The child's own interrupt payload.
        interrupt: Box<InterruptInfo>,
        /// Completed loop iterations before this one; zero for a plain
        /// sequential workflow.
        loop_iterations: usize,
    },
    /// A parallel fan-out suspended in one or more children.
    Parallel {
        /// Child index to that child's interrupt payload. Children absent
        /// from the map finished normally.
        interrupts: BTreeMap<usize, InterruptInfo>,
    },
}

/// Where an agent-as-tool adapter stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentToolInterruptInfo {
    /// The last event the inner agent produced before suspending.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<SessionEvent>,
    /// The inner agent's checkpoint, captured from the adapter's private
    /// in-memory store.
    pub data: Vec<u8>,
}
