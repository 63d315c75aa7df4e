//! Agent events: the unit of output and control flow between agents.
//!
//! Every agent run yields a stream of [`AgentEvent`]s. An event carries at
//! most one output (a message, a streaming message, or a custom payload) and
//! at most one [`AgentAction`]; an event with an error carries no output.
//! Terminal actions (`Exit`, `Interrupted`, `TransferToAgent`, `BreakLoop`)
//! end the producing agent's stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::interrupt::InterruptInfo;
use crate::message::{Message, concat_messages};
use crate::stream::StreamReader;

/// One step of a run path: the name of an agent on the route from the root
/// to the currently executing agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStep {
    /// The agent name at this step.
    pub name: String,
}

impl RunStep {
    /// Create a step for the named agent.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl std::fmt::Display for RunStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Whether `path` starts with `prefix`.
#[must_use]
pub fn path_starts_with(path: &[RunStep], prefix: &[RunStep]) -> bool {
    path.len() >= prefix.len() && path[..prefix.len()] == *prefix
}

/// Loop-control payload attached by a child that wants its enclosing loop
/// workflow to stop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakLoopInfo {
    /// Name of the agent that requested the break.
    pub from: String,
    /// Set by the enclosing loop once it has honored the request.
    pub done: bool,
    /// The loop iteration during which the break was requested.
    pub current_iterations: usize,
}

/// A control action carried by an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum AgentAction {
    /// The agent (or one of its tools) asked to end the whole run.
    Exit,
    /// Execution was suspended; the payload describes where to resume.
    Interrupted(Box<InterruptInfo>),
    /// Hand control to the named sibling, child, or parent agent.
    TransferToAgent {
        /// The destination agent name.
        dest_agent_name: String,
    },
    /// Stop the enclosing loop workflow.
    BreakLoop(BreakLoopInfo),
    /// Application-defined action.
    Custom(Value),
}

impl AgentAction {
    /// Whether this action ends the producing agent's event stream.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Exit | Self::Interrupted(_) | Self::TransferToAgent { .. } | Self::BreakLoop(_)
        )
    }
}

/// The output half of an event.
#[non_exhaustive]
pub enum AgentOutput {
    /// A complete message.
    Message(Message),
    /// A message streamed in chunks; concatenating the chunks yields the
    /// complete message.
    MessageStream(StreamReader<Message>),
    /// Application-defined output.
    Custom(Value),
}

impl std::fmt::Debug for AgentOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message(msg) => f.debug_tuple("Message").field(msg).finish(),
            Self::MessageStream(_) => f.debug_tuple("MessageStream").finish(),
            Self::Custom(value) => f.debug_tuple("Custom").field(value).finish(),
        }
    }
}

/// A step of output or control from an agent.
#[derive(Debug, Default)]
pub struct AgentEvent {
    /// Name of the producing agent. Stamped by the flow layer.
    pub agent_name: String,
    /// Route from the root agent to the producer. Stamped by the flow layer.
    pub run_path: Vec<RunStep>,
    /// The output, if any. Always absent when `error` is set.
    pub output: Option<AgentOutput>,
    /// The action, if any. At most one per event.
    pub action: Option<AgentAction>,
    /// A terminal error. Ends the producing agent's stream.
    pub error: Option<Error>,
}

impl AgentEvent {
    /// An event carrying a complete message.
    #[must_use]
    pub fn from_message(message: Message) -> Self {
        Self {
            output: Some(AgentOutput::Message(message)),
            ..Self::default()
        }
    }

    /// An event carrying a streaming message.
    #[must_use]
    pub fn from_message_stream(stream: StreamReader<Message>) -> Self {
        Self {
            output: Some(AgentOutput::MessageStream(stream)),
            ..Self::default()
        }
    }

    /// An event carrying a terminal error and no output.
    #[must_use]
    pub fn from_error(error: Error) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    /// An event carrying only an action.
    #[must_use]
    pub fn from_action(action: AgentAction) -> Self {
        Self {
            action: Some(action),
            ..Self::default()
        }
    }

    /// Attach an action to this event.
    #[must_use]
    pub fn with_action(mut self, action: AgentAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Whether this event ends its producer's stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.error.is_some() || self.action.as_ref().is_some_and(AgentAction::is_terminal)
    }

    /// The interrupt payload, when this event carries one.
    #[must_use]
    pub fn interrupt_info(&self) -> Option<&InterruptInfo> {
        match &self.action {
            Some(AgentAction::Interrupted(info)) => Some(info),
            _ => None,
        }
    }

    /// Split this event into two observers of the same output.
    ///
    /// A streaming message is forked via [`StreamReader::copy`], so each
    /// side owns an independent reader over the shared chunk sequence. All
    /// other fields are cloned.
    #[must_use]
    pub fn fork(self) -> (Self, Self) {
        let (left_output, right_output) = match self.output {
            Some(AgentOutput::Message(msg)) => (
                Some(AgentOutput::Message(msg.clone())),
                Some(AgentOutput::Message(msg)),
            ),
            Some(AgentOutput::MessageStream(stream)) => {
                let mut readers = stream.copy(2);
                let right = readers.pop().map(AgentOutput::MessageStream);
                let left = readers.pop().map(AgentOutput::MessageStream);
                (left, right)
            }
            Some(AgentOutput::Custom(value)) => (
                Some(AgentOutput::Custom(value.clone())),
                Some(AgentOutput::Custom(value)),
            ),
            None => (None, None),
        };
        let right = Self {
            agent_name: self.agent_name.clone(),
            run_path: self.run_path.clone(),
            output: right_output,
            action: self.action.clone(),
            error: self.error.clone(),
        };
        let left = Self {
            agent_name: self.agent_name,
            run_path: self.run_path,
            output: left_output,
            action: self.action,
            error: self.error,
        };
        (left, right)
    }
}

/// A fully materialized event, as kept in the session log and in
/// checkpoints.
///
/// Streaming output is collapsed into its concatenated message when the
/// event is converted; `streamed` remembers the original shape so decoding
/// can re-wrap the message as a single-element stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Name of the producing agent.
    pub agent_name: String,
    /// Route from the root agent to the producer.
    pub run_path: Vec<RunStep>,
    /// The collapsed message output, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    /// Custom output, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
    /// The action, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<AgentAction>,
    /// A terminal error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    /// Whether the message output was originally streamed.
    #[serde(default)]
    pub streamed: bool,
}

impl SessionEvent {
    /// Collapse a live event into its materialized form, draining any
    /// streaming output.
    pub async fn from_event(event: AgentEvent) -> Result<Self, Error> {
        let (message, custom, streamed) = match event.output {
            Some(AgentOutput::Message(msg)) => (Some(msg), None, false),
            Some(AgentOutput::MessageStream(stream)) => {
                let chunks = stream.collect().await?;
                let message = if chunks.is_empty() {
                    None
                } else {
                    Some(concat_messages(chunks)?)
                };
                (message, None, true)
            }
            Some(AgentOutput::Custom(value)) => (None, Some(value), false),
            None => (None, None, false),
        };
        Ok(Self {
            agent_name: event.agent_name,
            run_path: event.run_path,
            message,
            custom,
            action: event.action,
            error: event.error,
            streamed,
        })
    }

    /// Rebuild a live event. A collapsed streaming message comes back as a
    /// single-element stream.
    #[must_use]
    pub fn into_event(self) -> AgentEvent {
        let output = match (self.message, self.custom) {
            (Some(msg), _) if self.streamed => Some(AgentOutput::MessageStream(
                StreamReader::from_iter(vec![msg]),
            )),
            (Some(msg), _) => Some(AgentOutput::Message(msg)),
            (None, Some(value)) => Some(AgentOutput::Custom(value)),
            (None, None) => None,
        };
        AgentEvent {
            agent_name: self.agent_name,
            run_path: self.run_path,
            output,
            action: self.action,
            error: self.error,
        }
    }
}
