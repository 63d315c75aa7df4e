//! The agent contract and its implementations.
//!
//! An [`Agent`] is anything that can be asked to run against a list of
//! messages and produce a lazy stream of [`AgentEvent`](crate::event::AgentEvent)s.
//! The reasoning agent ([`react::ChatModelAgent`]), the workflow composites
//! ([`workflow`]), the agent-as-tool adapter ([`agent_tool::AgentTool`]),
//! and the deterministic transfer wrappers ([`transfer`]) all implement the
//! same contract and can be nested arbitrarily under the flow layer
//! ([`flow::FlowAgent`]).

pub mod agent_tool;
pub mod flow;
pub mod options;
pub mod react;
pub mod transfer;
pub mod workflow;

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::event::AgentEvent;
use crate::message::Message;
use crate::session::Context;
use crate::stream::{StreamReader, StreamWriter, pipe};

pub use agent_tool::AgentTool;
pub use flow::{FlowAgent, set_sub_agents};
pub use options::{RunOption, RunOptions};
pub use react::{ChatModelAgent, ChatModelAgentConfig};
pub use transfer::{agent_with_deterministic_transfer_to, agent_with_options};
pub use workflow::{LoopAgent, ParallelAgent, SequentialAgent};

/// Capacity of the event pipe behind every agent's producer task.
pub(crate) const EVENT_PIPE_CAPACITY: usize = 16;

/// The input an agent is started with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentInput {
    /// The conversation so far, ending with the request to act on.
    pub messages: Vec<Message>,
    /// Whether the caller wants streamed model output.
    #[serde(default)]
    pub enable_streaming: bool,
}

impl AgentInput {
    /// Create an input from messages.
    #[must_use]
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            enable_streaming: false,
        }
    }

    /// Request streamed model output.
    #[must_use]
    pub const fn with_streaming(mut self, enable: bool) -> Self {
        self.enable_streaming = enable;
        self
    }
}

/// Name and description of an agent, as seen by its tree neighbors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMeta {
    /// The agent's name.
    pub name: String,
    /// The agent's description.
    pub description: String,
}

/// The stream of events one agent run produces.
pub type EventStream = StreamReader<AgentEvent>;

/// What a [`ResumableAgent`] is resumed with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeInfo {
    /// Whether the caller wants streamed model output.
    pub enable_streaming: bool,
    /// The interrupt payload saved when the agent suspended.
    pub interrupt_info: crate::interrupt::InterruptInfo,
}

/// A unit of execution producing a lazy stream of events.
///
/// The returned stream is exclusively owned by the caller and terminates
/// either at natural end-of-stream or after a terminal event (an error, or
/// an `Exit` / `Interrupted` / `TransferToAgent` / `BreakLoop` action).
pub trait Agent: Send + Sync + 'static {
    /// The agent's name, unique among its tree neighbors.
    fn name(&self) -> &str;

    /// What the agent does; shown to models that may transfer to it.
    fn description(&self) -> &str;

    /// Start the agent. Event production runs on a spawned task; failures
    /// surface as in-band error events.
    fn run(&self, ctx: &Context, input: AgentInput, options: RunOptions) -> EventStream;

    /// The resumable view of this agent, when it supports resumption.
    fn as_resumable(&self) -> Option<&dyn ResumableAgent> {
        None
    }

    /// The flow-decorator handle behind this agent, when it is one. Lets
    /// tree construction reuse an existing decorator instead of wrapping it
    /// twice.
    fn as_flow(&self) -> Option<flow::FlowAgent> {
        None
    }

    /// Called when sub-agents are attached to this agent. Errors reject the
    /// wiring.
    fn on_set_sub_agents(&self, _agents: &[AgentMeta]) -> Result<()> {
        Ok(())
    }

    /// Called when this agent is attached under a parent. Errors reject the
    /// wiring.
    fn on_set_as_sub_agent(&self, _parent: AgentMeta) -> Result<()> {
        Ok(())
    }

    /// Called when transfers back to the parent are disallowed for this
    /// agent.
    fn on_disallow_transfer_to_parent(&self) -> Result<()> {
        Ok(())
    }
}

/// An agent whose interrupted runs can be continued from a saved payload.
pub trait ResumableAgent: Agent {
    /// Continue a previously interrupted run.
    fn resume(&self, ctx: &Context, info: ResumeInfo, options: RunOptions) -> EventStream;
}

/// Spawn an event producer with panic capture.
///
/// The producer writes events into a bounded pipe; if it panics, the panic
/// is converted into a terminal error event before the stream closes.
pub(crate) fn spawn_event_producer<F, Fut>(location: &'static str, producer: F) -> EventStream
where
    F: FnOnce(StreamWriter<AgentEvent>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (writer, reader) = pipe(EVENT_PIPE_CAPACITY);
    let fallback = writer.clone();
    tokio::spawn(async move {
        let run = AssertUnwindSafe(async move { producer(writer).await });
        if let Err(payload) = run.catch_unwind().await {
            let event = AgentEvent::from_error(Error::from_panic(location, &*payload));
            let _ = fallback.send(Ok(event)).await;
        }
    });
    reader
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_producer_events_arrive_in_order() {
        let mut stream = spawn_event_producer("test", |writer| async move {
            for i in 0..3 {
                let event = AgentEvent::from_message(Message::assistant(format!("m{i}")));
                if writer.send(Ok(event)).await {
                    return;
                }
            }
        });

        for i in 0..3 {
            let event = stream.recv().await.expect("event").expect("ok");
            let Some(crate::event::AgentOutput::Message(msg)) = event.output else {
                panic!("expected message output");
            };
            assert_eq!(msg.content, format!("m{i}"));
        }
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_producer_panic_becomes_error_event() {
        let mut stream = spawn_event_producer("test", |_writer| async move {
            panic!("producer blew up");
        });

        let event = stream.recv().await.expect("event").expect("ok");
        assert!(matches!(event.error, Some(Error::Panic { .. })));
        assert!(stream.recv().await.is_none());
    }
}
