//! The agent-as-tool adapter: nest a whole agent behind the tool interface.
//!
//! [`AgentTool`] runs its inner agent inside a private checkpoint bubble: a
//! fresh session and an in-memory store that live for one tool call. If the
//! inner agent suspends, the adapter saves the bubble's checkpoint bytes
//! (together with the last event) into the enclosing agent's persisted tool
//! state, keyed by the tool-call id, and surfaces
//! [`ToolError::InterruptAndRerun`] so the outer run suspends too. When the
//! outer run resumes and re-executes the call, the adapter finds the saved
//! bytes and resumes the inner agent instead of restarting it.

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checkpoint::{CheckPointStore, InMemoryStore};
use crate::error::{ToolError, ToolResult};
use crate::event::{AgentAction, SessionEvent};
use crate::interrupt::AgentToolInterruptInfo;
use crate::message::{Message, Role};
use crate::runner::{Runner, RunnerConfig};
use crate::tool::{Tool, ToolContext, ToolInfo};

use super::options::{RunOptions, with_checkpoint_id};
use super::transfer::gen_transfer_messages;
use super::Agent;

/// Checkpoint id used inside the adapter's private bubble.
const BUBBLE_CHECKPOINT_ID: &str = "agent_tool_bubble";

/// Default argument shape: a single request string for the inner agent.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct AgentToolArgs {
    /// The request to hand to the agent.
    request: String,
}

/// Exposes an [`Agent`] through the [`Tool`] interface.
pub struct AgentTool {
    agent: Arc<dyn Agent>,
    info: ToolInfo,
    full_history: bool,
}

impl std::fmt::Debug for AgentTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTool")
            .field("agent", &self.agent.name())
            .field("full_history", &self.full_history)
            .finish()
    }
}

impl AgentTool {
    /// Wrap an agent as a tool named and described after the agent, taking
    /// a single `request` string.
    #[must_use]
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        let info = ToolInfo::for_args::<AgentToolArgs>(
            agent.name().to_owned(),
            agent.description().to_owned(),
        );
        Self {
            agent,
            info,
            full_history: false,
        }
    }

    /// Use a caller-supplied tool descriptor instead of the default.
    #[must_use]
    pub fn with_info(mut self, info: ToolInfo) -> Self {
        self.info = info;
        self
    }

    /// Feed the inner agent the enclosing agent's whole message history
    /// instead of a single request string.
    #[must_use]
    pub const fn with_full_history(mut self) -> Self {
        self.full_history = true;
        self
    }

    /// Build the inner agent's input messages.
    fn build_input(&self, tctx: &ToolContext, args: &str) -> ToolResult<Vec<Message>> {
        if !self.full_history {
            let args: AgentToolArgs = crate::tool::parse_args(args)?;
            return Ok(vec![Message::user(args.request)]);
        }

        let mut messages: Vec<Message> = tctx.history.as_ref().clone();
        // The trailing assistant message carries the tool call currently
        // being served; the inner agent must not see it dangling.
        if messages
            .last()
            .is_some_and(|m| m.role == Role::Assistant && m.has_tool_calls())
        {
            messages.pop();
        }
        let (assistant, tool) = gen_transfer_messages(self.agent.name());
        messages.push(assistant);
        messages.push(tool);

        let enclosing = &tctx.agent_name;
        Ok(messages
            .into_iter()
            .map(|m| match m.role {
                Role::Assistant | Role::Tool => {
                    Message::user(format!("For context: [{enclosing}] said: {}", m.content))
                }
                _ => m,
            })
            .collect())
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn info(&self) -> ToolInfo {
        self.info.clone()
    }

    async fn invokable_run(&self, tctx: &ToolContext, args: &str) -> ToolResult<String> {
        let forwarded = tctx
            .options
            .agent_tool_options(self.agent.name())
            .unwrap_or_default();
        let options = forwarded.with(with_checkpoint_id(BUBBLE_CHECKPOINT_ID));

        let store = Arc::new(InMemoryStore::new());
        let runner = Runner::new(RunnerConfig {
            agent: Arc::clone(&self.agent),
            enable_streaming: tctx.enable_streaming,
            store: Some(Arc::clone(&store) as Arc<dyn CheckPointStore>),
        });

        let saved = tctx.state.get(&tctx.call_id).await;
        let mut events = match saved {
            Some(value) => {
                debug!(agent = self.agent.name(), call_id = %tctx.call_id,
                    "resuming nested agent from saved bubble");
                let info: AgentToolInterruptInfo = serde_json::from_value(value)?;
                store
                    .set(&tctx.context, BUBBLE_CHECKPOINT_ID, info.data)
                    .await
                    .map_err(|err| ToolError::execution(err.to_string()))?;
                runner
                    .resume(&tctx.context, BUBBLE_CHECKPOINT_ID, options)
                    .await
                    .map_err(|err| ToolError::execution(err.to_string()))?
            }
            None => {
                let messages = self.build_input(tctx, args)?;
                runner.run(&tctx.context, messages, options).await
            }
        };

        let mut last: Option<SessionEvent> = None;
        let mut final_answer: Option<String> = None;
        while let Some(item) = events.recv().await {
            let event = match item {
                Ok(event) => event,
                Err(err) => return Err(ToolError::execution(err.to_string())),
            };
            let collapsed = SessionEvent::from_event(event)
                .await
                .map_err(|err| ToolError::execution(err.to_string()))?;
            if let Some(err) = &collapsed.error {
                return Err(ToolError::execution(err.to_string()));
            }
            if let Some(message) = &collapsed.message {
                if message.role == Role::Assistant {
                    final_answer = Some(message.content.clone());
                }
            }
            last = Some(collapsed);
        }

        let interrupted = matches!(
            last.as_ref().and_then(|e| e.action.as_ref()),
            Some(AgentAction::Interrupted(_))
        );
        if interrupted {
            let data = store
                .get(&tctx.context, BUBBLE_CHECKPOINT_ID)
                .await
                .map_err(|err| ToolError::execution(err.to_string()))?
                .ok_or_else(|| {
                    ToolError::execution(crate::error::Error::MissingInterruptInfo.to_string())
                })?;
            let info = AgentToolInterruptInfo {
                last_event: last,
                data,
            };
            tctx.state
                .set(&tctx.call_id, serde_json::to_value(&info)?)
                .await;
            return Err(ToolError::InterruptAndRerun);
        }

        tctx.state.remove(&tctx.call_id).await;
        Ok(final_answer.unwrap_or_default())
    }
}
