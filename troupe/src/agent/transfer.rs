//! Deterministic transfer: hand control to named agents without a model
//! decision.
//!
//! [`gen_transfer_messages`] synthesizes the assistant/tool message pair a
//! model-driven transfer would have produced, so deterministic hand-offs
//! look identical in the session log. [`agent_with_deterministic_transfer_to`]
//! wraps an agent so that, after it finishes, control always moves to the
//! given destinations; [`agent_with_options`] pre-binds run options onto an
//! agent.

use std::sync::Arc;

use uuid::Uuid;

use crate::event::{AgentAction, AgentEvent};
use crate::message::Message;
use crate::session::Context;

use super::options::RunOptions;
use super::react::TRANSFER_TOOL_NAME;
use super::{Agent, AgentInput, EventStream, spawn_event_producer};

/// Synthesize the assistant/tool message pair describing a transfer to
/// `dest`: a tool-call request and its success result, sharing one call id.
#[must_use]
pub fn gen_transfer_messages(dest: &str) -> (Message, Message) {
    let call_id = Uuid::new_v4().to_string();
    let assistant = Message::assistant("").with_tool_calls(vec![
        crate::message::ToolCall::function(
            &call_id,
            TRANSFER_TOOL_NAME,
            format!(r#"{{"agent_name":"{dest}"}}"#),
        ),
    ]);
    let tool = Message::tool(
        format!("successfully transferred to agent [{dest}]"),
        call_id,
    )
    .with_tool_name(TRANSFER_TOOL_NAME);
    (assistant, tool)
}

/// Wrap an agent so that after its own events finish, control transfers to
/// each named destination in order.
///
/// The wrapper forwards the inner agent's events unchanged; if the inner
/// agent ends with a terminal event of its own, no transfer is appended.
#[must_use]
pub fn agent_with_deterministic_transfer_to(
    agent: Arc<dyn Agent>,
    dest_names: Vec<String>,
) -> Arc<dyn Agent> {
    Arc::new(DeterministicTransferAgent { agent, dest_names })
}

struct DeterministicTransferAgent {
    agent: Arc<dyn Agent>,
    dest_names: Vec<String>,
}

impl Agent for DeterministicTransferAgent {
    fn name(&self) -> &str {
        self.agent.name()
    }

    fn description(&self) -> &str {
        self.agent.description()
    }

    fn run(&self, ctx: &Context, input: AgentInput, options: RunOptions) -> EventStream {
        let agent = Arc::clone(&self.agent);
        let dest_names = self.dest_names.clone();
        let ctx = ctx.clone();
        spawn_event_producer("deterministic transfer", move |writer| async move {
            let mut stream = agent.run(&ctx, input, options);
            while let Some(item) = stream.recv().await {
                let terminal = item.as_ref().is_ok_and(AgentEvent::is_terminal);
                let closed = writer.send(item).await;
                if closed || terminal {
                    return;
                }
            }

            for dest in dest_names {
                let (assistant, tool) = gen_transfer_messages(&dest);
                if writer.send(Ok(AgentEvent::from_message(assistant))).await {
                    return;
                }
                let event = AgentEvent::from_message(tool).with_action(
                    AgentAction::TransferToAgent {
                        dest_agent_name: dest,
                    },
                );
                if writer.send(Ok(event)).await {
                    return;
                }
            }
        })
    }

    fn on_set_sub_agents(&self, agents: &[super::AgentMeta]) -> Result<(), crate::error::Error> {
        self.agent.on_set_sub_agents(agents)
    }

    fn on_set_as_sub_agent(&self, parent: super::AgentMeta) -> Result<(), crate::error::Error> {
        self.agent.on_set_as_sub_agent(parent)
    }

    fn on_disallow_transfer_to_parent(&self) -> Result<(), crate::error::Error> {
        self.agent.on_disallow_transfer_to_parent()
    }
}

/// Pre-bind run options onto an agent: every run merges `bound` before the
/// caller's options.
#[must_use]
pub fn agent_with_options(agent: Arc<dyn Agent>, bound: RunOptions) -> Arc<dyn Agent> {
    Arc::new(OptionsBoundAgent { agent, bound })
}

struct OptionsBoundAgent {
    agent: Arc<dyn Agent>,
    bound: RunOptions,
}

impl Agent for OptionsBoundAgent {
    fn name(&self) -> &str {
        self.agent.name()
    }

    fn description(&self) -> &str {
        self.agent.description()
    }

    fn run(&self, ctx: &Context, input: AgentInput, options: RunOptions) -> EventStream {
        self.agent
            .run(ctx, input, self.bound.clone().merged_with(options))
    }

    fn on_set_sub_agents(&self, agents: &[super::AgentMeta]) -> Result<(), crate::error::Error> {
        self.agent.on_set_sub_agents(agents)
    }

    fn on_set_as_sub_agent(&self, parent: super::AgentMeta) -> Result<(), crate::error::Error> {
        self.agent.on_set_as_sub_agent(parent)
    }

    fn on_disallow_transfer_to_parent(&self) -> Result<(), crate::error::Error> {
        self.agent.on_disallow_transfer_to_parent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    #[test]
    fn test_transfer_messages_share_call_id() {
        let (assistant, tool) = gen_transfer_messages("C");
        assert_eq!(assistant.role, Role::Assistant);
        assert_eq!(assistant.tool_calls.len(), 1);
        assert_eq!(assistant.tool_calls[0].function.name, TRANSFER_TOOL_NAME);
        assert_eq!(tool.role, Role::Tool);
        assert_eq!(
            tool.tool_call_id.as_deref(),
            Some(assistant.tool_calls[0].id.as_str())
        );
        assert_eq!(tool.content, "successfully transferred to agent [C]");
    }

    #[tokio::test]
    async fn test_deterministic_transfer_appends_transfer_events() {
        use crate::model::MockChatModel;
        use crate::agent::react::{ChatModelAgent, ChatModelAgentConfig};

        let inner = Arc::new(
            ChatModelAgent::new(ChatModelAgentConfig::new(
                "A",
                "answers",
                MockChatModel::new(vec![Message::assistant("done")]),
            ))
            .expect("agent"),
        );
        let wrapped =
            agent_with_deterministic_transfer_to(inner, vec!["next".to_owned()]);

        let mut stream = wrapped.run(
            &Context::new(),
            AgentInput::new(vec![Message::user("x")]),
            RunOptions::new(),
        );
        let mut events = Vec::new();
        while let Some(item) = stream.recv().await {
            events.push(item.expect("event"));
        }

        assert_eq!(events.len(), 3);
        assert!(matches!(
            events[2].action,
            Some(AgentAction::TransferToAgent { ref dest_agent_name }) if dest_agent_name == "next"
        ));
    }
}
