//! The flow decorator: sub-agent trees, history rebuilding, and transfer
//! dispatch.
//!
//! Every agent handed to the runner is wrapped in a [`FlowAgent`]. The
//! decorator owns the parent/child links of the sub-agent tree, rebuilds
//! each agent's input from the session's cumulative event log, mirrors every
//! emitted event into that log, and acts on terminal actions: it records
//! suspended contexts, resolves `TransferToAgent` destinations over its
//! children and parent, and walks the saved run path on resume to find the
//! innermost agent that can continue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use tracing::{Instrument, debug, info_span, warn};

use crate::error::Error;
use crate::event::{AgentAction, AgentEvent, SessionEvent, path_starts_with};
use crate::interrupt::InterruptInfo;
use crate::message::{Message, Role};
use crate::session::{Context, RunContext};
use crate::stream::StreamWriter;

use super::options::RunOptions;
use super::{
    Agent, AgentInput, AgentMeta, EventStream, ResumableAgent, ResumeInfo, spawn_event_producer,
};

/// One entry of an agent's rebuilt history, before rewriting.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// The underlying message.
    pub message: Message,
    /// Name of the agent that produced it; empty for user input.
    pub agent_name: String,
    /// Whether this entry came from the original root input.
    pub is_user_input: bool,
}

/// Rewrites history entries into the message list an agent will act on.
/// Receives the entries and the name of the agent about to run.
pub type HistoryRewriter = Arc<dyn Fn(Vec<HistoryEntry>, &str) -> Vec<Message> + Send + Sync>;

/// The default rewriter: entries produced by other agents become user
/// messages prefixed with their origin; the agent's own messages and the
/// user's input pass through untouched.
#[must_use]
pub fn default_history_rewriter() -> HistoryRewriter {
    Arc::new(|entries, agent_name| {
        entries
            .into_iter()
            .map(|entry| {
                if entry.is_user_input || entry.agent_name == agent_name {
                    return entry.message;
                }
                match entry.message.role {
                    Role::Assistant | Role::Tool => Message::user(format!(
                        "For context: [{}] said: {}",
                        entry.agent_name, entry.message.content
                    )),
                    _ => entry.message,
                }
            })
            .collect()
    })
}

struct FlowNode {
    inner: Arc<dyn Agent>,
    children: OnceLock<Vec<FlowAgent>>,
    parent: OnceLock<Weak<FlowNode>>,
    disallow_parent: AtomicBool,
    frozen: AtomicBool,
    rewriter: HistoryRewriter,
}

/// The flow decorator around one agent. Cheap to clone; clones share the
/// same tree node.
#[derive(Clone)]
pub struct FlowAgent {
    node: Arc<FlowNode>,
}

impl std::fmt::Debug for FlowAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowAgent")
            .field("name", &self.node.inner.name())
            .field(
                "children",
                &self
                    .node
                    .children
                    .get()
                    .map(|c| c.iter().map(|f| f.name().to_owned()).collect::<Vec<_>>()),
            )
            .finish_non_exhaustive()
    }
}

/// Attach `children` as sub-agents of `parent`, wiring both sides of the
/// tree and returning the parent's flow decorator.
///
/// Each side's wiring hooks run first and may veto the attachment (an agent
/// that already has sub-agents or a parent, or that has been frozen by its
/// first run, rejects it). A child decorator that already belongs to
/// another tree is deep-copied, so one agent can participate in several
/// trees.
pub fn set_sub_agents(
    parent: Arc<dyn Agent>,
    children: Vec<Arc<dyn Agent>>,
) -> Result<FlowAgent, Error> {
    let parent_flow = FlowAgent::wrap(parent);
    parent_flow.attach_sub_agents(children)?;
    Ok(parent_flow)
}

impl FlowAgent {
    /// Wrap an agent in a flow decorator, reusing an existing decorator
    /// when the agent already is one.
    #[must_use]
    pub fn wrap(agent: Arc<dyn Agent>) -> Self {
        if let Some(flow) = agent.as_flow() {
            return flow;
        }
        Self::new_node(agent, default_history_rewriter())
    }

    /// Wrap an agent with a custom history rewriter.
    #[must_use]
    pub fn wrap_with_rewriter(agent: Arc<dyn Agent>, rewriter: HistoryRewriter) -> Self {
        Self::new_node(agent, rewriter)
    }

    fn new_node(inner: Arc<dyn Agent>, rewriter: HistoryRewriter) -> Self {
        Self {
            node: Arc::new(FlowNode {
                inner,
                children: OnceLock::new(),
                parent: OnceLock::new(),
                disallow_parent: AtomicBool::new(false),
                frozen: AtomicBool::new(false),
                rewriter,
            }),
        }
    }

    /// Attach children to this decorator. Fails when the tree is frozen,
    /// when children were already attached, or when a wiring hook vetoes.
    pub fn attach_sub_agents(&self, children: Vec<Arc<dyn Agent>>) -> Result<(), Error> {
        if self.node.frozen.load(Ordering::Acquire) {
            return Err(Error::config(format!(
                "agent '{}' is frozen after its first run",
                self.name()
            )));
        }
        if self.node.children.get().is_some() {
            return Err(Error::config(format!(
                "sub-agents already set on agent '{}'",
                self.name()
            )));
        }

        let child_flows: Vec<Self> = children
            .into_iter()
            .map(|child| {
                let flow = Self::wrap(child);
                if flow.node.parent.get().is_some() {
                    // Already part of another tree; give this tree its own
                    // copy.
                    flow.deep_copy()
                } else {
                    flow
                }
            })
            .collect();

        let metas: Vec<AgentMeta> = child_flows.iter().map(FlowAgent::meta).collect();
        self.node.inner.on_set_sub_agents(&metas)?;
        for child in &child_flows {
            child.node.inner.on_set_as_sub_agent(self.meta())?;
            child
                .node
                .parent
                .set(Arc::downgrade(&self.node))
                .map_err(|_| {
                    Error::config(format!("agent '{}' already has a parent", child.name()))
                })?;
        }

        self.node
            .children
            .set(child_flows)
            .map_err(|_| Error::config(format!("sub-agents already set on agent '{}'", self.name())))
    }

    /// Disallow the wrapped agent from transferring back to its parent.
    pub fn disallow_transfer_to_parent(&self) -> Result<(), Error> {
        self.node.disallow_parent.store(true, Ordering::Release);
        self.node.inner.on_disallow_transfer_to_parent()
    }

    /// Copy this decorator and its whole subtree, sharing the inner agents
    /// but none of the tree links.
    #[must_use]
    pub fn deep_copy(&self) -> Self {
        let copy = Self::new_node(
            Arc::clone(&self.node.inner),
            Arc::clone(&self.node.rewriter),
        );
        copy.node.disallow_parent.store(
            self.node.disallow_parent.load(Ordering::Acquire),
            Ordering::Release,
        );
        if let Some(children) = self.node.children.get() {
            let copies: Vec<Self> = children.iter().map(Self::deep_copy).collect();
            for child in &copies {
                let _ = child.node.parent.set(Arc::downgrade(&copy.node));
            }
            let _ = copy.node.children.set(copies);
        }
        copy
    }

    fn meta(&self) -> AgentMeta {
        AgentMeta {
            name: self.name().to_owned(),
            description: self.description().to_owned(),
        }
    }

    fn parent(&self) -> Option<Self> {
        self.node
            .parent
            .get()
            .and_then(Weak::upgrade)
            .map(|node| Self { node })
    }

    /// Resolve a transfer destination: direct children first, then the
    /// parent unless transfers to it are disallowed.
    fn find_transfer_target(&self, name: &str) -> Option<Self> {
        if let Some(children) = self.node.children.get() {
            if let Some(child) = children.iter().find(|c| c.name() == name) {
                return Some(child.clone());
            }
        }
        if !self.node.disallow_parent.load(Ordering::Acquire) {
            if let Some(parent) = self.parent() {
                if parent.name() == name {
                    return Some(parent);
                }
            }
        }
        None
    }

    /// Resolve a saved run-path step: like transfer resolution, but a
    /// disallow flag never hides an edge the path already took.
    fn find_step(&self, name: &str) -> Option<Self> {
        if let Some(children) = self.node.children.get() {
            if let Some(child) = children.iter().find(|c| c.name() == name) {
                return Some(child.clone());
            }
        }
        self.parent().filter(|parent| parent.name() == name)
    }

    /// Rebuild this agent's input from the session log: the root input's
    /// user messages first, then every logged event on the current branch,
    /// passed through the history rewriter.
    async fn rebuild_input(
        &self,
        run_ctx: &RunContext,
        enable_streaming: bool,
        options: &RunOptions,
    ) -> AgentInput {
        let mut entries: Vec<HistoryEntry> = run_ctx
            .root_input
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| HistoryEntry {
                message: m.clone(),
                agent_name: String::new(),
                is_user_input: true,
            })
            .collect();

        let skip_transfer = options.skip_transfer_messages();
        for event in run_ctx.session.events().await {
            if !path_starts_with(&run_ctx.run_path, &event.run_path) {
                continue;
            }
            let Some(message) = event.message else {
                continue;
            };
            if skip_transfer
                && matches!(event.action, Some(AgentAction::TransferToAgent { .. }))
            {
                // The transfer pair is a synthesized assistant tool call
                // followed by a tool result; skipping the tool half must
                // also drop the dangling assistant half.
                if message.role == Role::Tool && !entries.is_empty() {
                    entries.pop();
                }
                continue;
            }
            entries.push(HistoryEntry {
                message,
                agent_name: event.agent_name,
                is_user_input: false,
            });
        }

        let mut messages = (self.node.rewriter)(entries, self.name());
        if let Some(modifier) = options.history_modifier() {
            messages = modifier(messages);
        }
        AgentInput {
            messages,
            enable_streaming,
        }
    }

    /// Forward the wrapped agent's events: stamp, mirror into the session
    /// log, and act on terminal actions.
    async fn forward_events(
        &self,
        ctx: &Context,
        run_ctx: &RunContext,
        mut stream: EventStream,
        writer: &StreamWriter<AgentEvent>,
        input: &AgentInput,
        options: &RunOptions,
    ) {
        while let Some(item) = stream.recv().await {
            let mut event = match item {
                Ok(event) => event,
                Err(err) => AgentEvent::from_error(err),
            };
            if event.agent_name.is_empty() {
                event.agent_name = self.name().to_owned();
            }
            if event.run_path.is_empty() {
                event.run_path = run_ctx.run_path.clone();
            }

            if let Some(AgentAction::Interrupted(_)) = &event.action {
                run_ctx.session.record_interrupted(run_ctx.clone()).await;
                let _ = writer.send(Ok(event)).await;
                return;
            }

            let (downstream, for_log) = event.fork();
            match SessionEvent::from_event(for_log).await {
                Ok(collapsed) => run_ctx.session.append_event(collapsed).await,
                Err(err) => {
                    warn!(agent = self.name(), error = %err, "failed to mirror event");
                }
            }

            let action = downstream.action.clone();
            let is_error = downstream.error.is_some();
            if writer.send(Ok(downstream)).await {
                return;
            }
            if is_error {
                return;
            }

            match action {
                Some(AgentAction::Exit) => return,
                Some(AgentAction::TransferToAgent { dest_agent_name }) => {
                    self.dispatch_transfer(ctx, run_ctx, &dest_agent_name, writer, input, options)
                        .await;
                    return;
                }
                _ => {}
            }
        }
    }

    /// Hand control to the transfer destination and forward its events.
    async fn dispatch_transfer(
        &self,
        ctx: &Context,
        run_ctx: &RunContext,
        dest_name: &str,
        writer: &StreamWriter<AgentEvent>,
        input: &AgentInput,
        options: &RunOptions,
    ) {
        let span = info_span!(
            "transfer",
            transfer.from = %self.name(),
            transfer.to = %dest_name,
        );
        async {
            debug!("transferring control");
            let Some(dest) = self.find_transfer_target(dest_name) else {
                let event =
                    AgentEvent::from_error(Error::transfer_failed(dest_name, self.name()));
                let _ = writer.send(Ok(event)).await;
                return;
            };

            // The destination picks its input up from the session; the run
            // context chain keeps growing through the transfer, so the
            // destination sees the whole branch.
            let ctx = ctx.with_run_ctx(run_ctx.clone());
            let mut dest_stream = dest.run(&ctx, input.clone(), options.clone());
            while let Some(item) = dest_stream.recv().await {
                let event = match item {
                    Ok(event) => event,
                    Err(err) => AgentEvent::from_error(err),
                };
                if writer.send(Ok(event)).await {
                    return;
                }
            }
        }
        .instrument(span)
        .await;
    }

    /// Resume a checkpointed run: walk down the saved run path to the
    /// innermost resumable agent and continue from there.
    pub(crate) fn resume_from(
        &self,
        ctx: &Context,
        saved_ctx: RunContext,
        interrupt_info: InterruptInfo,
        options: RunOptions,
    ) -> EventStream {
        let this = self.clone();
        let ctx = ctx.clone();
        spawn_event_producer("flow agent", move |writer| async move {
            let path = saved_ctx.run_path.clone();
            if path.first().map(|s| s.name.as_str()) != Some(this.name()) {
                let event = AgentEvent::from_error(Error::internal(format!(
                    "saved run path does not start at root agent '{}'",
                    this.name()
                )));
                let _ = writer.send(Ok(event)).await;
                return;
            }

            let mut target = this.clone();
            for step in &path[1..] {
                let Some(next) = target.find_step(&step.name) else {
                    let event = AgentEvent::from_error(Error::internal(format!(
                        "saved run path step '{}' not found under agent '{}'",
                        step.name,
                        target.name()
                    )));
                    let _ = writer.send(Ok(event)).await;
                    return;
                };
                target = next;
            }

            let Some(resumable) = target.node.inner.as_resumable() else {
                let event = AgentEvent::from_error(Error::internal(format!(
                    "agent '{}' was interrupted but cannot resume",
                    target.name()
                )));
                let _ = writer.send(Ok(event)).await;
                return;
            };

            target.node.frozen.store(true, Ordering::Release);
            let enable_streaming = saved_ctx.root_input.enable_streaming;
            let input = AgentInput {
                messages: Vec::new(),
                enable_streaming,
            };
            let ctx = ctx.with_run_ctx(saved_ctx.clone());
            let stream = resumable.resume(
                &ctx,
                ResumeInfo {
                    enable_streaming,
                    interrupt_info,
                },
                options.filter_for(target.name()),
            );
            target
                .forward_events(&ctx, &saved_ctx, stream, &writer, &input, &options)
                .await;
        })
    }
}

impl Agent for FlowAgent {
    fn name(&self) -> &str {
        self.node.inner.name()
    }

    fn description(&self) -> &str {
        self.node.inner.description()
    }

    fn run(&self, ctx: &Context, input: AgentInput, options: RunOptions) -> EventStream {
        let this = self.clone();
        let ctx = ctx.clone();
        spawn_event_producer("flow agent", move |writer| async move {
            this.node.frozen.store(true, Ordering::Release);
            // A caller that already appended this agent's step (a workflow
            // running its children) hands the context over as-is.
            let run_ctx = match ctx.run_ctx() {
                Some(rc)
                    if rc.run_path.last().map(|s| s.name.as_str()) == Some(this.name()) =>
                {
                    rc.clone()
                }
                Some(rc) => rc.descend(this.name()),
                None => RunContext::new(input.clone()).descend(this.name()),
            };
            let ctx = ctx.with_run_ctx(run_ctx.clone());

            let rebuilt = this
                .rebuild_input(&run_ctx, input.enable_streaming, &options)
                .await;
            let stream = this.node.inner.run(
                &ctx,
                rebuilt,
                options.filter_for(this.name()),
            );
            this.forward_events(&ctx, &run_ctx, stream, &writer, &input, &options)
                .await;
        })
    }

    fn as_resumable(&self) -> Option<&dyn ResumableAgent> {
        Some(self)
    }

    fn as_flow(&self) -> Option<FlowAgent> {
        Some(self.clone())
    }

    fn on_disallow_transfer_to_parent(&self) -> Result<(), Error> {
        self.disallow_transfer_to_parent()
    }
}

impl ResumableAgent for FlowAgent {
    /// Resume the wrapped agent in place. Used when this decorator is a
    /// workflow child; top-level resume goes through the runner's path
    /// walk instead.
    fn resume(&self, ctx: &Context, info: ResumeInfo, options: RunOptions) -> EventStream {
        let this = self.clone();
        let ctx = ctx.clone();
        spawn_event_producer("flow agent", move |writer| async move {
            let Some(resumable) = this.node.inner.as_resumable() else {
                let event = AgentEvent::from_error(Error::internal(format!(
                    "agent '{}' was interrupted but cannot resume",
                    this.name()
                )));
                let _ = writer.send(Ok(event)).await;
                return;
            };
            let run_ctx = match ctx.run_ctx() {
                Some(rc) if rc.run_path.last().map(|s| s.name.as_str())
                    == Some(this.name()) =>
                {
                    rc.clone()
                }
                Some(rc) => rc.descend(this.name()),
                None => RunContext::new(AgentInput::default()).descend(this.name()),
            };
            let ctx = ctx.with_run_ctx(run_ctx.clone());
            let input = AgentInput {
                messages: Vec::new(),
                enable_streaming: info.enable_streaming,
            };
            let stream =
                resumable.resume(&ctx, info, options.filter_for(this.name()));
            this.forward_events(&ctx, &run_ctx, stream, &writer, &input, &options)
                .await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::react::{ChatModelAgent, ChatModelAgentConfig};
    use crate::event::{AgentOutput, RunStep};
    use crate::message::ToolCall;
    use crate::model::MockChatModel;
    use crate::session::Session;

    fn chat_agent(name: &str, description: &str, responses: Vec<Message>) -> Arc<dyn Agent> {
        let model = MockChatModel::new(responses);
        Arc::new(
            ChatModelAgent::new(ChatModelAgentConfig::new(name, description, model))
                .expect("agent"),
        )
    }

    async fn collect(stream: EventStream) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        let mut stream = stream;
        while let Some(item) = stream.recv().await {
            events.push(item.expect("event"));
        }
        events
    }

    fn content_of(event: &AgentEvent) -> &str {
        match &event.output {
            Some(AgentOutput::Message(msg)) => &msg.content,
            other => panic!("expected message output, got {other:?}"),
        }
    }

    fn transfer_call(dest: &str) -> Message {
        Message::assistant("").with_tool_calls(vec![ToolCall::function(
            "call-1",
            crate::agent::react::TRANSFER_TOOL_NAME,
            format!(r#"{{"agent_name":"{dest}"}}"#),
        )])
    }

    #[tokio::test]
    async fn test_flow_stamps_name_and_path() {
        let flow = FlowAgent::wrap(chat_agent("A", "says hi", vec![Message::assistant("hi")]));
        let events = collect(flow.run(
            &Context::new(),
            AgentInput::new(vec![Message::user("hello")]),
            RunOptions::new(),
        ))
        .await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].agent_name, "A");
        assert_eq!(events[0].run_path, vec![RunStep::new("A")]);
    }

    #[tokio::test]
    async fn test_flow_mirrors_events_into_session() {
        let flow = FlowAgent::wrap(chat_agent("A", "says hi", vec![Message::assistant("hi")]));
        let session = Session::new();
        let run_ctx = RunContext {
            root_input: AgentInput::new(vec![Message::user("hello")]),
            run_path: Vec::new(),
            session: Arc::clone(&session),
        };
        let ctx = Context::new().with_run_ctx(run_ctx);

        let _ = collect(flow.run(
            &ctx,
            AgentInput::new(vec![Message::user("hello")]),
            RunOptions::new(),
        ))
        .await;

        let logged = session.events().await;
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].agent_name, "A");
        assert_eq!(logged[0].message.as_ref().expect("message").content, "hi");
    }

    #[tokio::test]
    async fn test_transfer_to_child_runs_destination() {
        let parent = chat_agent("P", "routes", vec![transfer_call("C")]);
        let child = chat_agent("C", "answers", vec![Message::assistant("hi from C")]);
        let flow = set_sub_agents(parent, vec![child]).expect("tree");

        let events = collect(flow.run(
            &Context::new(),
            AgentInput::new(vec![Message::user("route me")]),
            RunOptions::new(),
        ))
        .await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].agent_name, "P");
        assert!(matches!(
            events[1].action,
            Some(AgentAction::TransferToAgent { ref dest_agent_name }) if dest_agent_name == "C"
        ));
        assert_eq!(events[2].agent_name, "C");
        assert_eq!(content_of(&events[2]), "hi from C");
        assert_eq!(
            events[2].run_path,
            vec![RunStep::new("P"), RunStep::new("C")]
        );
    }

    #[tokio::test]
    async fn test_transfer_to_unknown_agent_is_error() {
        let parent = chat_agent("P", "routes", vec![transfer_call("missing")]);
        let flow = set_sub_agents(
            parent,
            vec![chat_agent("C", "unused", vec![Message::assistant("x")])],
        )
        .expect("tree");

        let events = collect(flow.run(
            &Context::new(),
            AgentInput::new(vec![Message::user("route me")]),
            RunOptions::new(),
        ))
        .await;

        let last = events.last().expect("events");
        assert_eq!(
            last.error,
            Some(Error::transfer_failed("missing", "P"))
        );
    }

    #[tokio::test]
    async fn test_second_attach_fails() {
        let parent = chat_agent("P", "routes", vec![Message::assistant("x")]);
        let flow = set_sub_agents(
            parent,
            vec![chat_agent("C", "child", vec![Message::assistant("y")])],
        )
        .expect("tree");

        let err = flow
            .attach_sub_agents(vec![chat_agent("D", "other", vec![])])
            .expect_err("second attach");
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn test_shared_child_is_deep_copied() {
        let shared = chat_agent("S", "shared", vec![Message::assistant("s")]);
        let first = set_sub_agents(
            chat_agent("P1", "one", vec![Message::assistant("x")]),
            vec![Arc::clone(&shared)],
        )
        .expect("first tree");

        // The same child in a second tree gets its own decorator copy.
        let second = set_sub_agents(
            chat_agent("P2", "two", vec![Message::assistant("y")]),
            vec![shared],
        );
        assert!(second.is_ok());
        assert_eq!(first.node.children.get().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_history_rewriter_prefixes_foreign_events() {
        let rewriter = default_history_rewriter();
        let entries = vec![
            HistoryEntry {
                message: Message::user("hello"),
                agent_name: String::new(),
                is_user_input: true,
            },
            HistoryEntry {
                message: Message::assistant("routing you"),
                agent_name: "P".to_owned(),
                is_user_input: false,
            },
            HistoryEntry {
                message: Message::assistant("mine"),
                agent_name: "C".to_owned(),
                is_user_input: false,
            },
        ];

        let messages = rewriter(entries, "C");
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].role, Role::User);
        assert_eq!(messages[1].content, "For context: [P] said: routing you");
        assert_eq!(messages[2].role, Role::Assistant);
        assert_eq!(messages[2].content, "mine");
    }

    #[tokio::test]
    async fn test_skip_transfer_messages_drops_pair() {
        let flow = FlowAgent::wrap(chat_agent("C", "answers", vec![Message::assistant("hi")]));
        let session = Session::new();
        let root_input = AgentInput::new(vec![Message::user("route me")]);
        // A logged transfer pair from the parent.
        session
            .append_event(SessionEvent {
                agent_name: "P".to_owned(),
                run_path: vec![RunStep::new("P")],
                message: Some(transfer_call("C")),
                ..SessionEvent::default()
            })
            .await;
        session
            .append_event(SessionEvent {
                agent_name: "P".to_owned(),
                run_path: vec![RunStep::new("P")],
                message: Some(
                    Message::tool("successfully transferred to agent [C]", "call-1")
                        .with_tool_name(crate::agent::react::TRANSFER_TOOL_NAME),
                ),
                action: Some(AgentAction::TransferToAgent {
                    dest_agent_name: "C".to_owned(),
                }),
                ..SessionEvent::default()
            })
            .await;

        let run_ctx = RunContext {
            root_input,
            run_path: vec![RunStep::new("P"), RunStep::new("C")],
            session,
        };

        let with_skip = flow
            .rebuild_input(
                &run_ctx,
                false,
                &RunOptions::new().with(crate::agent::options::with_skip_transfer_messages()),
            )
            .await;
        assert_eq!(with_skip.messages.len(), 1);
        assert_eq!(with_skip.messages[0].content, "route me");

        let without_skip = flow.rebuild_input(&run_ctx, false, &RunOptions::new()).await;
        assert_eq!(without_skip.messages.len(), 3);
    }
}
