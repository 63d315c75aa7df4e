//! The reasoning agent: a chat model looping against a set of tools.
//!
//! [`ChatModelAgent`] drives the model↔tools state machine:
//!
//! 1. Build the model input from the instruction and the incoming messages
//! 2. Fire the before-model hooks
//! 3. Call the model (generate or stream) and emit the assistant event
//! 4. Fire the after-model hooks
//! 5. No tool calls → terminate; otherwise execute every requested call
//!    concurrently, emitting tool events as they complete
//! 6. A return-directly tool ends the loop with its result deferred to the
//!    last emitted event; otherwise append the results and loop
//!
//! Tools may suspend the run by returning
//! [`ToolError::InterruptAndRerun`]; the agent captures its running state
//! into a [`ReactState`] and re-executes only the suspended calls on resume.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock, RwLock};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{Instrument, Span, debug, info_span, warn};

use crate::error::{Error, ToolError};
use crate::event::{AgentAction, AgentEvent};
use crate::interrupt::{InterruptData, InterruptInfo, ReactInterruptInfo};
use crate::message::{Message, ToolCall, concat_messages};
use crate::model::{ChatModel, GenerateOptions};
use crate::session::Context;
use crate::stream::{StreamWriter, convert};
use crate::tool::{ToolContext, ToolInfo, ToolState, ToolsConfig, parse_args};

use super::options::RunOptions;
use super::{
    Agent, AgentInput, AgentMeta, EventStream, ResumableAgent, ResumeInfo, spawn_event_producer,
};

/// Name of the synthesized transfer tool.
pub const TRANSFER_TOOL_NAME: &str = "transfer_to_agent";

/// Name of the synthesized exit tool.
pub const EXIT_TOOL_NAME: &str = "exit";

const DEFAULT_MAX_ITERATIONS: usize = 20;

/// Rewrites the accumulated message list around a model call.
pub type ChatModelHook = Arc<dyn Fn(Vec<Message>) -> Vec<Message> + Send + Sync>;

/// Builds the initial model input from the instruction, the incoming input,
/// and the current session values.
pub type GenModelInput =
    Arc<dyn Fn(&str, &AgentInput, &HashMap<String, Value>) -> Vec<Message> + Send + Sync>;

/// Configuration for a [`ChatModelAgent`].
#[derive(Clone)]
pub struct ChatModelAgentConfig {
    /// Agent name. Required.
    pub name: String,
    /// Agent description, shown to agents that may transfer here. Required.
    pub description: String,
    /// System instruction. `{key}` placeholders are substituted from
    /// session values when the run starts.
    pub instruction: String,
    /// The chat model to drive.
    pub model: Arc<dyn ChatModel>,
    /// Tools available to the model, with their middleware.
    pub tools: ToolsConfig,
    /// Tool names whose first successful result ends the loop and becomes
    /// the agent's final output.
    pub return_directly: HashSet<String>,
    /// Iteration cap for the reasoning loop. Zero means the default of 20.
    pub max_iterations: usize,
    /// Hooks fired before every model call, in registration order.
    pub before_chat_model: Vec<ChatModelHook>,
    /// Hooks fired after every model call, in registration order.
    pub after_chat_model: Vec<ChatModelHook>,
    /// Synthesize an `exit(final_result)` tool that ends the whole run.
    pub exit_tool_enabled: bool,
    /// Override for the default input builder.
    pub gen_model_input: Option<GenModelInput>,
}

impl std::fmt::Debug for ChatModelAgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatModelAgentConfig")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("max_iterations", &self.max_iterations)
            .field("return_directly", &self.return_directly)
            .field("exit_tool_enabled", &self.exit_tool_enabled)
            .finish_non_exhaustive()
    }
}

impl ChatModelAgentConfig {
    /// Create a config with the required fields.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        model: Arc<dyn ChatModel>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            instruction: String::new(),
            model,
            tools: ToolsConfig::new(),
            return_directly: HashSet::new(),
            max_iterations: 0,
            before_chat_model: Vec::new(),
            after_chat_model: Vec::new(),
            exit_tool_enabled: false,
            gen_model_input: None,
        }
    }

    /// Set the system instruction.
    #[must_use]
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    /// Set the tool configuration.
    #[must_use]
    pub fn with_tools(mut self, tools: ToolsConfig) -> Self {
        self.tools = tools;
        self
    }

    /// Mark a tool as return-directly.
    #[must_use]
    pub fn with_return_directly(mut self, tool_name: impl Into<String>) -> Self {
        self.return_directly.insert(tool_name.into());
        self
    }

    /// Set the iteration cap.
    #[must_use]
    pub const fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Add a before-model hook.
    #[must_use]
    pub fn with_before_chat_model(mut self, hook: ChatModelHook) -> Self {
        self.before_chat_model.push(hook);
        self
    }

    /// Add an after-model hook.
    #[must_use]
    pub fn with_after_chat_model(mut self, hook: ChatModelHook) -> Self {
        self.after_chat_model.push(hook);
        self
    }

    /// Enable the synthesized exit tool.
    #[must_use]
    pub const fn with_exit_tool(mut self) -> Self {
        self.exit_tool_enabled = true;
        self
    }
}

/// The running state of the reasoning loop, captured on interrupt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReactState {
    /// Name of the owning agent.
    pub agent_name: String,
    /// The accumulated history, ending with the assistant message whose
    /// tool calls were in flight.
    pub messages: Vec<Message>,
    /// Model invocations performed so far.
    pub iteration: usize,
    /// Results of calls that finished before the interrupt, by call id.
    pub completed: BTreeMap<String, Message>,
    /// Ids of the calls to re-execute on resume.
    pub interrupted_calls: Vec<String>,
    /// Persisted per-call tool state.
    #[serde(default)]
    pub tool_state: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
struct TransferWiring {
    sub_agents: Vec<AgentMeta>,
    parent: Option<AgentMeta>,
    disallow_parent: bool,
}

struct Runnable {
    model: Arc<dyn ChatModel>,
    transfer_targets: Vec<AgentMeta>,
}

/// An LLM-driven agent looping between a chat model and its tools.
#[derive(Clone)]
pub struct ChatModelAgent {
    inner: Arc<ReactInner>,
}

impl std::fmt::Debug for ChatModelAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatModelAgent")
            .field("name", &self.inner.config.name)
            .finish_non_exhaustive()
    }
}

struct ReactInner {
    config: ChatModelAgentConfig,
    wiring: RwLock<TransferWiring>,
    runnable: OnceLock<Result<Runnable, Error>>,
}

impl ChatModelAgent {
    /// Create an agent from its config.
    ///
    /// Errors when the name, description, or model is missing.
    pub fn new(config: ChatModelAgentConfig) -> Result<Self, Error> {
        if config.name.is_empty() {
            return Err(Error::config("agent name must not be empty"));
        }
        if config.description.is_empty() {
            return Err(Error::config("agent description must not be empty"));
        }
        Ok(Self {
            inner: Arc::new(ReactInner {
                config,
                wiring: RwLock::new(TransferWiring::default()),
                runnable: OnceLock::new(),
            }),
        })
    }
}

impl Agent for ChatModelAgent {
    fn name(&self) -> &str {
        &self.inner.config.name
    }

    fn description(&self) -> &str {
        &self.inner.config.description
    }

    fn run(&self, ctx: &Context, input: AgentInput, options: RunOptions) -> EventStream {
        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        let span = info_span!(
            "agent",
            agent.name = %self.inner.config.name,
            agent.max_iterations = self.inner.max_iterations(),
            agent.streaming = input.enable_streaming,
        );
        spawn_event_producer("chat model agent", move |writer| {
            async move {
                inner.execute(ctx, input, options, writer, None).await;
            }
            .instrument(span)
        })
    }

    fn as_resumable(&self) -> Option<&dyn ResumableAgent> {
        Some(self)
    }

    fn on_set_sub_agents(&self, agents: &[AgentMeta]) -> Result<(), Error> {
        self.inner.ensure_mutable()?;
        let mut wiring = self.inner.wiring.write().expect("wiring lock");
        if !wiring.sub_agents.is_empty() {
            return Err(Error::config(format!(
                "sub-agents already set on agent '{}'",
                self.inner.config.name
            )));
        }
        wiring.sub_agents = agents.to_vec();
        Ok(())
    }

    fn on_set_as_sub_agent(&self, parent: AgentMeta) -> Result<(), Error> {
        self.inner.ensure_mutable()?;
        let mut wiring = self.inner.wiring.write().expect("wiring lock");
        if wiring.parent.is_some() {
            return Err(Error::config(format!(
                "parent already set on agent '{}'",
                self.inner.config.name
            )));
        }
        wiring.parent = Some(parent);
        Ok(())
    }

    fn on_disallow_transfer_to_parent(&self) -> Result<(), Error> {
        self.inner.ensure_mutable()?;
        self.inner.wiring.write().expect("wiring lock").disallow_parent = true;
        Ok(())
    }
}

impl ResumableAgent for ChatModelAgent {
    fn resume(&self, ctx: &Context, info: ResumeInfo, options: RunOptions) -> EventStream {
        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        let span = info_span!(
            "agent",
            agent.name = %self.inner.config.name,
            agent.max_iterations = self.inner.max_iterations(),
            agent.resumed = true,
        );
        spawn_event_producer("chat model agent", move |writer| {
            async move {
                let InterruptData::React(react) = info.interrupt_info.data else {
                    let event = AgentEvent::from_error(Error::internal(format!(
                        "agent '{}' cannot resume from a foreign interrupt payload",
                        inner.config.name
                    )));
                    let _ = writer.send(Ok(event)).await;
                    return;
                };
                let input = AgentInput::new(Vec::new()).with_streaming(info.enable_streaming);
                inner
                    .execute(ctx, input, options, writer, Some(react.state))
                    .await;
            }
            .instrument(span)
        })
    }
}

enum ToolTaskResult {
    Done {
        name: String,
        event: AgentEvent,
        message: Message,
        action: Option<AgentAction>,
    },
    Interrupted {
        call_id: String,
    },
    Failed {
        name: String,
        error: ToolError,
    },
}

enum BatchOutcome {
    Continue,
    Terminate,
}

impl ReactInner {
    fn ensure_mutable(&self) -> Result<(), Error> {
        if self.runnable.get().is_some() {
            return Err(Error::config(format!(
                "agent '{}' is frozen after its first run",
                self.config.name
            )));
        }
        Ok(())
    }

    /// Build the frozen runnable view on first use.
    fn freeze(&self) -> &Result<Runnable, Error> {
        self.runnable.get_or_init(|| {
            let wiring = self.wiring.read().expect("wiring lock").clone();
            let mut targets = wiring.sub_agents;
            if let Some(parent) = wiring.parent {
                if !wiring.disallow_parent {
                    targets.push(parent);
                }
            }

            let mut infos = self.config.tools.infos();
            if !targets.is_empty() {
                infos.push(transfer_tool_info(&targets));
            }
            if self.config.exit_tool_enabled {
                infos.push(exit_tool_info());
            }

            let model = if infos.is_empty() {
                Arc::clone(&self.config.model)
            } else {
                Arc::clone(&self.config.model).with_tools(infos)?
            };
            Ok(Runnable {
                model,
                transfer_targets: targets,
            })
        })
    }

    fn max_iterations(&self) -> usize {
        if self.config.max_iterations == 0 {
            DEFAULT_MAX_ITERATIONS
        } else {
            self.config.max_iterations
        }
    }

    fn is_return_directly(&self, tool_name: &str) -> bool {
        self.config.return_directly.contains(tool_name)
            || tool_name == TRANSFER_TOOL_NAME
            || tool_name == EXIT_TOOL_NAME
    }

    async fn initial_messages(
        &self,
        ctx: &Context,
        input: &AgentInput,
        targets: &[AgentMeta],
    ) -> Vec<Message> {
        let values = match ctx.run_ctx() {
            Some(run_ctx) => run_ctx.session.values().await,
            None => HashMap::new(),
        };
        let mut messages = match &self.config.gen_model_input {
            Some(gen_fn) => gen_fn(&self.config.instruction, input, &values),
            None => default_model_input(&self.config.instruction, input, &values),
        };
        if !targets.is_empty() {
            append_transfer_instruction(&mut messages, targets);
        }
        messages
    }

    async fn execute(
        self: Arc<Self>,
        ctx: Context,
        input: AgentInput,
        options: RunOptions,
        writer: StreamWriter<AgentEvent>,
        resume: Option<ReactState>,
    ) {
        let runnable = match self.freeze() {
            Ok(runnable) => runnable,
            Err(err) => {
                let _ = writer.send(Ok(AgentEvent::from_error(err.clone()))).await;
                return;
            }
        };

        let enable_streaming = input.enable_streaming;
        let model_options = options.model_options().unwrap_or_default();
        let max_iterations = self.max_iterations();

        let (mut messages, mut iteration, tool_state, pending_batch) = match resume {
            None => (
                self.initial_messages(&ctx, &input, &runnable.transfer_targets)
                    .await,
                0,
                ToolState::new(),
                None,
            ),
            Some(state) => {
                debug!(agent = %self.config.name, calls = state.interrupted_calls.len(),
                    "resuming suspended tool calls");
                let tool_state = ToolState::from_entries(state.tool_state);
                (
                    state.messages,
                    state.iteration,
                    tool_state,
                    Some((state.interrupted_calls, state.completed)),
                )
            }
        };

        // A resumed run re-enters the loop at the tools node.
        if let Some((interrupted_calls, completed)) = pending_batch {
            let Some(assistant) = messages.last().cloned() else {
                let event =
                    AgentEvent::from_error(Error::internal("resume state has no history"));
                let _ = writer.send(Ok(event)).await;
                return;
            };
            let pending: Vec<ToolCall> = assistant
                .tool_calls
                .iter()
                .filter(|call| interrupted_calls.contains(&call.id))
                .cloned()
                .collect();
            match self
                .run_tools_node(
                    &ctx,
                    &options,
                    &writer,
                    &mut messages,
                    &assistant,
                    pending,
                    completed,
                    iteration,
                    enable_streaming,
                    &tool_state,
                )
                .await
            {
                BatchOutcome::Terminate => return,
                BatchOutcome::Continue => {}
            }
        }

        loop {
            if ctx.is_cancelled() {
                let _ = writer.send(Ok(AgentEvent::from_error(Error::Cancelled))).await;
                return;
            }
            if iteration >= max_iterations {
                warn!(agent = %self.config.name, max_iterations, "iteration cap reached");
                let _ = writer
                    .send(Ok(AgentEvent::from_error(Error::MaxIterations)))
                    .await;
                return;
            }
            iteration += 1;

            for hook in &self.config.before_chat_model {
                messages = hook(std::mem::take(&mut messages));
            }

            debug!(agent = %self.config.name, iteration, "invoking chat model");
            let assistant = match self
                .invoke_model(&ctx, runnable, &messages, &model_options, enable_streaming, &writer)
                .await
            {
                Ok(Some(assistant)) => assistant,
                Ok(None) => return,
                Err(err) => {
                    let _ = writer.send(Ok(AgentEvent::from_error(err))).await;
                    return;
                }
            };

            messages.push(assistant.clone());
            for hook in &self.config.after_chat_model {
                messages = hook(std::mem::take(&mut messages));
            }

            if !assistant.has_tool_calls() {
                return;
            }

            let pending = assistant.tool_calls.clone();
            match self
                .run_tools_node(
                    &ctx,
                    &options,
                    &writer,
                    &mut messages,
                    &assistant,
                    pending,
                    BTreeMap::new(),
                    iteration,
                    enable_streaming,
                    &tool_state,
                )
                .await
            {
                BatchOutcome::Terminate => return,
                BatchOutcome::Continue => {}
            }
        }
    }

    /// Call the model and emit the assistant event. Returns the complete
    /// assistant message, or `None` when the consumer went away.
    async fn invoke_model(
        &self,
        ctx: &Context,
        runnable: &Runnable,
        messages: &[Message],
        model_options: &GenerateOptions,
        enable_streaming: bool,
        writer: &StreamWriter<AgentEvent>,
    ) -> Result<Option<Message>, Error> {
        let cancelled = ctx.cancellation().clone();
        if enable_streaming {
            let stream = tokio::select! {
                () = cancelled.cancelled() => return Err(Error::Cancelled),
                result = runnable.model.stream(ctx, messages.to_vec(), model_options) => result?,
            };
            let mut copies = stream.copy(2);
            let mine = copies.pop().ok_or_else(|| Error::internal("stream copy"))?;
            let theirs = copies.pop().ok_or_else(|| Error::internal("stream copy"))?;
            if writer
                .send(Ok(AgentEvent::from_message_stream(theirs)))
                .await
            {
                return Ok(None);
            }
            let chunks = mine.collect().await?;
            Ok(Some(concat_messages(chunks)?))
        } else {
            let message = tokio::select! {
                () = cancelled.cancelled() => return Err(Error::Cancelled),
                result = runnable.model.generate(ctx, messages.to_vec(), model_options) => result?,
            };
            if writer
                .send(Ok(AgentEvent::from_message(message.clone())))
                .await
            {
                return Ok(None);
            }
            Ok(Some(message))
        }
    }

    /// Execute one batch of tool calls concurrently, emitting tool events in
    /// completion order, honoring return-directly deferral and interrupts.
    #[allow(clippy::too_many_arguments)]
    async fn run_tools_node(
        self: &Arc<Self>,
        ctx: &Context,
        options: &RunOptions,
        writer: &StreamWriter<AgentEvent>,
        messages: &mut Vec<Message>,
        assistant: &Message,
        pending: Vec<ToolCall>,
        mut completed: BTreeMap<String, Message>,
        iteration: usize,
        enable_streaming: bool,
        tool_state: &ToolState,
    ) -> BatchOutcome {
        let history = Arc::new(messages.clone());
        let (tx, mut rx) = tokio::sync::mpsc::channel::<ToolTaskResult>(pending.len().max(1));

        for call in &pending {
            let task = ToolCallTask {
                inner: Arc::clone(self),
                tctx: ToolContext {
                    context: ctx.clone(),
                    agent_name: self.config.name.clone(),
                    call_id: call.id.clone(),
                    enable_streaming,
                    history: Arc::clone(&history),
                    state: tool_state.clone(),
                    options: options.clone(),
                },
                call: call.clone(),
            };
            let span = info_span!(
                "tool",
                tool.name = %call.function.name,
                tool.id = %call.id,
                tool.output = tracing::field::Empty,
                error = tracing::field::Empty,
            );
            let tx = tx.clone();
            tokio::spawn(
                async move {
                    let result = AssertUnwindSafe(task.execute())
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|payload| {
                            let err = Error::from_panic("tool call", &*payload);
                            ToolTaskResult::Failed {
                                name: String::new(),
                                error: ToolError::execution(err.to_string()),
                            }
                        });
                    let current = Span::current();
                    match &result {
                        ToolTaskResult::Done { message, .. } => {
                            current.record("tool.output", message.content.as_str());
                        }
                        ToolTaskResult::Failed { error, .. } => {
                            let text = error.to_string();
                            current.record("error", text.as_str());
                        }
                        ToolTaskResult::Interrupted { .. } => {}
                    }
                    let _ = tx.send(result).await;
                }
                .instrument(span),
            );
        }
        drop(tx);

        let mut deferred: Option<AgentEvent> = None;
        let mut interrupted_calls: Vec<String> = Vec::new();
        let cancelled = ctx.cancellation().clone();

        loop {
            let result = tokio::select! {
                () = cancelled.cancelled() => {
                    let _ = writer.send(Ok(AgentEvent::from_error(Error::Cancelled))).await;
                    return BatchOutcome::Terminate;
                }
                result = rx.recv() => match result {
                    Some(result) => result,
                    None => break,
                },
            };
            match result {
                ToolTaskResult::Failed { name, error } => {
                    let _ = writer
                        .send(Ok(AgentEvent::from_error(Error::tool(
                            name,
                            error.to_string(),
                        ))))
                        .await;
                    return BatchOutcome::Terminate;
                }
                ToolTaskResult::Interrupted { call_id } => {
                    interrupted_calls.push(call_id);
                }
                ToolTaskResult::Done {
                    name,
                    event,
                    message,
                    action,
                } => {
                    completed.insert(
                        message.tool_call_id.clone().unwrap_or_default(),
                        message,
                    );
                    if self.is_return_directly(&name) {
                        // First completion wins; later return-directly
                        // results never reach the visible stream.
                        if deferred.is_none() {
                            let event = match action {
                                Some(action) => event.with_action(action),
                                None => event,
                            };
                            deferred = Some(event);
                        }
                    } else if writer.send(Ok(event)).await {
                        return BatchOutcome::Terminate;
                    }
                }
            }
        }

        if !interrupted_calls.is_empty() {
            let state = ReactState {
                agent_name: self.config.name.clone(),
                messages: messages.clone(),
                iteration,
                completed,
                interrupted_calls,
                tool_state: tool_state.snapshot().await,
            };
            let info = InterruptInfo::new(InterruptData::React(ReactInterruptInfo { state }));
            let event = AgentEvent::from_action(AgentAction::Interrupted(Box::new(info)));
            let _ = writer.send(Ok(event)).await;
            return BatchOutcome::Terminate;
        }

        // A resumed batch may owe its return-directly result to a call that
        // finished before the interrupt.
        if deferred.is_none() {
            for call in &assistant.tool_calls {
                if !self.is_return_directly(&call.function.name) {
                    continue;
                }
                if let Some(message) = completed.get(&call.id) {
                    deferred = Some(AgentEvent::from_message(message.clone()));
                    break;
                }
            }
        }

        if let Some(event) = deferred {
            let _ = writer.send(Ok(event)).await;
            return BatchOutcome::Terminate;
        }

        for call in &assistant.tool_calls {
            if let Some(message) = completed.get(&call.id) {
                messages.push(message.clone());
            }
        }
        BatchOutcome::Continue
    }
}

struct ToolCallTask {
    inner: Arc<ReactInner>,
    tctx: ToolContext,
    call: ToolCall,
}

impl ToolCallTask {
    async fn execute(self) -> ToolTaskResult {
        let name = self.call.function.name.clone();
        let args = self.call.function.arguments.clone();
        let call_id = self.call.id.clone();

        if name == TRANSFER_TOOL_NAME {
            return match parse_args::<TransferArgs>(&args) {
                Ok(parsed) => {
                    let content =
                        format!("successfully transferred to agent [{}]", parsed.agent_name);
                    let message = Message::tool(content, &call_id).with_tool_name(&name);
                    ToolTaskResult::Done {
                        name,
                        event: AgentEvent::from_message(message.clone()),
                        message,
                        action: Some(AgentAction::TransferToAgent {
                            dest_agent_name: parsed.agent_name,
                        }),
                    }
                }
                Err(error) => ToolTaskResult::Failed { name, error },
            };
        }
        if name == EXIT_TOOL_NAME && self.inner.config.exit_tool_enabled {
            return match parse_args::<ExitArgs>(&args) {
                Ok(parsed) => {
                    let message =
                        Message::tool(parsed.final_result, &call_id).with_tool_name(&name);
                    ToolTaskResult::Done {
                        name,
                        event: AgentEvent::from_message(message.clone()),
                        message,
                        action: Some(AgentAction::Exit),
                    }
                }
                Err(error) => ToolTaskResult::Failed { name, error },
            };
        }

        let Some(tool) = self.inner.config.tools.find(&name) else {
            return ToolTaskResult::Failed {
                error: ToolError::NotFound { name: name.clone() },
                name,
            };
        };

        if self.tctx.enable_streaming {
            let stream = match tool.streamable_run(&self.tctx, &args).await {
                Ok(stream) => stream,
                Err(ToolError::InterruptAndRerun) => {
                    return ToolTaskResult::Interrupted { call_id };
                }
                Err(error) => return ToolTaskResult::Failed { name, error },
            };
            let call_id_for_chunks = call_id.clone();
            let name_for_chunks = name.clone();
            let message_stream = convert(stream, move |chunk| {
                Some(
                    Message::tool(chunk, &call_id_for_chunks)
                        .with_tool_name(&name_for_chunks),
                )
            });
            let mut copies = message_stream.copy(2);
            let collector = copies.pop();
            let emitted = copies.pop();
            let (Some(collector), Some(emitted)) = (collector, emitted) else {
                return ToolTaskResult::Failed {
                    name,
                    error: ToolError::execution("stream copy failed"),
                };
            };
            let chunks = match collector.collect().await {
                Ok(chunks) => chunks,
                Err(err) => {
                    return ToolTaskResult::Failed {
                        name,
                        error: ToolError::execution(err.to_string()),
                    };
                }
            };
            let message = if chunks.is_empty() {
                Message::tool("", &call_id).with_tool_name(&name)
            } else {
                match concat_messages(chunks) {
                    Ok(message) => message,
                    Err(err) => {
                        return ToolTaskResult::Failed {
                            name,
                            error: ToolError::execution(err.to_string()),
                        };
                    }
                }
            };
            ToolTaskResult::Done {
                name,
                event: AgentEvent::from_message_stream(emitted),
                message,
                action: None,
            }
        } else {
            match self.inner.config.tools.call(tool.as_ref(), &self.tctx, args).await {
                Ok(content) => {
                    let message = Message::tool(content, &call_id).with_tool_name(&name);
                    ToolTaskResult::Done {
                        name,
                        event: AgentEvent::from_message(message.clone()),
                        message,
                        action: None,
                    }
                }
                Err(ToolError::InterruptAndRerun) => ToolTaskResult::Interrupted { call_id },
                Err(error) => ToolTaskResult::Failed { name, error },
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
struct TransferArgs {
    agent_name: String,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
struct ExitArgs {
    final_result: String,
}

fn transfer_tool_info(targets: &[AgentMeta]) -> ToolInfo {
    let names: Vec<&str> = targets.iter().map(|t| t.name.as_str()).collect();
    ToolInfo::for_args::<TransferArgs>(
        TRANSFER_TOOL_NAME,
        format!(
            "Hand the conversation over to another agent. Available agents: {}.",
            names.join(", ")
        ),
    )
}

fn exit_tool_info() -> ToolInfo {
    ToolInfo::for_args::<ExitArgs>(
        EXIT_TOOL_NAME,
        "End the whole run, returning final_result as the outcome.",
    )
}

/// The default model input: an instruction-derived system message followed
/// by the incoming messages.
fn default_model_input(
    instruction: &str,
    input: &AgentInput,
    values: &HashMap<String, Value>,
) -> Vec<Message> {
    let mut messages = Vec::with_capacity(input.messages.len() + 1);
    if !instruction.is_empty() {
        messages.push(Message::system(render_instruction(instruction, values)));
    }
    messages.extend(input.messages.iter().cloned());
    messages
}

/// Substitute `{key}` placeholders from session values. String values are
/// inserted verbatim, anything else as JSON.
fn render_instruction(instruction: &str, values: &HashMap<String, Value>) -> String {
    let mut rendered = instruction.to_owned();
    for (key, value) in values {
        let placeholder = format!("{{{key}}}");
        if !rendered.contains(&placeholder) {
            continue;
        }
        let replacement = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        rendered = rendered.replace(&placeholder, &replacement);
    }
    rendered
}

fn append_transfer_instruction(messages: &mut Vec<Message>, targets: &[AgentMeta]) {
    let mut text = String::from(
        "\n\nYou can hand the conversation over to one of the following agents \
         by calling the transfer_to_agent tool with its name:\n",
    );
    for target in targets {
        text.push_str(&format!("- {}: {}\n", target.name, target.description));
    }
    match messages.first_mut() {
        Some(first) if first.role == crate::message::Role::System => {
            first.content.push_str(&text);
        }
        _ => messages.insert(0, Message::system(text.trim_start().to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolResult;
    use crate::event::AgentOutput;
    use crate::model::MockChatModel;
    use crate::tool::FnTool;

    fn echo_tool() -> Arc<FnTool> {
        FnTool::new(
            ToolInfo::new(
                "echo",
                "Echo the input.",
                serde_json::json!({"type": "object"}),
            ),
            |_tctx, args| async move { Ok::<String, ToolError>(format!("echo:{args}")) },
        )
    }

    fn assistant_with_call(name: &str, id: &str, args: &str) -> Message {
        Message::assistant("").with_tool_calls(vec![ToolCall::function(id, name, args)])
    }

    async fn collect_events(stream: EventStream) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        let mut stream = stream;
        while let Some(item) = stream.recv().await {
            events.push(item.expect("event"));
        }
        events
    }

    fn message_of(event: &AgentEvent) -> &Message {
        match &event.output {
            Some(AgentOutput::Message(msg)) => msg,
            other => panic!("expected message output, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_plain_answer_emits_one_assistant_event() {
        let model = MockChatModel::new(vec![Message::assistant("hello")]);
        let agent = ChatModelAgent::new(ChatModelAgentConfig::new("A", "answers", model))
            .expect("agent");

        let events = collect_events(agent.run(
            &Context::new(),
            AgentInput::new(vec![Message::user("hi")]),
            RunOptions::new(),
        ))
        .await;

        assert_eq!(events.len(), 1);
        assert_eq!(message_of(&events[0]).content, "hello");
    }

    #[tokio::test]
    async fn test_tool_round_trip() {
        let model = MockChatModel::new(vec![
            assistant_with_call("echo", "call-1", r#"{"x":1}"#),
            Message::assistant("done"),
        ]);
        let config = ChatModelAgentConfig::new("A", "uses tools", Arc::clone(&model))
            .with_tools(ToolsConfig::new().with_tool(echo_tool()));
        let agent = ChatModelAgent::new(config).expect("agent");

        let events = collect_events(agent.run(
            &Context::new(),
            AgentInput::new(vec![Message::user("go")]),
            RunOptions::new(),
        ))
        .await;

        assert_eq!(events.len(), 3);
        assert!(message_of(&events[0]).has_tool_calls());
        let tool_msg = message_of(&events[1]);
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(tool_msg.content, r#"echo:{"x":1}"#);
        assert_eq!(message_of(&events[2]).content, "done");
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn test_return_directly_defers_and_terminates() {
        let model = MockChatModel::new(vec![assistant_with_call(
            "echo",
            "call-1",
            r#"{"q":"final"}"#,
        )]);
        let config = ChatModelAgentConfig::new("A", "direct", Arc::clone(&model))
            .with_tools(ToolsConfig::new().with_tool(echo_tool()))
            .with_return_directly("echo");
        let agent = ChatModelAgent::new(config).expect("agent");

        let events = collect_events(agent.run(
            &Context::new(),
            AgentInput::new(vec![Message::user("x")]),
            RunOptions::new(),
        ))
        .await;

        // One assistant event, then the deferred tool event, and no second
        // model turn.
        assert_eq!(events.len(), 2);
        assert_eq!(
            message_of(&events[1]).tool_name.as_deref(),
            Some("echo")
        );
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_iteration_cap_raises_error() {
        // The model asks for the same tool on every turn.
        let looping = MockChatModel::new(vec![
            assistant_with_call("echo", "c1", "{}"),
            assistant_with_call("echo", "c2", "{}"),
            assistant_with_call("echo", "c3", "{}"),
        ]);
        let config = ChatModelAgentConfig::new("A", "loops", Arc::clone(&looping))
            .with_tools(ToolsConfig::new().with_tool(echo_tool()))
            .with_max_iterations(2);
        let agent = ChatModelAgent::new(config).expect("agent");

        let events = collect_events(agent.run(
            &Context::new(),
            AgentInput::new(vec![Message::user("x")]),
            RunOptions::new(),
        ))
        .await;

        let last = events.last().expect("events");
        assert_eq!(last.error, Some(Error::MaxIterations));
        assert_eq!(looping.calls(), 2);
    }

    #[tokio::test]
    async fn test_exit_tool_emits_exit_action() {
        let model = MockChatModel::new(vec![assistant_with_call(
            EXIT_TOOL_NAME,
            "call-1",
            r#"{"final_result":"R"}"#,
        )]);
        let config =
            ChatModelAgentConfig::new("A", "exits", Arc::clone(&model)).with_exit_tool();
        let agent = ChatModelAgent::new(config).expect("agent");

        let events = collect_events(agent.run(
            &Context::new(),
            AgentInput::new(vec![Message::user("done")]),
            RunOptions::new(),
        ))
        .await;

        assert_eq!(events.len(), 2);
        let last = &events[1];
        assert_eq!(message_of(last).content, "R");
        assert_eq!(last.action, Some(AgentAction::Exit));
    }

    #[tokio::test]
    async fn test_transfer_tool_emits_transfer_action() {
        let model = MockChatModel::new(vec![assistant_with_call(
            TRANSFER_TOOL_NAME,
            "call-1",
            r#"{"agent_name":"C"}"#,
        )]);
        let agent = ChatModelAgent::new(ChatModelAgentConfig::new(
            "P",
            "routes",
            Arc::clone(&model),
        ))
        .expect("agent");
        agent
            .on_set_sub_agents(&[AgentMeta {
                name: "C".to_owned(),
                description: "child".to_owned(),
            }])
            .expect("wire");

        let events = collect_events(agent.run(
            &Context::new(),
            AgentInput::new(vec![Message::user("route me")]),
            RunOptions::new(),
        ))
        .await;

        assert_eq!(events.len(), 2);
        let last = &events[1];
        assert_eq!(
            message_of(last).content,
            "successfully transferred to agent [C]"
        );
        assert_eq!(
            last.action,
            Some(AgentAction::TransferToAgent {
                dest_agent_name: "C".to_owned()
            })
        );
    }

    #[tokio::test]
    async fn test_freeze_rejects_wiring_after_first_run() {
        let model = MockChatModel::new(vec![Message::assistant("hi")]);
        let agent = ChatModelAgent::new(ChatModelAgentConfig::new("A", "frozen", model))
            .expect("agent");

        let _ = collect_events(agent.run(
            &Context::new(),
            AgentInput::new(vec![Message::user("x")]),
            RunOptions::new(),
        ))
        .await;

        let err = agent
            .on_set_sub_agents(&[AgentMeta {
                name: "B".to_owned(),
                description: String::new(),
            }])
            .expect_err("frozen");
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn test_interrupt_captures_state_and_resume_reruns_only_suspended() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in_tool = Arc::clone(&attempts);
        let pausing = FnTool::new(
            ToolInfo::new("approval", "Asks a human.", serde_json::json!({"type": "object"})),
            move |_tctx, _args| {
                let attempts = Arc::clone(&attempts_in_tool);
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ToolError::InterruptAndRerun)
                    } else {
                        Ok::<String, ToolError>("approved".to_owned())
                    }
                }
            },
        );

        let model = MockChatModel::new(vec![
            Message::assistant("").with_tool_calls(vec![
                ToolCall::function("call-echo", "echo", "{}"),
                ToolCall::function("call-approval", "approval", "{}"),
            ]),
            Message::assistant("all done"),
        ]);
        let config = ChatModelAgentConfig::new("A", "pauses", Arc::clone(&model))
            .with_tools(ToolsConfig::new().with_tool(echo_tool()).with_tool(pausing));
        let agent = ChatModelAgent::new(config).expect("agent");

        let events = collect_events(agent.run(
            &Context::new(),
            AgentInput::new(vec![Message::user("go")]),
            RunOptions::new(),
        ))
        .await;

        let last = events.last().expect("events");
        let Some(info) = last.interrupt_info() else {
            panic!("expected interrupt, got {last:?}");
        };
        let InterruptData::React(react) = &info.data else {
            panic!("expected react payload");
        };
        assert_eq!(react.state.interrupted_calls, vec!["call-approval"]);
        assert!(react.state.completed.contains_key("call-echo"));

        let resumed = collect_events(agent.resume(
            &Context::new(),
            ResumeInfo {
                enable_streaming: false,
                interrupt_info: info.clone(),
            },
            RunOptions::new(),
        ))
        .await;

        // The rerun executes only the suspended call, then the loop finishes
        // with the scripted final answer.
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let tool_event = message_of(&resumed[0]);
        assert_eq!(tool_event.tool_call_id.as_deref(), Some("call-approval"));
        assert_eq!(tool_event.content, "approved");
        let final_event = message_of(resumed.last().expect("final"));
        assert_eq!(final_event.content, "all done");
    }

    #[tokio::test]
    async fn test_empty_input_with_instruction_yields_one_system_message() {
        let model = MockChatModel::new(vec![Message::assistant("ok")]);
        let config = ChatModelAgentConfig::new("A", "instructed", Arc::clone(&model))
            .with_instruction("Be terse.");
        let agent = ChatModelAgent::new(config).expect("agent");

        let _ = collect_events(agent.run(
            &Context::new(),
            AgentInput::new(Vec::new()),
            RunOptions::new(),
        ))
        .await;

        let request = &model.requests()[0];
        assert_eq!(request.len(), 1);
        assert_eq!(request[0].role, crate::message::Role::System);
        assert_eq!(request[0].content, "Be terse.");
    }

    #[tokio::test]
    async fn test_no_sub_agents_means_no_transfer_tool() {
        let model = MockChatModel::new(vec![Message::assistant("hi")]);
        let agent = ChatModelAgent::new(ChatModelAgentConfig::new(
            "A",
            "alone",
            Arc::clone(&model),
        ))
        .expect("agent");

        let _ = collect_events(agent.run(
            &Context::new(),
            AgentInput::new(vec![Message::user("x")]),
            RunOptions::new(),
        ))
        .await;

        assert!(model.bound_tools().is_empty());
    }

    #[tokio::test]
    async fn test_instruction_placeholders_render_from_session_values() {
        let values: HashMap<String, Value> =
            [("user".to_owned(), Value::String("ada".to_owned()))].into();
        let rendered = render_instruction("Help {user} with {task}.", &values);
        assert_eq!(rendered, "Help ada with {task}.");
    }

    #[tokio::test]
    async fn test_streaming_run_emits_stream_event() {
        let model =
            MockChatModel::new(vec![Message::assistant("streamed answer")]).with_chunk_size(3);
        let agent = ChatModelAgent::new(ChatModelAgentConfig::new("A", "streams", model))
            .expect("agent");

        let mut stream = agent.run(
            &Context::new(),
            AgentInput::new(vec![Message::user("hi")]).with_streaming(true),
            RunOptions::new(),
        );
        let event = stream.recv().await.expect("event").expect("ok");
        let Some(AgentOutput::MessageStream(chunks)) = event.output else {
            panic!("expected streaming output");
        };
        let merged = concat_messages(chunks.collect().await.expect("chunks")).expect("concat");
        assert_eq!(merged.content, "streamed answer");
        assert!(stream.recv().await.is_none());
    }
}
