//! Workflow composites: sequential, parallel, and loop execution of child
//! agents.
//!
//! All three modes share one executor. Children are ordinary [`Agent`]s;
//! their events are forwarded upward stamped with the child's name and path.
//! When a child suspends, the composite wraps the child's interrupt payload
//! into a [`WorkflowInterruptInfo`] recording where execution stopped, so a
//! later resume re-enters exactly the interrupted child and then continues
//! the remaining children (and, for loops, the remaining iterations).

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{Instrument, debug, info_span};

use crate::error::Error;
use crate::event::{AgentAction, AgentEvent, RunStep};
use crate::interrupt::{InterruptData, InterruptInfo, WorkflowInterruptInfo, WorkflowProgress};
use crate::session::Context;
use crate::stream::StreamWriter;

use super::options::RunOptions;
use super::{
    Agent, AgentInput, EventStream, ResumableAgent, ResumeInfo, spawn_event_producer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Sequential,
    Parallel,
    Loop { max_iterations: usize },
}

struct WorkflowInner {
    name: String,
    description: String,
    children: Vec<Arc<dyn Agent>>,
    mode: Mode,
}

fn build_inner(
    name: impl Into<String>,
    description: impl Into<String>,
    children: Vec<Arc<dyn Agent>>,
    mode: Mode,
) -> Result<Arc<WorkflowInner>, Error> {
    let name = name.into();
    if name.is_empty() {
        return Err(Error::config("workflow name must not be empty"));
    }
    if children.is_empty() {
        return Err(Error::config(format!(
            "workflow '{name}' needs at least one sub-agent"
        )));
    }
    // Children may not escape the workflow by transferring to its parent.
    for child in &children {
        child.on_disallow_transfer_to_parent()?;
    }
    Ok(Arc::new(WorkflowInner {
        name,
        description: description.into(),
        children,
        mode,
    }))
}

/// Runs its children one after another.
#[derive(Clone)]
pub struct SequentialAgent {
    inner: Arc<WorkflowInner>,
}

/// Runs all children concurrently.
#[derive(Clone)]
pub struct ParallelAgent {
    inner: Arc<WorkflowInner>,
}

/// Repeats a sequential pass over its children.
#[derive(Clone)]
pub struct LoopAgent {
    inner: Arc<WorkflowInner>,
}

impl SequentialAgent {
    /// Create a sequential workflow over the given children.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        children: Vec<Arc<dyn Agent>>,
    ) -> Result<Self, Error> {
        Ok(Self {
            inner: build_inner(name, description, children, Mode::Sequential)?,
        })
    }
}

impl ParallelAgent {
    /// Create a parallel workflow over the given children.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        children: Vec<Arc<dyn Agent>>,
    ) -> Result<Self, Error> {
        Ok(Self {
            inner: build_inner(name, description, children, Mode::Parallel)?,
        })
    }
}

impl LoopAgent {
    /// Create a loop workflow. `max_iterations` of zero means no intrinsic
    /// cap: the loop runs until a child breaks, exits, suspends, or fails.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        children: Vec<Arc<dyn Agent>>,
        max_iterations: usize,
    ) -> Result<Self, Error> {
        Ok(Self {
            inner: build_inner(name, description, children, Mode::Loop { max_iterations })?,
        })
    }
}

macro_rules! impl_workflow_agent {
    ($ty:ident) => {
        impl std::fmt::Debug for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($ty))
                    .field("name", &self.inner.name)
                    .field(
                        "children",
                        &self
                            .inner
                            .children
                            .iter()
                            .map(|c| c.name().to_owned())
                            .collect::<Vec<_>>(),
                    )
                    .finish()
            }
        }

        impl Agent for $ty {
            fn name(&self) -> &str {
                &self.inner.name
            }

            fn description(&self) -> &str {
                &self.inner.description
            }

            fn run(&self, ctx: &Context, input: AgentInput, options: RunOptions) -> EventStream {
                let inner = Arc::clone(&self.inner);
                let ctx = ctx.clone();
                let span = info_span!(
                    "workflow",
                    workflow.name = %self.inner.name,
                    workflow.children = self.inner.children.len(),
                );
                spawn_event_producer("workflow agent", move |writer| {
                    async move {
                        inner.execute(ctx, input, options, writer, None).await;
                    }
                    .instrument(span)
                })
            }

            fn as_resumable(&self) -> Option<&dyn ResumableAgent> {
                Some(self)
            }
        }

        impl ResumableAgent for $ty {
            fn resume(&self, ctx: &Context, info: ResumeInfo, options: RunOptions) -> EventStream {
                let inner = Arc::clone(&self.inner);
                let ctx = ctx.clone();
                let span = info_span!(
                    "workflow",
                    workflow.name = %self.inner.name,
                    workflow.children = self.inner.children.len(),
                    workflow.resumed = true,
                );
                spawn_event_producer("workflow agent", move |writer| {
                    async move {
                        let InterruptData::Workflow(wf) = info.interrupt_info.data else {
                            let event = AgentEvent::from_error(Error::internal(format!(
                                "workflow '{}' cannot resume from a foreign interrupt payload",
                                inner.name
                            )));
                            let _ = writer.send(Ok(event)).await;
                            return;
                        };
                        let mut input = wf.orig_input;
                        input.enable_streaming = info.enable_streaming;
                        inner
                            .execute(ctx, input, options, writer, Some(wf.progress))
                            .await;
                    }
                    .instrument(span)
                })
            }
        }
    };
}

impl_workflow_agent!(SequentialAgent);
impl_workflow_agent!(ParallelAgent);
impl_workflow_agent!(LoopAgent);

/// How one child's event stream ended, from the composite's point of view.
enum ChildEnd {
    /// Natural end of stream without a terminal action.
    Completed,
    /// The child suspended; its interrupt event was consumed, not forwarded.
    Interrupted(InterruptInfo),
    /// The child ended the stream with a break-loop, exit, or error event
    /// (already forwarded), or the downstream consumer went away.
    Stopped,
    /// A break-loop request ended the stream (already forwarded).
    Broke,
}

/// Outcome of one sequential pass.
enum PassEnd {
    Completed,
    Stopped,
    Broke,
}

impl WorkflowInner {
    async fn execute(
        self: Arc<Self>,
        ctx: Context,
        input: AgentInput,
        options: RunOptions,
        writer: StreamWriter<AgentEvent>,
        resume: Option<WorkflowProgress>,
    ) {
        match (self.mode, resume) {
            (Mode::Sequential, None) => {
                self.run_sequential(&ctx, &input, &options, &writer, 0, None, None)
                    .await;
            }
            (Mode::Sequential, Some(WorkflowProgress::Sequential { index, interrupt, .. })) => {
                self.run_sequential(&ctx, &input, &options, &writer, index, Some(*interrupt), None)
                    .await;
            }
            (Mode::Parallel, None) => {
                self.run_parallel(&ctx, &input, &options, &writer, None).await;
            }
            (Mode::Parallel, Some(WorkflowProgress::Parallel { interrupts })) => {
                self.run_parallel(&ctx, &input, &options, &writer, Some(interrupts))
                    .await;
            }
            (Mode::Loop { max_iterations }, None) => {
                self.run_loop(&ctx, &input, &options, &writer, max_iterations, 0, None)
                    .await;
            }
            (
                Mode::Loop { max_iterations },
                Some(WorkflowProgress::Sequential {
                    index,
                    interrupt,
                    loop_iterations,
                }),
            ) => {
                self.run_loop(
                    &ctx,
                    &input,
                    &options,
                    &writer,
                    max_iterations,
                    loop_iterations,
                    Some((index, *interrupt)),
                )
                .await;
            }
            (_, Some(_)) => {
                let event = AgentEvent::from_error(Error::internal(format!(
                    "workflow '{}' got an interrupt payload for a different mode",
                    self.name
                )));
                let _ = writer.send(Ok(event)).await;
            }
        }
    }

    async fn run_loop(
        self: &Arc<Self>,
        ctx: &Context,
        input: &AgentInput,
        options: &RunOptions,
        writer: &StreamWriter<AgentEvent>,
        max_iterations: usize,
        start_iteration: usize,
        resume: Option<(usize, InterruptInfo)>,
    ) {
        let mut iteration = start_iteration;
        let mut resume = resume;
        loop {
            let (start_index, interrupt) = match resume.take() {
                Some((index, interrupt)) => (index, Some(interrupt)),
                None => (0, None),
            };
            let end = self
                .run_sequential(
                    ctx,
                    input,
                    options,
                    writer,
                    start_index,
                    interrupt,
                    Some(iteration),
                )
                .await;
            match end {
                PassEnd::Completed => {}
                PassEnd::Stopped | PassEnd::Broke => return,
            }
            iteration += 1;
            if max_iterations != 0 && iteration >= max_iterations {
                debug!(workflow = %self.name, iterations = iteration, "loop cap reached");
                return;
            }
        }
    }

    /// Run children `start_index..` in order. `loop_iteration` is `Some`
    /// when this pass is one iteration of a loop workflow.
    #[allow(clippy::too_many_arguments)]
    async fn run_sequential(
        self: &Arc<Self>,
        ctx: &Context,
        input: &AgentInput,
        options: &RunOptions,
        writer: &StreamWriter<AgentEvent>,
        start_index: usize,
        mut resume_interrupt: Option<InterruptInfo>,
        loop_iteration: Option<usize>,
    ) -> PassEnd {
        for (index, child) in self.children.iter().enumerate().skip(start_index) {
            let child_ctx = self.child_context(ctx, child.as_ref());
            let child_options = options.filter_for(child.name());
            let stream = match resume_interrupt.take() {
                Some(interrupt) => {
                    let Some(resumable) = child.as_resumable() else {
                        let event = AgentEvent::from_error(Error::internal(format!(
                            "agent '{}' was interrupted but cannot resume",
                            child.name()
                        )));
                        let _ = writer.send(Ok(event)).await;
                        return PassEnd::Stopped;
                    };
                    resumable.resume(
                        &child_ctx,
                        ResumeInfo {
                            enable_streaming: input.enable_streaming,
                            interrupt_info: interrupt,
                        },
                        child_options,
                    )
                }
                None => child.run(&child_ctx, input.clone(), child_options),
            };

            let end = self
                .forward_child(writer, stream, child.as_ref(), &child_ctx, loop_iteration)
                .await;
            match end {
                ChildEnd::Completed => {}
                ChildEnd::Interrupted(info) => {
                    self.emit_interrupt(
                        ctx,
                        writer,
                        input,
                        WorkflowProgress::Sequential {
                            index,
                            interrupt: Box::new(info),
                            loop_iterations: loop_iteration.unwrap_or(0),
                        },
                    )
                    .await;
                    return PassEnd::Stopped;
                }
                ChildEnd::Stopped => return PassEnd::Stopped,
                ChildEnd::Broke => return PassEnd::Broke,
            }
        }
        PassEnd::Completed
    }

    async fn run_parallel(
        self: &Arc<Self>,
        ctx: &Context,
        input: &AgentInput,
        options: &RunOptions,
        writer: &StreamWriter<AgentEvent>,
        resume: Option<BTreeMap<usize, InterruptInfo>>,
    ) {
        let mut handles = Vec::new();
        for (index, child) in self.children.iter().enumerate() {
            let interrupt = match &resume {
                // On resume, children absent from the map already finished.
                Some(map) => match map.get(&index) {
                    Some(info) => Some(info.clone()),
                    None => continue,
                },
                None => None,
            };

            let child = Arc::clone(child);
            let child_ctx = self.child_context(ctx, child.as_ref());
            let child_options = options.filter_for(child.name());
            let input = input.clone();
            let writer = writer.clone();
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let stream = match interrupt {
                    Some(interrupt) => {
                        let Some(resumable) = child.as_resumable() else {
                            let event = AgentEvent::from_error(Error::internal(format!(
                                "agent '{}' was interrupted but cannot resume",
                                child.name()
                            )));
                            let _ = writer.send(Ok(event)).await;
                            return None;
                        };
                        resumable.resume(
                            &child_ctx,
                            ResumeInfo {
                                enable_streaming: input.enable_streaming,
                                interrupt_info: interrupt,
                            },
                            child_options,
                        )
                    }
                    None => child.run(&child_ctx, input, child_options),
                };
                let end = this
                    .forward_child(&writer, stream, child.as_ref(), &child_ctx, None)
                    .await;
                match end {
                    ChildEnd::Interrupted(info) => Some((index, info)),
                    _ => None,
                }
            }));
        }

        let mut interrupts = BTreeMap::new();
        for handle in handles {
            if let Ok(Some((index, info))) = handle.await {
                interrupts.insert(index, info);
            }
        }

        if !interrupts.is_empty() {
            self.emit_interrupt(ctx, writer, input, WorkflowProgress::Parallel { interrupts })
                .await;
        }
    }

    /// Forward one child's events, stamping unstamped names and paths.
    async fn forward_child(
        &self,
        writer: &StreamWriter<AgentEvent>,
        mut stream: EventStream,
        child: &dyn Agent,
        child_ctx: &Context,
        loop_iteration: Option<usize>,
    ) -> ChildEnd {
        let child_path: Vec<RunStep> = child_ctx
            .run_ctx()
            .map(|rc| rc.run_path.clone())
            .unwrap_or_else(|| vec![RunStep::new(child.name())]);

        while let Some(item) = stream.recv().await {
            let mut event = match item {
                Ok(event) => event,
                Err(err) => AgentEvent::from_error(err),
            };
            if event.agent_name.is_empty() {
                event.agent_name = child.name().to_owned();
            }
            if event.run_path.is_empty() {
                event.run_path = child_path.clone();
            }

            if let Some(AgentAction::Interrupted(_)) = &event.action {
                let Some(AgentAction::Interrupted(info)) = event.action.take() else {
                    unreachable!("action kind checked above");
                };
                return ChildEnd::Interrupted(*info);
            }
            if let Some(AgentAction::BreakLoop(info)) = event.action.as_mut() {
                let Some(iteration) = loop_iteration else {
                    // No enclosing loop: pass the request through untouched
                    // and let the pass continue with the next child.
                    if writer.send(Ok(event)).await {
                        return ChildEnd::Stopped;
                    }
                    continue;
                };
                info.done = true;
                info.current_iterations = iteration;
                let _ = writer.send(Ok(event)).await;
                return ChildEnd::Broke;
            }
            if let Some(AgentAction::Exit) = &event.action {
                let _ = writer.send(Ok(event)).await;
                return ChildEnd::Stopped;
            }

            let is_error = event.error.is_some();
            if writer.send(Ok(event)).await {
                return ChildEnd::Stopped;
            }
            if is_error {
                return ChildEnd::Stopped;
            }
        }
        ChildEnd::Completed
    }

    /// Emit the workflow-level interrupted event and repoint the session's
    /// suspended contexts at this workflow.
    async fn emit_interrupt(
        &self,
        ctx: &Context,
        writer: &StreamWriter<AgentEvent>,
        input: &AgentInput,
        progress: WorkflowProgress,
    ) {
        if let Some(run_ctx) = ctx.run_ctx() {
            run_ctx.session.record_interrupted(run_ctx.clone()).await;
        }
        let info = InterruptInfo::new(InterruptData::Workflow(WorkflowInterruptInfo {
            orig_input: input.clone(),
            progress,
        }));
        let event = AgentEvent::from_action(AgentAction::Interrupted(Box::new(info)));
        let _ = writer.send(Ok(event)).await;
    }

    fn child_context(&self, ctx: &Context, child: &dyn Agent) -> Context {
        match ctx.run_ctx() {
            Some(run_ctx) => ctx.with_run_ctx(run_ctx.descend(child.name())),
            None => ctx.clone(),
        }
    }
}
