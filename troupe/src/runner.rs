//! The runner: outermost entry point for executing and resuming agents.
//!
//! A [`Runner`] wraps its root agent in a flow decorator, creates a fresh
//! session per run, and — when a checkpoint store is configured — watches
//! the event stream so that a run ending in an `Interrupted` action is
//! persisted under the caller's checkpoint id. [`Runner::resume`] loads that
//! checkpoint, reconstructs the run context, and dispatches to the innermost
//! suspended agent.

use std::sync::Arc;

use tracing::{Instrument, debug, info_span, warn};

use crate::agent::flow::FlowAgent;
use crate::agent::options::RunOptions;
use crate::agent::{Agent, AgentInput, EventStream, spawn_event_producer};
use crate::checkpoint::{CheckPointStore, Checkpoint};
use crate::error::{Error, Result};
use crate::event::{AgentAction, AgentEvent};
use crate::interrupt::InterruptInfo;
use crate::message::Message;
use crate::session::{Context, RunContext};

/// Configuration for a [`Runner`].
#[derive(Clone)]
pub struct RunnerConfig {
    /// The root agent to execute.
    pub agent: Arc<dyn Agent>,
    /// Whether runs request streamed model output.
    pub enable_streaming: bool,
    /// Checkpoint storage; without one, interrupted runs cannot be resumed.
    pub store: Option<Arc<dyn CheckPointStore>>,
}

impl std::fmt::Debug for RunnerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerConfig")
            .field("agent", &self.agent.name())
            .field("enable_streaming", &self.enable_streaming)
            .field("store", &self.store.is_some())
            .finish()
    }
}

/// Executes a root agent against fresh sessions and persists interrupted
/// runs.
pub struct Runner {
    root: FlowAgent,
    enable_streaming: bool,
    store: Option<Arc<dyn CheckPointStore>>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("root", &self.root.name())
            .field("enable_streaming", &self.enable_streaming)
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Create a runner over the configured root agent.
    #[must_use]
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            root: FlowAgent::wrap(config.agent),
            enable_streaming: config.enable_streaming,
            store: config.store,
        }
    }

    /// Start a run over the given conversation.
    ///
    /// A fresh session is created and seeded with any session values from
    /// `options`. The ambient context supplies cancellation only; an outer
    /// run's context never leaks into this run.
    pub async fn run(
        &self,
        ctx: &Context,
        messages: Vec<Message>,
        options: RunOptions,
    ) -> EventStream {
        let input = AgentInput {
            messages,
            enable_streaming: self.enable_streaming,
        };
        let run_ctx = RunContext::new(input.clone());
        let values = options.session_values();
        if !values.is_empty() {
            run_ctx.session.set_values(values).await;
        }

        let base = Context::with_cancellation(ctx.cancellation().clone());
        let ctx = base.with_run_ctx(run_ctx.clone());
        let events = self.root.run(&ctx, input, options.clone());

        match &self.store {
            None => events,
            Some(store) => observe(
                events,
                Arc::clone(store),
                base,
                run_ctx,
                options.checkpoint_id(),
            ),
        }
    }

    /// Convenience wrapper: run a single user message.
    pub async fn query(
        &self,
        ctx: &Context,
        query: impl Into<String>,
        options: RunOptions,
    ) -> EventStream {
        self.run(ctx, vec![Message::user(query)], options).await
    }

    /// Resume the run persisted under `checkpoint_id`.
    ///
    /// The checkpoint's run context is reconstructed and execution continues
    /// at the innermost suspended agent. A further interrupt is persisted
    /// under the same id (or a new one from `options`).
    pub async fn resume(
        &self,
        ctx: &Context,
        checkpoint_id: &str,
        options: RunOptions,
    ) -> Result<EventStream> {
        let store = self.store.as_ref().ok_or(Error::ResumeStoreMissing)?;
        let base = Context::with_cancellation(ctx.cancellation().clone());

        let load_span = info_span!(
            "checkpoint",
            checkpoint.id = %checkpoint_id,
            checkpoint.op = "load",
        );
        let (run_ctx, interrupt_info) = async {
            let bytes = store
                .get(&base, checkpoint_id)
                .await?
                .ok_or_else(|| Error::CheckpointNotFound {
                    id: checkpoint_id.to_owned(),
                })?;
            let checkpoint = Checkpoint::from_bytes(&bytes)?;
            Ok::<_, Error>(checkpoint.restore().await)
        }
        .instrument(load_span)
        .await?;
        debug!(checkpoint_id, path = ?run_ctx.run_path, "resuming from checkpoint");

        let events = self
            .root
            .resume_from(&base, run_ctx.clone(), interrupt_info, options.clone());
        let next_id = options
            .checkpoint_id()
            .unwrap_or_else(|| checkpoint_id.to_owned());
        Ok(observe(
            events,
            Arc::clone(store),
            base,
            run_ctx,
            Some(next_id),
        ))
    }
}

/// Forward events while tracking whether the run ended suspended; persist a
/// checkpoint when it did and a checkpoint id was supplied.
fn observe(
    mut events: EventStream,
    store: Arc<dyn CheckPointStore>,
    ctx: Context,
    run_ctx: RunContext,
    checkpoint_id: Option<String>,
) -> EventStream {
    spawn_event_producer("runner observer", move |writer| async move {
        let mut pending: Option<InterruptInfo> = None;
        while let Some(item) = events.recv().await {
            if let Ok(event) = &item {
                pending = match &event.action {
                    Some(AgentAction::Interrupted(info)) => Some((**info).clone()),
                    _ => None,
                };
            }
            if writer.send(item).await {
                return;
            }
        }

        let (Some(info), Some(id)) = (pending, checkpoint_id) else {
            return;
        };
        let interrupted = run_ctx.session.interrupted_contexts().await;
        let Some(snapshot_ctx) = interrupted.first() else {
            let event = AgentEvent::from_error(Error::MissingInterruptInfo);
            let _ = writer.send(Ok(event)).await;
            return;
        };

        let save_span = info_span!(
            "checkpoint",
            checkpoint.id = %id,
            checkpoint.op = "save",
        );
        async {
            let checkpoint = Checkpoint::capture(snapshot_ctx, info).await;
            let result = match checkpoint.to_bytes() {
                Ok(bytes) => store.set(&ctx, &id, bytes).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => debug!("checkpoint persisted"),
                Err(err) => {
                    warn!(error = %err, "failed to persist checkpoint");
                    let _ = writer.send(Ok(AgentEvent::from_error(err))).await;
                }
            }
        }
        .instrument(save_span)
        .await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::react::{ChatModelAgent, ChatModelAgentConfig};
    use crate::checkpoint::InMemoryStore;
    use crate::error::{ToolError, ToolResult};
    use crate::event::AgentOutput;
    use crate::model::MockChatModel;
    use crate::tool::{FnTool, ToolInfo, ToolsConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn collect(mut stream: EventStream) -> Vec<AgentEvent> {
        let mut events = Vec::new();
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

    #[tokio::test]
    async fn test_query_runs_root_agent() {
        let runner = Runner::new(RunnerConfig {
            agent: Arc::new(
                ChatModelAgent::new(ChatModelAgentConfig::new(
                    "A",
                    "answers",
                    MockChatModel::new(vec![Message::assistant("hello")]),
                ))
                .expect("agent"),
            ),
            enable_streaming: false,
            store: None,
        });

        let events = collect(runner.query(&Context::new(), "hi", RunOptions::new()).await).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].agent_name, "A");
        assert_eq!(content_of(&events[0]), "hello");
    }

    #[tokio::test]
    async fn test_resume_without_store_fails() {
        let runner = Runner::new(RunnerConfig {
            agent: Arc::new(
                ChatModelAgent::new(ChatModelAgentConfig::new(
                    "A",
                    "answers",
                    MockChatModel::new(vec![]),
                ))
                .expect("agent"),
            ),
            enable_streaming: false,
            store: None,
        });

        let err = runner
            .resume(&Context::new(), "ck-1", RunOptions::new())
            .await
            .expect_err("no store");
        assert_eq!(err, Error::ResumeStoreMissing);
    }

    #[tokio::test]
    async fn test_resume_unknown_checkpoint_fails() {
        let runner = Runner::new(RunnerConfig {
            agent: Arc::new(
                ChatModelAgent::new(ChatModelAgentConfig::new(
                    "A",
                    "answers",
                    MockChatModel::new(vec![]),
                ))
                .expect("agent"),
            ),
            enable_streaming: false,
            store: Some(Arc::new(InMemoryStore::new())),
        });

        let err = runner
            .resume(&Context::new(), "missing", RunOptions::new())
            .await
            .expect_err("unknown checkpoint");
        assert_eq!(
            err,
            Error::CheckpointNotFound {
                id: "missing".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn test_interrupt_persists_and_resumes_across_runner_calls() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in_tool = Arc::clone(&attempts);
        let gate = FnTool::new(
            ToolInfo::new("gate", "Pauses once.", serde_json::json!({"type": "object"})),
            move |_tctx, _args| {
                let attempts = Arc::clone(&attempts_in_tool);
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ToolError::InterruptAndRerun)
                    } else {
                        Ok::<String, ToolError>("opened".to_owned())
                    }
                }
            },
        );
        let agent = Arc::new(
            ChatModelAgent::new(
                ChatModelAgentConfig::new(
                    "A",
                    "pauses",
                    MockChatModel::new(vec![
                        Message::assistant("").with_tool_calls(vec![
                            crate::message::ToolCall::function("call-1", "gate", "{}"),
                        ]),
                        Message::assistant("finished"),
                    ]),
                )
                .with_tools(ToolsConfig::new().with_tool(gate)),
            )
            .expect("agent"),
        );
        let store = Arc::new(InMemoryStore::new());
        let runner = Runner::new(RunnerConfig {
            agent,
            enable_streaming: false,
            store: Some(Arc::clone(&store) as Arc<dyn CheckPointStore>),
        });

        let ctx = Context::new();
        let options = RunOptions::new().with(crate::agent::options::with_checkpoint_id("ck-1"));
        let events = collect(runner.query(&ctx, "go", options).await).await;
        let last = events.last().expect("events");
        assert!(last.interrupt_info().is_some());
        assert!(
            store
                .get(&ctx, "ck-1")
                .await
                .expect("store get")
                .is_some(),
            "checkpoint must be persisted under the supplied id"
        );

        let resumed = collect(
            runner
                .resume(&ctx, "ck-1", RunOptions::new())
                .await
                .expect("resume"),
        )
        .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let texts: Vec<&str> = resumed.iter().map(content_of).collect();
        assert_eq!(texts, vec!["opened", "finished"]);
    }

    #[tokio::test]
    async fn test_interrupt_without_checkpoint_id_is_not_persisted() {
        let gate = FnTool::new(
            ToolInfo::new("gate", "Always pauses.", serde_json::json!({"type": "object"})),
            |_tctx, _args| async move {
                Err::<String, ToolError>(ToolError::InterruptAndRerun)
            },
        );
        let agent = Arc::new(
            ChatModelAgent::new(
                ChatModelAgentConfig::new(
                    "A",
                    "pauses",
                    MockChatModel::new(vec![Message::assistant("").with_tool_calls(vec![
                        crate::message::ToolCall::function("call-1", "gate", "{}"),
                    ])]),
                )
                .with_tools(ToolsConfig::new().with_tool(gate)),
            )
            .expect("agent"),
        );
        let store = Arc::new(InMemoryStore::new());
        let runner = Runner::new(RunnerConfig {
            agent,
            enable_streaming: false,
            store: Some(Arc::clone(&store) as Arc<dyn CheckPointStore>),
        });

        let ctx = Context::new();
        let events = collect(runner.query(&ctx, "go", RunOptions::new()).await).await;
        // The interrupt still surfaces, but nothing is persisted.
        assert!(events.last().expect("events").interrupt_info().is_some());
    }
}
