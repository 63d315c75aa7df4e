//! Per-run shared state: the session, run contexts, and the ambient context.
//!
//! One [`Session`] is shared by every agent participating in a run. It holds
//! the ordered event log, a key/value map for inter-agent hand-offs, and the
//! list of run contexts that are currently suspended. Each agent sees its own
//! cloned [`RunContext`] (run path extended with its step) but the same
//! session behind an `Arc`.
//!
//! The ambient [`Context`] is the sole cancellation channel; every
//! suspension point in the crate observes its token.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentInput;
use crate::event::{RunStep, SessionEvent, path_starts_with};

/// Shared per-run store: event log, values, and interrupted contexts.
#[derive(Debug, Default)]
pub struct Session {
    state: Mutex<SessionState>,
}

#[derive(Debug, Default)]
struct SessionState {
    events: Vec<SessionEvent>,
    values: HashMap<String, Value>,
    interrupted: Vec<RunContext>,
}

impl Session {
    /// Create an empty session.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append one event to the log. Append order equals the order events
    /// are emitted downstream.
    pub async fn append_event(&self, event: SessionEvent) {
        self.state.lock().await.events.push(event);
    }

    /// A snapshot of the event log.
    pub async fn events(&self) -> Vec<SessionEvent> {
        self.state.lock().await.events.clone()
    }

    /// Store a session value.
    pub async fn set_value(&self, key: impl Into<String>, value: Value) {
        self.state.lock().await.values.insert(key.into(), value);
    }

    /// Store many session values at once.
    pub async fn set_values(&self, values: HashMap<String, Value>) {
        self.state.lock().await.values.extend(values);
    }

    /// Read one session value.
    pub async fn get_value(&self, key: &str) -> Option<Value> {
        self.state.lock().await.values.get(key).cloned()
    }

    /// A snapshot of all session values.
    pub async fn values(&self) -> HashMap<String, Value> {
        self.state.lock().await.values.clone()
    }

    /// Record a suspended run context, replacing any previously recorded
    /// context whose path extends the new one. Ensures resume dispatches
    /// from the outermost agent that owns the interrupt.
    pub async fn record_interrupted(&self, ctx: RunContext) {
        let mut state = self.state.lock().await;
        state
            .interrupted
            .retain(|existing| !path_starts_with(&existing.run_path, &ctx.run_path));
        state.interrupted.push(ctx);
    }

    /// A snapshot of the suspended run contexts.
    pub async fn interrupted_contexts(&self) -> Vec<RunContext> {
        self.state.lock().await.interrupted.clone()
    }

    /// Drop all recorded suspended contexts.
    pub async fn clear_interrupted(&self) {
        self.state.lock().await.interrupted.clear();
    }
}

/// The execution context of one agent within a run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// The input the root agent was started with.
    pub root_input: AgentInput,
    /// Route from the root to the agent owning this context.
    pub run_path: Vec<RunStep>,
    /// The session shared by the whole run.
    pub session: Arc<Session>,
}

impl RunContext {
    /// A fresh root-less context over a new session.
    #[must_use]
    pub fn new(root_input: AgentInput) -> Self {
        Self {
            root_input,
            run_path: Vec::new(),
            session: Session::new(),
        }
    }

    /// Clone this context for a sub-agent, appending its step to the path.
    #[must_use]
    pub fn descend(&self, agent_name: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.run_path.push(RunStep::new(agent_name));
        next
    }

    /// Whether this context belongs to the root agent.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.run_path.len() == 1
    }
}

/// The ambient context threaded through every operation.
///
/// Carries the cancellation token and, below the runner, the current
/// [`RunContext`].
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancellation: CancellationToken,
    run_ctx: Option<RunContext>,
}

impl Context {
    /// A fresh context with its own cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A context observing the given cancellation token.
    #[must_use]
    pub fn with_cancellation(cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            run_ctx: None,
        }
    }

    /// The cancellation token every suspension point observes.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the run has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// The current run context, when executing under a runner.
    #[must_use]
    pub fn run_ctx(&self) -> Option<&RunContext> {
        self.run_ctx.as_ref()
    }

    /// Derive a context carrying the given run context.
    #[must_use]
    pub fn with_run_ctx(&self, run_ctx: RunContext) -> Self {
        Self {
            cancellation: self.cancellation.clone(),
            run_ctx: Some(run_ctx),
        }
    }
}

/// Read a session value through the ambient context.
///
/// Returns `None` outside a run or when the key is absent.
pub async fn get_session_value(ctx: &Context, key: &str) -> Option<Value> {
    match ctx.run_ctx() {
        Some(run_ctx) => run_ctx.session.get_value(key).await,
        None => None,
    }
}

/// Write a session value through the ambient context.
///
/// No-op outside a run. Values written here are visible to every agent in
/// the same run.
pub async fn add_session_value(ctx: &Context, key: impl Into<String>, value: Value) {
    if let Some(run_ctx) = ctx.run_ctx() {
        run_ctx.session.set_value(key, value).await;
    }
}
