//! The tool interface consumed by reasoning agents.
//!
//! Concrete tools live outside this crate; the runtime calls them through
//! [`Tool`] with a [`ToolContext`] that carries the ambient context, the
//! current call id, the enclosing agent's message history, and a persisted
//! state slot that survives interrupt/resume cycles. Per-call
//! [`ToolCallMiddleware`] wraps every execution in registration order.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::agent::options::RunOptions;
use crate::error::{ToolError, ToolResult};
use crate::message::Message;
use crate::session::Context;
use crate::stream::StreamReader;

/// Descriptor of a tool, as presented to the chat model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    /// Tool name, unique within one agent.
    pub name: String,
    /// What the tool does; guides the model's tool selection.
    pub description: String,
    /// JSON schema of the argument object.
    pub parameters: Value,
}

impl ToolInfo {
    /// Create a descriptor from an explicit schema.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Create a descriptor whose schema is derived from an argument type.
    #[must_use]
    pub fn for_args<T: JsonSchema>(
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let schema = schemars::schema_for!(T);
        let parameters = serde_json::to_value(schema).unwrap_or(Value::Null);
        Self::new(name, description, parameters)
    }
}

/// Per-call state that survives interrupts.
///
/// Values written here are captured into the enclosing agent's interrupt
/// payload and restored on resume, keyed however the writer chooses
/// (adapters key by tool-call id).
#[derive(Debug, Clone, Default)]
pub struct ToolState {
    entries: Arc<Mutex<HashMap<String, Value>>>,
}

impl ToolState {
    /// Create an empty state slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a state slot from persisted entries.
    #[must_use]
    pub fn from_entries(entries: HashMap<String, Value>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(entries)),
        }
    }

    /// Read one entry.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Write one entry.
    pub async fn set(&self, key: impl Into<String>, value: Value) {
        self.entries.lock().await.insert(key.into(), value);
    }

    /// Remove one entry.
    pub async fn remove(&self, key: &str) -> Option<Value> {
        self.entries.lock().await.remove(key)
    }

    /// Snapshot all entries, for interrupt capture.
    pub async fn snapshot(&self) -> HashMap<String, Value> {
        self.entries.lock().await.clone()
    }
}

/// Everything a tool can see about the call it is serving.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// The ambient context; tools observe its cancellation token.
    pub context: Context,
    /// Name of the agent invoking the tool.
    pub agent_name: String,
    /// Id of the tool call being served.
    pub call_id: String,
    /// Whether the caller wants streamed output.
    pub enable_streaming: bool,
    /// The invoking agent's message history at call time, ending with the
    /// assistant message that requested this call.
    pub history: Arc<Vec<Message>>,
    /// Persisted per-call state.
    pub state: ToolState,
    /// Run options forwarded by the invoking agent, already filtered to it.
    pub options: RunOptions,
}

/// A capability an agent can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The descriptor presented to the model.
    fn info(&self) -> ToolInfo;

    /// Execute with a JSON-encoded argument string, returning the complete
    /// result.
    async fn invokable_run(&self, tctx: &ToolContext, args: &str) -> ToolResult<String>;

    /// Execute with streamed output. The default adapts [`Tool::invokable_run`]
    /// into a single-chunk stream.
    async fn streamable_run(
        &self,
        tctx: &ToolContext,
        args: &str,
    ) -> ToolResult<StreamReader<String>> {
        let out = self.invokable_run(tctx, args).await?;
        Ok(StreamReader::from_iter(vec![out]))
    }
}

/// Ordered wrapper around every tool call an agent makes.
///
/// `before_call` hooks fire in registration order and may rewrite the
/// argument string or veto the call; `after_call` hooks fire in reverse
/// order and may rewrite the result.
#[async_trait]
pub trait ToolCallMiddleware: Send + Sync {
    /// Runs before the tool executes.
    async fn before_call(
        &self,
        _tctx: &ToolContext,
        _tool_name: &str,
        _args: &mut String,
    ) -> ToolResult<()> {
        Ok(())
    }

    /// Runs after the tool executes.
    async fn after_call(
        &self,
        _tctx: &ToolContext,
        _tool_name: &str,
        _result: &mut ToolResult<String>,
    ) {
    }
}

/// The tool set and middleware chain of one agent.
#[derive(Clone, Default)]
pub struct ToolsConfig {
    /// Tools available to the agent.
    pub tools: Vec<Arc<dyn Tool>>,
    /// Middleware applied to every call.
    pub middleware: Vec<Arc<dyn ToolCallMiddleware>>,
}

impl std::fmt::Debug for ToolsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolsConfig")
            .field(
                "tools",
                &self.tools.iter().map(|t| t.info().name).collect::<Vec<_>>(),
            )
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

impl ToolsConfig {
    /// Create an empty config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool.
    #[must_use]
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Add a middleware.
    #[must_use]
    pub fn with_middleware(mut self, middleware: Arc<dyn ToolCallMiddleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Look up a tool by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.info().name == name).cloned()
    }

    /// Descriptors of every tool, in registration order.
    #[must_use]
    pub fn infos(&self) -> Vec<ToolInfo> {
        self.tools.iter().map(|t| t.info()).collect()
    }

    /// Run `tool` through the middleware chain.
    pub async fn call(
        &self,
        tool: &dyn Tool,
        tctx: &ToolContext,
        args: String,
    ) -> ToolResult<String> {
        let name = tool.info().name;
        let mut args = args;
        for mw in &self.middleware {
            mw.before_call(tctx, &name, &mut args).await?;
        }
        let mut result = tool.invokable_run(tctx, &args).await;
        for mw in self.middleware.iter().rev() {
            mw.after_call(tctx, &name, &mut result).await;
        }
        result
    }
}

type ToolHandler =
    dyn Fn(ToolContext, String) -> BoxFuture<'static, ToolResult<String>> + Send + Sync;

/// A tool built from a closure.
pub struct FnTool {
    info: ToolInfo,
    handler: Box<ToolHandler>,
}

impl std::fmt::Debug for FnTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTool").field("info", &self.info).finish()
    }
}

impl FnTool {
    /// Wrap an async closure as a tool.
    pub fn new<F, Fut>(info: ToolInfo, handler: F) -> Arc<Self>
    where
        F: Fn(ToolContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ToolResult<String>> + Send + 'static,
    {
        Arc::new(Self {
            info,
            handler: Box::new(move |tctx, args| Box::pin(handler(tctx, args))),
        })
    }
}

#[async_trait]
impl Tool for FnTool {
    fn info(&self) -> ToolInfo {
        self.info.clone()
    }

    async fn invokable_run(&self, tctx: &ToolContext, args: &str) -> ToolResult<String> {
        (self.handler)(tctx.clone(), args.to_owned()).await
    }
}

/// Parse a tool's JSON argument string into a typed value.
pub fn parse_args<T: for<'de> Deserialize<'de>>(args: &str) -> ToolResult<T> {
    let trimmed = args.trim();
    let source = if trimmed.is_empty() { "{}" } else { trimmed };
    serde_json::from_str(source).map_err(ToolError::from)
}
