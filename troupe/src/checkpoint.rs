//! Checkpoint persistence: durable suspension and resumption of runs.
//!
//! A checkpoint is the serialized tuple of a run's context (root input, run
//! path, session contents) and the interrupt payload describing where
//! execution stopped. Storage is delegated to a caller-supplied
//! [`CheckPointStore`]; the crate ships a concurrency-safe [`InMemoryStore`]
//! and the codec itself.
//!
//! Encoding collapses any streaming message output into its concatenated
//! message; decoding re-wraps such messages as single-element streams, so a
//! resumed consumer sees the same shapes it would have seen live.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::agent::AgentInput;
use crate::error::Result;
use crate::event::{RunStep, SessionEvent};
use crate::interrupt::InterruptInfo;
use crate::session::{Context, RunContext, Session};

/// Durable byte storage for checkpoints.
///
/// Implementations must be safe for concurrent callers.
#[async_trait]
pub trait CheckPointStore: Send + Sync {
    /// Fetch the bytes stored under `id`, if any.
    async fn get(&self, ctx: &Context, id: &str) -> Result<Option<Vec<u8>>>;

    /// Store `bytes` under `id`, replacing any previous value.
    async fn set(&self, ctx: &Context, id: &str, bytes: Vec<u8>) -> Result<()>;
}

/// A process-local checkpoint store backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckPointStore for InMemoryStore {
    async fn get(&self, _ctx: &Context, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(id).cloned())
    }

    async fn set(&self, _ctx: &Context, id: &str, bytes: Vec<u8>) -> Result<()> {
        self.entries.write().await.insert(id.to_owned(), bytes);
        Ok(())
    }
}

/// The serialized form of a suspended run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The input the root agent was started with.
    pub root_input: AgentInput,
    /// Run path of the suspended context.
    pub run_path: Vec<RunStep>,
    /// The session event log at suspension time.
    pub events: Vec<SessionEvent>,
    /// The session values at suspension time.
    pub values: HashMap<String, Value>,
    /// Run paths of every suspended context recorded in the session.
    pub interrupted_paths: Vec<Vec<RunStep>>,
    /// The interrupt payload describing where to resume.
    pub interrupt_info: InterruptInfo,
}

impl Checkpoint {
    /// Capture a suspended run context and its interrupt payload.
    pub async fn capture(run_ctx: &RunContext, interrupt_info: InterruptInfo) -> Self {
        let events = run_ctx.session.events().await;
        let values = run_ctx.session.values().await;
        let interrupted_paths = run_ctx
            .session
            .interrupted_contexts()
            .await
            .into_iter()
            .map(|ctx| ctx.run_path)
            .collect();
        Self {
            root_input: run_ctx.root_input.clone(),
            run_path: run_ctx.run_path.clone(),
            events,
            values,
            interrupted_paths,
            interrupt_info,
        }
    }

    /// Rebuild a live run context over a fresh session, plus the interrupt
    /// payload to resume from.
    pub async fn restore(self) -> (RunContext, InterruptInfo) {
        let session = Session::new();
        for event in self.events {
            session.append_event(event).await;
        }
        session.set_values(self.values).await;

        let run_ctx = RunContext {
            root_input: self.root_input,
            run_path: self.run_path,
            session: Arc::clone(&session),
        };
        for path in self.interrupted_paths {
            session
                .record_interrupted(RunContext {
                    root_input: run_ctx.root_input.clone(),
                    run_path: path,
                    session: Arc::clone(&session),
                })
                .await;
        }
        (run_ctx, self.interrupt_info)
    }

    /// Encode to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::InterruptData;
    use crate::message::Message;

    fn sample_interrupt() -> InterruptInfo {
        InterruptInfo::new(InterruptData::Custom {
            name: "test.pause".to_owned(),
            payload: serde_json::json!({"step": 2}),
        })
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let run_ctx = RunContext::new(AgentInput::new(vec![Message::user("hi")])).descend("root");
        run_ctx
            .session
            .append_event(SessionEvent {
                agent_name: "root".to_owned(),
                run_path: run_ctx.run_path.clone(),
                message: Some(Message::assistant("partial")),
                streamed: true,
                ..SessionEvent::default()
            })
            .await;
        run_ctx
            .session
            .set_value("k", Value::String("v".into()))
            .await;
        run_ctx.session.record_interrupted(run_ctx.clone()).await;

        let checkpoint = Checkpoint::capture(&run_ctx, sample_interrupt()).await;
        let bytes = checkpoint.to_bytes().expect("encode");
        let decoded = Checkpoint::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded, checkpoint);

        let (restored, info) = decoded.restore().await;
        assert_eq!(info, sample_interrupt());
        assert_eq!(restored.run_path, run_ctx.run_path);
        assert_eq!(restored.root_input.messages[0].content, "hi");
        assert_eq!(
            restored.session.get_value("k").await,
            Some(Value::String("v".into()))
        );
        let events = restored.session.events().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].streamed);
        let interrupted = restored.session.interrupted_contexts().await;
        assert_eq!(interrupted.len(), 1);
        assert_eq!(interrupted[0].run_path, run_ctx.run_path);
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryStore::new();
        let ctx = Context::new();
        assert_eq!(store.get(&ctx, "missing").await.expect("get"), None);
        store.set(&ctx, "id", vec![1, 2, 3]).await.expect("set");
        assert_eq!(
            store.get(&ctx, "id").await.expect("get"),
            Some(vec![1, 2, 3])
        );
    }
}
