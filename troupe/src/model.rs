//! The chat model interface consumed by reasoning agents.
//!
//! [`ChatModel`] is implemented by provider clients outside this crate; the
//! runtime only ever calls `generate`, `stream`, and `with_tools`. A
//! scripted [`MockChatModel`] ships here so agents can be driven in tests
//! without a network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::session::Context;
use crate::stream::StreamReader;
use crate::tool::ToolInfo;

/// Controls how the model may use the tools it was bound with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ToolChoice {
    /// The model decides whether to call a tool.
    #[default]
    Auto,
    /// The model must not call tools.
    None,
    /// The model must call some tool.
    Required,
    /// The model must call the named tool.
    Forced {
        /// Name of the tool the model must call.
        name: String,
    },
}

/// Options for one model call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Maximum tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Nucleus sampling parameter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Stop sequences.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    /// Tool usage constraint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    /// Provider-specific extras.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, Value>,
}

impl GenerateOptions {
    /// Create empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sampling temperature.
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the generation cap.
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Constrain tool usage.
    #[must_use]
    pub fn with_tool_choice(mut self, tool_choice: ToolChoice) -> Self {
        self.tool_choice = Some(tool_choice);
        self
    }

    /// Overlay non-empty fields of `other` onto `self`.
    #[must_use]
    pub fn merged_with(mut self, other: Self) -> Self {
        if other.temperature.is_some() {
            self.temperature = other.temperature;
        }
        if other.max_tokens.is_some() {
            self.max_tokens = other.max_tokens;
        }
        if other.top_p.is_some() {
            self.top_p = other.top_p;
        }
        if !other.stop.is_empty() {
            self.stop = other.stop;
        }
        if other.tool_choice.is_some() {
            self.tool_choice = other.tool_choice;
        }
        self.extra.extend(other.extra);
        self
    }
}

/// A chat completion model.
///
/// `stream` yields partial messages whose concatenation equals the complete
/// response; providers that cannot stream may yield a single chunk.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Generate one complete response.
    async fn generate(
        &self,
        ctx: &Context,
        messages: Vec<Message>,
        options: &GenerateOptions,
    ) -> Result<Message>;

    /// Generate a streamed response.
    async fn stream(
        &self,
        ctx: &Context,
        messages: Vec<Message>,
        options: &GenerateOptions,
    ) -> Result<StreamReader<Message>>;

    /// Return a variant of this model bound to the given tools.
    fn with_tools(self: Arc<Self>, tools: Vec<ToolInfo>) -> Result<Arc<dyn ChatModel>>;
}

/// A scripted model for tests and examples.
///
/// Responses are returned in sequence; a call past the end of the script
/// fails with a model error. Every request's messages are recorded for
/// later inspection.
#[derive(Debug, Default)]
pub struct MockChatModel {
    responses: Vec<Message>,
    cursor: AtomicUsize,
    chunk_size: Option<usize>,
    bound_tools: Mutex<Vec<ToolInfo>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl MockChatModel {
    /// Create a model that replays the given responses in order.
    #[must_use]
    pub fn new(responses: Vec<Message>) -> Arc<Self> {
        Arc::new(Self {
            responses,
            ..Self::default()
        })
    }

    /// Create a model that always answers with the same text.
    #[must_use]
    pub fn repeating(text: impl Into<String>) -> Arc<Self> {
        let text = text.into();
        Arc::new(Self {
            responses: vec![Message::assistant(text)],
            cursor: AtomicUsize::new(usize::MAX),
            ..Self::default()
        })
    }

    /// Split streamed responses into content chunks of at most `size`
    /// characters.
    #[must_use]
    pub fn with_chunk_size(mut self: Arc<Self>, size: usize) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .expect("chunk size must be set before the model is shared")
            .chunk_size = Some(size.max(1));
        self
    }

    /// How many calls the model has served.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    /// The messages of every recorded request.
    #[must_use]
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// The tools this model (or the variant chain it came from) was bound
    /// with.
    #[must_use]
    pub fn bound_tools(&self) -> Vec<ToolInfo> {
        self.bound_tools.lock().expect("tools lock").clone()
    }

    fn next_response(&self, messages: Vec<Message>) -> Result<Message> {
        self.requests.lock().expect("requests lock").push(messages);
        // A repeating script pins the cursor to usize::MAX.
        let index = self.cursor.load(Ordering::SeqCst);
        if index == usize::MAX {
            return self
                .responses
                .first()
                .cloned()
                .ok_or_else(|| Error::model("mock script is empty"));
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        self.responses
            .get(index)
            .cloned()
            .ok_or_else(|| Error::model(format!("mock script exhausted after {index} responses")))
    }
}

#[async_trait]
impl ChatModel for MockChatModel {
    async fn generate(
        &self,
        _ctx: &Context,
        messages: Vec<Message>,
        _options: &GenerateOptions,
    ) -> Result<Message> {
        self.next_response(messages)
    }

    async fn stream(
        &self,
        ctx: &Context,
        messages: Vec<Message>,
        options: &GenerateOptions,
    ) -> Result<StreamReader<Message>> {
        let response = self.generate(ctx, messages, options).await?;
        let Some(size) = self.chunk_size else {
            return Ok(StreamReader::from_iter(vec![response]));
        };

        let chars: Vec<char> = response.content.chars().collect();
        let mut chunks: Vec<Message> = chars
            .chunks(size)
            .map(|piece| Message::assistant(piece.iter().collect::<String>()))
            .collect();
        if chunks.is_empty() {
            chunks.push(Message::assistant(""));
        }
        // Tool calls and metadata ride on the final chunk.
        if let Some(last) = chunks.last_mut() {
            last.tool_calls = response.tool_calls;
            last.response_meta = response.response_meta;
        }
        Ok(StreamReader::from_iter(chunks))
    }

    fn with_tools(self: Arc<Self>, tools: Vec<ToolInfo>) -> Result<Arc<dyn ChatModel>> {
        *self.bound_tools.lock().expect("tools lock") = tools;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_replays_script_in_order() {
        let model = MockChatModel::new(vec![
            Message::assistant("first"),
            Message::assistant("second"),
        ]);
        let ctx = Context::new();
        let opts = GenerateOptions::new();

        let r1 = model.generate(&ctx, vec![], &opts).await.expect("generate");
        assert_eq!(r1.content, "first");
        let r2 = model.generate(&ctx, vec![], &opts).await.expect("generate");
        assert_eq!(r2.content, "second");
        assert!(model.generate(&ctx, vec![], &opts).await.is_err());
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_streaming_chunks_concat_to_response() {
        let model = MockChatModel::new(vec![Message::assistant("hello world")]).with_chunk_size(4);
        let ctx = Context::new();
        let stream = model
            .stream(&ctx, vec![], &GenerateOptions::new())
            .await
            .expect("stream");
        let chunks = stream.collect().await.expect("collect");
        assert!(chunks.len() > 1);
        let merged = crate::message::concat_messages(chunks).expect("concat");
        assert_eq!(merged.content, "hello world");
    }

    #[tokio::test]
    async fn test_repeating_model_never_exhausts() {
        let model = MockChatModel::repeating("iter");
        let ctx = Context::new();
        for _ in 0..5 {
            let msg = model
                .generate(&ctx, vec![], &GenerateOptions::new())
                .await
                .expect("generate");
            assert_eq!(msg.content, "iter");
        }
    }
}
