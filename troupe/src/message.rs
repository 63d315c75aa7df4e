//! Conversation message model and the chunk concatenation law.
//!
//! [`Message`] is the atomic unit of conversation between users, models, and
//! tools. Streaming model output arrives as a sequence of partial messages;
//! [`concat_messages`] folds such a sequence back into one message and is
//! used both as a public utility and inside the checkpoint codec when
//! streaming output has to be collapsed before encoding.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Role of the message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions or context for the model.
    System,
    /// Input from the end user.
    User,
    /// Output from the model.
    Assistant,
    /// Output from a tool execution.
    Tool,
}

impl Role {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A function invocation requested by the model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Name of the function to call.
    pub name: String,
    /// JSON-encoded argument string. May be empty, and during streaming may
    /// arrive in fragments that concatenate into valid JSON.
    #[serde(default)]
    pub arguments: String,
}

/// A tool call attached to an assistant message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Position of this call in a streamed response. Chunks sharing an index
    /// merge into one call; calls without an index never merge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    /// Unique identifier for this call.
    #[serde(default)]
    pub id: String,
    /// Tool call type, normally `"function"`.
    #[serde(default, rename = "type")]
    pub call_type: String,
    /// The requested function and its arguments.
    pub function: FunctionCall,
}

impl ToolCall {
    /// Create a complete (non-streaming) function call.
    #[must_use]
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            index: None,
            id: id.into(),
            call_type: "function".to_owned(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// Binary or referenced media carried by a content part.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPart {
    /// Remote location of the media.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Base64-encoded payload for inline media.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// MIME type of the payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl MediaPart {
    /// Media referenced by URL.
    #[must_use]
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            data: None,
            mime_type: None,
        }
    }

    /// Inline base64 media with its MIME type.
    #[must_use]
    pub fn base64(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            url: None,
            data: Some(data.into()),
            mime_type: Some(mime_type.into()),
        }
    }
}

/// One part of a multi-modal message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// An image.
    Image {
        /// The image payload.
        media: MediaPart,
    },
    /// An audio clip.
    Audio {
        /// The audio payload.
        media: MediaPart,
    },
    /// A video clip.
    Video {
        /// The video payload.
        media: MediaPart,
    },
    /// An arbitrary file.
    File {
        /// The file payload.
        media: MediaPart,
    },
}

impl ContentPart {
    /// A text part.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Token accounting reported by the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u64,
    /// Tokens produced by the completion.
    pub completion_tokens: u64,
    /// Total billed tokens.
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Create a usage record; the total is derived.
    #[must_use]
    pub const fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Per-field maximum of two usage records. Streamed usage counters are
    /// cumulative, so the maximum of all chunks equals the final value.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens.max(other.prompt_tokens),
            completion_tokens: self.completion_tokens.max(other.completion_tokens),
            total_tokens: self.total_tokens.max(other.total_tokens),
        }
    }
}

/// Log probability of one produced token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenLogProb {
    /// The token text.
    pub token: String,
    /// Natural log of the token probability.
    pub logprob: f64,
    /// Most likely alternatives at this position.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub top_logprobs: Vec<TopLogProb>,
}

/// One alternative token candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopLogProb {
    /// The candidate token text.
    pub token: String,
    /// Natural log of the candidate probability.
    pub logprob: f64,
}

/// Per-token log probabilities for a response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogProbs {
    /// One entry per produced token.
    pub content: Vec<TokenLogProb>,
}

/// Response-level metadata attached to assistant messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMeta {
    /// Why the model stopped generating.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub finish_reason: String,
    /// Token accounting, when reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// Token log probabilities, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<LogProbs>,
}

/// A single message in a conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who produced the message.
    pub role: Role,
    /// Optional participant name, used to distinguish multiple speakers
    /// sharing one role.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Text content.
    #[serde(default)]
    pub content: String,
    /// The model's chain-of-thought, when exposed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Multi-modal body parts. Used alongside or instead of `content`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub multi_content: Vec<ContentPart>,
    /// Tool calls requested by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For tool messages: the id of the call being answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For tool messages: the name of the tool that produced the result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Response metadata from the producing model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_meta: Option<ResponseMeta>,
    /// Provider- or application-specific extras.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, Value>,
}

impl Default for Role {
    fn default() -> Self {
        Self::User
    }
}

impl Message {
    /// Create a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            ..Self::default()
        }
    }

    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            ..Self::default()
        }
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            ..Self::default()
        }
    }

    /// Create a tool result message answering the given call id.
    #[must_use]
    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            ..Self::default()
        }
    }

    /// Attach tool calls.
    #[must_use]
    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    /// Attach a tool name.
    #[must_use]
    pub fn with_tool_name(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    /// Attach a participant name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach response metadata.
    #[must_use]
    pub fn with_response_meta(mut self, meta: ResponseMeta) -> Self {
        self.response_meta = Some(meta);
        self
    }

    /// Whether the message carries any tool calls.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Merge a sequence of same-role message chunks into one message.
///
/// Text and reasoning content concatenate in order. Tool-call chunks sharing
/// an `index` merge field by field: id, type, and name must agree whenever
/// both sides are non-empty, and argument fragments concatenate. Multi-modal
/// text runs coalesce, as do consecutive inline audio parts with the same
/// MIME type. Response metadata keeps the latest non-empty finish reason,
/// the per-field maximum of usage counters, and appended log probabilities.
///
/// Errors if the chunks disagree on role, name, or tool-call id, or if the
/// input is empty.
pub fn concat_messages(chunks: Vec<Message>) -> Result<Message> {
    let mut iter = chunks.into_iter();
    let Some(first) = iter.next() else {
        return Err(Error::concat("empty chunk sequence"));
    };

    let mut out = first;
    for chunk in iter {
        if chunk.role != out.role {
            return Err(Error::concat(format!(
                "different roles: {} vs {}",
                out.role, chunk.role
            )));
        }
        if chunk.name != out.name {
            return Err(Error::concat(format!(
                "different names: {:?} vs {:?}",
                out.name, chunk.name
            )));
        }
        if chunk.tool_call_id != out.tool_call_id {
            return Err(Error::concat(format!(
                "different tool call ids: {:?} vs {:?}",
                out.tool_call_id, chunk.tool_call_id
            )));
        }
        if out.tool_name.is_none() {
            out.tool_name = chunk.tool_name;
        }

        out.content.push_str(&chunk.content);
        if let Some(reasoning) = chunk.reasoning_content {
            out.reasoning_content
                .get_or_insert_with(String::new)
                .push_str(&reasoning);
        }

        for call in chunk.tool_calls {
            merge_tool_call(&mut out.tool_calls, call)?;
        }

        for part in chunk.multi_content {
            push_content_part(&mut out.multi_content, part);
        }

        if let Some(meta) = chunk.response_meta {
            merge_response_meta(&mut out.response_meta, meta);
        }
        out.extra.extend(chunk.extra);
    }

    out.tool_calls.sort_by_key(|c| c.index.unwrap_or(usize::MAX));
    Ok(out)
}

fn merge_tool_call(calls: &mut Vec<ToolCall>, incoming: ToolCall) -> Result<()> {
    let Some(index) = incoming.index else {
        calls.push(incoming);
        return Ok(());
    };

    let Some(position) = calls.iter().position(|c| c.index == Some(index)) else {
        calls.push(incoming);
        return Ok(());
    };

    let existing = &mut calls[position];
    merge_call_field(&mut existing.id, incoming.id, index, "id")?;
    merge_call_field(&mut existing.call_type, incoming.call_type, index, "type")?;
    merge_call_field(
        &mut existing.function.name,
        incoming.function.name,
        index,
        "name",
    )?;
    existing.function.arguments.push_str(&incoming.function.arguments);
    Ok(())
}

fn merge_call_field(existing: &mut String, incoming: String, index: usize, field: &str) -> Result<()> {
    if incoming.is_empty() {
        return Ok(());
    }
    if existing.is_empty() {
        *existing = incoming;
        return Ok(());
    }
    if *existing != incoming {
        return Err(Error::concat(format!(
            "tool call {index} has conflicting {field}: '{existing}' vs '{incoming}'"
        )));
    }
    Ok(())
}

fn push_content_part(parts: &mut Vec<ContentPart>, incoming: ContentPart) {
    match incoming {
        ContentPart::Text { text: more } => {
            if let Some(ContentPart::Text { text }) = parts.last_mut() {
                text.push_str(&more);
            } else {
                parts.push(ContentPart::Text { text: more });
            }
        }
        ContentPart::Audio { media: more } => {
            let mergeable = matches!(
                parts.last(),
                Some(ContentPart::Audio { media })
                    if media.data.is_some()
                        && more.data.is_some()
                        && media.mime_type == more.mime_type
            );
            if mergeable {
                if let (Some(ContentPart::Audio { media }), Some(extra)) =
                    (parts.last_mut(), more.data)
                {
                    if let Some(data) = media.data.as_mut() {
                        data.push_str(&extra);
                    }
                }
            } else {
                parts.push(ContentPart::Audio { media: more });
            }
        }
        part => parts.push(part),
    }
}

fn merge_response_meta(target: &mut Option<ResponseMeta>, incoming: ResponseMeta) {
    let meta = target.get_or_insert_with(ResponseMeta::default);
    if !incoming.finish_reason.is_empty() {
        meta.finish_reason = incoming.finish_reason;
    }
    if let Some(usage) = incoming.usage {
        meta.usage = Some(meta.usage.map_or(usage, |u| u.max(usage)));
    }
    if let Some(logprobs) = incoming.logprobs {
        meta.logprobs
            .get_or_insert_with(LogProbs::default)
            .content
            .extend(logprobs.content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunked_assistant(parts: &[&str]) -> Vec<Message> {
        parts.iter().map(|p| Message::assistant(*p)).collect()
    }

    #[test]
    fn test_concat_singleton_identity() {
        let msg = Message::assistant("hello").with_name("a");
        let out = concat_messages(vec![msg.clone()]).expect("concat should succeed");
        assert_eq!(out, msg);
    }

    #[test]
    fn test_concat_text_in_order() {
        let out = concat_messages(chunked_assistant(&["he", "ll", "o"]))
            .expect("concat should succeed");
        assert_eq!(out.content, "hello");
    }

    #[test]
    fn test_concat_is_associative() {
        let chunks = chunked_assistant(&["a", "b", "c"]);
        let left = concat_messages(vec![
            concat_messages(chunks[..2].to_vec()).expect("left prefix"),
            chunks[2].clone(),
        ])
        .expect("left fold");
        let right = concat_messages(vec![
            chunks[0].clone(),
            concat_messages(chunks[1..].to_vec()).expect("right suffix"),
        ])
        .expect("right fold");
        assert_eq!(left, right);
    }

    #[test]
    fn test_concat_rejects_role_mismatch() {
        let err = concat_messages(vec![Message::assistant("a"), Message::user("b")])
            .expect_err("roles conflict");
        assert!(matches!(err, Error::MessageConcat { .. }));
    }

    #[test]
    fn test_concat_rejects_tool_call_id_mismatch() {
        let err = concat_messages(vec![Message::tool("a", "call-1"), Message::tool("b", "call-2")])
            .expect_err("ids conflict");
        assert!(matches!(err, Error::MessageConcat { .. }));
    }

    #[test]
    fn test_concat_merges_indexed_tool_calls() {
        let first = Message::assistant("").with_tool_calls(vec![ToolCall {
            index: Some(0),
            id: "call-1".into(),
            call_type: "function".into(),
            function: FunctionCall {
                name: "search".into(),
                arguments: "{\"q\":".into(),
            },
        }]);
        let second = Message::assistant("").with_tool_calls(vec![ToolCall {
            index: Some(0),
            id: String::new(),
            call_type: String::new(),
            function: FunctionCall {
                name: String::new(),
                arguments: "\"rust\"}".into(),
            },
        }]);

        let out = concat_messages(vec![first, second]).expect("concat should succeed");
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].id, "call-1");
        assert_eq!(out.tool_calls[0].function.arguments, "{\"q\":\"rust\"}");
    }

    #[test]
    fn test_concat_rejects_conflicting_call_names() {
        let mk = |name: &str| {
            Message::assistant("").with_tool_calls(vec![ToolCall {
                index: Some(0),
                id: "call-1".into(),
                call_type: "function".into(),
                function: FunctionCall {
                    name: name.into(),
                    arguments: String::new(),
                },
            }])
        };
        let err = concat_messages(vec![mk("a"), mk("b")]).expect_err("names conflict");
        assert!(matches!(err, Error::MessageConcat { .. }));
    }

    #[test]
    fn test_concat_coalesces_audio_runs() {
        let mk = |data: &str| Message {
            role: Role::Assistant,
            multi_content: vec![ContentPart::Audio {
                media: MediaPart::base64(data, "audio/wav"),
            }],
            ..Message::default()
        };
        let out = concat_messages(vec![mk("AAAA"), mk("BBBB")]).expect("concat should succeed");
        assert_eq!(out.multi_content.len(), 1);
        let ContentPart::Audio { media } = &out.multi_content[0] else {
            panic!("expected audio part");
        };
        assert_eq!(media.data.as_deref(), Some("AAAABBBB"));
    }

    #[test]
    fn test_concat_meta_keeps_latest_finish_reason_and_max_usage() {
        let mut first = Message::assistant("a");
        first.response_meta = Some(ResponseMeta {
            finish_reason: String::new(),
            usage: Some(TokenUsage::new(10, 1)),
            logprobs: None,
        });
        let mut second = Message::assistant("b");
        second.response_meta = Some(ResponseMeta {
            finish_reason: "stop".into(),
            usage: Some(TokenUsage::new(10, 7)),
            logprobs: None,
        });

        let out = concat_messages(vec![first, second]).expect("concat should succeed");
        let meta = out.response_meta.expect("meta present");
        assert_eq!(meta.finish_reason, "stop");
        assert_eq!(meta.usage, Some(TokenUsage::new(10, 7)));
    }

    #[test]
    fn test_concat_empty_is_error() {
        assert!(concat_messages(Vec::new()).is_err());
    }
}
