//! Composable, optionally agent-scoped run options.
//!
//! Callers hand a [`RunOptions`] bag to [`Agent::run`](super::Agent::run).
//! Each [`RunOption`] may be scoped to named agents via
//! [`RunOption::designate_agent`]; when the flow layer forwards options to a
//! sub-agent it keeps those with no scope or with the sub-agent's name in
//! their scope.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::message::Message;
use crate::model::GenerateOptions;

/// Rewrites the rebuilt history before an agent acts on it.
pub type HistoryModifier = Arc<dyn Fn(Vec<Message>) -> Vec<Message> + Send + Sync>;

/// One typed run option.
#[derive(Clone)]
pub struct RunOption {
    designated: Option<Vec<String>>,
    kind: RunOptionKind,
}

#[derive(Clone)]
enum RunOptionKind {
    SessionValues(HashMap<String, Value>),
    CheckpointId(String),
    SkipTransferMessages,
    Model(GenerateOptions),
    ToolParams {
        tool_name: String,
        params: Value,
    },
    AgentToolOptions {
        agent_name: String,
        options: Box<RunOptions>,
    },
    HistoryModifier(HistoryModifier),
}

impl std::fmt::Debug for RunOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            RunOptionKind::SessionValues(_) => "SessionValues",
            RunOptionKind::CheckpointId(_) => "CheckpointId",
            RunOptionKind::SkipTransferMessages => "SkipTransferMessages",
            RunOptionKind::Model(_) => "Model",
            RunOptionKind::ToolParams { .. } => "ToolParams",
            RunOptionKind::AgentToolOptions { .. } => "AgentToolOptions",
            RunOptionKind::HistoryModifier(_) => "HistoryModifier",
        };
        f.debug_struct("RunOption")
            .field("designated", &self.designated)
            .field("kind", &kind)
            .finish()
    }
}

impl RunOption {
    const fn new(kind: RunOptionKind) -> Self {
        Self {
            designated: None,
            kind,
        }
    }

    /// Scope this option to the named agents. Unscoped options apply
    /// everywhere.
    #[must_use]
    pub fn designate_agent<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.designated = Some(names.into_iter().map(Into::into).collect());
        self
    }

    fn applies_to(&self, agent_name: &str) -> bool {
        match &self.designated {
            None => true,
            Some(names) => names.iter().any(|n| n == agent_name),
        }
    }
}

/// Seed the session's key/value map before the run starts.
#[must_use]
pub fn with_session_values(values: HashMap<String, Value>) -> RunOption {
    RunOption::new(RunOptionKind::SessionValues(values))
}

/// Persist a checkpoint under this id if the run interrupts.
#[must_use]
pub fn with_checkpoint_id(id: impl Into<String>) -> RunOption {
    RunOption::new(RunOptionKind::CheckpointId(id.into()))
}

/// Drop synthesized transfer messages when rebuilding an agent's history.
#[must_use]
pub fn with_skip_transfer_messages() -> RunOption {
    RunOption::new(RunOptionKind::SkipTransferMessages)
}

/// Overlay options onto every chat model call.
#[must_use]
pub fn with_model_options(options: GenerateOptions) -> RunOption {
    RunOption::new(RunOptionKind::Model(options))
}

/// Pass parameters to the named tool, readable through its call context.
#[must_use]
pub fn with_tool_params(tool_name: impl Into<String>, params: Value) -> RunOption {
    RunOption::new(RunOptionKind::ToolParams {
        tool_name: tool_name.into(),
        params,
    })
}

/// Forward run options to the inner agent of the named agent-tool.
#[must_use]
pub fn with_agent_tool_options(agent_name: impl Into<String>, options: RunOptions) -> RunOption {
    RunOption::new(RunOptionKind::AgentToolOptions {
        agent_name: agent_name.into(),
        options: Box::new(options),
    })
}

/// Rewrite the rebuilt history before the agent acts on it.
#[must_use]
pub fn with_history_modifier<F>(modifier: F) -> RunOption
where
    F: Fn(Vec<Message>) -> Vec<Message> + Send + Sync + 'static,
{
    RunOption::new(RunOptionKind::HistoryModifier(Arc::new(modifier)))
}

/// An ordered bag of run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    options: Vec<RunOption>,
}

impl RunOptions {
    /// Create an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one option.
    #[must_use]
    pub fn with(mut self, option: RunOption) -> Self {
        self.options.push(option);
        self
    }

    /// Append every option from `other`.
    #[must_use]
    pub fn merged_with(mut self, other: Self) -> Self {
        self.options.extend(other.options);
        self
    }

    /// Whether the bag is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// The options applicable to the named agent, scopes included.
    #[must_use]
    pub fn filter_for(&self, agent_name: &str) -> Self {
        Self {
            options: self
                .options
                .iter()
                .filter(|o| o.applies_to(agent_name))
                .cloned()
                .collect(),
        }
    }

    /// All session values to seed, later options overriding earlier ones.
    #[must_use]
    pub fn session_values(&self) -> HashMap<String, Value> {
        let mut merged = HashMap::new();
        for option in &self.options {
            if let RunOptionKind::SessionValues(values) = &option.kind {
                merged.extend(values.clone());
            }
        }
        merged
    }

    /// The checkpoint id to persist under, when one was supplied.
    #[must_use]
    pub fn checkpoint_id(&self) -> Option<String> {
        self.options.iter().rev().find_map(|o| match &o.kind {
            RunOptionKind::CheckpointId(id) => Some(id.clone()),
            _ => None,
        })
    }

    /// Whether transfer messages should be skipped during history rebuild.
    #[must_use]
    pub fn skip_transfer_messages(&self) -> bool {
        self.options
            .iter()
            .any(|o| matches!(o.kind, RunOptionKind::SkipTransferMessages))
    }

    /// Chat model options, merged in bag order.
    #[must_use]
    pub fn model_options(&self) -> Option<GenerateOptions> {
        let mut merged: Option<GenerateOptions> = None;
        for option in &self.options {
            if let RunOptionKind::Model(opts) = &option.kind {
                merged = Some(match merged {
                    Some(acc) => acc.merged_with(opts.clone()),
                    None => opts.clone(),
                });
            }
        }
        merged
    }

    /// Parameters for the named tool, when supplied. The last write wins.
    #[must_use]
    pub fn tool_params(&self, tool_name: &str) -> Option<Value> {
        self.options.iter().rev().find_map(|o| match &o.kind {
            RunOptionKind::ToolParams {
                tool_name: name,
                params,
            } if name == tool_name => Some(params.clone()),
            _ => None,
        })
    }

    /// Options to forward to the inner agent of the named agent-tool.
    #[must_use]
    pub fn agent_tool_options(&self, agent_name: &str) -> Option<Self> {
        self.options.iter().rev().find_map(|o| match &o.kind {
            RunOptionKind::AgentToolOptions {
                agent_name: name,
                options,
            } if name == agent_name => Some((**options).clone()),
            _ => None,
        })
    }

    /// The history modifier, when supplied. The last write wins.
    #[must_use]
    pub fn history_modifier(&self) -> Option<HistoryModifier> {
        self.options.iter().rev().find_map(|o| match &o.kind {
            RunOptionKind::HistoryModifier(f) => Some(Arc::clone(f)),
            _ => None,
        })
    }
}

impl FromIterator<RunOption> for RunOptions {
    fn from_iter<I: IntoIterator<Item = RunOption>>(iter: I) -> Self {
        Self {
            options: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_designation_filters_options() {
        let options = RunOptions::new()
            .with(with_checkpoint_id("everyone"))
            .with(with_tool_params("t", Value::Null).designate_agent(["a"]));

        let for_a = options.filter_for("a");
        assert_eq!(for_a.checkpoint_id(), Some("everyone".to_owned()));
        assert!(for_a.tool_params("t").is_some());

        let for_b = options.filter_for("b");
        assert_eq!(for_b.checkpoint_id(), Some("everyone".to_owned()));
        assert!(for_b.tool_params("t").is_none());
    }

    #[test]
    fn test_model_options_merge_in_order() {
        let options = RunOptions::new()
            .with(with_model_options(
                GenerateOptions::new().with_temperature(0.2).with_max_tokens(10),
            ))
            .with(with_model_options(GenerateOptions::new().with_temperature(0.9)));

        let merged = options.model_options().expect("merged");
        assert_eq!(merged.temperature, Some(0.9));
        assert_eq!(merged.max_tokens, Some(10));
    }

    #[test]
    fn test_session_values_later_wins() {
        let mut first = HashMap::new();
        first.insert("k".to_owned(), Value::from(1));
        let mut second = HashMap::new();
        second.insert("k".to_owned(), Value::from(2));

        let options = RunOptions::new()
            .with(with_session_values(first))
            .with(with_session_values(second));
        assert_eq!(options.session_values().get("k"), Some(&Value::from(2)));
    }

    #[test]
    fn test_agent_tool_options_unwrap() {
        let inner = RunOptions::new().with(with_checkpoint_id("inner-ck"));
        let options = RunOptions::new().with(with_agent_tool_options("helper", inner));

        let forwarded = options.agent_tool_options("helper").expect("forwarded");
        assert_eq!(forwarded.checkpoint_id(), Some("inner-ck".to_owned()));
        assert!(options.agent_tool_options("other").is_none());
    }
}
