// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::policy::ApprovalPolicy;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim).
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub args: Value,
}

/// A single content item in a rich tool output.
///
/// Most tools produce only `Text`. Vision-capable tools may produce a mix of
/// `Text` and `Image` items.
#[derive(Debug, Clone)]
pub enum ToolOutputPart {
    /// Plain UTF-8 text.
    Text(String),
    /// Base64 data URL: `data:<mime>;base64,<b64>`.
    Image(String),
}

/// The result of executing a tool.
///
/// `content` is always the plain-text representation of the output (the
/// concatenation of all `Text` parts); `parts` carries the richer structure
/// when a tool returns images alongside text.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    pub parts: Vec<ToolOutputPart>,
    /// If true, the tool execution failed non-fatally (returned error message).
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let text = content.into();
        Self { call_id: call_id.into(), content: text.clone(), parts: vec![ToolOutputPart::Text(text)], is_error: false }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        let text = msg.into();
        Self { call_id: call_id.into(), content: text.clone(), parts: vec![ToolOutputPart::Text(text)], is_error: true }
    }

    pub fn with_parts(call_id: impl Into<String>, parts: Vec<ToolOutputPart>) -> Self {
        let text = parts
            .iter()
            .filter_map(|p| match p {
                ToolOutputPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        Self { call_id: call_id.into(), content: text, parts, is_error: false }
    }

    pub fn has_images(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, ToolOutputPart::Image(_)))
    }
}

/// Describes the shape of a tool's text output for context-aware truncation.
///
/// When a tool result exceeds the configured token cap, `opal-core` uses
/// this category to pick the right extraction strategy instead of hard-coding
/// tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Terminal / process output: keep the first 60 + last 40 lines so both
    /// the command preamble and the final result are visible.
    HeadTail,
    /// Ordered match list: keep the leading matches so the model sees the
    /// highest-relevance results first.
    MatchList,
    /// File content: keep a head and tail window with a separator.
    FileContent,
    /// Generic text: hard-truncate at the character boundary.
    #[default]
    Generic,
}

/// A question a tool needs answered by the human operator (or the parent
/// agent, for a sub-agent) before it can proceed.
#[derive(Debug, Clone)]
pub struct Question {
    pub prompt: String,
    pub choices: Vec<String>,
}

/// Relays a tool's question to whoever can answer it.
///
/// `opal-core` implements this for the top-level agent (relaying to the RPC
/// client via `client/input`) and for a sub-agent (relaying to its parent's
/// own handler), so `opal-tools` never depends on either.
#[async_trait]
pub trait QuestionHandler: Send + Sync {
    async fn ask(&self, question: Question) -> anyhow::Result<String>;
}

/// The slice of agent state a tool may need to make a policy decision —
/// currently just the sub-agent nesting depth and whether sub-agents are
/// enabled at all, which the `sub_agent` tool uses to refuse recursion past
/// depth 1 without depending on `opal-core` directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentStateRef {
    /// Number of sub-agent levels already above this tool call. The
    /// top-level agent runs at depth 0.
    pub depth: u32,
    pub sub_agents_enabled: bool,
}

/// Everything a tool needs beyond its own parsed arguments: where it runs,
/// which turn it belongs to, how to report progress, and how to ask a
/// question if it must block for one.
pub struct ToolContext {
    pub working_dir: PathBuf,
    pub session_id: String,
    pub call_id: String,
    /// Progress notifications a long-running tool can emit before returning
    /// its final `ToolOutput` (e.g. partial shell output).
    pub emit: mpsc::UnboundedSender<ToolOutputPart>,
    pub question_handler: Arc<dyn QuestionHandler>,
    pub agent_state: AgentStateRef,
}

/// Trait that every built-in and user-defined tool must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters.
    fn parameters_schema(&self) -> Value;
    /// Default approval level for this tool.
    fn default_policy(&self) -> ApprovalPolicy;
    /// Describes the shape of this tool's output for context-aware truncation.
    ///
    /// Override when a tool's leading or trailing output is more useful than
    /// a hard cut. Default is [`OutputCategory::Generic`].
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }
    /// Opaque metadata describing this invocation before it runs, forwarded
    /// verbatim on the `tool_execution_start` event (e.g. a file path or
    /// command string the client can render before the result arrives).
    /// Default is no metadata.
    fn meta(&self, _args: &Value) -> Value {
        Value::Null
    }
    /// Execute the tool. Errors should be wrapped in [`ToolOutput::err`].
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::policy::ApprovalPolicy;

    fn test_ctx() -> ToolContext {
        let (tx, _rx) = mpsc::unbounded_channel();
        struct NoopHandler;
        #[async_trait]
        impl QuestionHandler for NoopHandler {
            async fn ask(&self, _q: Question) -> anyhow::Result<String> {
                Ok(String::new())
            }
        }
        ToolContext {
            working_dir: std::env::temp_dir(),
            session_id: "s1".into(),
            call_id: "c1".into(),
            emit: tx,
            question_handler: Arc::new(NoopHandler),
            agent_state: AgentStateRef::default(),
        }
    }

    #[test]
    fn output_category_default_is_generic() {
        assert_eq!(OutputCategory::default(), OutputCategory::Generic);
    }

    #[test]
    fn output_category_variants_are_distinct() {
        assert_ne!(OutputCategory::HeadTail, OutputCategory::MatchList);
        assert_ne!(OutputCategory::HeadTail, OutputCategory::FileContent);
        assert_ne!(OutputCategory::HeadTail, OutputCategory::Generic);
        assert_ne!(OutputCategory::MatchList, OutputCategory::FileContent);
        assert_ne!(OutputCategory::MatchList, OutputCategory::Generic);
        assert_ne!(OutputCategory::FileContent, OutputCategory::Generic);
    }

    #[test]
    fn output_category_copy_semantics() {
        let a = OutputCategory::HeadTail;
        let b = a;
        assert_eq!(a, b);
    }

    struct MinimalTool;

    #[async_trait]
    impl Tool for MinimalTool {
        fn name(&self) -> &str {
            "minimal"
        }
        fn description(&self) -> &str {
            "a minimal tool"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn default_policy(&self) -> ApprovalPolicy {
            ApprovalPolicy::Auto
        }
        async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolOutput {
            ToolOutput::ok(&call.id, "ok")
        }
    }

    #[test]
    fn tool_default_output_category_is_generic() {
        assert_eq!(MinimalTool.output_category(), OutputCategory::Generic);
    }

    struct HeadTailTool;

    #[async_trait]
    impl Tool for HeadTailTool {
        fn name(&self) -> &str {
            "ht"
        }
        fn description(&self) -> &str {
            "produces terminal output"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn default_policy(&self) -> ApprovalPolicy {
            ApprovalPolicy::Auto
        }
        fn output_category(&self) -> OutputCategory {
            OutputCategory::HeadTail
        }
        async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolOutput {
            ToolOutput::ok(&call.id, "ok")
        }
    }

    #[test]
    fn tool_can_override_output_category() {
        assert_eq!(HeadTailTool.output_category(), OutputCategory::HeadTail);
    }

    #[test]
    fn tool_default_meta_is_null() {
        assert_eq!(MinimalTool.meta(&json!({})), Value::Null);
    }

    #[test]
    fn agent_state_ref_default_is_depth_zero_disabled() {
        let state = AgentStateRef::default();
        assert_eq!(state.depth, 0);
        assert!(!state.sub_agents_enabled);
    }

    #[tokio::test]
    async fn minimal_tool_executes_with_context() {
        let call = ToolCall { id: "1".into(), name: "minimal".into(), args: json!({}) };
        let out = MinimalTool.execute(&call, &test_ctx()).await;
        assert!(!out.is_error);
    }
}
