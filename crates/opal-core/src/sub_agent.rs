// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The `sub_agent` tool delegates a self-contained subtask to a depth+1
//! child agent with a constrained tool subset, forwarding every child event
//! onto the parent's bus wrapped in [`AgentEvent::SubAgentEvent`].
//!
//! Lives in `opal-core` rather than `opal-tools` because it must construct a
//! child [`Agent`] — `opal-tools` has no dependency on this crate, and the
//! dependency runs the other way.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opal_bus::EventBus;
use opal_config::AgentConfig;
use opal_model::ModelProvider;
use opal_tools::{
    ApprovalPolicy, Question, QuestionHandler, Tool, ToolCall, ToolContext, ToolOutput,
    ToolRegistry,
};
use serde_json::Value;
use uuid::Uuid;

use crate::agent::{Agent, AutoApprove};
use crate::events::{AgentEvent, ToolResult};
use crate::runtime_context::AgentRuntimeContext;

/// Bound on a sub-agent's entire collection loop: if no event — including
/// `agent_end` — arrives within this window the parent gives up and reports
/// a timeout.
const SUB_AGENT_TIMEOUT: Duration = Duration::from_secs(120);

/// One entry of the child's tool-call log, tracked in FIFO order so a
/// `tool_execution_end` can be matched back to its still-pending start.
struct ToolLogEntry {
    tool: String,
    args: Value,
    result: Option<ToolResult>,
}

/// Forwards a child agent's blocking questions straight to the parent's own
/// handler. The parent may itself be a sub-agent (whose own handler in turn
/// forwards further up), or the top-level RPC client relay — this type
/// doesn't need to know which; it just relays one level up, same as the
/// child's `ask_question` tool call relays one level down into this handler.
struct ParentRelayQuestionHandler {
    parent: Arc<dyn QuestionHandler>,
}

#[async_trait]
impl QuestionHandler for ParentRelayQuestionHandler {
    async fn ask(&self, question: Question) -> anyhow::Result<String> {
        self.parent.ask(question).await
    }
}

/// The `sub_agent` tool. One instance is shared by every turn of the agent
/// that registers it; each `execute` call spawns its own short-lived child
/// agent and bus.
pub struct SubAgentTool {
    parent_tools: Arc<ToolRegistry>,
    provider: Arc<dyn ModelProvider>,
    parent_bus: Arc<EventBus<AgentEvent>>,
    config: Arc<AgentConfig>,
    runtime_ctx: AgentRuntimeContext,
    context_window: u32,
}

impl SubAgentTool {
    pub fn new(
        parent_tools: Arc<ToolRegistry>,
        provider: Arc<dyn ModelProvider>,
        parent_bus: Arc<EventBus<AgentEvent>>,
        config: Arc<AgentConfig>,
        runtime_ctx: AgentRuntimeContext,
        context_window: u32,
    ) -> Self {
        Self { parent_tools, provider, parent_bus, config, runtime_ctx, context_window }
    }

    /// Build the child's tool subset: the requested names (default: every
    /// tool the parent has) intersected with what the parent actually has
    /// registered, always excluding `sub_agent` itself so a child can never
    /// recurse past depth 1.
    fn build_child_tools(&self, requested: Option<Vec<String>>) -> ToolRegistry {
        let names = requested.unwrap_or_else(|| self.parent_tools.names());
        let mut child = ToolRegistry::new();
        for name in names {
            if name == "sub_agent" {
                continue;
            }
            if let Some(tool) = self.parent_tools.get(&name) {
                child.register_arc(tool);
            }
        }
        child
    }

    fn format_output(text: &str, tool_log: &[ToolLogEntry]) -> String {
        if tool_log.is_empty() {
            return text.to_string();
        }
        let mut out = String::from("## Sub-agent tool log\n");
        for entry in tool_log {
            let result_str = match &entry.result {
                Some(r) if r.ok => r.output.clone().unwrap_or_default(),
                Some(r) => format!("ERROR: {}", r.error.clone().unwrap_or_default()),
                None => "ERROR: no result reported".to_string(),
            };
            out.push_str(&format!("- {}({}): {}\n", entry.tool, entry.args, result_str));
        }
        out.push_str("\n## Sub-agent response\n");
        out.push_str(text);
        out
    }
}

#[async_trait]
impl Tool for SubAgentTool {
    fn name(&self) -> &str {
        "sub_agent"
    }

    fn description(&self) -> &str {
        "Delegate a self-contained subtask to a sub-agent with its own conversation and a \
         constrained set of tools. Use for well-scoped work that doesn't need to share this \
         turn's context. A sub-agent cannot itself delegate further."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The task to hand off to the sub-agent."
                },
                "tools": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Names of tools the sub-agent may use. Defaults to every tool this agent has."
                },
                "model": {
                    "type": "string",
                    "description": "Label for the model the sub-agent should be reported as using."
                },
                "system_prompt": {
                    "type": "string",
                    "description": "Override the sub-agent's system prompt entirely."
                }
            },
            "required": ["prompt"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    fn meta(&self, args: &Value) -> Value {
        let tools = args.get("tools").cloned().unwrap_or(Value::Null);
        serde_json::json!({ "tools": tools })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        if !ctx.agent_state.sub_agents_enabled {
            return ToolOutput::err(&call.id, "sub-agents are disabled for this session (depth limit or config)");
        }

        let prompt = match call.args.get("prompt").and_then(Value::as_str) {
            Some(p) if !p.trim().is_empty() => p.to_string(),
            _ => return ToolOutput::err(&call.id, "`prompt` is required"),
        };
        let requested_tools = call.args.get("tools").and_then(Value::as_array).map(|arr| {
            arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect::<Vec<_>>()
        });
        let system_prompt_override = call.args.get("system_prompt").and_then(Value::as_str).map(str::to_string);

        let child_tools = self.build_child_tools(requested_tools);
        let tool_names = child_tools.names();
        let model_label =
            call.args.get("model").and_then(Value::as_str).map(str::to_string).unwrap_or_else(|| self.provider.model_name().to_string());

        let sub_session_id = format!("{}.sub.{}", ctx.session_id, Uuid::new_v4());
        let child_bus = Arc::new(EventBus::new());

        let mut child_runtime_ctx = self.runtime_ctx.clone();
        if let Some(sp) = system_prompt_override {
            child_runtime_ctx.system_prompt_override = Some(sp);
        }

        let question_handler: Arc<dyn QuestionHandler> =
            Arc::new(ParentRelayQuestionHandler { parent: ctx.question_handler.clone() });

        let child = Agent::with_depth(
            sub_session_id.clone(),
            self.provider.clone(),
            Arc::new(child_tools),
            child_bus.clone(),
            &self.config,
            child_runtime_ctx,
            self.context_window,
            ctx.agent_state.depth + 1,
            Arc::new(AutoApprove),
            question_handler,
        );

        let mut sub = child_bus.subscribe(sub_session_id.clone());

        self.parent_bus.broadcast(
            ctx.session_id.clone(),
            AgentEvent::SubAgentStart { model: model_label, label: prompt.clone(), tools: tool_names },
        );

        child.prompt(prompt).await;

        let mut text = String::new();
        let mut tool_log: Vec<ToolLogEntry> = Vec::new();

        let outcome = loop {
            let delivery = match tokio::time::timeout(SUB_AGENT_TIMEOUT, sub.rx.recv()).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break ToolOutput::err(&call.id, "sub-agent bus closed before completion"),
                Err(_) => break ToolOutput::err(&call.id, "sub-agent timed out after 120s"),
            };
            let inner = delivery.event;

            self.parent_bus.broadcast(
                ctx.session_id.clone(),
                AgentEvent::SubAgentEvent {
                    parent_call_id: call.id.clone(),
                    sub_session_id: sub_session_id.clone(),
                    inner: Box::new(inner.clone()),
                },
            );

            match inner {
                AgentEvent::MessageDelta { delta } => text.push_str(&delta),
                AgentEvent::ToolExecutionStart { tool, args, .. } => {
                    tool_log.push(ToolLogEntry { tool, args, result: None });
                }
                AgentEvent::ToolExecutionEnd { tool, result, .. } => {
                    if let Some(entry) = tool_log.iter_mut().rev().find(|e| e.tool == tool && e.result.is_none()) {
                        entry.result = Some(result);
                    }
                }
                AgentEvent::AgentEnd { .. } => {
                    break ToolOutput::ok(&call.id, Self::format_output(&text, &tool_log));
                }
                AgentEvent::Error { reason } => {
                    break ToolOutput::err(&call.id, reason);
                }
                _ => {}
            }
        };

        child_bus.unsubscribe(&sub_session_id);
        outcome
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use opal_model::{MockProvider, ScriptedMockProvider};
    use opal_tools::{AgentStateRef, AskQuestionTool, ReadFileTool};
    use tokio::sync::mpsc;

    struct NoopHandler;
    #[async_trait]
    impl QuestionHandler for NoopHandler {
        async fn ask(&self, _q: Question) -> anyhow::Result<String> {
            Ok("auto-answer".into())
        }
    }

    fn test_ctx(depth: u32, sub_agents_enabled: bool) -> ToolContext {
        let (tx, _rx) = mpsc::unbounded_channel();
        ToolContext {
            working_dir: std::env::temp_dir(),
            session_id: "parent".into(),
            call_id: "call-1".into(),
            emit: tx,
            question_handler: Arc::new(NoopHandler),
            agent_state: AgentStateRef { depth, sub_agents_enabled },
        }
    }

    fn tool_with_provider(provider: Arc<dyn ModelProvider>) -> SubAgentTool {
        let mut reg = ToolRegistry::new();
        reg.register(ReadFileTool);
        reg.register(AskQuestionTool);
        SubAgentTool::new(
            Arc::new(reg),
            provider,
            Arc::new(EventBus::new()),
            Arc::new(AgentConfig::default()),
            AgentRuntimeContext::default(),
            100_000,
        )
    }

    #[tokio::test]
    async fn disabled_sub_agents_are_refused() {
        let tool = tool_with_provider(Arc::new(MockProvider));
        let call = ToolCall { id: "c1".into(), name: "sub_agent".into(), args: serde_json::json!({"prompt": "go"}) };
        let out = tool.execute(&call, &test_ctx(1, false)).await;
        assert!(out.is_error);
        assert!(out.content.contains("disabled"));
    }

    #[tokio::test]
    async fn missing_prompt_is_rejected() {
        let tool = tool_with_provider(Arc::new(MockProvider));
        let call = ToolCall { id: "c1".into(), name: "sub_agent".into(), args: serde_json::json!({}) };
        let out = tool.execute(&call, &test_ctx(0, true)).await;
        assert!(out.is_error);
        assert!(out.content.contains("prompt"));
    }

    #[tokio::test]
    async fn successful_delegation_returns_bare_text_with_no_tool_calls() {
        let tool = tool_with_provider(Arc::new(ScriptedMockProvider::always_text("child says hi")));
        let call = ToolCall { id: "c1".into(), name: "sub_agent".into(), args: serde_json::json!({"prompt": "say hi"}) };
        let out = tool.execute(&call, &test_ctx(0, true)).await;
        assert!(!out.is_error, "expected success, got: {}", out.content);
        assert_eq!(out.content, "child says hi");
    }

    #[tokio::test]
    async fn delegation_with_tool_call_formats_tool_log_section() {
        let provider = ScriptedMockProvider::tool_then_text(
            "tc-1",
            "read_file",
            serde_json::json!({"path": "a.rs"}).to_string(),
            "done reading",
        );
        let tool = tool_with_provider(Arc::new(provider));
        let call = ToolCall { id: "c1".into(), name: "sub_agent".into(), args: serde_json::json!({"prompt": "read a.rs"}) };
        let out = tool.execute(&call, &test_ctx(0, true)).await;
        assert!(!out.is_error, "expected success, got: {}", out.content);
        assert!(out.content.contains("## Sub-agent tool log"));
        assert!(out.content.contains("read_file"));
        assert!(out.content.contains("## Sub-agent response"));
        assert!(out.content.contains("done reading"));
    }

    #[tokio::test]
    async fn requested_tool_subset_excludes_sub_agent_itself() {
        let tool = tool_with_provider(Arc::new(MockProvider));
        let built = tool.build_child_tools(Some(vec!["sub_agent".into(), "read_file".into()]));
        assert_eq!(built.names(), vec!["read_file".to_string()]);
    }

    #[tokio::test]
    async fn default_tool_subset_is_every_parent_tool() {
        let tool = tool_with_provider(Arc::new(MockProvider));
        let built = tool.build_child_tools(None);
        assert_eq!(built.names(), vec!["ask_question".to_string(), "read_file".to_string()]);
    }
}
