// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The Agent Runtime: the per-session state machine that drives one
//! conversation's turns against a [`ModelProvider`], dispatching tool calls
//! and emitting [`AgentEvent`]s onto the session's [`EventBus`].
//!
//! A turn is driven by a background `tokio::task` so that `prompt`/`steer`
//! can return `{queued}` immediately while the caller (and any other
//! subscriber) watches the turn unfold over the bus. Everything that can be
//! read back out (`get_state`, `get_context`) is guarded by a single
//! `Mutex<AgentState>`; the provider handle, tool registry, and bus are
//! immutable for the agent's lifetime and shared via `Arc`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use opal_bus::EventBus;
use opal_config::{AgentConfig, CompactionStrategy};
use opal_model::{CompletionRequest, Message, ModelProvider, ProviderEvent, Role, StopReason, ThinkingLevel, ToolCallSpec, Usage};
use opal_tools::{AgentStateRef, ApprovalPolicy, Question, QuestionHandler, Tool, ToolCall, ToolContext, ToolOutputPart, ToolPolicy, ToolRegistry};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::events::{AgentEvent, ToolResult};
use crate::prompts::{self, PromptContext};
use crate::runtime_context::AgentRuntimeContext;
use crate::state::{AgentFeatureToggles, AgentState, AgentStateSnapshot, ModelSpec, PromptOutcome};

/// Relays a tool's approval decision for non-auto tool calls. `opal-core`'s
/// default forwards every `Ask` decision straight to the RPC client; tests
/// and embedders that don't have a client attached can supply [`AutoApprove`].
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn approve(&self, tool_name: &str, command: &str) -> anyhow::Result<bool>;
}

/// Approves every tool call without asking. Used by sub-agents (whose tool
/// calls are already scoped by their parent) and by tests.
pub struct AutoApprove;

#[async_trait]
impl ApprovalHandler for AutoApprove {
    async fn approve(&self, _tool_name: &str, _command: &str) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Refuses every question. The default when no interactive client is
/// attached, so a tool that blocks for input fails loudly instead of
/// hanging forever.
pub struct NoInteractiveHandler;

#[async_trait]
impl QuestionHandler for NoInteractiveHandler {
    async fn ask(&self, question: Question) -> anyhow::Result<String> {
        anyhow::bail!("no interactive handler attached to answer: {}", question.prompt)
    }
}

/// Accumulates one tool call's name and argument-fragment stream as a
/// provider emits interleaved `tool_call_start`/`tool_call_delta`/
/// `tool_call_done` events, keyed by whichever of `call_id`/`call_index` the
/// provider actually supplies.
#[derive(Debug, Default, Clone)]
struct PendingToolCall {
    call_id: Option<String>,
    call_index: Option<u32>,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    fn matches(&self, call_id: &Option<String>, call_index: &Option<u32>) -> bool {
        if let (Some(a), Some(b)) = (&self.call_id, call_id) {
            return a == b;
        }
        if let (Some(a), Some(b)) = (&self.call_index, call_index) {
            return a == b;
        }
        false
    }

    /// Parse `args_buf` as JSON, repairing the common truncated-object case
    /// (a dangling opening brace with no matching close) before giving up
    /// and falling back to an empty object.
    fn finalize(&self) -> ToolCallSpec {
        let raw = self.args_buf.trim();
        let parsed = serde_json::from_str(raw).or_else(|_| {
            let mut repaired = raw.to_string();
            let opens = repaired.matches('{').count();
            let closes = repaired.matches('}').count();
            for _ in closes..opens {
                repaired.push('}');
            }
            serde_json::from_str(&repaired)
        });
        let arguments = parsed.unwrap_or_else(|_| serde_json::json!({}));
        ToolCallSpec {
            call_id: self.call_id.clone().unwrap_or_else(|| format!("call_{}", self.call_index.unwrap_or(0))),
            name: self.name.clone(),
            arguments,
        }
    }
}

/// Shared, immutable context every turn reads from. Does not change for the
/// lifetime of an [`Agent`] (apart from the provider, which `set_model`
/// replaces wholesale, and `state`, which is the one mutable record).
struct AgentInner {
    session_id: String,
    bus: Arc<EventBus<AgentEvent>>,
    tools: Arc<ToolRegistry>,
    tool_policy: ToolPolicy,
    approval: Arc<dyn ApprovalHandler>,
    question_handler: Arc<dyn QuestionHandler>,
    runtime_ctx: AgentRuntimeContext,
    context_window: u32,
    max_tool_rounds: u32,
    compaction_threshold: f32,
    compaction_keep_recent_tokens: usize,
    compaction_strategy: CompactionStrategy,
    tool_result_token_cap: usize,
    sub_agent_depth: u32,
    state: Mutex<AgentState>,
    provider: Mutex<Arc<dyn ModelProvider>>,
    /// Live handle to the background turn-driving task, so `abort` can force
    /// it to stop even mid-stream.
    turn_task: Mutex<Option<JoinHandle<()>>>,
}

/// A running agent session. Cheap to clone — every clone shares the same
/// underlying state and bus subscription.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    /// Construct a new, idle, top-level agent for `session_id`.
    pub fn new(
        session_id: impl Into<String>,
        provider: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        bus: Arc<EventBus<AgentEvent>>,
        config: &AgentConfig,
        runtime_ctx: AgentRuntimeContext,
        context_window: u32,
    ) -> Self {
        Self::with_depth(session_id, provider, tools, bus, config, runtime_ctx, context_window, 0, Arc::new(AutoApprove), Arc::new(NoInteractiveHandler))
    }

    /// Construct an agent running at sub-agent nesting `depth`, with an
    /// explicit approval/question handler (the `sub_agent` tool builds its
    /// child agent with handlers that relay back to the parent).
    #[allow(clippy::too_many_arguments)]
    pub fn with_depth(
        session_id: impl Into<String>,
        provider: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        bus: Arc<EventBus<AgentEvent>>,
        config: &AgentConfig,
        runtime_ctx: AgentRuntimeContext,
        context_window: u32,
        depth: u32,
        approval: Arc<dyn ApprovalHandler>,
        question_handler: Arc<dyn QuestionHandler>,
    ) -> Self {
        let model = ModelSpec {
            provider: provider.name().to_string(),
            id: provider.model_name().to_string(),
            thinking_level: ThinkingLevel::Off,
        };
        let toggles = AgentFeatureToggles {
            sub_agents: config.sub_agents && depth < 1,
            skills: config.skills,
            mcp: config.mcp,
            debug: config.debug,
        };
        let working_dir = runtime_ctx.project_root.clone().unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
        let state = AgentState::new(model, working_dir, toggles);
        let inner = AgentInner {
            session_id: session_id.into(),
            bus,
            tools,
            tool_policy: ToolPolicy::from_config(&Default::default()),
            approval,
            question_handler,
            runtime_ctx,
            context_window,
            max_tool_rounds: config.max_tool_rounds,
            compaction_threshold: config.compaction_threshold,
            compaction_keep_recent_tokens: config.compaction_keep_recent * 200,
            compaction_strategy: config.compaction_strategy,
            tool_result_token_cap: config.tool_result_token_cap,
            sub_agent_depth: depth,
            state: Mutex::new(state),
            provider: Mutex::new(provider),
            turn_task: Mutex::new(None),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    // ─── Commands ────────────────────────────────────────────────────────────

    /// Submit a new top-level prompt. If the agent is idle this starts a turn
    /// immediately (`queued: false`); if a turn is already running the text is
    /// queued as a pending steer and folded in as soon as the turn would
    /// otherwise go idle (`queued: true`).
    pub async fn prompt(&self, text: impl Into<String>) -> PromptOutcome {
        self.submit(text.into()).await
    }

    /// Steer a running turn with additional instructions. Identical to
    /// [`Agent::prompt`] in every observable way — both compete for the same
    /// `pending_steers` queue — kept as a distinct method because RPC callers
    /// distinguish "new top-level ask" from "amend the one in flight" even
    /// though the runtime treats them the same (see `DESIGN.md`, Open
    /// Question 1).
    pub async fn steer(&self, text: impl Into<String>) -> PromptOutcome {
        self.submit(text.into()).await
    }

    async fn submit(&self, text: String) -> PromptOutcome {
        let mut state = self.inner.state.lock().await;
        if state.status == crate::state::AgentStatus::Idle {
            let msg = Message::user(text.clone());
            state.messages.push(msg);
            state.status = crate::state::AgentStatus::Running;
            drop(state);
            self.inner.bus.broadcast(self.inner.session_id.clone(), AgentEvent::MessageApplied { text });
            self.spawn_turn();
            PromptOutcome { queued: false }
        } else {
            state.pending_steers.push_back(text.clone());
            drop(state);
            self.inner.bus.broadcast(self.inner.session_id.clone(), AgentEvent::MessageQueued { text });
            PromptOutcome { queued: true }
        }
    }

    /// Force-stop the running turn. Any in-flight tool task is aborted; no
    /// auto-continue happens even if steers are queued — they remain queued
    /// for the next `prompt`/`steer` call to pick up.
    pub async fn abort(&self) {
        let mut task = self.inner.turn_task.lock().await;
        if let Some(handle) = task.take() {
            handle.abort();
        }
        drop(task);
        let mut state = self.inner.state.lock().await;
        if state.status != crate::state::AgentStatus::Idle {
            state.status = crate::state::AgentStatus::Idle;
            state.remaining_tool_calls = 0;
            drop(state);
            self.inner.bus.broadcast(self.inner.session_id.clone(), AgentEvent::AgentAbort);
            self.inner.bus.broadcast(self.inner.session_id.clone(), AgentEvent::AgentEnd { usage: None });
        }
    }

    /// Replace the active model/provider. Takes effect at the start of the
    /// *next* turn — a running turn finishes with the provider it started
    /// with, per the "effective next turn" rule shared by every
    /// configure-ish command.
    pub async fn set_model(&self, provider: Arc<dyn ModelProvider>, thinking_level: ThinkingLevel) {
        let mut state = self.inner.state.lock().await;
        state.model = ModelSpec { provider: provider.name().to_string(), id: provider.model_name().to_string(), thinking_level };
        drop(state);
        *self.inner.provider.lock().await = provider;
    }

    pub async fn set_thinking_level(&self, level: ThinkingLevel) {
        let mut state = self.inner.state.lock().await;
        state.model.thinking_level = level;
    }

    /// Toggle feature flags and the disabled-tool list. Effective next turn.
    pub async fn configure(&self, toggles: Option<AgentFeatureToggles>, disabled_tools: Option<Vec<String>>) {
        let mut state = self.inner.state.lock().await;
        if let Some(toggles) = toggles {
            state.config = toggles;
        }
        if let Some(disabled) = disabled_tools {
            state.disabled_tools = disabled;
        }
    }

    /// Overwrite the materialized message history wholesale (used after the
    /// session tree's `replace_path_segment` during compaction, or after an
    /// RPC client edits history directly).
    pub async fn sync_messages(&self, messages: Vec<Message>) {
        let mut state = self.inner.state.lock().await;
        state.messages = messages;
    }

    /// Register a skill's resolved instructions as an Agent Runtime command
    /// (not a tool call — skill-file parsing is out of scope for this crate,
    /// so the caller supplies content it has already resolved).
    pub async fn load_skill(&self, name: impl Into<String>, description: impl Into<String>, instructions: impl Into<String>) {
        let name = name.into();
        let description = description.into();
        let mut state = self.inner.state.lock().await;
        state.messages.push(
            Message::system(instructions.into())
                .with_metadata("type", serde_json::json!("skill"))
                .with_metadata("skill_name", serde_json::json!(name.clone())),
        );
        drop(state);
        self.inner.bus.broadcast(self.inner.session_id.clone(), AgentEvent::SkillLoaded { name, description });
    }

    pub async fn get_state(&self) -> AgentStateSnapshot {
        self.inner.state.lock().await.snapshot()
    }

    /// Alias kept distinct from `get_state` at the command-surface level: RPC
    /// exposes both `agent/get_state` (full snapshot) and
    /// `agent/get_context` (same data, named for "what would the next turn
    /// see").
    pub async fn get_context(&self) -> AgentStateSnapshot {
        self.get_state().await
    }

    /// Reconcile state after a process restart from a persisted session: the
    /// caller has already replaced `messages` via [`Agent::sync_messages`];
    /// this marks the agent idle again and emits `agent_recovered` with a
    /// synthetic notice so the model (and any client) knows history may be
    /// missing an in-flight turn.
    pub async fn recover(&self) {
        let mut state = self.inner.state.lock().await;
        state.status = crate::state::AgentStatus::Idle;
        drop(state);
        self.inner.bus.broadcast(self.inner.session_id.clone(), AgentEvent::AgentRecovered);
    }

    // ─── Turn driver ─────────────────────────────────────────────────────────

    fn spawn_turn(&self) {
        let agent = self.clone();
        let handle = tokio::spawn(async move {
            agent.run_turn_loop().await;
        });
        let inner = self.inner.clone();
        tokio::spawn(async move {
            *inner.turn_task.lock().await = Some(handle);
        });
    }

    /// Drives rounds until the model stops asking for tools, then folds in
    /// any steers queued meanwhile and loops again, until nothing is left to
    /// say and the agent returns to `idle`.
    async fn run_turn_loop(&self) {
        self.inner.bus.broadcast(self.inner.session_id.clone(), AgentEvent::AgentStart);
        let mut rounds = 0u32;
        loop {
            let snapshot = self.inner.state.lock().await;
            let model = snapshot.model.clone();
            let disabled = snapshot.disabled_tools.clone();
            drop(snapshot);

            {
                let mut state = self.inner.state.lock().await;
                state.status = crate::state::AgentStatus::Streaming;
            }

            let round_result = self.run_one_round(&model.thinking_level, &disabled).await;

            match round_result {
                Ok(RoundOutcome::ToolCalls) => {
                    rounds += 1;
                    if rounds >= self.inner.max_tool_rounds {
                        self.inner.bus.broadcast(
                            self.inner.session_id.clone(),
                            AgentEvent::Error { reason: format!("stopped after {rounds} tool-call rounds (max_tool_rounds)") },
                        );
                        self.finish_turn(false).await;
                        return;
                    }
                    self.flush_pending_steers_mid_turn().await;
                    continue;
                }
                Ok(RoundOutcome::Done(message)) => {
                    self.inner.bus.broadcast(self.inner.session_id.clone(), AgentEvent::TurnEnd { message });
                    self.maybe_compact().await;
                    if self.finish_turn(true).await {
                        rounds = 0;
                        continue;
                    }
                    return;
                }
                Err(reason) => {
                    self.inner.bus.broadcast(self.inner.session_id.clone(), AgentEvent::Error { reason });
                    self.finish_turn(false).await;
                    return;
                }
            }
        }
    }

    /// Between tool-call rounds, any steer queued while tools were executing
    /// is folded into the conversation immediately rather than waiting for
    /// the turn to end — it is the next round's first user message.
    async fn flush_pending_steers_mid_turn(&self) {
        let mut state = self.inner.state.lock().await;
        if state.pending_steers.is_empty() {
            return;
        }
        let combined: Vec<String> = state.pending_steers.drain(..).collect();
        let text = combined.join("\n\n");
        state.messages.push(Message::user(text.clone()));
        drop(state);
        self.inner.bus.broadcast(self.inner.session_id.clone(), AgentEvent::MessageApplied { text });
    }

    /// At the natural end of a turn: if steers piled up while the final
    /// answer was streaming, fold them in and report `true` (auto-continue).
    /// Otherwise go idle and emit `agent_end`, reporting `false`.
    async fn finish_turn(&self, allow_continue: bool) -> bool {
        let mut state = self.inner.state.lock().await;
        if allow_continue && !state.pending_steers.is_empty() {
            let combined: Vec<String> = state.pending_steers.drain(..).collect();
            let text = combined.join("\n\n");
            state.messages.push(Message::user(text.clone()));
            state.status = crate::state::AgentStatus::Running;
            drop(state);
            self.inner.bus.broadcast(self.inner.session_id.clone(), AgentEvent::MessageApplied { text });
            true
        } else {
            let usage = state.token_usage;
            state.status = crate::state::AgentStatus::Idle;
            drop(state);
            self.inner.bus.broadcast(self.inner.session_id.clone(), AgentEvent::AgentEnd { usage: Some(usage) });
            false
        }
    }

    /// Run exactly one model round: stream a completion, translate events,
    /// and either execute the requested tool calls sequentially or return the
    /// final assistant message.
    async fn run_one_round(&self, thinking_level: &ThinkingLevel, disabled_tools: &[String]) -> Result<RoundOutcome, String> {
        let (messages, system) = self.build_request_messages().await;
        let tools = self.inner.tools.schemas(disabled_tools);
        let tool_schemas: Vec<opal_model::ToolSchema> =
            tools.into_iter().map(|t| opal_model::ToolSchema { name: t.name, description: t.description, parameters: t.parameters }).collect();

        let mut full_messages = Vec::with_capacity(messages.len() + 1);
        full_messages.push(system);
        full_messages.extend(messages);

        let req = CompletionRequest {
            messages: full_messages,
            tools: tool_schemas,
            stream: true,
            thinking_level: *thinking_level,
            system_dynamic_suffix: None,
        };

        let provider = self.inner.provider.lock().await.clone();
        {
            let mut state = self.inner.state.lock().await;
            state.last_prompt_tokens = req.messages.iter().map(|m| m.approx_tokens() as u32).sum();
        }

        let mut stream = provider.stream(req).await.map_err(|e| e.to_string())?;

        let mut text = String::new();
        let mut thinking = String::new();
        let mut stop_reason = StopReason::Stop;
        let mut usage = Usage::default();
        let mut pending_calls: Vec<PendingToolCall> = Vec::new();
        let mut text_started = false;
        let mut thinking_started = false;

        while let Some(event) = stream.next().await {
            let event = event.map_err(|e| e.to_string())?;
            match event {
                ProviderEvent::TextStart => {
                    if !text_started {
                        text_started = true;
                        self.inner.bus.broadcast(self.inner.session_id.clone(), AgentEvent::MessageStart);
                    }
                }
                ProviderEvent::TextDelta { delta } => {
                    text.push_str(&delta);
                    self.inner.bus.broadcast(self.inner.session_id.clone(), AgentEvent::MessageDelta { delta });
                }
                ProviderEvent::TextDone => {}
                ProviderEvent::ThinkingStart => {
                    if !thinking_started {
                        thinking_started = true;
                        self.inner.bus.broadcast(self.inner.session_id.clone(), AgentEvent::ThinkingStart);
                    }
                }
                ProviderEvent::ThinkingDelta { delta } => {
                    thinking.push_str(&delta);
                    self.inner.bus.broadcast(self.inner.session_id.clone(), AgentEvent::ThinkingDelta { delta });
                }
                ProviderEvent::ToolCallStart { call_id, call_index, name } => {
                    pending_calls.push(PendingToolCall { call_id, call_index, name: name.unwrap_or_default(), args_buf: String::new() });
                }
                ProviderEvent::ToolCallDelta { call_id, call_index, delta } => {
                    if let Some(call) = pending_calls.iter_mut().find(|c| c.matches(&call_id, &call_index)) {
                        call.args_buf.push_str(&delta);
                    }
                }
                ProviderEvent::ToolCallDone { .. } => {}
                ProviderEvent::ResponseDone { stop_reason: reason } => {
                    stop_reason = reason;
                }
                ProviderEvent::Usage(u) => {
                    usage = u;
                    self.inner.bus.broadcast(self.inner.session_id.clone(), AgentEvent::UsageUpdate(u));
                }
                ProviderEvent::Error { reason } => return Err(reason),
            }
        }

        {
            let mut state = self.inner.state.lock().await;
            state.token_usage.input_tokens += usage.input_tokens;
            state.token_usage.output_tokens += usage.output_tokens;
            state.token_usage.cache_read_tokens += usage.cache_read_tokens;
            state.token_usage.cache_write_tokens += usage.cache_write_tokens;
        }

        match stop_reason {
            StopReason::ToolCalls => {
                let tool_calls: Vec<ToolCallSpec> = pending_calls.iter().map(|c| c.finalize()).collect();
                let content = if text.is_empty() { None } else { Some(text) };
                let mut assistant = Message::assistant_with_tool_calls(content, tool_calls.clone());
                if !thinking.is_empty() {
                    assistant = assistant.with_thinking(thinking);
                }
                {
                    let mut state = self.inner.state.lock().await;
                    state.messages.push(assistant);
                    state.status = crate::state::AgentStatus::ExecutingTools;
                    state.remaining_tool_calls = tool_calls.len();
                }
                self.execute_tool_calls(tool_calls).await;
                Ok(RoundOutcome::ToolCalls)
            }
            StopReason::Stop | StopReason::Length => {
                let mut assistant = Message::assistant(text);
                if !thinking.is_empty() {
                    assistant = assistant.with_thinking(thinking);
                }
                {
                    let mut state = self.inner.state.lock().await;
                    state.messages.push(assistant.clone());
                }
                Ok(RoundOutcome::Done(assistant))
            }
            StopReason::Error => Err("model reported an error stop reason".to_string()),
        }
    }

    /// Execute every tool call from this round sequentially, in emission
    /// order. Each call still runs inside its own spawned task purely so a
    /// concrete `JoinHandle` exists for `abort` to cancel — but the loop
    /// awaits each one before starting the next, matching the one-turn,
    /// one-pending-tool-task model described for this runtime.
    async fn execute_tool_calls(&self, calls: Vec<ToolCallSpec>) {
        for call in calls {
            let tool_name = call.name.clone();
            let call_id = call.call_id.clone();
            let args = call.arguments.clone();

            let meta = self.inner.tools.get(&tool_name).map(|t| t.meta(&args)).unwrap_or(serde_json::Value::Null);
            self.inner.bus.broadcast(
                self.inner.session_id.clone(),
                AgentEvent::ToolExecutionStart { tool: tool_name.clone(), call_id: call_id.clone(), args: args.clone(), meta },
            );

            let agent = self.clone();
            let handle: JoinHandle<ToolResult> = tokio::spawn(async move { agent.run_single_tool(tool_name, call_id, args).await });
            let result = match handle.await {
                Ok(r) => r,
                Err(e) => ToolResult::err(format!("tool task aborted or panicked: {e}")),
            };

            let tool_name = call.name.clone();
            let call_id = call.call_id.clone();
            let output_text = result.output.clone().or_else(|| result.error.clone()).unwrap_or_default();
            {
                let mut state = self.inner.state.lock().await;
                state.messages.push(Message::tool_result(call_id.clone(), tool_name.clone(), output_text));
                state.remaining_tool_calls = state.remaining_tool_calls.saturating_sub(1);
            }
            self.inner.bus.broadcast(self.inner.session_id.clone(), AgentEvent::ToolExecutionEnd { tool: tool_name, call_id, result });
        }
    }

    async fn run_single_tool(&self, tool_name: String, call_id: String, args: serde_json::Value) -> ToolResult {
        let Some(tool) = self.inner.tools.get(&tool_name) else {
            return ToolResult::err(format!("unknown tool: {tool_name}"));
        };

        let policy = if tool_name == "run_terminal_command" {
            let command = args.get("command").and_then(|v| v.as_str()).unwrap_or("");
            self.inner.tool_policy.decide(command)
        } else {
            tool.default_policy()
        };

        if policy == ApprovalPolicy::Deny {
            return ToolResult::err(format!("tool call to {tool_name} denied by policy"));
        }
        if policy == ApprovalPolicy::Ask {
            let command = args.get("command").and_then(|v| v.as_str()).unwrap_or(&tool_name).to_string();
            match self.inner.approval.approve(&tool_name, &command).await {
                Ok(true) => {}
                Ok(false) => return ToolResult::err(format!("user declined to approve {tool_name}")),
                Err(e) => return ToolResult::err(format!("approval request failed: {e}")),
            }
        }

        let (emit_tx, mut emit_rx) = tokio::sync::mpsc::unbounded_channel();
        let stream_bus = self.inner.bus.clone();
        let stream_session_id = self.inner.session_id.clone();
        let stream_call_id = call_id.clone();
        tokio::spawn(async move {
            while let Some(part) = emit_rx.recv().await {
                let chunk = match part {
                    ToolOutputPart::Text(text) => text,
                    ToolOutputPart::Image(data_url) => data_url,
                };
                stream_bus.broadcast(stream_session_id.clone(), AgentEvent::ToolStream { call_id: stream_call_id.clone(), chunk });
            }
        });

        let (working_dir, depth, sub_agents_enabled) = {
            let state = self.inner.state.lock().await;
            (state.working_dir.clone(), self.inner.sub_agent_depth, state.config.sub_agents)
        };

        let ctx = ToolContext {
            working_dir,
            session_id: self.inner.session_id.clone(),
            call_id: call_id.clone(),
            emit: emit_tx,
            question_handler: self.inner.question_handler.clone(),
            agent_state: AgentStateRef { depth, sub_agents_enabled },
        };
        let call = ToolCall { id: call_id, name: tool_name, args };
        let output = tool.execute(&call, &ctx).await;
        let capped = crate::compact::smart_truncate(&output.content, tool.output_category(), self.inner.tool_result_token_cap);
        if output.is_error {
            ToolResult::err(capped)
        } else {
            ToolResult::ok(capped)
        }
    }

    async fn build_request_messages(&self) -> (Vec<Message>, Message) {
        let state = self.inner.state.lock().await;
        let messages = state.messages.clone();
        drop(state);

        let project_root = self.inner.runtime_ctx.project_root.as_deref();
        let ctx = PromptContext {
            project_root,
            git_context: self.inner.runtime_ctx.git_context_note.as_deref(),
            project_context_file: self.inner.runtime_ctx.project_context_file.as_deref(),
            ci_context: self.inner.runtime_ctx.ci_context_note.as_deref(),
            append: self.inner.runtime_ctx.append_system_prompt.as_deref(),
        };
        let text = prompts::system_prompt(self.inner.runtime_ctx.system_prompt_override.as_deref(), ctx);
        (messages, Message::system(text))
    }

    /// Triggers after a turn's final answer: compacts when the last
    /// request's token count crossed `compaction_threshold` of the model's
    /// context window.
    async fn maybe_compact(&self) {
        self.run_compaction(false).await;
    }

    /// Compacts the active path unconditionally, skipping the
    /// `compaction_threshold` gate. Used by the `session/compact` RPC method
    /// so a client can force compaction ahead of a known-large prompt rather
    /// than waiting for the automatic post-turn check.
    pub async fn force_compact(&self) {
        self.run_compaction(true).await;
    }

    /// Replaces the older portion of the path with a summary (or, if the
    /// summarizer call itself fails, an emergency truncation), leaving the
    /// recent tail untouched.
    async fn run_compaction(&self, force: bool) {
        let (fraction, len) = {
            let state = self.inner.state.lock().await;
            (
                if self.inner.context_window == 0 { 0.0 } else { state.last_prompt_tokens as f32 / self.inner.context_window as f32 },
                state.messages.len(),
            )
        };
        if !force && fraction < self.inner.compaction_threshold {
            return;
        }
        self.inner.bus.broadcast(self.inner.session_id.clone(), AgentEvent::CompactionStart { msg_count: len });

        let (keep_system, rest): (Vec<Message>, Vec<Message>) = {
            let state = self.inner.state.lock().await;
            state.messages.clone().into_iter().partition(|m| m.role == Role::System)
        };
        let system_msg = keep_system.into_iter().next();

        let (to_summarize, to_keep) = crate::compact::split_path(&rest, self.inner.compaction_keep_recent_tokens);
        if to_summarize.is_empty() {
            self.inner.bus.broadcast(self.inner.session_id.clone(), AgentEvent::CompactionEnd { before: len, after: len });
            return;
        }

        let provider = self.inner.provider.lock().await.clone();
        let model_name = provider.model_name().to_string();
        let strategy = self.inner.compaction_strategy;
        let summarized = match crate::compact::summarize(provider.as_ref(), &model_name, &to_summarize, &strategy).await {
            Ok(summary) => {
                let mut new_messages = Vec::new();
                if let Some(sys) = &system_msg {
                    new_messages.push(sys.clone());
                }
                new_messages.push(summary);
                new_messages.extend(to_keep);
                new_messages
            }
            Err(e) => {
                warn!(error = %e, "compaction summarizer call failed, falling back to emergency compact");
                let mut messages = rest;
                crate::compact::emergency_compact(&mut messages, system_msg, self.inner.compaction_keep_recent_tokens.max(1) / 50 + 1);
                messages
            }
        };

        let after = summarized.len();
        {
            let mut state = self.inner.state.lock().await;
            state.messages = summarized;
        }
        self.inner.bus.broadcast(self.inner.session_id.clone(), AgentEvent::CompactionEnd { before: len, after });
    }
}

enum RoundOutcome {
    ToolCalls,
    Done(Message),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
