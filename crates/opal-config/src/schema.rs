// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Named provider configurations.
    ///
    /// Define custom endpoints, local models, or additional accounts here and
    /// reference them by name.
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ModelConfig>,
    /// Directory that session tree snapshots are written to and enumerated from.
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: String,
}

fn default_sessions_dir() -> String {
    "sessions".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier. Common values: "openai" | "anthropic" | "mock".
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0-2.0)
    pub temperature: Option<f32>,
    /// Free-form provider-specific options forwarded as-is to the driver.
    #[serde(default)]
    pub driver_options: serde_json::Value,
    /// Path to YAML mock-responses file (used when provider = "mock").
    pub mock_responses_file: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "mock".into(),
            name: "mock-model".into(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            driver_options: serde_json::Value::Null,
            mock_responses_file: None,
        }
    }
}

fn default_max_tool_rounds() -> u32 {
    200
}
fn default_compaction_threshold() -> f32 {
    0.85
}

/// Strategy used when compacting the session context.
///
/// `Summarize` (default) calls the provider with a short summarizer prompt
/// over the serialized transcript. `Emergency` skips the provider entirely
/// and keeps only the last `keep_n` messages, for use when the provider
/// itself is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompactionStrategy {
    #[default]
    Summarize,
    Emergency,
}

impl std::fmt::Display for CompactionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactionStrategy::Summarize => write!(f, "summarize"),
            CompactionStrategy::Emergency => write!(f, "emergency"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Whether the sub-agent tool is registered and reachable (depth < 1).
    #[serde(default = "default_true")]
    pub sub_agents: bool,
    /// Whether `load_skill` and skill-derived system prompt addenda are enabled.
    #[serde(default = "default_true")]
    pub skills: bool,
    /// Whether MCP-provided tools are exposed to the runtime.
    #[serde(default)]
    pub mcp: bool,
    /// Verbose per-turn debug logging and the bounded debug RPC ring.
    #[serde(default)]
    pub debug: bool,
    /// Maximum number of autonomous tool-call rounds before stopping a turn.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Token fraction at which proactive compaction triggers (0.0-1.0).
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f32,
    /// Minimum number of trailing conversation tokens preserved verbatim
    /// during compaction; the remainder is summarized.
    #[serde(default = "default_compaction_keep_recent")]
    pub compaction_keep_recent: usize,
    /// Compaction strategy (see [`CompactionStrategy`]).
    #[serde(default)]
    pub compaction_strategy: CompactionStrategy,
    /// Maximum tokens allowed for a single tool result before it is
    /// deterministically truncated before entering the session.
    #[serde(default = "default_tool_result_token_cap")]
    pub tool_result_token_cap: usize,
    /// System prompt override; leave None to use the built-in prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Tokens reserved below `context_window` for the summarizer's own
    /// request overhead (system prompt, tool schemas) when compaction runs.
    /// Kept separate from `compaction_keep_recent` since it bounds the
    /// compaction call itself, not the conversation it compacts.
    #[serde(default = "default_compaction_overhead_reserve")]
    pub compaction_overhead_reserve: usize,
}

fn default_compaction_keep_recent() -> usize {
    6
}
fn default_tool_result_token_cap() -> usize {
    4000
}
fn default_compaction_overhead_reserve() -> usize {
    2000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            sub_agents: true,
            skills: true,
            mcp: false,
            debug: false,
            max_tool_rounds: default_max_tool_rounds(),
            compaction_threshold: default_compaction_threshold(),
            compaction_keep_recent: default_compaction_keep_recent(),
            compaction_strategy: CompactionStrategy::Summarize,
            tool_result_token_cap: default_tool_result_token_cap(),
            system_prompt: None,
            compaction_overhead_reserve: default_compaction_overhead_reserve(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Automatically approve shell commands matching these glob patterns.
    pub auto_approve_patterns: Vec<String>,
    /// Block shell commands matching these glob patterns.
    pub deny_patterns: Vec<String>,
    /// Timeout in seconds for a single tool call.
    pub timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            auto_approve_patterns: vec!["cat *".into(), "ls *".into(), "find *".into()],
            deny_patterns: vec!["rm -rf /*".into(), "dd if=*".into()],
            timeout_secs: 30,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
