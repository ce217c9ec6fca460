// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Conversation role. `ToolResult` carries a tool's output back to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    ToolResult,
}

/// A single tool invocation emitted by an assistant turn.
///
/// `arguments` is a parsed JSON value rather than a raw string: by the time a
/// provider's delta stream has been folded into a [`Message`] the argument
/// fragments are already assembled and validated, so downstream consumers
/// never re-parse them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallSpec {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A single message in the conversation history.
///
/// This is the one canonical message shape shared by the session tree, the
/// agent runtime's materialized turn history, and the provider request —
/// there is no separate wire type per layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: Option<String>,
    pub call_id: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallSpec>,
    pub thinking: Option<String>,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    fn new(role: Role, content: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            call_id: None,
            name: None,
            tool_calls: Vec::new(),
            thinking: None,
            parent_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, Some(text.into()))
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, Some(text.into()))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, Some(text.into()))
    }

    pub fn assistant_with_tool_calls(text: Option<String>, tool_calls: Vec<ToolCallSpec>) -> Self {
        let mut m = Self::new(Role::Assistant, text);
        m.tool_calls = tool_calls;
        m
    }

    pub fn tool_result(call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        let mut m = Self::new(Role::ToolResult, Some(content.into()));
        m.call_id = Some(call_id.into());
        m.name = Some(name.into());
        m
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_thinking(mut self, thinking: impl Into<String>) -> Self {
        self.thinking = Some(thinking.into());
        self
    }

    /// Return the plain text of this message, if any.
    pub fn as_text(&self) -> Option<&str> {
        self.content.as_deref()
    }

    /// Approximate token count used for context management: 4 characters per
    /// token, the calibration used throughout this workspace.
    pub fn approx_tokens(&self) -> usize {
        let mut chars = self.content.as_ref().map(|c| c.len()).unwrap_or(0);
        chars += self.thinking.as_ref().map(|c| c.len()).unwrap_or(0);
        for call in &self.tool_calls {
            chars += call.name.len();
            chars += call.arguments.to_string().len();
        }
        if chars == 0 && self.tool_calls.is_empty() && self.content.is_none() {
            return 0;
        }
        (chars / 4).max(1)
    }
}

/// A tool schema forwarded to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: serde_json::Value,
}

/// Reasoning effort requested of the model. `Off` omits the parameter
/// entirely rather than sending a zero-effort value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Low,
    Medium,
    High,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub stream: bool,
    pub thinking_level: ThinkingLevel,
    /// Dynamic context (e.g. git branch/commit, CI info) appended for this
    /// request only, without mutating the stored system message — keeps the
    /// cached prefix stable across turns.
    pub system_dynamic_suffix: Option<String>,
}

/// The reason a model round stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ToolCalls,
    Stop,
    Length,
    Error,
}

/// Token usage from one turn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Tokens served from the provider's prompt cache (read hit).
    #[serde(default)]
    pub cache_read_tokens: u32,
    /// Tokens written into the provider's prompt cache (write/creation).
    #[serde(default)]
    pub cache_write_tokens: u32,
}

/// A single normalized event from a model's streamed response.
///
/// Every provider, regardless of wire format, folds its native stream into
/// this event set before it reaches `opal-core` — start/delta/done triples
/// for text and thinking segments, indexed start/delta/done triples for tool
/// calls (OpenAI-style function-calling streams interleave multiple calls by
/// index before any one of them completes), then usage and a terminal
/// `ResponseDone`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    TextStart,
    TextDelta { delta: String },
    TextDone,
    ThinkingStart,
    ThinkingDelta { delta: String },
    ToolCallStart {
        #[serde(skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        call_index: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    ToolCallDelta {
        #[serde(skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        call_index: Option<u32>,
        delta: String,
    },
    ToolCallDone {
        #[serde(skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        call_index: Option<u32>,
    },
    ResponseDone { stop_reason: StopReason },
    Usage(Usage),
    Error { reason: String },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
