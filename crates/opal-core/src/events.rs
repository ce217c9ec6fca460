// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Normalized events a running agent turn emits onto its session's event bus.
//!
//! Every variant here is one line of the protocol's `agent/event` notification
//! schema: the `type` tag is this enum's snake_case variant name, and the
//! remaining fields are the notification's `params` (minus `session_id`,
//! which `opal-bus`'s `EventEnvelope` adds). Ordering within a turn:
//! `agent_start` precedes everything else, `agent_end` is last,
//! `tool_execution_start(call_id=c)` precedes its matching
//! `tool_execution_end(call_id=c)`.

use opal_model::{Message, Usage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The outcome of one tool invocation, as reported on `tool_execution_end`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self { ok: true, output: Some(output.into()), error: None }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self { ok: false, output: None, error: Some(error.into()) }
    }
}

/// One normalized event from a running agent turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStart,
    AgentEnd {
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    AgentAbort,
    AgentRecovered,

    MessageStart,
    MessageDelta {
        delta: String,
    },
    /// A user message (live prompt or flushed steer) was appended to the
    /// conversation and session tree.
    MessageApplied {
        text: String,
    },
    /// A prompt arrived while the agent was busy and has been enqueued.
    MessageQueued {
        text: String,
    },

    ThinkingStart,
    ThinkingDelta {
        delta: String,
    },

    ToolExecutionStart {
        tool: String,
        call_id: String,
        #[serde(default)]
        args: Value,
        #[serde(default)]
        meta: Value,
    },
    ToolExecutionEnd {
        tool: String,
        call_id: String,
        result: ToolResult,
    },
    /// A tool called `context.emit` to stream a partial-output chunk before
    /// returning. No ordering guarantee across different tools is made since
    /// at most one tool runs at a time.
    ToolStream {
        call_id: String,
        chunk: String,
    },

    SubAgentStart {
        model: String,
        label: String,
        tools: Vec<String>,
    },
    /// Wraps every event a child agent emits so it reaches the parent's
    /// subscribers under its own namespace; no raw child event ever reaches
    /// the parent bus directly.
    SubAgentEvent {
        parent_call_id: String,
        sub_session_id: String,
        inner: Box<AgentEvent>,
    },

    SkillLoaded {
        name: String,
        description: String,
    },
    ContextDiscovered {
        files: Vec<String>,
    },
    StatusUpdate {
        message: String,
    },
    UsageUpdate(Usage),

    /// Carries the final assistant message of the turn; distinct from
    /// `agent_end`, which signals the runtime has returned to `idle`.
    TurnEnd {
        message: Message,
    },

    CompactionStart {
        msg_count: usize,
    },
    CompactionEnd {
        before: usize,
        after: usize,
    },

    Error {
        reason: String,
    },
}

impl AgentEvent {
    /// The wire `type` discriminator, for logging and debug-ring entries
    /// without paying for a full JSON round-trip.
    pub fn type_name(&self) -> &'static str {
        match self {
            AgentEvent::AgentStart => "agent_start",
            AgentEvent::AgentEnd { .. } => "agent_end",
            AgentEvent::AgentAbort => "agent_abort",
            AgentEvent::AgentRecovered => "agent_recovered",
            AgentEvent::MessageStart => "message_start",
            AgentEvent::MessageDelta { .. } => "message_delta",
            AgentEvent::MessageApplied { .. } => "message_applied",
            AgentEvent::MessageQueued { .. } => "message_queued",
            AgentEvent::ThinkingStart => "thinking_start",
            AgentEvent::ThinkingDelta { .. } => "thinking_delta",
            AgentEvent::ToolExecutionStart { .. } => "tool_execution_start",
            AgentEvent::ToolExecutionEnd { .. } => "tool_execution_end",
            AgentEvent::ToolStream { .. } => "tool_stream",
            AgentEvent::SubAgentStart { .. } => "sub_agent_start",
            AgentEvent::SubAgentEvent { .. } => "sub_agent_event",
            AgentEvent::SkillLoaded { .. } => "skill_loaded",
            AgentEvent::ContextDiscovered { .. } => "context_discovered",
            AgentEvent::StatusUpdate { .. } => "status_update",
            AgentEvent::UsageUpdate(_) => "usage_update",
            AgentEvent::TurnEnd { .. } => "turn_end",
            AgentEvent::CompactionStart { .. } => "compaction_start",
            AgentEvent::CompactionEnd { .. } => "compaction_end",
            AgentEvent::Error { .. } => "error",
        }
    }

    /// True for the two events that terminate a turn's event sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::AgentEnd { .. } | AgentEvent::Error { .. })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_name_matches_serde_tag() {
        let ev = AgentEvent::MessageDelta { delta: "hi".into() };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], ev.type_name());
    }

    #[test]
    fn every_variant_round_trips_through_json() {
        let events = vec![
            AgentEvent::AgentStart,
            AgentEvent::AgentEnd { usage: Some(Usage::default()) },
            AgentEvent::AgentAbort,
            AgentEvent::AgentRecovered,
            AgentEvent::MessageStart,
            AgentEvent::MessageDelta { delta: "d".into() },
            AgentEvent::MessageApplied { text: "t".into() },
            AgentEvent::MessageQueued { text: "q".into() },
            AgentEvent::ThinkingStart,
            AgentEvent::ThinkingDelta { delta: "d".into() },
            AgentEvent::ToolExecutionStart {
                tool: "shell".into(),
                call_id: "c1".into(),
                args: serde_json::json!({"command": "ls"}),
                meta: Value::Null,
            },
            AgentEvent::ToolExecutionEnd {
                tool: "shell".into(),
                call_id: "c1".into(),
                result: ToolResult::ok("src/"),
            },
            AgentEvent::ToolStream { call_id: "c1".into(), chunk: "partial...".into() },
            AgentEvent::SubAgentStart { model: "m".into(), label: "l".into(), tools: vec!["read_file".into()] },
            AgentEvent::SubAgentEvent {
                parent_call_id: "c1".into(),
                sub_session_id: "s2".into(),
                inner: Box::new(AgentEvent::AgentStart),
            },
            AgentEvent::SkillLoaded { name: "n".into(), description: "d".into() },
            AgentEvent::ContextDiscovered { files: vec!["a.rs".into()] },
            AgentEvent::StatusUpdate { message: "m".into() },
            AgentEvent::UsageUpdate(Usage::default()),
            AgentEvent::TurnEnd { message: Message::assistant("done") },
            AgentEvent::CompactionStart { msg_count: 5 },
            AgentEvent::CompactionEnd { before: 10, after: 2 },
            AgentEvent::Error { reason: "boom".into() },
        ];
        for ev in events {
            let json = serde_json::to_string(&ev).unwrap();
            let back: AgentEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(ev, back);
        }
    }

    #[test]
    fn tool_execution_end_error_omits_output() {
        let ev = AgentEvent::ToolExecutionEnd {
            tool: "shell".into(),
            call_id: "c1".into(),
            result: ToolResult::err("not found"),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["result"]["ok"], false);
        assert!(json["result"].get("output").is_none());
        assert_eq!(json["result"]["error"], "not found");
    }

    #[test]
    fn sub_agent_event_never_needs_a_raw_variant() {
        let inner = AgentEvent::MessageDelta { delta: "hi".into() };
        let wrapped = AgentEvent::SubAgentEvent {
            parent_call_id: "c1".into(),
            sub_session_id: "s2".into(),
            inner: Box::new(inner.clone()),
        };
        match wrapped {
            AgentEvent::SubAgentEvent { inner: boxed, .. } => assert_eq!(*boxed, inner),
            _ => panic!("expected SubAgentEvent"),
        }
    }

    #[test]
    fn is_terminal_only_for_agent_end_and_error() {
        assert!(AgentEvent::AgentEnd { usage: None }.is_terminal());
        assert!(AgentEvent::Error { reason: "x".into() }.is_terminal());
        assert!(!AgentEvent::AgentStart.is_terminal());
        assert!(!AgentEvent::TurnEnd { message: Message::assistant("x") }.is_terminal());
    }
}
