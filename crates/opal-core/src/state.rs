// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The Agent Runtime's per-session mutable record.
//!
//! Kept separate from [`crate::agent::Agent`] itself so a snapshot can be
//! handed out by `get_state`/`get_context` without exposing the provider
//! handle, tool registry, or bus the agent also owns.

use std::collections::VecDeque;
use std::path::PathBuf;

use opal_model::{Message, ThinkingLevel, Usage};
use serde::{Deserialize, Serialize};

/// Where the per-session state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
    Streaming,
    ExecutingTools,
    Compacting,
}

impl Default for AgentStatus {
    fn default() -> Self {
        AgentStatus::Idle
    }
}

/// The active model selection. `provider`/`id` name a driver and model the
/// caller has already registered — this runtime never looks providers up by
/// name itself (see [`crate::agent::Agent::set_model`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub provider: String,
    pub id: String,
    pub thinking_level: ThinkingLevel,
}

/// Feature toggles mirrored from [`opal_config::AgentConfig`] that `configure`
/// may flip at runtime, effective starting the next turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgentFeatureToggles {
    pub sub_agents: bool,
    pub skills: bool,
    pub mcp: bool,
    pub debug: bool,
}

/// A deep-cloned, read-only view of [`AgentState`] for `get_state`/`get_context`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStateSnapshot {
    pub status: AgentStatus,
    pub messages: Vec<Message>,
    pub model: ModelSpec,
    pub disabled_tools: Vec<String>,
    pub pending_steers: Vec<String>,
    pub remaining_tool_calls: usize,
    pub token_usage: Usage,
    pub last_prompt_tokens: u32,
    pub working_dir: PathBuf,
    pub config: AgentFeatureToggles,
}

/// The per-session mutable record a running agent owns.
///
/// `pending_tool_task` is not stored here as data — `crate::agent::Agent`
/// holds the live `JoinHandle` directly, since a handle to a running task
/// cannot be meaningfully cloned into a snapshot.
#[derive(Debug)]
pub struct AgentState {
    pub status: AgentStatus,
    pub messages: Vec<Message>,
    pub model: ModelSpec,
    pub disabled_tools: Vec<String>,
    pub pending_steers: VecDeque<String>,
    pub remaining_tool_calls: usize,
    pub token_usage: Usage,
    pub last_prompt_tokens: u32,
    pub working_dir: PathBuf,
    pub config: AgentFeatureToggles,
}

impl AgentState {
    pub fn new(model: ModelSpec, working_dir: PathBuf, config: AgentFeatureToggles) -> Self {
        Self {
            status: AgentStatus::Idle,
            messages: Vec::new(),
            model,
            disabled_tools: Vec::new(),
            pending_steers: VecDeque::new(),
            remaining_tool_calls: 0,
            token_usage: Usage::default(),
            last_prompt_tokens: 0,
            working_dir,
            config,
        }
    }

    pub fn snapshot(&self) -> AgentStateSnapshot {
        AgentStateSnapshot {
            status: self.status,
            messages: self.messages.clone(),
            model: self.model.clone(),
            disabled_tools: self.disabled_tools.clone(),
            pending_steers: self.pending_steers.iter().cloned().collect(),
            remaining_tool_calls: self.remaining_tool_calls,
            token_usage: self.token_usage,
            last_prompt_tokens: self.last_prompt_tokens,
            working_dir: self.working_dir.clone(),
            config: self.config,
        }
    }
}

/// Result of `prompt`/`steer`: whether the text was queued behind a running
/// turn or began a new one immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptOutcome {
    pub queued: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toggles() -> AgentFeatureToggles {
        AgentFeatureToggles { sub_agents: true, skills: true, mcp: false, debug: false }
    }

    #[test]
    fn new_state_starts_idle_with_no_messages() {
        let s = AgentState::new(
            ModelSpec { provider: "mock".into(), id: "mock-model".into(), thinking_level: ThinkingLevel::Off },
            PathBuf::from("/tmp"),
            toggles(),
        );
        assert_eq!(s.status, AgentStatus::Idle);
        assert!(s.messages.is_empty());
        assert_eq!(s.remaining_tool_calls, 0);
    }

    #[test]
    fn snapshot_copies_pending_steers_in_order() {
        let mut s = AgentState::new(
            ModelSpec { provider: "mock".into(), id: "mock-model".into(), thinking_level: ThinkingLevel::Off },
            PathBuf::from("/tmp"),
            toggles(),
        );
        s.pending_steers.push_back("a".into());
        s.pending_steers.push_back("b".into());
        let snap = s.snapshot();
        assert_eq!(snap.pending_steers, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn default_status_is_idle() {
        assert_eq!(AgentStatus::default(), AgentStatus::Idle);
    }
}
