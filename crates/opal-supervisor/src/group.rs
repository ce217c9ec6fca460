// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! One session's process group: the agent that drives it, the session tree
//! it is mirrored into, and the task bridging the two.

use std::path::PathBuf;
use std::sync::Arc;

use opal_core::Agent;
use opal_session::SessionTree;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Everything the supervisor starts for one session. Held behind the
/// registry's lock; never handed out directly (see [`crate::SessionHandle`]).
pub(crate) struct SessionGroup {
    pub agent: Agent,
    pub tree: Arc<Mutex<SessionTree>>,
    pub sessions_dir: PathBuf,
    pub bridge: JoinHandle<()>,
    pub restarts: u32,
}

/// A cheap-clone handle to a running session group's two live pieces, handed
/// to RPC callers so driving a turn never touches the registry's lock.
#[derive(Clone)]
pub struct SessionHandle {
    pub agent: Agent,
    pub tree: Arc<Mutex<SessionTree>>,
}

/// A read-only snapshot of one session group's composition, mirroring the
/// registry's `{agent, tool_pool, sub_agent_pool, session_tree?}` shape.
#[derive(Debug, Clone)]
pub struct SessionGroupInfo {
    pub session_id: String,
    pub active_tool_calls: usize,
    pub sub_agents_enabled: bool,
    pub has_session_tree: bool,
    pub restarts: u32,
}
