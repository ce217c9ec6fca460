// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The named session registry: starts, stops, and restarts per-session
//! groups, and snapshots their session trees.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use opal_bus::EventBus;
use opal_config::{AgentConfig, ModelConfig};
use opal_core::{Agent, AgentEvent, AgentRuntimeContext, ApprovalHandler, AutoApprove, NoInteractiveHandler, SubAgentTool};
use opal_model::ModelProvider;
use opal_session::SessionTree;
use opal_tools::{QuestionHandler, ToolRegistry};
use tokio::sync::Mutex;
use tracing::warn;

use crate::bridge;
use crate::error::{Result, SupervisorError};
use crate::group::{SessionGroup, SessionGroupInfo, SessionHandle};

/// Everything [`Supervisor::start_session`] needs to bring up one session's
/// group. `restore` controls whether an existing `<session_id>.json` under
/// the sessions directory is loaded and replayed into the fresh agent before
/// it starts taking turns.
#[derive(Clone)]
pub struct StartSessionSpec {
    pub session_id: String,
    pub model: ModelConfig,
    pub agent_config: AgentConfig,
    pub runtime_ctx: AgentRuntimeContext,
    pub context_window: u32,
    pub restore: bool,
    /// Relays non-auto tool-call approvals to whoever is attached to this
    /// session (the RPC client, for a real server). `None` falls back to
    /// [`AutoApprove`], which is what every existing caller relied on before
    /// this field existed.
    pub approval: Option<Arc<dyn ApprovalHandler>>,
    /// Relays a blocking tool question (`ask_parent`, interactive prompts) to
    /// whoever is attached. `None` falls back to [`NoInteractiveHandler`].
    pub question_handler: Option<Arc<dyn QuestionHandler>>,
}

/// Owns every running session's group and the shared event bus they all
/// broadcast onto. Cheap to clone — wrap in `Arc` at the call site if shared
/// ownership across tasks is needed (the registry's internal lock is already
/// the only mutable state).
pub struct Supervisor {
    bus: Arc<EventBus<AgentEvent>>,
    sessions_dir: PathBuf,
    groups: Mutex<HashMap<String, SessionGroup>>,
}

impl Supervisor {
    pub fn new(bus: Arc<EventBus<AgentEvent>>, sessions_dir: PathBuf) -> Self {
        Self { bus, sessions_dir, groups: Mutex::new(HashMap::new()) }
    }

    pub fn bus(&self) -> &Arc<EventBus<AgentEvent>> {
        &self.bus
    }

    /// Starts a session group: constructs the provider and tool registry
    /// (registering a [`SubAgentTool`] when `spec.agent_config.sub_agents` is
    /// set, since `opal-tools::default_registry` never includes one itself),
    /// the agent, and — if `spec.restore` finds a persisted tree — replays
    /// its active path into the agent via `sync_messages` before returning.
    pub async fn start_session(&self, spec: StartSessionSpec) -> Result<SessionHandle> {
        let mut groups = self.groups.lock().await;
        if groups.contains_key(&spec.session_id) {
            return Err(SupervisorError::AlreadyRunning(spec.session_id));
        }

        let provider: Arc<dyn ModelProvider> = Arc::from(opal_model::from_config(&spec.model)?);
        let tools = Arc::new(build_tool_registry(&spec, provider.clone(), self.bus.clone()));

        let approval = spec.approval.clone().unwrap_or_else(|| Arc::new(AutoApprove));
        let question_handler = spec.question_handler.clone().unwrap_or_else(|| Arc::new(NoInteractiveHandler));
        let agent = Agent::with_depth(
            spec.session_id.clone(),
            provider,
            tools,
            self.bus.clone(),
            &spec.agent_config,
            spec.runtime_ctx.clone(),
            spec.context_window,
            0,
            approval,
            question_handler,
        );

        let tree = if spec.restore {
            SessionTree::load_from(&self.sessions_dir, &spec.session_id).unwrap_or_else(|_| SessionTree::new(spec.session_id.clone()))
        } else {
            SessionTree::new(spec.session_id.clone())
        };
        let path = tree.get_path();
        if !path.is_empty() {
            agent.sync_messages(path).await;
        }
        let tree = Arc::new(Mutex::new(tree));

        let bridge = bridge::spawn(agent.clone(), self.bus.clone(), tree.clone(), self.sessions_dir.clone());

        let handle = SessionHandle { agent: agent.clone(), tree: tree.clone() };
        groups.insert(spec.session_id, SessionGroup { agent, tree, sessions_dir: self.sessions_dir.clone(), bridge, restarts: 0 });
        Ok(handle)
    }

    /// Terminates a session's group: aborts its tree-mirroring bridge task
    /// and any in-flight turn, snapshotting the tree once more first so a
    /// turn that never reached a boundary is not lost.
    pub async fn stop_session(&self, session_id: &str) -> Result<()> {
        let mut groups = self.groups.lock().await;
        let group = groups.remove(session_id).ok_or_else(|| SupervisorError::NotFound(session_id.to_string()))?;
        group.bridge.abort();
        group.agent.abort().await;
        if let Err(e) = group.tree.lock().await.save(&group.sessions_dir) {
            warn!(session_id, error = %e, "failed to snapshot session tree on stop");
        }
        Ok(())
    }

    pub async fn handle(&self, session_id: &str) -> Option<SessionHandle> {
        let groups = self.groups.lock().await;
        groups.get(session_id).map(|g| SessionHandle { agent: g.agent.clone(), tree: g.tree.clone() })
    }

    pub async fn list_session_ids(&self) -> Vec<String> {
        self.groups.lock().await.keys().cloned().collect()
    }

    pub async fn info(&self, session_id: &str) -> Option<SessionGroupInfo> {
        let (agent, restarts) = {
            let groups = self.groups.lock().await;
            let group = groups.get(session_id)?;
            (group.agent.clone(), group.restarts)
        };
        let snapshot = agent.get_state().await;
        Some(SessionGroupInfo {
            session_id: session_id.to_string(),
            active_tool_calls: snapshot.remaining_tool_calls,
            sub_agents_enabled: snapshot.config.sub_agents,
            has_session_tree: true,
            restarts,
        })
    }

    /// Rest-for-one reconciliation: a session whose bridge task ended
    /// without `stop_session` having been called is considered crashed.
    /// The tree is snapshotted as-is and a fresh bridge is spawned against a
    /// new bus subscription — the agent and its provider are left running
    /// untouched, since they are the bridge's provider, not its dependent.
    pub async fn reconcile(&self) {
        let mut groups = self.groups.lock().await;
        for (session_id, group) in groups.iter_mut() {
            if !group.bridge.is_finished() {
                continue;
            }
            warn!(session_id, "session tree bridge ended unexpectedly, restarting");
            if let Err(e) = group.tree.lock().await.save(&group.sessions_dir) {
                warn!(session_id, error = %e, "failed to snapshot session tree before bridge restart");
            }
            group.bridge = bridge::spawn(group.agent.clone(), self.bus.clone(), group.tree.clone(), group.sessions_dir.clone());
            group.restarts += 1;
        }
    }

    /// Snapshots every running session's tree to the sessions directory.
    /// Used on process shutdown, where each group's own non-normal-exit
    /// snapshot wouldn't otherwise run.
    pub async fn snapshot_all(&self) {
        let groups = self.groups.lock().await;
        for (session_id, group) in groups.iter() {
            if let Err(e) = group.tree.lock().await.save(&group.sessions_dir) {
                warn!(session_id, error = %e, "failed to snapshot session tree on shutdown");
            }
        }
    }
}

fn build_tool_registry(spec: &StartSessionSpec, provider: Arc<dyn ModelProvider>, bus: Arc<EventBus<AgentEvent>>) -> ToolRegistry {
    let base = Arc::new(opal_tools::default_registry());
    let mut full = ToolRegistry::new();
    for name in base.names() {
        full.register_arc(base.get(&name).expect("name came from this registry"));
    }
    if spec.agent_config.sub_agents {
        let sub_agent = SubAgentTool::new(base, provider, bus, Arc::new(spec.agent_config.clone()), spec.runtime_ctx.clone(), spec.context_window);
        full.register(sub_agent);
    }
    full
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(id: &str) -> StartSessionSpec {
        StartSessionSpec {
            session_id: id.to_string(),
            model: ModelConfig::default(),
            agent_config: AgentConfig::default(),
            runtime_ctx: AgentRuntimeContext::default(),
            context_window: 100_000,
            restore: false,
            approval: None,
            question_handler: None,
        }
    }

    fn supervisor(dir: &std::path::Path) -> Supervisor {
        Supervisor::new(Arc::new(opal_bus::EventBus::new()), dir.to_path_buf())
    }

    #[tokio::test]
    async fn start_session_registers_it() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());
        sup.start_session(spec("s1")).await.unwrap();
        assert_eq!(sup.list_session_ids().await, vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn starting_duplicate_session_id_errors() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());
        sup.start_session(spec("s1")).await.unwrap();
        let err = sup.start_session(spec("s1")).await.unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning(id) if id == "s1"));
    }

    #[tokio::test]
    async fn stop_session_removes_it_and_writes_snapshot() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());
        let handle = sup.start_session(spec("s1")).await.unwrap();
        handle.agent.prompt("hello").await;
        // give the bridge a moment to mirror the turn onto the tree
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        sup.stop_session("s1").await.unwrap();
        assert!(sup.list_session_ids().await.is_empty());
        assert!(dir.path().join("s1.json").exists());
    }

    #[tokio::test]
    async fn stopping_unknown_session_errors() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());
        assert!(matches!(sup.stop_session("nope").await, Err(SupervisorError::NotFound(_))));
    }

    #[tokio::test]
    async fn bridge_mirrors_turn_into_session_tree() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());
        let handle = sup.start_session(spec("s1")).await.unwrap();
        handle.agent.prompt("hello").await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let tree = handle.tree.lock().await;
        assert!(tree.get_path().len() >= 2, "expects at least the user prompt and assistant reply");
    }

    #[tokio::test]
    async fn info_reports_sub_agents_enabled_by_default() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());
        sup.start_session(spec("s1")).await.unwrap();
        let info = sup.info("s1").await.unwrap();
        assert!(info.sub_agents_enabled);
        assert_eq!(info.restarts, 0);
    }

    #[tokio::test]
    async fn reconcile_restarts_a_finished_bridge() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());
        sup.start_session(spec("s1")).await.unwrap();
        {
            let mut groups = sup.groups.lock().await;
            groups.get_mut("s1").unwrap().bridge.abort();
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        sup.reconcile().await;
        let info = sup.info("s1").await.unwrap();
        assert_eq!(info.restarts, 1);
    }

    #[tokio::test]
    async fn snapshot_all_writes_every_running_session() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path());
        sup.start_session(spec("a")).await.unwrap();
        sup.start_session(spec("b")).await.unwrap();
        sup.snapshot_all().await;
        assert!(dir.path().join("a.json").exists());
        assert!(dir.path().join("b.json").exists());
    }
}
