// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Mirrors a running agent's message list into its [`SessionTree`] and
//! persists the tree to disk at every turn boundary.
//!
//! `opal-core` has no dependency on `opal-session` — the agent never touches
//! a tree directly — so this is the one place the two meet. Rather than
//! re-deriving messages from the fine-grained event stream (duplicating
//! logic the agent already has), this diffs the agent's own
//! [`opal_core::AgentStateSnapshot::messages`] against what the tree already
//! knows by id. On an ordinary turn boundary every tree id survives and the
//! diff is a pure append. On a `compaction_end` boundary a run of existing
//! ids disappears (the summarized segment) and exactly one new id appears
//! (the summary message); that pair is replayed onto the tree via
//! `replace_path_segment` instead of being appended as a new leaf, so the
//! persisted tree's path stays the compacted one rather than growing the
//! full pre-compaction history plus a trailing summary.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use opal_bus::EventBus;
use opal_core::{Agent, AgentEvent};
use opal_session::SessionTree;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::error;

pub(crate) fn spawn(agent: Agent, bus: Arc<EventBus<AgentEvent>>, tree: Arc<Mutex<SessionTree>>, sessions_dir: PathBuf) -> JoinHandle<()> {
    let session_id = agent.session_id().to_string();
    tokio::spawn(async move {
        let mut sub = bus.subscribe(session_id.clone());
        while let Some(delivery) = sub.rx.recv().await {
            let compacted = matches!(delivery.event, AgentEvent::CompactionEnd { .. });
            if delivery.event.is_terminal() || compacted {
                sync_and_save(&agent, &tree, &sessions_dir, &session_id, compacted).await;
            }
        }
    })
}

async fn sync_and_save(agent: &Agent, tree: &Mutex<SessionTree>, sessions_dir: &std::path::Path, session_id: &str, compacted: bool) {
    let snapshot = agent.get_state().await;
    let mut tree = tree.lock().await;
    let new_ids: HashSet<String> = snapshot.messages.iter().map(|m| m.id.clone()).collect();

    if compacted {
        // The path order of the removed ids is their order on the tree's
        // current path, which is exactly the contiguous segment
        // `replace_path_segment` requires.
        let removed_ids: Vec<String> = tree.get_path().into_iter().map(|m| m.id).filter(|id| !new_ids.contains(id)).collect();
        let known: HashSet<String> = tree.all_messages().into_iter().map(|m| m.id.clone()).collect();
        let summary = snapshot.messages.into_iter().find(|m| !known.contains(&m.id));
        match (removed_ids.is_empty(), summary) {
            (false, Some(summary)) => {
                if let Err(e) = tree.replace_path_segment(&removed_ids, summary) {
                    error!(session_id, error = %e, "failed to replace compacted path segment in session tree");
                }
            }
            (true, _) => { /* compaction found nothing to summarize; nothing to replace */ }
            (false, None) => {
                error!(session_id, "compaction removed messages from the tree but produced no summary to replace them with");
            }
        }
    } else {
        let known: HashSet<String> = tree.all_messages().into_iter().map(|m| m.id.clone()).collect();
        for msg in snapshot.messages.into_iter().filter(|m| !known.contains(&m.id)) {
            tree.append(msg);
        }
    }

    if let Err(e) = tree.save(sessions_dir) {
        error!(session_id, error = %e, "failed to persist session tree after turn");
    }
}
