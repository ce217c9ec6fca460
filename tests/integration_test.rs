// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end tests that exercise the supervisor, session tree, event bus,
//! and tool registry together rather than any single crate in isolation.

use std::sync::Arc;
use std::time::Duration;

use opal_bus::EventBus;
use opal_config::{AgentConfig, ModelConfig};
use opal_core::{AgentEvent, AgentRuntimeContext};
use opal_model::Message;
use opal_session::SessionTree;
use opal_supervisor::{StartSessionSpec, Supervisor};
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

async fn wait_for_tick() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// A full session lifecycle: start, prompt against the mock provider, let
/// the bridge mirror the turn onto disk, then restart the session and
/// confirm its history survived the round trip.
#[tokio::test]
async fn session_survives_stop_and_restore() {
    let dir = tempdir().unwrap();
    let bus = Arc::new(EventBus::<AgentEvent>::new());
    let sup = Supervisor::new(bus, dir.path().to_path_buf());

    let handle = sup.start_session(spec("s1")).await.unwrap();
    handle.agent.prompt("hello there").await;
    wait_for_tick().await;
    sup.stop_session("s1").await.unwrap();

    assert!(dir.path().join("s1.json").exists());

    let mut restore_spec = spec("s1");
    restore_spec.restore = true;
    let handle2 = sup.start_session(restore_spec).await.unwrap();
    let state = handle2.agent.get_state().await;
    assert!(
        state.messages.iter().any(|m| m.content.as_deref() == Some("hello there")),
        "restored agent should have replayed the prior turn's messages"
    );
}

/// After a compaction, the bridge must replace the summarized segment on the
/// persisted tree rather than append the summary alongside the untouched
/// original messages — otherwise restoring a session after compaction
/// replays the full, un-compacted history.
#[tokio::test]
async fn compaction_shrinks_the_persisted_tree_instead_of_appending_to_it() {
    let dir = tempdir().unwrap();
    let bus = Arc::new(EventBus::<AgentEvent>::new());
    let sup = Supervisor::new(bus, dir.path().to_path_buf());

    let mut s = spec("s1");
    s.agent_config.compaction_keep_recent = 0;
    let handle = sup.start_session(s).await.unwrap();

    handle.agent.prompt("first turn").await;
    wait_for_tick().await;
    handle.agent.prompt("second turn").await;
    wait_for_tick().await;

    let before_path = handle.tree.lock().await.get_path();
    assert_eq!(before_path.len(), 4, "two turns against the mock provider produce 4 messages");

    handle.agent.force_compact().await;
    wait_for_tick().await;

    let after_path = handle.tree.lock().await.get_path();
    assert!(after_path.len() < before_path.len(), "compaction should shrink the persisted path, not grow it");
    let before_ids: std::collections::HashSet<_> = before_path.iter().map(|m| m.id.clone()).collect();
    let summarized_away = before_ids.len() - after_path.iter().filter(|m| before_ids.contains(&m.id)).count();
    assert!(summarized_away > 0, "at least one pre-compaction message must have been replaced, not retained alongside the summary");

    sup.stop_session("s1").await.unwrap();
    let reloaded = SessionTree::load_from(dir.path(), "s1").unwrap();
    assert_eq!(reloaded.get_path().len(), after_path.len(), "reload must see the compacted path, not the pre-compaction one");
}

/// Two independently running sessions never see each other's events, but a
/// wildcard subscriber observes both.
#[tokio::test]
async fn event_bus_isolates_sessions_but_wildcard_sees_all() {
    let dir = tempdir().unwrap();
    let bus = Arc::new(EventBus::<AgentEvent>::new());
    let sup = Supervisor::new(bus.clone(), dir.path().to_path_buf());

    let mut a_sub = bus.subscribe("a".to_string());
    let mut wildcard = bus.subscribe_all();

    let a = sup.start_session(spec("a")).await.unwrap();
    let _b = sup.start_session(spec("b")).await.unwrap();

    a.agent.prompt("only for a").await;
    wait_for_tick().await;

    let mut saw_a_scoped = false;
    while let Ok(delivery) = a_sub.rx.try_recv() {
        assert_eq!(delivery.session_id, "a");
        saw_a_scoped = true;
    }
    assert!(saw_a_scoped, "scoped subscriber on \"a\" should see its own events");

    let mut saw_wildcard_a = false;
    while let Ok(delivery) = wildcard.rx.try_recv() {
        if delivery.session_id == "a" {
            saw_wildcard_a = true;
        }
    }
    assert!(saw_wildcard_a, "wildcard subscriber should observe session \"a\"'s events too");
}

/// Branching a session tree off an earlier message discards the messages
/// that came after it on the old path.
#[tokio::test]
async fn branching_tree_prunes_the_abandoned_path() {
    let mut tree = SessionTree::new("branch-test".to_string());
    let first = tree.append(Message::user("first")).id.clone();
    tree.append(Message::assistant("first reply"));
    let second = tree.append(Message::user("second")).id.clone();
    tree.append(Message::assistant("second reply"));
    assert_eq!(tree.get_path().len(), 4);

    tree.branch(&first).unwrap();
    assert_eq!(tree.get_path().len(), 1);
    assert!(tree.get_path_to(&second).is_err(), "branched-away message should be unreachable from the new head");
}

/// Compaction replaces a run of old messages with a single summary message
/// while leaving the messages outside that range untouched.
#[tokio::test]
async fn compaction_replaces_path_segment_with_summary() {
    let mut tree = SessionTree::new("compact-test".to_string());
    let old1 = tree.append(Message::user("old turn 1")).id.clone();
    let old2 = tree.append(Message::assistant("old reply 1")).id.clone();
    let keep = tree.append(Message::user("recent turn")).id.clone();

    tree.replace_path_segment(&[old1, old2], Message::system("summary of old turns")).unwrap();

    let path = tree.get_path();
    assert_eq!(path.len(), 2, "two old messages collapse into one summary");
    assert_eq!(path[0].content.as_deref(), Some("summary of old turns"));
    assert_eq!(path[1].id, keep);
}

/// A session tree saved to disk round-trips through `list_sessions`.
#[tokio::test]
async fn persisted_sessions_are_listed() {
    let dir = tempdir().unwrap();
    let mut tree = SessionTree::new("listed-session".to_string());
    tree.append(Message::user("what's up"));
    tree.save(dir.path()).unwrap();

    let listings = SessionTree::list_sessions(dir.path()).unwrap();
    assert_eq!(listings.len(), 1);
    assert_eq!(listings[0].session_id, "listed-session");
}

/// `opal_config::merge_yaml` layered on top of a loaded config only
/// overrides the keys present in the override document.
#[test]
fn config_layering_preserves_untouched_fields() {
    let base = opal_config::from_str("model:\n  provider: mock\n  name: mock-model\nagent:\n  max_tool_rounds: 200\n").unwrap();
    let mut base_yaml = serde_yaml::to_value(&base).unwrap();
    let override_yaml: serde_yaml::Value = serde_yaml::from_str("agent:\n  max_tool_rounds: 12\n").unwrap();
    opal_config::merge_yaml(&mut base_yaml, override_yaml);
    let merged = opal_config::from_value(base_yaml).unwrap();

    assert_eq!(merged.agent.max_tool_rounds, 12);
    assert_eq!(merged.model.provider, "mock", "untouched model section must survive the merge");
}

/// The static model catalog and the default model config agree on what
/// "mock" means, since the supervisor looks both up independently when
/// starting a session.
#[test]
fn catalog_entry_matches_default_model_config() {
    let cfg = ModelConfig::default();
    let entry = opal_model::catalog::lookup(&cfg.name).expect("default model must be cataloged");
    assert_eq!(entry.provider, cfg.provider);
}

/// Reading a file just written by the `write_file` tool round-trips through
/// `read_file`, exercising the default tool registry end to end.
#[tokio::test]
async fn default_registry_write_then_read_roundtrip() {
    use opal_tools::ToolCall;

    let registry = opal_tools::default_registry();
    let path = std::env::temp_dir().join(format!("opal-it-{}.txt", uuid::Uuid::new_v4()));

    let write = registry
        .get("write_file")
        .expect("write_file must be registered")
        .execute(&ToolCall {
            id: "w1".into(),
            name: "write_file".into(),
            args: serde_json::json!({"path": path.to_string_lossy(), "content": "round trip"}),
        })
        .await;
    assert!(write.ok, "write_file failed: {:?}", write.error);

    let read = registry
        .get("read_file")
        .expect("read_file must be registered")
        .execute(&ToolCall {
            id: "r1".into(),
            name: "read_file".into(),
            args: serde_json::json!({"path": path.to_string_lossy()}),
        })
        .await;
    assert!(read.ok, "read_file failed: {:?}", read.error);
    assert!(read.output.contains("round trip"));

    let _ = std::fs::remove_file(&path);
}

/// `Supervisor::info` reports per-session metadata the RPC layer's
/// `tasks/list` method exposes directly.
#[tokio::test]
async fn supervisor_info_reports_running_sessions() {
    let dir = tempdir().unwrap();
    let bus = Arc::new(EventBus::<AgentEvent>::new());
    let sup = Supervisor::new(bus, dir.path().to_path_buf());
    sup.start_session(spec("s1")).await.unwrap();

    let info = sup.info("s1").await.expect("session must be running");
    assert_eq!(info.session_id, "s1");
    assert_eq!(info.restarts, 0);
    assert!(sup.info("does-not-exist").await.is_none());
}
