// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The method dispatcher: decodes inbound JSON-RPC lines, routes requests to
//! the [`Supervisor`], and forwards every bus event as an `agent/event`
//! notification. One [`Server`] is shared (behind an `Arc`) between the
//! read loop and the notification-forwarding task it spawns.

use std::path::PathBuf;
use std::sync::Arc;

use opal_config::{Config, ModelConfig};
use opal_core::AgentRuntimeContext;
use opal_model::ThinkingLevel;
use opal_session::{SessionError, SessionTree};
use opal_supervisor::{StartSessionSpec, Supervisor, SupervisorError};
use opal_tools::QuestionHandler;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::debug::{new_rpc_ring, BoundedRing, Direction, RpcLogEntry};
use crate::pending::PendingRequests;
use crate::protocol::{
    ErrorObject, IncomingMessage, OutgoingNotification, Response, INTERNAL_ERROR, INVALID_PARAMS,
    INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
};
use crate::relay::{RpcApprovalHandler, RpcQuestionHandler};
use crate::transport::MessageWriter;

/// Everything the dispatcher needs that outlives a single request: the
/// supervisor it drives, the mutable runtime config (`opal/config/*`), the
/// freeform settings store (`settings/*`), and the wiring back to the
/// transport.
pub struct Server {
    supervisor: Arc<Supervisor>,
    config: Mutex<Config>,
    settings: Mutex<Value>,
    sessions_dir: PathBuf,
    pending: Arc<PendingRequests>,
    writer: Arc<dyn MessageWriter>,
    rpc_log: Mutex<BoundedRing<RpcLogEntry>>,
    version: String,
}

impl Server {
    pub fn new(
        supervisor: Arc<Supervisor>,
        config: Config,
        sessions_dir: PathBuf,
        writer: Arc<dyn MessageWriter>,
        version: impl Into<String>,
    ) -> Arc<Self> {
        let settings = std::fs::read(sessions_dir.join("settings.json"))
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_else(|| Value::Object(Default::default()));

        Arc::new(Self {
            supervisor,
            config: Mutex::new(config),
            settings: Mutex::new(settings),
            sessions_dir,
            pending: Arc::new(PendingRequests::new()),
            writer,
            rpc_log: Mutex::new(new_rpc_ring()),
            version: version.into(),
        })
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    /// Drives the server until `reader` reaches EOF: spawns the
    /// notification-forwarding task, decodes one line at a time, and
    /// dispatches each request concurrently (request ordering across
    /// sessions is not guaranteed; ordering within a session's own event
    /// stream is the bus's job, not this loop's).
    pub async fn run<R: AsyncBufRead + Unpin>(self: Arc<Self>, mut reader: R) -> anyhow::Result<()> {
        let forwarder = {
            let this = self.clone();
            tokio::spawn(async move { this.forward_events().await })
        };

        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                break;
            }
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if trimmed.is_empty() {
                continue;
            }
            self.log_line(Direction::Inbound, trimmed).await;
            let this = self.clone();
            let owned = trimmed.to_string();
            tokio::spawn(async move { this.handle_line(&owned).await });
        }

        forwarder.abort();
        self.pending.cancel_all();
        self.supervisor.snapshot_all().await;
        Ok(())
    }

    async fn forward_events(self: Arc<Self>) {
        let mut sub = self.supervisor.bus().subscribe_all();
        while let Some(delivery) = sub.rx.recv().await {
            let mut params = match serde_json::to_value(&delivery.event) {
                Ok(v) => v,
                Err(e) => {
                    error!(error = %e, "failed to serialize agent event");
                    continue;
                }
            };
            if let Some(obj) = params.as_object_mut() {
                obj.insert("session_id".to_string(), Value::String(delivery.session_id.clone()));
            }
            let notification = OutgoingNotification::new("agent/event", params);
            self.emit(&notification).await;
        }
    }

    async fn handle_line(self: Arc<Self>, line: &str) {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                self.emit(&Response::err(Value::Null, ErrorObject::new(PARSE_ERROR, format!("invalid JSON: {e}")))).await;
                return;
            }
        };
        let msg: IncomingMessage = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(e) => {
                self.emit(&Response::err(Value::Null, ErrorObject::new(PARSE_ERROR, format!("malformed message: {e}")))).await;
                return;
            }
        };

        // A line with no method is either a reply to one of our own
        // server-initiated requests, or garbage; either way it never gets a
        // response of its own.
        if msg.method.is_none() {
            if let Some(id) = msg.id.as_ref().and_then(|v| v.as_str()) {
                let reply = match (msg.result, msg.error) {
                    (Some(r), _) => Ok(r),
                    (None, Some(e)) => Err(e),
                    (None, None) => Err(ErrorObject::new(INVALID_REQUEST, "response carries neither result nor error")),
                };
                self.pending.resolve(id, reply);
            }
            return;
        }

        let method = msg.method.unwrap();
        let Some(id) = msg.id else {
            // A client-sent notification. Nothing in this protocol expects one.
            warn!(method, "ignoring client notification");
            return;
        };

        if msg.jsonrpc.as_deref() != Some("2.0") {
            self.emit(&Response::err(id, ErrorObject::new(INVALID_REQUEST, "missing or invalid jsonrpc version"))).await;
            return;
        }

        let params = msg.params.unwrap_or(Value::Null);
        let response = match self.dispatch(&method, params).await {
            Ok(result) => Response::ok(id, result),
            Err(error) => Response::err(id, error),
        };
        self.emit(&response).await;
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, ErrorObject> {
        match method {
            "session/start" => self.session_start(params).await,
            "session/list" => self.session_list().await,
            "session/branch" => self.session_branch(params).await,
            "session/compact" => self.session_compact(params).await,
            "session/delete" => self.session_delete(params).await,
            "agent/prompt" => self.agent_prompt(params).await,
            "agent/steer" => self.agent_steer(params).await,
            "agent/abort" => self.agent_abort(params).await,
            "agent/state" => self.agent_state(params).await,
            "models/list" => self.models_list(params).await,
            "model/set" => self.model_set(params).await,
            "thinking/set" => self.thinking_set(params).await,
            "auth/status" => Ok(self.auth_status().await),
            "auth/login" => Ok(auth_login()),
            "auth/poll" => Ok(auth_poll()),
            "auth/set_key" => self.auth_set_key(params).await,
            "opal/config/get" => self.config_get().await,
            "opal/config/set" => self.config_set(params).await,
            "opal/version" => Ok(json!({"name": "opal", "version": self.version})),
            "opal/ping" => Ok(json!({"pong": true})),
            "settings/get" => Ok(self.settings_get(params).await),
            "settings/save" => self.settings_save(params).await,
            "tasks/list" => Ok(self.tasks_list().await),
            other => Err(ErrorObject::new(METHOD_NOT_FOUND, format!("unknown method: {other}"))),
        }
    }

    // ─── session/* ───────────────────────────────────────────────────────

    async fn session_start(&self, params: Value) -> Result<Value, ErrorObject> {
        let session_id = params
            .get("session_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let restore = params.get("restore").and_then(|v| v.as_bool()).unwrap_or(false);

        let config = self.config.lock().await.clone();
        let model = match params.get("model").and_then(|v| v.as_str()) {
            Some(name) => ModelConfig { name: name.to_string(), ..config.model.clone() },
            None => config.model.clone(),
        };
        let context_window = opal_model::catalog::context_window(&model.provider, &model.name, 128_000);

        let approval: Arc<dyn opal_core::ApprovalHandler> =
            Arc::new(RpcApprovalHandler::new(session_id.clone(), self.pending.clone(), self.writer.clone()));
        let question_handler: Arc<dyn QuestionHandler> =
            Arc::new(RpcQuestionHandler::new(session_id.clone(), self.pending.clone(), self.writer.clone()));

        let working_dir = params.get("working_dir").and_then(|v| v.as_str()).map(PathBuf::from);
        let runtime_ctx = detect_runtime_context(working_dir.as_deref());

        let spec = StartSessionSpec {
            session_id: session_id.clone(),
            model,
            agent_config: config.agent,
            runtime_ctx,
            context_window,
            restore,
            approval: Some(approval),
            question_handler: Some(question_handler),
        };
        self.supervisor.start_session(spec).await.map_err(supervisor_error)?;
        Ok(json!({"session_id": session_id}))
    }

    async fn session_list(&self) -> Result<Value, ErrorObject> {
        let listing = SessionTree::list_sessions(&self.sessions_dir).map_err(session_error)?;
        let sessions: Vec<Value> = listing
            .into_iter()
            .map(|s| json!({"session_id": s.session_id, "title": s.title, "modified": s.modified.to_rfc3339()}))
            .collect();
        Ok(json!({"sessions": sessions}))
    }

    async fn session_branch(&self, params: Value) -> Result<Value, ErrorObject> {
        let session_id = required_str(&params, "session_id")?;
        let message_id = required_str(&params, "message_id")?;
        let handle = self.require_handle(&session_id).await?;
        let path = {
            let mut tree = handle.tree.lock().await;
            tree.branch(&message_id).map_err(session_error)?;
            tree.get_path()
        };
        handle.agent.sync_messages(path).await;
        Ok(json!({"session_id": session_id, "message_id": message_id}))
    }

    async fn session_compact(&self, params: Value) -> Result<Value, ErrorObject> {
        let session_id = required_str(&params, "session_id")?;
        let handle = self.require_handle(&session_id).await?;
        handle.agent.force_compact().await;
        Ok(json!({"session_id": session_id}))
    }

    async fn session_delete(&self, params: Value) -> Result<Value, ErrorObject> {
        let session_id = required_str(&params, "session_id")?;
        self.supervisor.stop_session(&session_id).await.map_err(supervisor_error)?;
        let _ = std::fs::remove_file(self.sessions_dir.join(format!("{session_id}.json")));
        Ok(json!({"session_id": session_id, "deleted": true}))
    }

    // ─── agent/* ─────────────────────────────────────────────────────────

    async fn agent_prompt(&self, params: Value) -> Result<Value, ErrorObject> {
        let session_id = required_str(&params, "session_id")?;
        let text = required_str(&params, "text")?;
        let handle = self.require_handle(&session_id).await?;
        let outcome = handle.agent.prompt(text).await;
        Ok(json!({"queued": outcome.queued}))
    }

    async fn agent_steer(&self, params: Value) -> Result<Value, ErrorObject> {
        let session_id = required_str(&params, "session_id")?;
        let text = required_str(&params, "text")?;
        let handle = self.require_handle(&session_id).await?;
        let outcome = handle.agent.steer(text).await;
        Ok(json!({"queued": outcome.queued}))
    }

    async fn agent_abort(&self, params: Value) -> Result<Value, ErrorObject> {
        let session_id = required_str(&params, "session_id")?;
        let handle = self.require_handle(&session_id).await?;
        handle.agent.abort().await;
        Ok(json!({"session_id": session_id, "aborted": true}))
    }

    async fn agent_state(&self, params: Value) -> Result<Value, ErrorObject> {
        let session_id = required_str(&params, "session_id")?;
        let handle = self.require_handle(&session_id).await?;
        let snapshot = handle.agent.get_state().await;
        serde_json::to_value(snapshot).map_err(internal_error)
    }

    // ─── models/*, model/set, thinking/set ──────────────────────────────

    async fn models_list(&self, params: Value) -> Result<Value, ErrorObject> {
        let filter: Option<Vec<String>> = params
            .get("providers")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect());
        let mut models = opal_model::catalog::static_catalog();
        if let Some(providers) = filter {
            models.retain(|m| providers.contains(&m.provider));
        }
        Ok(json!({"models": models}))
    }

    async fn model_set(&self, params: Value) -> Result<Value, ErrorObject> {
        let session_id = required_str(&params, "session_id")?;
        let provider = required_str(&params, "provider")?;
        let model_name = required_str(&params, "model")?;
        let handle = self.require_handle(&session_id).await?;

        let model_config = ModelConfig { provider: provider.clone(), name: model_name.clone(), ..ModelConfig::default() };
        let provider_impl = opal_model::from_config(&model_config).map_err(|e| ErrorObject::new(INVALID_PARAMS, e.to_string()))?;
        let thinking_level = handle.agent.get_state().await.model.thinking_level;
        handle.agent.set_model(Arc::from(provider_impl), thinking_level).await;
        Ok(json!({"session_id": session_id, "provider": provider, "model": model_name}))
    }

    async fn thinking_set(&self, params: Value) -> Result<Value, ErrorObject> {
        let session_id = required_str(&params, "session_id")?;
        let level_str = required_str(&params, "level")?;
        let level = match level_str.as_str() {
            "off" => ThinkingLevel::Off,
            "low" => ThinkingLevel::Low,
            "medium" => ThinkingLevel::Medium,
            "high" => ThinkingLevel::High,
            other => return Err(ErrorObject::new(INVALID_PARAMS, format!("unknown thinking level: {other}"))),
        };
        let handle = self.require_handle(&session_id).await?;
        handle.agent.set_thinking_level(level).await;
        Ok(json!({"session_id": session_id, "level": level_str}))
    }

    // ─── auth/* ──────────────────────────────────────────────────────────
    //
    // Acquiring a real provider auth token is out of scope for this
    // runtime; these three still return well-formed results so the
    // protocol's declared method set is complete end to end.

    async fn auth_status(&self) -> Value {
        let config = self.config.lock().await;
        let configured = config.model.api_key.is_some() || config.model.api_key_env.is_some();
        json!({"provider": config.model.provider, "configured": configured})
    }

    async fn auth_set_key(&self, params: Value) -> Result<Value, ErrorObject> {
        let provider = required_str(&params, "provider")?;
        let api_key = required_str(&params, "api_key")?;
        let mut config = self.config.lock().await;
        if config.model.provider == provider {
            config.model.api_key = Some(api_key.clone());
        }
        config
            .providers
            .entry(provider.clone())
            .or_insert_with(|| ModelConfig { provider: provider.clone(), ..ModelConfig::default() })
            .api_key = Some(api_key);
        Ok(json!({"provider": provider, "stored": true}))
    }

    // ─── opal/config/* ───────────────────────────────────────────────────

    async fn config_get(&self) -> Result<Value, ErrorObject> {
        let mut value = serde_json::to_value(&*self.config.lock().await).map_err(internal_error)?;
        redact_secrets(&mut value);
        Ok(value)
    }

    async fn config_set(&self, patch: Value) -> Result<Value, ErrorObject> {
        let mut config = self.config.lock().await;
        let current = serde_json::to_value(&*config).map_err(internal_error)?;
        let mut dst: serde_yaml::Value = serde_yaml::to_value(&current).map_err(internal_error)?;
        let src: serde_yaml::Value = serde_yaml::to_value(&patch).map_err(internal_error)?;
        opal_config::merge_yaml(&mut dst, src);
        let merged: Config = opal_config::from_value(dst).map_err(|e| ErrorObject::new(INVALID_PARAMS, e.to_string()))?;
        *config = merged;
        let mut out = serde_json::to_value(&*config).map_err(internal_error)?;
        redact_secrets(&mut out);
        Ok(out)
    }

    // ─── settings/* ──────────────────────────────────────────────────────

    async fn settings_get(&self, params: Value) -> Value {
        let settings = self.settings.lock().await;
        match params.get("key").and_then(|v| v.as_str()) {
            Some(key) => json!({"value": settings.get(key).cloned().unwrap_or(Value::Null)}),
            None => json!({"settings": settings.clone()}),
        }
    }

    async fn settings_save(&self, params: Value) -> Result<Value, ErrorObject> {
        let key = required_str(&params, "key")?;
        let value = params.get("value").cloned().unwrap_or(Value::Null);
        let mut settings = self.settings.lock().await;
        if let Some(obj) = settings.as_object_mut() {
            obj.insert(key.clone(), value);
        }
        if std::fs::create_dir_all(&self.sessions_dir).is_ok() {
            if let Ok(bytes) = serde_json::to_vec_pretty(&*settings) {
                if let Err(e) = std::fs::write(self.sessions_dir.join("settings.json"), bytes) {
                    warn!(error = %e, "failed to persist settings");
                }
            }
        }
        Ok(json!({"key": key, "saved": true}))
    }

    // ─── tasks/list ──────────────────────────────────────────────────────

    async fn tasks_list(&self) -> Value {
        let mut tasks = Vec::new();
        for session_id in self.supervisor.list_session_ids().await {
            if let Some(info) = self.supervisor.info(&session_id).await {
                tasks.push(json!({
                    "session_id": info.session_id,
                    "active_tool_calls": info.active_tool_calls,
                    "sub_agents_enabled": info.sub_agents_enabled,
                    "restarts": info.restarts,
                }));
            }
        }
        json!({"tasks": tasks})
    }

    // ─── shared helpers ──────────────────────────────────────────────────

    async fn require_handle(&self, session_id: &str) -> Result<opal_supervisor::SessionHandle, ErrorObject> {
        self.supervisor
            .handle(session_id)
            .await
            .ok_or_else(|| ErrorObject::with_data(INVALID_PARAMS, "session not found", json!({"session_id": session_id})))
    }

    async fn emit(&self, value: &impl Serialize) {
        let line = match serde_json::to_string(value) {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "failed to serialize outgoing RPC message");
                return;
            }
        };
        self.log_line(Direction::Outbound, &line).await;
        if let Err(e) = self.writer.write_line(&line).await {
            error!(error = %e, "failed to write RPC line");
        }
    }

    async fn log_line(&self, direction: Direction, line: &str) {
        self.rpc_log.lock().await.push(RpcLogEntry { direction, line: line.to_string() });
    }
}

/// Detects everything [`AgentRuntimeContext`] carries that isn't a CLI/config
/// override: the project root (`.git` walk-up from `working_dir`, or the
/// server's own cwd when the client didn't supply one), its git and CI
/// environment context, and the project context file (`AGENTS.md`, …) found
/// there. All are best-effort — a detection failure just leaves that field
/// `None` rather than failing `session/start`.
fn detect_runtime_context(working_dir: Option<&std::path::Path>) -> AgentRuntimeContext {
    let project_root = match working_dir {
        Some(dir) => opal_runtime::find_project_root_from(dir),
        None => opal_runtime::find_project_root().ok(),
    };
    let git_context_note = project_root
        .as_deref()
        .map(opal_runtime::collect_git_context)
        .and_then(|ctx| ctx.to_prompt_section());
    let project_context_file =
        project_root.as_deref().and_then(opal_runtime::load_project_context_file);
    let ci = opal_runtime::detect_ci_context();
    let ci_context_note = ci.to_prompt_section();

    AgentRuntimeContext { project_root, git_context_note, ci_context_note, project_context_file, ..Default::default() }
}

fn auth_login() -> Value {
    json!({
        "supported": false,
        "message": "token acquisition happens outside this runtime; use auth/set_key or a provider's *_env config field",
    })
}

fn auth_poll() -> Value {
    json!({"status": "not_started"})
}

fn redact_secrets(value: &mut Value) {
    if let Some(model) = value.get_mut("model").and_then(|v| v.as_object_mut()) {
        model.insert("api_key".to_string(), Value::Null);
    }
    if let Some(providers) = value.get_mut("providers").and_then(|v| v.as_object_mut()) {
        for (_, entry) in providers.iter_mut() {
            if let Some(obj) = entry.as_object_mut() {
                obj.insert("api_key".to_string(), Value::Null);
            }
        }
    }
}

fn required_str(params: &Value, name: &str) -> Result<String, ErrorObject> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ErrorObject::new(INVALID_PARAMS, format!("missing or non-string required param \"{name}\"")))
}

fn supervisor_error(e: SupervisorError) -> ErrorObject {
    match &e {
        SupervisorError::AlreadyRunning(_) | SupervisorError::NotFound(_) => ErrorObject::new(INVALID_PARAMS, e.to_string()),
        SupervisorError::Provider(_) => ErrorObject::new(INVALID_PARAMS, e.to_string()),
        SupervisorError::Session(_) => ErrorObject::new(INTERNAL_ERROR, e.to_string()),
    }
}

fn session_error(e: SessionError) -> ErrorObject {
    match &e {
        SessionError::NotFound(_) | SessionError::InvalidSegment => ErrorObject::new(INVALID_PARAMS, e.to_string()),
        SessionError::Io(_) | SessionError::Serde(_) => ErrorObject::new(INTERNAL_ERROR, e.to_string()),
    }
}

fn internal_error(e: impl std::fmt::Display) -> ErrorObject {
    ErrorObject::new(INTERNAL_ERROR, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockWriter;
    use opal_bus::EventBus;
    use tempfile::tempdir;

    fn server(dir: &std::path::Path) -> (Arc<Server>, Arc<MockWriter>) {
        let bus = Arc::new(EventBus::new());
        let supervisor = Arc::new(Supervisor::new(bus, dir.to_path_buf()));
        let mock = Arc::new(MockWriter::new());
        let writer: Arc<dyn MessageWriter> = mock.clone();
        (Server::new(supervisor, Config::default(), dir.to_path_buf(), writer, "0.1.0-test"), mock)
    }

    #[tokio::test]
    async fn ping_returns_pong() {
        let dir = tempdir().unwrap();
        let (server, _mock) = server(dir.path());
        let result = server.dispatch("opal/ping", Value::Null).await.unwrap();
        assert_eq!(result["pong"], true);
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let dir = tempdir().unwrap();
        let (server, _mock) = server(dir.path());
        let err = server.dispatch("nonexistent/method", Value::Null).await.unwrap_err();
        assert_eq!(err.code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn session_start_missing_then_prompt_and_state_round_trip() {
        let dir = tempdir().unwrap();
        let (server, _mock) = server(dir.path());
        let started = server.dispatch("session/start", json!({"session_id": "s1"})).await.unwrap();
        assert_eq!(started["session_id"], "s1");

        let prompted = server.dispatch("agent/prompt", json!({"session_id": "s1", "text": "hello"})).await.unwrap();
        assert_eq!(prompted["queued"], false);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let state = server.dispatch("agent/state", json!({"session_id": "s1"})).await.unwrap();
        assert!(!state["messages"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn agent_methods_on_unknown_session_are_invalid_params() {
        let dir = tempdir().unwrap();
        let (server, _mock) = server(dir.path());
        let err = server.dispatch("agent/abort", json!({"session_id": "nope"})).await.unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
    }

    #[test]
    fn detect_runtime_context_finds_project_root_and_context_file() {
        let project = tempdir().unwrap();
        std::fs::create_dir(project.path().join(".git")).unwrap();
        std::fs::write(project.path().join("AGENTS.md"), "Always run tests.").unwrap();

        let ctx = detect_runtime_context(Some(project.path()));
        assert_eq!(ctx.project_root.unwrap(), project.path().canonicalize().unwrap());
        assert!(ctx.project_context_file.unwrap().contains("Always run tests."));
    }

    #[test]
    fn detect_runtime_context_without_working_dir_falls_back_to_cwd() {
        let ctx = detect_runtime_context(None);
        assert!(ctx.project_root.is_some());
    }

    #[tokio::test]
    async fn handle_line_with_invalid_json_emits_parse_error() {
        let dir = tempdir().unwrap();
        let (server, mock) = server(dir.path());
        server.clone().handle_line("not json").await;
        let lines = mock.lines.lock().await;
        assert!(lines[0].contains("-32700"));
    }

    #[tokio::test]
    async fn handle_line_missing_jsonrpc_version_is_invalid_request() {
        let dir = tempdir().unwrap();
        let (server, mock) = server(dir.path());
        server.clone().handle_line(r#"{"id":1,"method":"opal/ping"}"#).await;
        let lines = mock.lines.lock().await;
        assert!(lines[0].contains("-32600"));
    }

    #[tokio::test]
    async fn handle_line_dispatches_valid_request() {
        let dir = tempdir().unwrap();
        let (server, mock) = server(dir.path());
        server.clone().handle_line(r#"{"jsonrpc":"2.0","id":1,"method":"opal/ping"}"#).await;
        let lines = mock.lines.lock().await;
        assert!(lines[0].contains("\"pong\":true"));
    }

    #[tokio::test]
    async fn handle_line_routes_client_reply_to_pending_waiter() {
        let dir = tempdir().unwrap();
        let (server, _mock) = server(dir.path());
        let (id, rx) = server.pending.register();
        server.clone().handle_line(&format!(r#"{{"jsonrpc":"2.0","id":"{id}","result":{{"approved":true}}}}"#)).await;
        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply["approved"], true);
    }

    #[tokio::test]
    async fn models_list_filters_by_provider() {
        let dir = tempdir().unwrap();
        let (server, _mock) = server(dir.path());
        let result = server.dispatch("models/list", json!({"providers": ["mock"]})).await.unwrap();
        let models = result["models"].as_array().unwrap();
        assert!(models.iter().all(|m| m["provider"] == "mock"));
    }

    #[tokio::test]
    async fn config_get_redacts_api_key() {
        let dir = tempdir().unwrap();
        let (server, _mock) = server(dir.path());
        server.dispatch("auth/set_key", json!({"provider": "mock", "api_key": "secret"})).await.unwrap();
        let cfg = server.dispatch("opal/config/get", Value::Null).await.unwrap();
        assert_eq!(cfg["model"]["api_key"], Value::Null);
    }

    #[tokio::test]
    async fn config_set_merges_without_clobbering_untouched_fields() {
        let dir = tempdir().unwrap();
        let (server, _mock) = server(dir.path());
        server.dispatch("opal/config/set", json!({"agent": {"max_tool_rounds": 5}})).await.unwrap();
        let cfg = server.dispatch("opal/config/get", Value::Null).await.unwrap();
        assert_eq!(cfg["agent"]["max_tool_rounds"], 5);
        assert_eq!(cfg["model"]["provider"], "mock");
    }

    #[tokio::test]
    async fn settings_save_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let (server, _mock) = server(dir.path());
        server.dispatch("settings/save", json!({"key": "theme", "value": "dark"})).await.unwrap();
        let got = server.dispatch("settings/get", json!({"key": "theme"})).await.unwrap();
        assert_eq!(got["value"], "dark");
    }

    #[tokio::test]
    async fn session_delete_removes_persisted_snapshot() {
        let dir = tempdir().unwrap();
        let (server, _mock) = server(dir.path());
        server.dispatch("session/start", json!({"session_id": "s1"})).await.unwrap();
        server.dispatch("agent/prompt", json!({"session_id": "s1", "text": "hi"})).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        server.dispatch("session/delete", json!({"session_id": "s1"})).await.unwrap();
        assert!(!dir.path().join("s1.json").exists());
    }

    #[tokio::test]
    async fn opal_ping_via_full_handle_line_produces_no_error_field() {
        let dir = tempdir().unwrap();
        let (server, mock) = server(dir.path());
        server.clone().handle_line(r#"{"jsonrpc":"2.0","id":7,"method":"opal/ping"}"#).await;
        let lines = mock.lines.lock().await;
        let parsed: Value = serde_json::from_str(&lines[0]).unwrap();
        assert!(parsed.get("error").is_none());
        assert_eq!(parsed["id"], 7);
    }
}
