// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Wires a session's [`ApprovalHandler`]/[`QuestionHandler`] to the RPC
//! client: a tool that needs a decision blocks its turn on a `client/confirm`
//! or `client/input` server-initiated request and resumes once the client
//! answers (or the deadline in [`CLIENT_REQUEST_TIMEOUT`] passes).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use opal_core::ApprovalHandler;
use opal_tools::{Question, QuestionHandler};
use serde_json::json;

use crate::pending::PendingRequests;
use crate::protocol::OutgoingRequest;
use crate::transport::{send, MessageWriter};

/// How long the server waits for a client response to a `client/confirm` or
/// `client/input` request before giving up and failing the tool call.
pub const CLIENT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct RpcApprovalHandler {
    session_id: String,
    pending: Arc<PendingRequests>,
    writer: Arc<dyn MessageWriter>,
}

impl RpcApprovalHandler {
    pub fn new(session_id: impl Into<String>, pending: Arc<PendingRequests>, writer: Arc<dyn MessageWriter>) -> Self {
        Self { session_id: session_id.into(), pending, writer }
    }
}

#[async_trait]
impl ApprovalHandler for RpcApprovalHandler {
    async fn approve(&self, tool_name: &str, command: &str) -> anyhow::Result<bool> {
        let (id, rx) = self.pending.register();
        let request = OutgoingRequest {
            jsonrpc: "2.0",
            id: id.clone(),
            method: "client/confirm",
            params: json!({"session_id": self.session_id, "tool": tool_name, "command": command}),
        };
        send(&self.writer, &request).await?;

        match tokio::time::timeout(CLIENT_REQUEST_TIMEOUT, rx).await {
            Ok(Ok(Ok(value))) => Ok(value.get("approved").and_then(|v| v.as_bool()).unwrap_or(false)),
            Ok(Ok(Err(err))) => bail!("client/confirm rejected: {}", err.message),
            Ok(Err(_)) => bail!("client/confirm channel closed before a reply arrived"),
            Err(_) => bail!("client/confirm timed out waiting for {id}"),
        }
    }
}

pub struct RpcQuestionHandler {
    session_id: String,
    pending: Arc<PendingRequests>,
    writer: Arc<dyn MessageWriter>,
}

impl RpcQuestionHandler {
    pub fn new(session_id: impl Into<String>, pending: Arc<PendingRequests>, writer: Arc<dyn MessageWriter>) -> Self {
        Self { session_id: session_id.into(), pending, writer }
    }
}

#[async_trait]
impl QuestionHandler for RpcQuestionHandler {
    async fn ask(&self, question: Question) -> anyhow::Result<String> {
        let (id, rx) = self.pending.register();
        let request = OutgoingRequest {
            jsonrpc: "2.0",
            id: id.clone(),
            method: "client/input",
            params: json!({
                "session_id": self.session_id,
                "prompt": question.prompt,
                "choices": question.choices,
            }),
        };
        send(&self.writer, &request).await?;

        match tokio::time::timeout(CLIENT_REQUEST_TIMEOUT, rx).await {
            Ok(Ok(Ok(value))) => value
                .get("answer")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| anyhow!("client/input reply missing a string \"answer\" field")),
            Ok(Ok(Err(err))) => bail!("client/input rejected: {}", err.message),
            Ok(Err(_)) => bail!("client/input channel closed before a reply arrived"),
            Err(_) => bail!("client/input timed out waiting for {id}"),
        }
    }
}
