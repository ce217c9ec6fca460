// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::tool::{AgentStateRef, Tool, ToolCall, ToolContext, ToolOutput};

pub struct WriteTool;

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Writes a file to the local filesystem. Overwrites any existing file at the path. \
         Creates parent directories automatically. \
         Set append=true to add to the end of an existing file instead of overwriting."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Absolute or working-directory-relative path to the file" },
                "content": { "type": "string", "description": "Content to write to the file" },
                "append": { "type": "boolean", "description": "If true, append instead of overwriting (default false)" }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'path'"),
        };
        let content = match call.args.get("content").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'content'"),
        };
        let should_append = call.args.get("append").and_then(|v| v.as_bool()).unwrap_or(false);

        let resolved = ctx.working_dir.join(&path);
        debug!(path = %resolved.display(), append = should_append, "write_file tool");

        if let Some(parent) = resolved.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
        }

        if should_append {
            use tokio::io::AsyncWriteExt;
            match tokio::fs::OpenOptions::new().append(true).create(true).open(&resolved).await {
                Ok(mut f) => {
                    let result = f.write_all(content.as_bytes()).await;
                    let _ = f.flush().await;
                    let _ = f.shutdown().await;
                    match result {
                        Ok(_) => ToolOutput::ok(&call.id, format!("appended {} bytes to {path}", content.len())),
                        Err(e) => ToolOutput::err(&call.id, format!("write error: {e}")),
                    }
                }
                Err(e) => ToolOutput::err(&call.id, format!("open error: {e}")),
            }
        } else {
            match tokio::fs::write(&resolved, &content).await {
                Ok(_) => ToolOutput::ok(&call.id, format!("wrote {} bytes to {path}", content.len())),
                Err(e) => ToolOutput::err(&call.id, format!("write error: {e}")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::tool::{Question, QuestionHandler, ToolCall};

    struct NoopHandler;
    #[async_trait]
    impl QuestionHandler for NoopHandler {
        async fn ask(&self, _q: Question) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    fn ctx(dir: &std::path::Path) -> ToolContext {
        let (tx, _rx) = mpsc::unbounded_channel();
        ToolContext {
            working_dir: dir.to_path_buf(),
            session_id: "s1".into(),
            call_id: "c1".into(),
            emit: tx,
            question_handler: Arc::new(NoopHandler),
            agent_state: AgentStateRef::default(),
        }
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall { id: "w1".into(), name: "write_file".into(), args }
    }

    #[tokio::test]
    async fn write_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = WriteTool.execute(&call(json!({"path": "out.txt", "content": "hello write"})), &ctx(dir.path())).await;
        assert!(!out.is_error, "{}", out.content);
        assert_eq!(std::fs::read_to_string(dir.path().join("out.txt")).unwrap(), "hello write");
    }

    #[tokio::test]
    async fn append_adds_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(dir.path());
        let w1 = WriteTool.execute(&call(json!({"path": "f.txt", "content": "first\n"})), &c).await;
        assert!(!w1.is_error, "{}", w1.content);
        let w2 = WriteTool.execute(&call(json!({"path": "f.txt", "content": "second\n", "append": true})), &c).await;
        assert!(!w2.is_error, "{}", w2.content);
        let contents = std::fs::read_to_string(dir.path().join("f.txt")).unwrap();
        assert!(contents.contains("first"));
        assert!(contents.contains("second"));
    }

    #[tokio::test]
    async fn write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let out = WriteTool.execute(&call(json!({"path": "sub/dir/file.txt", "content": "nested"})), &ctx(dir.path())).await;
        assert!(!out.is_error, "{}", out.content);
        assert_eq!(std::fs::read_to_string(dir.path().join("sub/dir/file.txt")).unwrap(), "nested");
    }

    #[tokio::test]
    async fn missing_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = WriteTool.execute(&call(json!({"content": "x"})), &ctx(dir.path())).await;
        assert!(out.is_error);
        assert!(out.content.contains("missing required parameter 'path'"));
    }

    #[tokio::test]
    async fn missing_content_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = WriteTool.execute(&call(json!({"path": "x.txt"})), &ctx(dir.path())).await;
        assert!(out.is_error);
        assert!(out.content.contains("missing required parameter 'content'"));
    }
}
