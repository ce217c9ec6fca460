// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::tool::{AgentStateRef, OutputCategory, Tool, ToolCall, ToolContext, ToolOutput};

/// Default number of lines returned when the caller does not specify a limit.
/// Kept small to avoid flooding the model context on the first read; the
/// agent can paginate with offset + limit to get more.
const DEFAULT_LINE_LIMIT: usize = 200;

/// Hard byte ceiling applied in addition to the line limit. Whichever
/// constraint is hit first determines where the output is cut.
const MAX_BYTES: usize = 20_000;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Reads a file. Default: 200 lines / 20 KB — whichever comes first.\n\
         Binary files are reported as such rather than dumped.\n\
         Lines formatted as L{n}:content (1-indexed).\n\
         When more lines exist, a pagination notice shows the next offset."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Absolute or working-directory-relative path to the file" },
                "offset": { "type": "integer", "description": "1-indexed line number to start reading from (default 1)" },
                "limit": { "type": "integer", "description": "Maximum number of lines to return (default 200)" }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }
    fn output_category(&self) -> OutputCategory {
        OutputCategory::FileContent
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'path'"),
        };
        let offset = call.args.get("offset").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
        let limit = call.args.get("limit").and_then(|v| v.as_u64()).unwrap_or(DEFAULT_LINE_LIMIT as u64) as usize;

        let resolved = ctx.working_dir.join(&path);
        debug!(path = %resolved.display(), offset, limit, "read_file tool");

        let bytes = match tokio::fs::read(&resolved).await {
            Ok(b) => b,
            Err(e) => return ToolOutput::err(&call.id, format!("read error: {e}")),
        };

        if has_binary_content(&bytes) {
            return ToolOutput::ok(&call.id, format!("note: {path} is a binary file ({} bytes); not rendered as text", bytes.len()));
        }

        let text = String::from_utf8_lossy(&bytes);
        let start = offset.saturating_sub(1);
        let all_lines: Vec<&str> = text.lines().collect();
        let total = all_lines.len();

        let mut selected: Vec<String> = Vec::new();
        let mut byte_count = 0usize;
        let mut truncated_by_bytes = false;
        for (i, line) in all_lines.iter().enumerate().skip(start).take(limit) {
            let line_bytes = line.len() + 1;
            if byte_count + line_bytes > MAX_BYTES {
                truncated_by_bytes = true;
                break;
            }
            selected.push(format!("L{}:{}", i + 1, line));
            byte_count += line_bytes;
        }

        let last_shown = start + selected.len();
        let mut content = selected.join("\n");
        if last_shown < total {
            let reason = if truncated_by_bytes {
                format!("byte limit ({MAX_BYTES} B) reached")
            } else {
                format!("{} more lines", total - last_shown)
            };
            content.push_str(&format!(
                "\n...[{reason} — showing L{offset}-L{} of {total}; use offset={} to continue]",
                offset + selected.len().saturating_sub(1),
                last_shown + 1
            ));
        }

        ToolOutput::ok(&call.id, content)
    }
}

/// Samples up to 4096 bytes of `bytes` to decide if the content is binary.
///
/// Any null byte, or more than 30% non-printable bytes outside TAB/LF/CR and
/// the printable ASCII range, counts as binary.
fn has_binary_content(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    let sample = &bytes[..bytes.len().min(4096)];
    if sample.contains(&0u8) {
        return true;
    }
    let non_printable = sample.iter().filter(|&&b| b < 9 || (b > 13 && b < 32)).count();
    non_printable * 100 / sample.len() > 30
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
        ToolCall { id: "r1".into(), name: "read_file".into(), args }
    }

    #[tokio::test]
    async fn reads_file_with_line_numbers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "alpha\nbeta\ngamma\n").unwrap();
        let out = ReadFileTool.execute(&call(json!({"path": "f.txt"})), &ctx(dir.path())).await;
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains("L1:alpha"));
        assert!(out.content.contains("L3:gamma"));
    }

    #[tokio::test]
    async fn offset_and_limit_work() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "l1\nl2\nl3\nl4\nl5\n").unwrap();
        let out = ReadFileTool.execute(&call(json!({"path": "f.txt", "offset": 2, "limit": 2})), &ctx(dir.path())).await;
        assert!(!out.is_error);
        assert!(out.content.contains("L2:l2"));
        assert!(out.content.contains("L3:l3"));
        assert!(!out.content.contains("L1:"));
        assert!(!out.content.contains("L4:"));
    }

    #[tokio::test]
    async fn missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = ReadFileTool.execute(&call(json!({"path": "nope.txt"})), &ctx(dir.path())).await;
        assert!(out.is_error);
        assert!(out.content.contains("read error"));
    }

    #[tokio::test]
    async fn missing_path_param_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = ReadFileTool.execute(&call(json!({})), &ctx(dir.path())).await;
        assert!(out.is_error);
        assert!(out.content.contains("missing required parameter 'path'"));
    }

    #[tokio::test]
    async fn pagination_notice_when_more_lines_exist() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "a\nb\nc\nd\ne\n").unwrap();
        let out = ReadFileTool.execute(&call(json!({"path": "f.txt", "limit": 2})), &ctx(dir.path())).await;
        assert!(!out.is_error);
        assert!(out.content.contains("offset=3"), "{}", out.content);
    }

    #[tokio::test]
    async fn binary_file_is_reported_not_dumped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.bin"), b"\x7fELF\x00\x01\x02\x03").unwrap();
        let out = ReadFileTool.execute(&call(json!({"path": "f.bin"})), &ctx(dir.path())).await;
        assert!(!out.is_error);
        assert!(out.content.contains("binary file"));
    }

    #[test]
    fn null_byte_triggers_binary_detection() {
        assert!(has_binary_content(b"hello\x00world"));
    }

    #[test]
    fn normal_text_not_detected_as_binary() {
        assert!(!has_binary_content(b"Hello, world!\n"));
    }
}
