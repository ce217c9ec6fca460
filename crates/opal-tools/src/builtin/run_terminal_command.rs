// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
#[cfg(unix)]
use libc;
use serde_json::{json, Value};
use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::tool::{AgentStateRef, OutputCategory, Tool, ToolCall, ToolContext, ToolOutput};

/// Hard byte ceiling for combined stdout + stderr returned to the model.
const OUTPUT_LIMIT_BYTES: usize = 20_000;
const TAIL_LINES: usize = 100;

pub struct RunTerminalCommandTool {
    pub timeout_secs: u64,
}

impl Default for RunTerminalCommandTool {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[async_trait]
impl Tool for RunTerminalCommandTool {
    fn name(&self) -> &str {
        "run_terminal_command"
    }

    fn description(&self) -> &str {
        "Executes a shell command and returns stdout + stderr.\n\
         'command' is required; 'timeout_secs' overrides the default 30 s.\n\
         Output is capped at ~20 KB; when larger, only the last 100 lines are kept\n\
         and the full output is saved to a temp file whose path is given in the notice.\n\
         Prefer read_file/write_file for file operations over cat/sed/etc."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "The shell command to execute" },
                "timeout_secs": { "type": "integer", "description": "Execution timeout in seconds (optional)" }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }
    fn output_category(&self) -> OutputCategory {
        OutputCategory::HeadTail
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let command = match call.args.get("command").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'command' argument"),
        };
        let timeout = call.args.get("timeout_secs").and_then(|v| v.as_u64()).unwrap_or(self.timeout_secs);

        debug!(cmd = %command, "run_terminal_command tool");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&command);
        cmd.current_dir(&ctx.working_dir);
        // Detach from any controlling terminal: stdin is closed and the child
        // gets its own session, so it cannot read from or write escape
        // sequences to a TTY that isn't there.
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let result = tokio::time::timeout(std::time::Duration::from_secs(timeout), cmd.output()).await;

        match result {
            Ok(Ok(output)) => {
                let mut content = String::new();
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);

                if !stdout.is_empty() {
                    content.push_str(&tail_truncate(&stdout));
                }
                if !stderr.is_empty() {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str("[stderr]\n");
                    content.push_str(&tail_truncate(&stderr));
                }
                if content.is_empty() {
                    content = format!("[exit {}]", output.status.code().unwrap_or(-1));
                }

                let code = output.status.code().unwrap_or(-1);
                if code == 0 {
                    ToolOutput::ok(&call.id, content)
                } else {
                    ToolOutput::err(&call.id, format!("[exit {code}]\n{content}"))
                }
            }
            Ok(Err(e)) => ToolOutput::err(&call.id, format!("spawn error: {e}")),
            Err(_) => ToolOutput::err(&call.id, format!("timeout after {timeout}s")),
        }
    }
}

/// Keeps only the last [`TAIL_LINES`] lines when `s` exceeds
/// [`OUTPUT_LIMIT_BYTES`] — unlike file reads, where the head usually matters
/// most, a shell command's final lines are where the result and any error
/// live. The untruncated output is spilled to a temp file so nothing is
/// actually lost; its path is surfaced in the omission notice.
pub(crate) fn tail_truncate(s: &str) -> String {
    if s.len() <= OUTPUT_LIMIT_BYTES {
        return s.to_string();
    }

    let lines: Vec<&str> = s.lines().collect();
    let total = lines.len();
    let tail_start = total.saturating_sub(TAIL_LINES);
    let mut tail = lines[tail_start..].join("\n");
    if tail.len() > OUTPUT_LIMIT_BYTES {
        let byte_start = tail.len() - OUTPUT_LIMIT_BYTES;
        let byte_start = tail.char_indices().map(|(i, _)| i).find(|&i| i >= byte_start).unwrap_or(tail.len());
        tail = tail[byte_start..].to_string();
    }
    let omitted_lines = tail_start;

    match spill_to_temp_file(s) {
        Some(path) => format!("...[{omitted_lines} lines omitted; full output saved to {}]...\n{tail}", path.display()),
        None => format!("...[{omitted_lines} lines omitted; full output could not be saved to a temp file]...\n{tail}"),
    }
}

/// Writes `content` to a fresh temp file and leaves it on disk (a plain
/// `NamedTempFile` would delete it on drop, defeating the point).
fn spill_to_temp_file(content: &str) -> Option<PathBuf> {
    let mut file = tempfile::Builder::new().prefix("opal-cmd-output-").suffix(".log").tempfile().ok()?;
    file.write_all(content.as_bytes()).ok()?;
    file.into_temp_path().keep().ok()
}
