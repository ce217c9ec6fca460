// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
pub mod policy;
pub mod registry;
pub mod tool;

pub use policy::{ApprovalPolicy, ToolPolicy};
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{
    AgentStateRef, OutputCategory, Question, QuestionHandler, Tool, ToolCall, ToolContext, ToolOutput, ToolOutputPart,
};

pub use builtin::ask_question::AskQuestionTool;
pub use builtin::read_file::ReadFileTool;
pub use builtin::run_terminal_command::RunTerminalCommandTool;
pub use builtin::write_file::WriteTool;

/// Builds a [`ToolRegistry`] with every built-in tool registered.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool);
    registry.register(WriteTool);
    registry.register(RunTerminalCommandTool::default());
    registry.register(AskQuestionTool);
    registry
}
