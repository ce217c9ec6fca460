// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! System prompt assembly.
//!
//! The prompt is split into a *stable* prefix (identity, project context
//! file, guidelines, append/override) that a provider's prompt cache can
//! reuse turn over turn, and a *dynamic* suffix (git/CI state) that changes
//! too often to cache and is sent as [`CompletionRequest::system_dynamic_suffix`]
//! instead of being baked into the cached system message.

use chrono::Local;
use std::path::Path;

/// All optional contextual blocks that can be injected into the system prompt.
#[derive(Debug, Default)]
pub struct PromptContext<'a> {
    /// Absolute path to the project root (from `.git` detection).
    pub project_root: Option<&'a Path>,
    /// Pre-formatted git context (branch, commit, dirty status).
    ///
    /// **Caching note**: this field is *volatile* — it changes on every commit
    /// and with every file edit (dirty count). When prompt caching is enabled
    /// this content is placed in a *separate, uncached* system block so the
    /// stable prefix remains cacheable across turns.
    pub git_context: Option<&'a str>,
    /// Contents of the project context file (AGENTS.md / .opal/context.md).
    pub project_context_file: Option<&'a str>,
    /// Pre-formatted CI environment block.
    ///
    /// **Caching note**: like `git_context`, this is volatile between CI runs.
    pub ci_context: Option<&'a str>,
    /// Text appended verbatim after the default Guidelines section.
    pub append: Option<&'a str>,
}

impl<'a> PromptContext<'a> {
    /// Return a version of this context with the volatile fields cleared.
    ///
    /// Used to build the *stable* (cacheable) portion of the system prompt.
    pub fn stable_only(&self) -> Self {
        Self {
            project_root: self.project_root,
            git_context: None,
            project_context_file: self.project_context_file,
            ci_context: None,
            append: self.append,
        }
    }

    /// Format the volatile fields (git + CI context) as a block suitable for
    /// appending to the system prompt outside the cached region.
    ///
    /// Returns `None` when neither git nor CI context is present.
    pub fn dynamic_block(&self) -> Option<String> {
        let git = self.git_context.filter(|s| !s.trim().is_empty()).map(|s| s.to_string());
        let ci = self.ci_context.filter(|s| !s.trim().is_empty()).map(|s| s.to_string());
        match (git, ci) {
            (None, None) => None,
            (Some(g), None) => Some(g),
            (None, Some(c)) => Some(c),
            (Some(g), Some(c)) => Some(format!("{g}\n\n{c}")),
        }
    }
}

// ─── Guidelines ──────────────────────────────────────────────────────────────

mod guidelines {
    pub fn general() -> &'static str {
        "- Be concise and precise. Use tools instead of guessing.\n\
         - State assumptions explicitly when a request is ambiguous."
    }

    pub fn tool_usage() -> &'static str {
        "- Use `read_file` before `write` when modifying an existing file, so you \
           know its current contents.\n\
         - Use `run_terminal_command` for build/test/VCS commands, not for file I/O.\n\
         - Batch independent tool calls in parallel to reduce round trips.\n\
         - Use `ask_question` for decisions that need an explicit human choice; \
           for yes/no, just ask directly in text."
    }

    pub fn code_quality() -> &'static str {
        "- Match the surrounding code's structure and style; do not reformat \
           unrelated lines.\n\
         - Do not create new files unless the task requires it.\n\
         - Write or update tests alongside functional changes."
    }

    pub fn delegation() -> &'static str {
        "- Use `sub_agent` to delegate a self-contained piece of work that does \
           not need the rest of this conversation's context.\n\
         - A sub-agent cannot itself delegate further; keep delegated tasks scoped \
           to what a single additional turn can finish."
    }

    pub fn error_handling() -> &'static str {
        "- When a tool fails, read the error and try a different approach rather \
           than repeating the same call.\n\
         - Never bypass version-control safety checks (force-push, skip hooks) \
           without the user's explicit permission."
    }
}

fn build_guidelines_section() -> String {
    format!(
        "## Guidelines\n\n\
         ### General Principles\n\
         {}\n\n\
         ### Tool Usage Patterns\n\
         {}\n\n\
         ### Code Quality\n\
         {}\n\n\
         ### Delegation\n\
         {}\n\n\
         ### Error Handling\n\
         {}",
        guidelines::general(),
        guidelines::tool_usage(),
        guidelines::code_quality(),
        guidelines::delegation(),
        guidelines::error_handling(),
    )
}

/// Build the system prompt.
///
/// `custom` overrides the built-in identity/guidelines prompt entirely
/// (`AgentConfig::system_prompt` or a runtime override); `ctx.append` is
/// still honored on top of a custom prompt so a user override can layer
/// on top of a project-specific addendum.
pub fn system_prompt(custom: Option<&str>, ctx: PromptContext<'_>) -> String {
    if let Some(custom) = custom {
        if let Some(extra) = ctx.append {
            return format!("{}\n\n{}", custom.trim_end(), extra);
        }
        return custom.to_string();
    }

    let agent_identity = format!(
        "You are Opal, a coding agent that works through a session of typed \
         tool calls rather than a single free-form response.\n\n\
         Current date and time: `{current_date_time}`\n\
         Current working directory: `{current_working_directory}`\n\n\
         Core capabilities:\n\
         - A branching, persisted conversation tree — prior turns remain \
           addressable even after compaction or a restart.\n\
         - Tool execution behind a configurable approval policy.\n\
         - Delegation to a single-level sub-agent for self-contained subtasks.\n\
         - Automatic context compaction as the conversation nears the model's \
           context window.",
        current_date_time = Local::now().format("%Y-%m-%d %H:%M:%S"),
        current_working_directory = std::env::current_dir().map(|p| p.display().to_string()).unwrap_or_default(),
    );

    let project_section = if let Some(root) = ctx.project_root {
        format!(
            "\n\n## Project Context\n\
             Project root directory: `{}`\n\
             - Use this absolute path for all file read/write operations.\n\
             - Pass this path as the `workdir` argument to `run_terminal_command` \
               so shell commands execute in the correct directory.\n\
             - Prefer absolute paths over relative paths in every tool call.",
            root.display()
        )
    } else {
        String::new()
    };

    let context_file_section = if let Some(content) = ctx.project_context_file {
        format!("\n\n## Project Instructions\n\n{content}")
    } else {
        String::new()
    };

    let git_section = ctx.git_context.map(|g| format!("\n\n{g}")).unwrap_or_default();
    let ci_section = ctx.ci_context.map(|c| format!("\n\n{c}")).unwrap_or_default();

    let guidelines_section = build_guidelines_section();

    let append_section = ctx.append.map(|extra| format!("\n\n{extra}")).unwrap_or_default();

    format!(
        "{agent_identity}{project_section}{context_file_section}{git_section}{ci_section}\n\n\
         {guidelines_section}{append_section}",
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }
    fn empty() -> PromptContext<'static> {
        PromptContext::default()
    }

    #[test]
    fn custom_prompt_is_returned_verbatim() {
        let prompt = system_prompt(Some("Custom instructions here."), empty());
        assert_eq!(prompt, "Custom instructions here.");
    }

    #[test]
    fn custom_prompt_with_append() {
        let ctx = PromptContext { append: Some("Extra rule."), ..Default::default() };
        let prompt = system_prompt(Some("Base."), ctx);
        assert!(prompt.contains("Base."));
        assert!(prompt.contains("Extra rule."));
    }

    #[test]
    fn default_prompt_names_opal() {
        let pr = system_prompt(None, empty());
        assert!(pr.contains("Opal"));
    }

    #[test]
    fn default_prompt_includes_guidelines_section() {
        let pr = system_prompt(None, empty());
        assert!(pr.contains("## Guidelines"));
        assert!(pr.contains("### General Principles"));
        assert!(pr.contains("### Tool Usage Patterns"));
        assert!(pr.contains("### Code Quality"));
        assert!(pr.contains("### Delegation"));
        assert!(pr.contains("### Error Handling"));
    }

    #[test]
    fn default_prompt_mentions_sub_agent_single_level_cap() {
        let pr = system_prompt(None, empty());
        assert!(pr.contains("sub_agent"));
        assert!(pr.contains("cannot itself delegate further"));
    }

    #[test]
    fn project_root_appears_in_prompt() {
        let root = p("/home/user/my-project");
        let ctx = PromptContext { project_root: Some(&root), ..Default::default() };
        let pr = system_prompt(None, ctx);
        assert!(pr.contains("/home/user/my-project"));
        assert!(pr.contains("Project Context"));
    }

    #[test]
    fn no_project_root_no_section() {
        let pr = system_prompt(None, empty());
        assert!(!pr.contains("Project Context"));
    }

    #[test]
    fn ci_context_is_appended() {
        let ci = "## CI Environment\nRunning in: GitHub Actions\nBranch: main";
        let ctx = PromptContext { ci_context: Some(ci), ..Default::default() };
        let pr = system_prompt(None, ctx);
        assert!(pr.contains("GitHub Actions"));
        assert!(pr.contains("Branch: main"));
    }

    #[test]
    fn git_context_appears_in_prompt() {
        let git = "## Git Context\nBranch: main\nCommit: abc1234";
        let ctx = PromptContext { git_context: Some(git), ..Default::default() };
        let pr = system_prompt(None, ctx);
        assert!(pr.contains("Git Context"));
        assert!(pr.contains("abc1234"));
    }

    #[test]
    fn project_context_file_appears_in_prompt() {
        let file_content = "Always write tests for every function.";
        let ctx = PromptContext { project_context_file: Some(file_content), ..Default::default() };
        let pr = system_prompt(None, ctx);
        assert!(pr.contains("Project Instructions"));
        assert!(pr.contains("Always write tests"));
    }

    #[test]
    fn append_section_is_added_after_guidelines() {
        let ctx = PromptContext { append: Some("Custom rule: never delete files."), ..Default::default() };
        let pr = system_prompt(None, ctx);
        let guidelines_pos = pr.find("Guidelines").unwrap();
        let append_pos = pr.find("Custom rule").unwrap();
        assert!(append_pos > guidelines_pos);
    }

    #[test]
    fn stable_only_clears_volatile_fields() {
        let ctx = PromptContext {
            git_context: Some("git stuff"),
            ci_context: Some("ci stuff"),
            project_root: Some(&PathBuf::from("/x")),
            ..Default::default()
        };
        let stable = ctx.stable_only();
        assert!(stable.git_context.is_none());
        assert!(stable.ci_context.is_none());
        assert!(stable.project_root.is_some());
    }

    #[test]
    fn dynamic_block_none_when_empty() {
        assert!(empty().dynamic_block().is_none());
    }

    #[test]
    fn dynamic_block_concatenates_git_and_ci() {
        let ctx = PromptContext { git_context: Some("GIT"), ci_context: Some("CI"), ..Default::default() };
        let block = ctx.dynamic_block().unwrap();
        assert!(block.contains("GIT"));
        assert!(block.contains("CI"));
    }
}
