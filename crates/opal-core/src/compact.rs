// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Compaction: replacing an older prefix of the active conversation path with
//! an LLM-generated summary so the session stays within its context window.

use std::collections::BTreeSet;

use futures::StreamExt;
use opal_config::CompactionStrategy;
use opal_model::{CompletionRequest, Message, ModelProvider, ProviderEvent, Role};
use opal_tools::OutputCategory;

// ─── Compaction prompts ───────────────────────────────────────────────────────

const SUMMARIZE_PROMPT: &str = "You are a summarizer. Read the conversation transcript below and \
produce a concise, information-dense summary that will replace it in the model's context. Use \
exactly these sections:\n\n\
<Goal>\nWhat the user originally asked for, in 1-2 sentences.\n\
<Progress>\nWhat has been done so far: decisions made, files read or changed, commands run.\n\
<Next>\nWhat remains to be done.\n\n\
Preserve file paths, function/identifier names, and error messages verbatim where they matter.";

fn summarizer_prompt(strategy: &CompactionStrategy) -> &'static str {
    match strategy {
        CompactionStrategy::Summarize => SUMMARIZE_PROMPT,
        CompactionStrategy::Emergency => SUMMARIZE_PROMPT,
    }
}

// ─── Path splitting ────────────────────────────────────────────────────────────

/// Split `path` into `(to_summarize, to_keep)` such that `to_keep`'s token
/// total is at least `keep_recent_tokens` (or the whole path, if smaller).
/// The boundary never falls inside a single tool turn (an assistant message
/// with tool calls plus its subsequent `tool_result`s): if it would, the
/// boundary moves back to that turn's start.
pub fn split_path(path: &[Message], keep_recent_tokens: usize) -> (Vec<Message>, Vec<Message>) {
    if path.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let mut split_at = path.len();
    let mut tokens = 0usize;
    while split_at > 0 {
        tokens += path[split_at - 1].approx_tokens();
        split_at -= 1;
        if tokens >= keep_recent_tokens {
            break;
        }
    }

    split_at = turn_start_at_or_before(path, split_at);

    (path[..split_at].to_vec(), path[split_at..].to_vec())
}

/// Walk backward from `idx` to the start of the tool turn it falls inside, if
/// any. A tool turn starts at the assistant message that issued the tool
/// calls whose results precede `idx`.
fn turn_start_at_or_before(path: &[Message], idx: usize) -> usize {
    if idx == 0 || idx >= path.len() {
        return idx;
    }
    // If the message right at the boundary is a tool_result, its owning
    // assistant message (with tool_calls) must stay together with it.
    if path[idx].role == Role::ToolResult {
        for i in (0..idx).rev() {
            if path[i].role == Role::Assistant && !path[i].tool_calls.is_empty() {
                return i;
            }
            if path[i].role == Role::User {
                break;
            }
        }
    }
    idx
}

/// Detects the "split-turn" case described by the compaction procedure: the
/// tail of `to_summarize` is an assistant-with-tool-calls turn whose
/// `tool_result`s were pushed into `to_keep` because the whole turn didn't
/// fit the boundary snap above (a very large single turn). Returns the index
/// within `to_summarize` where that turn's tool-heavy prefix begins, so the
/// caller can additionally summarize just that prefix.
pub fn detect_split_turn(to_summarize: &[Message]) -> Option<usize> {
    let last = to_summarize.last()?;
    if last.role == Role::Assistant && !last.tool_calls.is_empty() {
        let start = to_summarize.iter().rposition(|m| m.role == Role::User).map(|i| i + 1).unwrap_or(0);
        return Some(start);
    }
    None
}

// ─── Transcript serialization ──────────────────────────────────────────────────

/// Serialize a message slice into the transcript format fed to the
/// summarizer: `<conversation>...</conversation>` with one tagged line (or
/// block) per message. System messages are omitted — they are never part of
/// the compacted history.
pub fn serialize_transcript(messages: &[Message]) -> String {
    let mut out = String::from("<conversation>\n");
    for m in messages {
        match m.role {
            Role::System => continue,
            Role::User => {
                out.push_str(&format!("[User]: {}\n", m.content.as_deref().unwrap_or("")));
            }
            Role::Assistant => {
                if let Some(text) = &m.content {
                    if !text.is_empty() {
                        out.push_str(&format!("[Assistant]: {text}\n"));
                    }
                }
                if !m.tool_calls.is_empty() {
                    out.push_str("[Assistant tool calls]:\n");
                    for call in &m.tool_calls {
                        out.push_str(&format!("  {}({})\n", call.name, call.arguments));
                    }
                }
            }
            Role::ToolResult => {
                let name = m.name.as_deref().unwrap_or("tool");
                out.push_str(&format!("[Tool result ({name})]: {}\n", m.content.as_deref().unwrap_or("")));
            }
        }
    }
    out.push_str("</conversation>");
    out
}

// ─── File metadata scanning ─────────────────────────────────────────────────────

/// Tool names whose `path` argument names a file read, and those that write
/// one. A file appearing in both sets within the same scan is promoted to
/// `modified_files` only, per the compaction procedure.
const READ_TOOLS: &[&str] = &["read_file"];
const WRITE_TOOLS: &[&str] = &["write_file", "edit_file"];

/// Scan a message slice for `read_file`/`write_file`/`edit_file` calls and
/// return the `(read_files, modified_files)` sets the compaction summary's
/// metadata carries, with cross-set promotion already applied.
pub fn scan_file_metadata(messages: &[Message]) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut read = BTreeSet::new();
    let mut modified = BTreeSet::new();
    for m in messages {
        for call in &m.tool_calls {
            let Some(path) = call.arguments.get("path").and_then(|v| v.as_str()) else { continue };
            if READ_TOOLS.contains(&call.name.as_str()) {
                read.insert(path.to_string());
            } else if WRITE_TOOLS.contains(&call.name.as_str()) {
                modified.insert(path.to_string());
            }
        }
    }
    let overlap: Vec<String> = read.intersection(&modified).cloned().collect();
    for path in overlap {
        read.remove(&path);
    }
    (read, modified)
}

/// Merge metadata sets from a prior compaction summary (if `to_summarize`'s
/// head is itself a `compaction_summary`) with freshly scanned sets, so file
/// history accumulates across repeated compactions instead of resetting.
fn union_metadata_sets(
    prior: Option<&Message>,
    fresh_read: BTreeSet<String>,
    fresh_modified: BTreeSet<String>,
) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut read = fresh_read;
    let mut modified = fresh_modified;
    if let Some(prior) = prior {
        if prior.metadata.get("type").and_then(|v| v.as_str()) == Some("compaction_summary") {
            if let Some(arr) = prior.metadata.get("read_files").and_then(|v| v.as_array()) {
                read.extend(arr.iter().filter_map(|v| v.as_str()).map(str::to_string));
            }
            if let Some(arr) = prior.metadata.get("modified_files").and_then(|v| v.as_array()) {
                modified.extend(arr.iter().filter_map(|v| v.as_str()).map(str::to_string));
            }
        }
    }
    let overlap: Vec<String> = read.intersection(&modified).cloned().collect();
    for path in overlap {
        read.remove(&path);
    }
    (read, modified)
}

// ─── Summarizer call ────────────────────────────────────────────────────────────

/// Run the summarizer once against `to_summarize` and build the replacement
/// summary message. Handles the split-turn case by issuing a second,
/// narrower summarizer call over just the tool-heavy prefix and concatenating
/// both sections, per the compaction procedure's step 2.
pub async fn summarize(
    provider: &dyn ModelProvider,
    model_name: &str,
    to_summarize: &[Message],
    strategy: &CompactionStrategy,
) -> anyhow::Result<Message> {
    let prompt = summarizer_prompt(strategy);
    let mut text = run_summarizer_call(provider, prompt, to_summarize).await?;

    if let Some(split_idx) = detect_split_turn(to_summarize) {
        let prefix = &to_summarize[split_idx..];
        let prefix_text = run_summarizer_call(provider, prompt, prefix).await?;
        text = format!("{text}\n\n[Tool-heavy tail]\n{prefix_text}");
    }

    let prior = to_summarize.first();
    let (fresh_read, fresh_modified) = scan_file_metadata(to_summarize);
    let (read_files, modified_files) = union_metadata_sets(prior, fresh_read, fresh_modified);

    let mut summary = Message::user(format!("[Conversation summary]\n\n{text}"))
        .with_metadata("type", serde_json::json!("compaction_summary"))
        .with_metadata("read_files", serde_json::json!(read_files.into_iter().collect::<Vec<_>>()))
        .with_metadata("modified_files", serde_json::json!(modified_files.into_iter().collect::<Vec<_>>()));
    summary.name = Some(model_name.to_string());
    Ok(summary)
}

async fn run_summarizer_call(
    provider: &dyn ModelProvider,
    system_prompt: &str,
    history: &[Message],
) -> anyhow::Result<String> {
    let transcript = serialize_transcript(history);
    let req = CompletionRequest {
        messages: vec![Message::system(system_prompt), Message::user(transcript)],
        tools: Vec::new(),
        stream: true,
        thinking_level: Default::default(),
        system_dynamic_suffix: None,
    };
    let mut stream = provider.stream(req).await?;
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            ProviderEvent::TextDelta { delta } => text.push_str(&delta),
            ProviderEvent::Error { reason } => anyhow::bail!("summarizer error: {reason}"),
            _ => {}
        }
    }
    Ok(text)
}

// ─── Emergency fallback ──────────────────────────────────────────────────────────

/// Deterministic fallback used when the session is too large to fit even a
/// summarization call within budget. Drops all but the last `keep_n`
/// non-system messages and prepends a canned notice. No model call is made.
pub fn emergency_compact(messages: &mut Vec<Message>, system_msg: Option<Message>, keep_n: usize) -> usize {
    let before = messages.len();
    let non_system: Vec<Message> = messages.iter().filter(|m| m.role != Role::System).cloned().collect();
    let keep = keep_n.min(non_system.len());
    let preserved: Vec<Message> = non_system[non_system.len() - keep..].to_vec();
    let notice = Message::assistant(
        "[Context emergency-compacted: earlier history was dropped to prevent a \
         context-window overflow. The agent may lack full context for earlier \
         decisions. Proceed carefully and ask the user to re-provide any missing \
         requirements if needed.]",
    );
    messages.clear();
    if let Some(sys) = system_msg {
        messages.push(sys);
    }
    messages.push(notice);
    messages.extend(preserved);
    before
}

// ─── Tool-result truncation ─────────────────────────────────────────────────────

/// Deterministic, content-aware tool-result truncation.
///
/// Returns `content` unchanged when it fits within `cap_tokens`.
/// Otherwise applies a category-specific extraction strategy that preserves
/// the most useful portion of the output. Dispatching on [`OutputCategory`]
/// (not on tool names) keeps this function independent of the tools crate's
/// concrete tool list; each tool declares its own category.
///
/// - [`OutputCategory::HeadTail`]: keep the first 60 + last 40 lines so both
///   the command preamble and the final result are visible.
/// - [`OutputCategory::MatchList`]: keep leading matches (highest relevance
///   first); the tail is not preserved because later matches are less relevant.
/// - [`OutputCategory::FileContent`]: balanced head + tail with a separator,
///   preserving both the imports/declarations and the most recent changes.
/// - [`OutputCategory::Generic`]: hard-truncate at the nearest line boundary.
///
/// Every truncated result ends with an explicit notice so the model knows
/// that additional content exists and how to retrieve it.
pub fn smart_truncate(content: &str, category: OutputCategory, cap_tokens: usize) -> String {
    if cap_tokens == 0 {
        return content.to_string();
    }
    let cap_chars = cap_tokens * 4;
    if content.len() <= cap_chars {
        return content.to_string();
    }
    let omitted_bytes = content.len().saturating_sub(cap_chars);
    match category {
        OutputCategory::HeadTail => head_tail_lines(
            content,
            cap_chars,
            60,
            40,
            &format!("[... {{lines}} lines / {omitted_bytes} bytes omitted ...]"),
        ),
        OutputCategory::MatchList => head_lines(
            content,
            cap_chars,
            &format!(
                "[... {{lines}} more matches omitted ({omitted_bytes} bytes); \
                     use a more specific pattern to see them ...]"
            ),
        ),
        OutputCategory::FileContent => head_tail_lines(
            content,
            cap_chars,
            usize::MAX,
            usize::MAX,
            &format!(
                "[... {{lines}} lines omitted ({omitted_bytes} bytes); \
                     use read_file with offset/limit to see more ...]"
            ),
        ),
        OutputCategory::Generic => {
            let cut = content[..cap_chars].rfind('\n').map(|p| p + 1).unwrap_or(cap_chars);
            format!("{}\n[... {omitted_bytes} bytes omitted; content truncated to fit context budget ...]", &content[..cut])
        }
    }
}

// ─── Private helpers ──────────────────────────────────────────────────────────

/// Keep only the leading lines that fit within `cap_chars`.
fn head_lines(content: &str, cap_chars: usize, notice_template: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let mut kept = String::with_capacity(cap_chars);
    let mut kept_count = 0usize;
    for line in &lines {
        let needed = if kept.is_empty() { line.len() } else { line.len() + 1 };
        if kept.len() + needed > cap_chars {
            break;
        }
        if !kept.is_empty() {
            kept.push('\n');
        }
        kept.push_str(line);
        kept_count += 1;
    }
    let omitted = lines.len().saturating_sub(kept_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{kept}\n{notice}")
}

/// Keep `max_head` leading lines and `max_tail` trailing lines, inserting a
/// notice between them. Pass `usize::MAX` to split evenly by character budget.
fn head_tail_lines(content: &str, cap_chars: usize, max_head: usize, max_tail: usize, notice_template: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let half_cap = cap_chars / 2;

    let mut head = String::with_capacity(half_cap);
    let mut head_count = 0usize;
    for line in lines.iter().take(max_head) {
        let needed = if head.is_empty() { line.len() } else { line.len() + 1 };
        if head.len() + needed > half_cap {
            break;
        }
        if !head.is_empty() {
            head.push('\n');
        }
        head.push_str(line);
        head_count += 1;
    }

    let mut tail_lines: Vec<&str> = Vec::new();
    let mut tail_chars = 0usize;
    for line in lines.iter().rev().take(max_tail) {
        let needed = if tail_lines.is_empty() { line.len() } else { line.len() + 1 };
        if tail_chars + needed > half_cap {
            break;
        }
        tail_chars += needed;
        tail_lines.push(line);
    }
    tail_lines.reverse();
    let tail_count = tail_lines.len();
    let tail = tail_lines.join("\n");

    let omitted = lines.len().saturating_sub(head_count + tail_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{head}\n{notice}\n{tail}")
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
