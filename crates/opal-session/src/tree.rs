// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use opal_model::Message;
use serde_json::Value;

use crate::error::{Result, SessionError};

/// A single node in [`SessionTree::get_tree`]'s nested view.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub message: Message,
    pub children: Vec<TreeNode>,
}

/// A content-addressed tree of conversation messages.
///
/// Messages are keyed by id; `current_id` is the active leaf. The path from
/// any root (a message with `parent_id = None`) to `current_id` is the
/// materialized conversation an [`opal_core`] agent mirrors into its own
/// state. Branching never deletes anything — it only moves the cursor.
#[derive(Debug, Clone)]
pub struct SessionTree {
    pub session_id: String,
    messages: HashMap<String, Message>,
    current_id: Option<String>,
    pub metadata: HashMap<String, Value>,
}

impl SessionTree {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            messages: HashMap::new(),
            current_id: None,
            metadata: HashMap::new(),
        }
    }

    /// Insert `msg`, re-parenting it onto the current leaf regardless of any
    /// `parent_id` the caller set, then move `current_id` to it.
    pub fn append(&mut self, mut msg: Message) -> &Message {
        msg.parent_id = self.current_id.clone();
        let id = msg.id.clone();
        self.messages.insert(id.clone(), msg);
        self.current_id = Some(id.clone());
        self.messages.get(&id).expect("just inserted")
    }

    /// Append each message in order, chaining `parent_id` through the batch.
    pub fn append_many(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for msg in msgs {
            self.append(msg);
        }
    }

    pub fn get_message(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    /// Insert a message verbatim, preserving whatever `parent_id` it already
    /// carries. Used by the persistence layer when reconstructing a tree from
    /// disk; [`SessionTree::append`] is for live conversation growth.
    pub(crate) fn insert_raw(&mut self, id: String, msg: Message) {
        self.messages.insert(id, msg);
    }

    /// Set `current_id` directly without validating it against `messages`.
    /// Used by the persistence layer, which trusts its own snapshot.
    pub(crate) fn set_current_id_raw(&mut self, id: Option<String>) {
        self.current_id = id;
    }

    /// All stored messages, in arbitrary (HashMap iteration) order.
    pub fn all_messages(&self) -> Vec<&Message> {
        self.messages.values().collect()
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current_id.as_deref()
    }

    /// Root-to-`current_id` path, oldest first.
    pub fn get_path(&self) -> Vec<Message> {
        match &self.current_id {
            Some(id) => self.path_to(id).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Root-to-`id` path, oldest first. Fails with [`SessionError::NotFound`]
    /// if `id` is not a known message.
    pub fn get_path_to(&self, id: &str) -> Result<Vec<Message>> {
        self.path_to(id).ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    fn path_to(&self, id: &str) -> Option<Vec<Message>> {
        let mut chain = Vec::new();
        let mut cursor = Some(id.to_string());
        while let Some(cur) = cursor {
            let msg = self.messages.get(&cur)?;
            cursor = msg.parent_id.clone();
            chain.push(msg.clone());
        }
        chain.reverse();
        Some(chain)
    }

    /// Nested `{message, children}` view. The root set is every message with
    /// `parent_id = None`; children are grouped by `parent_id`.
    pub fn get_tree(&self) -> Vec<TreeNode> {
        let mut by_parent: HashMap<Option<String>, Vec<&Message>> = HashMap::new();
        for msg in self.messages.values() {
            by_parent.entry(msg.parent_id.clone()).or_default().push(msg);
        }
        for children in by_parent.values_mut() {
            children.sort_by(|a, b| a.id.cmp(&b.id));
        }

        fn build(msg: &Message, by_parent: &HashMap<Option<String>, Vec<&Message>>) -> TreeNode {
            let children = by_parent
                .get(&Some(msg.id.clone()))
                .into_iter()
                .flatten()
                .map(|child| build(child, by_parent))
                .collect();
            TreeNode { message: msg.clone(), children }
        }

        by_parent.get(&None).into_iter().flatten().map(|root| build(root, &by_parent)).collect()
    }

    /// Move `current_id` to `id`. Subsequent appends extend from here,
    /// producing a divergence in the tree.
    pub fn branch(&mut self, id: &str) -> Result<()> {
        if !self.messages.contains_key(id) {
            return Err(SessionError::NotFound(id.to_string()));
        }
        self.current_id = Some(id.to_string());
        Ok(())
    }

    /// Replace a contiguous path segment with a single summary message.
    ///
    /// `ids` must be a contiguous parent-to-child run of existing ids.
    /// `summary` is re-parented onto the segment's original parent, and every
    /// non-removed child of the segment's last id is re-parented onto
    /// `summary`. If `current_id` fell inside the segment, it follows to
    /// `summary.id`.
    pub fn replace_path_segment(&mut self, ids: &[String], mut summary: Message) -> Result<()> {
        if ids.is_empty() {
            return Err(SessionError::InvalidSegment);
        }
        let first_parent = self
            .messages
            .get(&ids[0])
            .ok_or_else(|| SessionError::NotFound(ids[0].clone()))?
            .parent_id
            .clone();
        let last_id = ids.last().unwrap().clone();

        let removed: std::collections::HashSet<&String> = ids.iter().collect();
        let to_reparent: Vec<String> = self
            .messages
            .values()
            .filter(|m| m.parent_id.as_deref() == Some(last_id.as_str()) && !removed.contains(&m.id))
            .map(|m| m.id.clone())
            .collect();

        summary.parent_id = first_parent;
        let summary_id = summary.id.clone();

        for id in ids {
            self.messages.remove(id);
        }
        for child_id in to_reparent {
            if let Some(child) = self.messages.get_mut(&child_id) {
                child.parent_id = Some(summary_id.clone());
            }
        }
        self.messages.insert(summary_id.clone(), summary);

        if let Some(cur) = &self.current_id {
            if removed.contains(cur) {
                self.current_id = Some(summary_id);
            }
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
