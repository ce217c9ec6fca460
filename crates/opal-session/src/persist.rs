// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Durable single-file persistence for a [`SessionTree`].
//!
//! Each session is written as one JSON object: a reserved `__session_meta__`
//! key holds `{session_id, current_id, metadata}`, and every other key is a
//! message id mapping to its `Message`. Writes go to a sibling `.tmp` file
//! and are renamed into place, so a crash mid-write never corrupts the
//! previous snapshot.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::tree::SessionTree;

const META_KEY: &str = "__session_meta__";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionMeta {
    session_id: String,
    current_id: Option<String>,
    #[serde(default)]
    metadata: std::collections::HashMap<String, Value>,
}

fn session_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{session_id}.json"))
}

impl SessionTree {
    /// Serialize this tree and atomically write it to `<dir>/<session_id>.json`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let mut map = Map::new();
        let meta = SessionMeta {
            session_id: self.session_id.clone(),
            current_id: self.current_id().map(str::to_string),
            metadata: self.metadata.clone(),
        };
        map.insert(META_KEY.to_string(), serde_json::to_value(meta)?);
        for msg in self.all_messages() {
            map.insert(msg.id.clone(), serde_json::to_value(msg)?);
        }

        let path = session_path(dir, &self.session_id);
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_vec_pretty(&Value::Object(map))?)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Load a session previously written by [`SessionTree::save`].
    pub fn load_from(dir: &Path, session_id: &str) -> Result<Self> {
        let path = session_path(dir, session_id);
        let data = fs::read_to_string(&path)?;
        let mut map: Map<String, Value> = serde_json::from_str(&data)?;

        let meta_value = map.remove(META_KEY).unwrap_or_else(|| {
            serde_json::json!({ "session_id": session_id, "current_id": null, "metadata": {} })
        });
        let meta: SessionMeta = serde_json::from_value(meta_value)?;

        let mut tree = SessionTree::new(meta.session_id);
        tree.metadata = meta.metadata;
        for (id, value) in map {
            let msg: opal_model::Message = serde_json::from_value(value)?;
            tree.insert_raw(id, msg);
        }
        tree.set_current_id_raw(meta.current_id);
        Ok(tree)
    }

    /// Every session persisted under `dir`: id, file path, title (from
    /// `metadata["title"]`, empty string if absent), and last-modified time,
    /// sorted newest first.
    pub fn list_sessions(dir: &Path) -> Result<Vec<SessionListing>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            let modified: chrono::DateTime<chrono::Utc> =
                fs::metadata(&path).and_then(|m| m.modified()).map(chrono::DateTime::from).unwrap_or_else(|_| chrono::Utc::now());
            let title = fs::read_to_string(&path)
                .ok()
                .and_then(|data| serde_json::from_str::<Map<String, Value>>(&data).ok())
                .and_then(|map| map.get(META_KEY).cloned())
                .and_then(|meta| serde_json::from_value::<SessionMeta>(meta).ok())
                .and_then(|meta| meta.metadata.get("title").and_then(|v| v.as_str()).map(str::to_string))
                .unwrap_or_default();
            out.push(SessionListing { session_id: stem.to_string(), path: path.clone(), title, modified });
        }
        out.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.session_id.cmp(&b.session_id)));
        Ok(out)
    }

    /// Every user-role message's text and timestamp from each session's
    /// active path under `dir`, newest session first, capped at `limit`
    /// sessions. Sessions with no user message on their active path are
    /// skipped. Used to populate a session picker without loading the full
    /// history into the caller.
    pub fn recent_prompts(dir: &Path, limit: usize) -> Result<Vec<RecentPrompt>> {
        let mut out = Vec::new();
        for listing in Self::list_sessions(dir)?.into_iter().take(limit) {
            let tree = Self::load_from(dir, &listing.session_id)?;
            if let Some(msg) = tree.get_path().iter().rev().find(|m| m.role == opal_model::Role::User) {
                if let Some(text) = msg.as_text() {
                    out.push(RecentPrompt { session_id: listing.session_id, text: text.to_string(), timestamp: listing.modified });
                }
            }
        }
        Ok(out)
    }
}

/// One row of [`SessionTree::list_sessions`].
#[derive(Debug, Clone)]
pub struct SessionListing {
    pub session_id: String,
    pub path: PathBuf,
    pub title: String,
    pub modified: chrono::DateTime<chrono::Utc>,
}

/// One row of [`SessionTree::recent_prompts`].
#[derive(Debug, Clone)]
pub struct RecentPrompt {
    pub session_id: String,
    pub text: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
