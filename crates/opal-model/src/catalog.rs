// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model catalog: static metadata for known models.
//!
//! Concrete wire-format drivers (OpenAI, Anthropic, ...) live outside this
//! workspace; the catalog still carries enough metadata about well-known
//! models to drive context-window and compaction-threshold math against a
//! `ModelConfig` that names one of them, even when only the mock driver is
//! actually linked in.

use serde::{Deserialize, Serialize};

/// Input modalities supported by a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputModality {
    Text,
    Image,
}

/// Metadata for a single model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelCatalogEntry {
    /// Provider-scoped model identifier (e.g. "gpt-4o", "mock-model").
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// Provider identifier: "openai" | "anthropic" | "mock".
    pub provider: String,
    /// Total context window in tokens (input + output).
    pub context_window: u32,
    /// Maximum output tokens per completion.
    pub max_output_tokens: u32,
    /// Short description.
    pub description: String,
    /// Supported input modalities.
    pub input_modalities: Vec<InputModality>,
}

impl ModelCatalogEntry {
    pub fn supports_images(&self) -> bool {
        self.input_modalities.contains(&InputModality::Image)
    }
}

fn entry(
    id: &str,
    name: &str,
    provider: &str,
    context_window: u32,
    max_output_tokens: u32,
    description: &str,
    modalities: &[InputModality],
) -> ModelCatalogEntry {
    ModelCatalogEntry {
        id: id.into(),
        name: name.into(),
        provider: provider.into(),
        context_window,
        max_output_tokens,
        description: description.into(),
        input_modalities: modalities.to_vec(),
    }
}

/// Return all entries from the static catalog.
pub fn static_catalog() -> Vec<ModelCatalogEntry> {
    vec![
        entry(
            "mock-model",
            "Mock Model",
            "mock",
            128_000,
            4_096,
            "Deterministic in-process provider for tests and offline development.",
            &[InputModality::Text, InputModality::Image],
        ),
        entry(
            "gpt-4o",
            "GPT-4o",
            "openai",
            128_000,
            16_384,
            "OpenAI general-purpose multimodal model.",
            &[InputModality::Text, InputModality::Image],
        ),
        entry(
            "claude-opus-4-6",
            "Claude Opus 4.6",
            "anthropic",
            200_000,
            8_192,
            "Anthropic flagship reasoning model.",
            &[InputModality::Text, InputModality::Image],
        ),
    ]
}

/// Look up a single model by provider and id (or name).
pub fn lookup(provider: &str, model_id: &str) -> Option<ModelCatalogEntry> {
    static_catalog()
        .into_iter()
        .find(|e| e.provider == provider && (e.id == model_id || e.name == model_id))
}

/// Return `true` if the model supports image input, defaulting to `false`
/// when the model is not found in the catalog.
pub fn supports_images(provider: &str, model_id: &str) -> bool {
    lookup(provider, model_id).map(|e| e.supports_images()).unwrap_or(false)
}

/// Look up the context window for a model, falling back to `default`.
pub fn context_window(provider: &str, model_id: &str, default: u32) -> u32 {
    lookup(provider, model_id).map(|e| e.context_window).unwrap_or(default)
}

/// Look up the max output tokens for a model, falling back to `default`.
pub fn max_output_tokens(provider: &str, model_id: &str, default: u32) -> u32 {
    lookup(provider, model_id).map(|e| e.max_output_tokens).unwrap_or(default)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_catalog_is_non_empty() {
        assert!(!static_catalog().is_empty());
    }

    #[test]
    fn mock_model_is_in_catalog() {
        let entry = lookup("mock", "mock-model").expect("mock-model must be in catalog");
        assert_eq!(entry.provider, "mock");
        assert!(entry.supports_images());
    }

    #[test]
    fn lookup_unknown_model_returns_none() {
        assert!(lookup("mock", "nonexistent-model-xyz").is_none());
    }

    #[test]
    fn context_window_fallback_used_when_unknown() {
        assert_eq!(context_window("mock", "no-such-model", 4096), 4096);
    }

    #[test]
    fn all_entries_have_non_zero_windows() {
        for entry in static_catalog() {
            assert!(entry.context_window > 0, "{} has zero context_window", entry.id);
            assert!(entry.max_output_tokens > 0, "{} has zero max_output_tokens", entry.id);
        }
    }

    #[test]
    fn all_entries_have_at_least_text_modality() {
        for entry in static_catalog() {
            assert!(entry.input_modalities.contains(&InputModality::Text), "{} missing text modality", entry.id);
        }
    }
}
