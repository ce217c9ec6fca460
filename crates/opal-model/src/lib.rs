// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod catalog;
mod mock;
mod provider;
mod types;

pub use catalog::{InputModality, ModelCatalogEntry};
pub use mock::{MockProvider, ScriptedMockProvider};
pub use provider::{ModelProvider, ResponseStream};
pub use types::*;

use anyhow::bail;
use opal_config::ModelConfig;

/// Construct a boxed [`ModelProvider`] from configuration.
///
/// Only the `mock` driver ships in this workspace; concrete wire-format
/// drivers for real model APIs are an external concern. A caller that needs
/// one registers it separately and bypasses this dispatcher.
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Box<dyn ModelProvider>> {
    match cfg.provider.as_str() {
        "mock" => Ok(Box::new(MockProvider)),
        other => bail!(
            "unknown model provider: {other:?}\n\
             Only \"mock\" is built in; register a custom ModelProvider for real endpoints."
        ),
    }
}
