// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::Context;

use crate::Config;

/// Parse a single YAML document into a [`Config`], falling back to
/// `Config::default()` fields for anything the document omits.
///
/// Locating and merging config files from well-known search paths is out of
/// scope for this crate — callers own that policy and hand this function the
/// resolved text.
pub fn from_str(yaml: &str) -> anyhow::Result<Config> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(yaml).context("parsing config YAML")?;
    from_value(value)
}

/// Deserialize an already-parsed YAML value into a [`Config`].
pub fn from_value(value: serde_yaml::Value) -> anyhow::Result<Config> {
    if matches!(&value, serde_yaml::Value::Mapping(m) if m.is_empty())
        || matches!(&value, serde_yaml::Value::Null)
    {
        return Ok(Config::default());
    }
    serde_yaml::from_value(value).context("deserializing config")
}

/// Deep-merge `src` into `dst`; `src` wins on scalar conflicts.
///
/// Exposed so a caller layering multiple config sources (env, CLI flags, a
/// project file) can compose them before handing the result to
/// [`from_value`].
pub fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        let src = val("x: 2");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = val("a: 1\nb: 2");
        let src = val("b: 99");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"].as_i64(), Some(1));
        assert_eq!(dst["b"].as_i64(), Some(99));
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = val("model:\n  provider: mock\n  name: mock-model");
        let src = val("model:\n  name: gpt-4o-mini");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["model"]["provider"].as_str(), Some("mock"));
        assert_eq!(dst["model"]["name"].as_str(), Some("gpt-4o-mini"));
    }

    #[test]
    fn from_str_empty_document_is_default() {
        let cfg = from_str("").unwrap();
        assert_eq!(cfg.model.provider, "mock");
    }

    #[test]
    fn from_str_overrides_model() {
        let cfg = from_str("model:\n  provider: anthropic\n  name: test-model\n").unwrap();
        assert_eq!(cfg.model.provider, "anthropic");
        assert_eq!(cfg.model.name, "test-model");
    }
}
