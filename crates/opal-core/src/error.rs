// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The typed error taxonomy every fallible operation in this crate maps
//! onto, grouped by `kind()` rather than by concrete variant so `opal-rpc`
//! can pick a JSON-RPC error code without string-sniffing a message.

use thiserror::Error;

/// A coarse classification of an [`OpalError`], matching the error-handling
/// design's kind list one-to-one. `opal-rpc` uses this (not the variant
/// itself) to decide which JSON-RPC error code a failure surfaces as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Provider,
    ToolExecution,
    Crash,
    Timeout,
    BusUnavailable,
}

#[derive(Debug, Error)]
pub enum OpalError {
    /// Missing or malformed RPC params, or any other locally-recoverable
    /// input error. Surfaced as `-32602`.
    #[error("validation error: {0}")]
    Validation(String),

    /// Session id, message id, or tool name not registered. Surfaced as
    /// `-32602` with an explanatory `data` field.
    #[error("not found: {0}")]
    NotFound(String),

    /// The LLM call failed (network, auth, rate-limit, malformed stream).
    /// Ends the turn with an `error` bus event; not retried automatically.
    #[error("provider error: {0}")]
    Provider(#[source] anyhow::Error),

    /// A tool returned `Err(msg)`. Recovered locally — a synthetic
    /// `tool_result` carries the message back to the model — so this
    /// variant exists for callers that need to observe the failure
    /// structurally rather than as a `tool_execution_end { ok: false }` event.
    #[error("tool execution error: {0}")]
    ToolExecution(String),

    /// An internal task crashed; the supervisor restarts the component and
    /// the agent emits `agent_recovered`. Not surfaced to the client unless
    /// it affects an outstanding request.
    #[error("internal crash: {0}")]
    Crash(String),

    /// A bounded operation (sub-agent collection, provider stream idle)
    /// exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The event bus registry itself is gone. Fatal; never recovered.
    #[error("event bus unavailable")]
    BusUnavailable,
}

impl OpalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OpalError::Validation(_) => ErrorKind::Validation,
            OpalError::NotFound(_) => ErrorKind::NotFound,
            OpalError::Provider(_) => ErrorKind::Provider,
            OpalError::ToolExecution(_) => ErrorKind::ToolExecution,
            OpalError::Crash(_) => ErrorKind::Crash,
            OpalError::Timeout(_) => ErrorKind::Timeout,
            OpalError::BusUnavailable => ErrorKind::BusUnavailable,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        OpalError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        OpalError::NotFound(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        OpalError::Timeout(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, OpalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(OpalError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(OpalError::not_found("x").kind(), ErrorKind::NotFound);
        assert_eq!(OpalError::BusUnavailable.kind(), ErrorKind::BusUnavailable);
    }

    #[test]
    fn provider_error_wraps_anyhow_source() {
        let e = OpalError::Provider(anyhow::anyhow!("rate limited"));
        assert!(e.to_string().contains("rate limited"));
        assert_eq!(e.kind(), ErrorKind::Provider);
    }
}
