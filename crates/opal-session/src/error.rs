// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Errors raised by the session tree and its persistence layer.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("message not found: {0}")]
    NotFound(String),
    #[error("segment is not contiguous or empty")]
    InvalidSegment,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
