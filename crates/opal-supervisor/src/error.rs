// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("session already running: {0}")]
    AlreadyRunning(String),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session tree error: {0}")]
    Session(#[from] opal_session::SessionError),
    #[error("failed to construct model provider: {0}")]
    Provider(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
