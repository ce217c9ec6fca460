// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Line-framed stdio transport. Each JSON-RPC message is exactly one line;
//! the writer side is a trait so tests can assert on emitted lines without
//! touching real stdio.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex as TokioMutex;

/// Sink for outbound protocol lines. A real server writes to stdout; tests
/// use an in-memory implementation to inspect what was sent.
#[async_trait::async_trait]
pub trait MessageWriter: Send + Sync {
    async fn write_line(&self, line: &str) -> Result<()>;
}

pub struct StdoutWriter {
    stdout: TokioMutex<Stdout>,
}

impl StdoutWriter {
    pub fn new() -> Self {
        Self { stdout: TokioMutex::new(tokio::io::stdout()) }
    }
}

impl Default for StdoutWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MessageWriter for StdoutWriter {
    async fn write_line(&self, line: &str) -> Result<()> {
        let mut out = self.stdout.lock().await;
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
        Ok(())
    }
}

/// Serializes `value` and writes it as one line. Kept free of the `Server`
/// type so both responses and notifications go through the same path.
pub async fn send(writer: &Arc<dyn MessageWriter>, value: &impl Serialize) -> Result<()> {
    let line = serde_json::to_string(value)?;
    writer.write_line(&line).await
}

#[cfg(test)]
pub struct MockWriter {
    pub lines: TokioMutex<Vec<String>>,
}

#[cfg(test)]
impl MockWriter {
    pub fn new() -> Self {
        Self { lines: TokioMutex::new(Vec::new()) }
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl MessageWriter for MockWriter {
    async fn write_line(&self, line: &str) -> Result<()> {
        self.lines.lock().await.push(line.to_string());
        Ok(())
    }
}
