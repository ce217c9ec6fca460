// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::Parser;

/// Runs the JSON-RPC 2.0 agent server on stdin/stdout.
///
/// A client (editor plugin, CLI wrapper, test harness) speaks newline-
/// delimited JSON-RPC 2.0 requests on stdin and reads responses and
/// `agent/event` notifications back on stdout. Diagnostics go to stderr so
/// stdout stays a clean protocol stream.
#[derive(Parser, Debug)]
#[command(
    name = "opal",
    about = "Core runtime for a coding-agent SDK: JSON-RPC 2.0 agent server",
    version,
    long_about = None,
)]
pub struct Cli {
    /// Path to a YAML config file. If omitted, OPAL_CONFIG is checked, then
    /// ./opal.yaml, then built-in defaults.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Directory used to persist session trees and server settings.
    /// Overrides the config file's `sessions_dir` field.
    #[arg(long, short = 's')]
    pub sessions_dir: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace).
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Resolve the config file to read, in priority order: an explicit
    /// `--config` flag, the `OPAL_CONFIG` environment variable, or
    /// `./opal.yaml` if present. Returns `None` when none apply, in which
    /// case the caller falls back to built-in defaults.
    pub fn resolve_config_path(&self) -> Option<PathBuf> {
        if let Some(p) = &self.config {
            return Some(p.clone());
        }
        if let Ok(p) = std::env::var("OPAL_CONFIG") {
            return Some(PathBuf::from(p));
        }
        let default = PathBuf::from("opal.yaml");
        if default.is_file() {
            return Some(default);
        }
        None
    }
}
