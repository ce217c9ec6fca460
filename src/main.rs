// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cli::Cli;
use opal_bus::EventBus;
use opal_core::AgentEvent;
use opal_rpc::{Server, StdoutWriter};
use opal_supervisor::Supervisor;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;
    let sessions_dir = resolve_sessions_dir(&cli, &config);
    std::fs::create_dir_all(&sessions_dir)
        .with_context(|| format!("creating sessions directory {}", sessions_dir.display()))?;

    let bus = Arc::new(EventBus::<AgentEvent>::new());
    let supervisor = Arc::new(Supervisor::new(bus, sessions_dir.clone()));

    let server = Server::new(
        supervisor,
        config,
        sessions_dir,
        Arc::new(StdoutWriter::new()),
        env!("CARGO_PKG_VERSION"),
    );

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    server.run(stdin).await
}

/// Read the resolved config file (if any) and parse it, falling back to
/// built-in defaults for anything the file omits or when no file is found.
fn load_config(cli: &Cli) -> anyhow::Result<opal_config::Config> {
    match cli.resolve_config_path() {
        Some(path) => {
            let yaml = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            opal_config::from_str(&yaml)
                .with_context(|| format!("parsing config file {}", path.display()))
        }
        None => Ok(opal_config::Config::default()),
    }
}

/// `--sessions-dir` overrides the config file; otherwise the config's own
/// `sessions_dir` field (which carries a sensible default) is used.
fn resolve_sessions_dir(cli: &Cli, config: &opal_config::Config) -> PathBuf {
    cli.sessions_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.sessions_dir))
}

/// Logs go to stderr so stdout stays a clean JSON-RPC stream for the client.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
