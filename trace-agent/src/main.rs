// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entrypoint of the trace agent binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use datadog_trace_agent::{Agent, AgentConfig, MetricsClient};

#[derive(Debug, Parser)]
#[command(name = "trace-agent", disable_version_flag = true)]
struct Cli {
    /// Trace agent config file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Turn on debug logging.
    #[arg(long)]
    debug: bool,
    /// Use TCP conns info to draw network topology.
    #[arg(long)]
    topology: bool,
    /// Show version information and exit.
    #[arg(long)]
    version: bool,
}

fn version_string() -> String {
    let mut out = format!("Version: {}\n", env!("CARGO_PKG_VERSION"));
    if let Some(commit) = option_env!("GIT_COMMIT") {
        out.push_str(&format!("Git hash: {commit}\n"));
    }
    if let Some(date) = option_env!("BUILD_DATE") {
        out.push_str(&format!("Build date: {date}\n"));
    }
    out
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Cancel the shutdown token on SIGINT or SIGTERM.
async fn handle_signals(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(error) => {
                    warn!(%error, "cannot install SIGTERM handler");
                    let _ = ctrl_c.await;
                    info!("received interruption signal");
                    shutdown.cancel();
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    info!("received interruption signal");
    shutdown.cancel();
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        print!("{}", version_string());
        return Ok(());
    }

    init_logging(cli.debug);

    let mut config = match &cli.config {
        Some(path) => AgentConfig::from_file(path)?,
        None => {
            info!("no config file given, using defaults");
            AgentConfig::default()
        }
    };
    config.topology = cli.topology;
    if config.topology {
        warn!("network topology collection is not supported by this build");
    }

    let metrics = match MetricsClient::new(&config.statsd_host, config.statsd_port) {
        Ok(metrics) => Arc::new(metrics),
        Err(error) => {
            warn!(%error, "statsd is unreachable, internal metrics disabled");
            Arc::new(MetricsClient::disabled())
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("cannot build runtime")?;

    runtime.block_on(async move {
        let shutdown = CancellationToken::new();
        tokio::spawn(handle_signals(shutdown.clone()));

        info!(version = env!("CARGO_PKG_VERSION"), "starting trace agent");
        Agent::new(config, metrics).run(shutdown).await
    })
}
