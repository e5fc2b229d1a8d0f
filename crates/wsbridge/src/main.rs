mod cli;
mod config;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use ws_bridge::{Bridge, BridgeConfig, ProxyPolicy};

use crate::cli::Cli;
use crate::config::{Config, LogFormat};

#[tokio::main]
async fn main() -> ExitCode {
    // 1. Parse CLI args. Help and version are successful exits.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(err = %format!("{err:#}"), "wsbridge failed");
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    // 2. Load config, remembering whether the named file was missing.
    let (cfg, missing) = match &cli.config {
        Some(path) => match config::load(path)? {
            Some(cfg) => (cfg, None),
            None => (Config::default(), Some(path)),
        },
        None => (Config::default(), None),
    };

    // 3. Init tracing-subscriber.
    init_tracing(cfg.log_level(&cli), cfg.logging.format);
    if let Some(path) = missing {
        warn!(path = %path.display(), "configuration file not found; using defaults");
    }

    // 4. Merge CLI overrides and validate URLs.
    let bridge_config = cfg.bridge_config(&cli)?;
    let bridge = Bridge::new(bridge_config).context("failed to initialize bridge")?;
    print_banner(bridge.config());

    // 5. Bind and serve until ctrl-c or SIGTERM.
    let listener = bridge.bind().await.context("failed to start listener")?;
    bridge.serve_with_shutdown(listener, shutdown_signal()).await;

    info!("wsbridge shutting down");
    Ok(())
}

fn init_tracing(level: &str, format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    match format {
        LogFormat::Json => builder.json().with_thread_ids(true).init(),
        LogFormat::Text => builder.init(),
    }
}

fn print_banner(config: &BridgeConfig) {
    let rule = "*".repeat(80);
    let proxy = match &config.proxy {
        ProxyPolicy::Explicit(proxy) => proxy.to_string(),
        ProxyPolicy::Environment => "system".to_string(),
    };

    println!("{rule}");
    println!("wsbridge - Tiny websocket connection bridge server");
    println!();
    println!("  listen: {}", config.listen_url());
    println!("  server: {}", config.target);
    println!("  proxy:  {proxy}");
    println!();
    println!("{rule}");
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT (ctrl-c)"),
        _ = terminate => info!("received SIGTERM"),
    }
}
