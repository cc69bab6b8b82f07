//! Remote SSH MCP Server - entry point
//!
//! Parses CLI/environment configuration, builds the tool context, starts the
//! MCP server on stdio transport, and handles graceful shutdown. Exit codes:
//! 0 orderly shutdown, 1 configuration error, 2 fatal initialisation error.

use clap::Parser;
use rmcp::service::ServiceExt;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use remote_ssh_mcp::config::{Args, Config};
use remote_ssh_mcp::server::RemoteSshServer;
use remote_ssh_mcp::tools::ToolContext;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // Logging goes to stderr; stdout carries MCP JSON-RPC.
    let level = if config.debug {
        Level::DEBUG
    } else {
        parse_level(&config.log_level)
    };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        "Remote SSH MCP Server v{} starting (permissibility={}, max_sessions={}, timeout={}ms)",
        env!("CARGO_PKG_VERSION"),
        config.level,
        config.max_sessions,
        config.command_timeout_ms,
    );
    if let (Some(host), Some(user)) = (&config.host, &config.user) {
        info!("Default target: {}@{}:{}", user, host, config.port);
    }

    let ctx = match ToolContext::new(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Initialisation failed: {e}");
            std::process::exit(2);
        }
    };

    let server = RemoteSshServer::new(ctx);
    let maintenance = server.spawn_maintenance();

    // Disconnect every session when the process is asked to stop.
    let server_for_shutdown = server.clone();
    let shutdown_handle = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
            }
            _ = async {
                #[cfg(unix)]
                {
                    match tokio::signal::unix::signal(
                        tokio::signal::unix::SignalKind::terminate()
                    ) {
                        Ok(mut sigterm) => { sigterm.recv().await; }
                        Err(e) => {
                            error!("Failed to register SIGTERM handler: {e}");
                            std::future::pending::<()>().await;
                        }
                    }
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<()>().await;
                }
            } => {
                info!("Received SIGTERM, shutting down...");
            }
        }
        server_for_shutdown.shutdown().await;
        std::process::exit(0);
    });

    info!("Remote SSH MCP Server running on stdio");

    match server.clone().serve(rmcp::transport::io::stdio()).await {
        Ok(running) => {
            if let Err(e) = running.waiting().await {
                error!("Server error: {e}");
            }
        }
        Err(e) => {
            error!("Failed to start MCP server: {e}");
            std::process::exit(2);
        }
    }

    shutdown_handle.abort();
    maintenance.abort();
    server.shutdown().await;

    info!("Remote SSH MCP Server stopped");
}

fn parse_level(name: &str) -> Level {
    match name.to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}
