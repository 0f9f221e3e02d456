//! Gateway binary

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use mcpgate_core::GatewayConfig;
use mcpgate_server::{AppContext, router};

/// MCP Gate: multi-tenant reverse proxy and federation layer for MCP
/// servers.
#[derive(Debug, Parser)]
#[command(name = "mcpgate", version, about)]
struct Cli {
    /// Configuration file (TOML or JSON); environment variables prefixed
    /// MCPGATE_ override it
    #[arg(long, env = "MCPGATE_CONFIG")]
    config: Option<String>,

    /// Serve a single session over stdin/stdout instead of HTTP
    #[arg(long)]
    stdio: bool,

    /// Log filter, e.g. "info,mcpgate_pool=debug"
    #[arg(long, env = "MCPGATE_LOG", default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&cli.log)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = GatewayConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let ctx = Arc::new(
        AppContext::build(config, None, None)
            .await
            .map_err(|e| anyhow::anyhow!("wiring gateway: {e}"))?,
    );

    if cli.stdio {
        mcpgate_transport::serve_stdio(
            Arc::clone(&ctx.registry),
            Arc::clone(&ctx.dispatcher) as Arc<dyn mcpgate_transport::RpcHandler>,
        )
        .await
        .map_err(|e| anyhow::anyhow!("stdio transport: {e}"))?;
        ctx.shutdown().await;
        return Ok(());
    }

    let app = router(Arc::clone(&ctx));
    let listener = tokio::net::TcpListener::bind(&ctx.config.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", ctx.config.server.bind_addr))?;
    info!(addr = %ctx.config.server.bind_addr, "gateway listening");

    let shutdown_ctx = Arc::clone(&ctx);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_ctx.shutdown().await;
        })
        .await
        .context("serving")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("termination signal received");
}
