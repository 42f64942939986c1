use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::info;

use domo_gateway::config::GatewayConfig;
use domo_gateway::server::{self, AppState};
use domo_gateway::telemetry;

/// domo API gateway.
#[derive(Parser, Debug)]
#[command(name = "domo-gateway", about = "API gateway for the domo platform")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "gateway.yaml")]
    config: PathBuf,

    /// Override the bind address.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = GatewayConfig::load(&cli.config)?;
    telemetry::init(&config.log);

    let config_dir = cli
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let state = AppState::from_config(&config, config_dir)?;

    let listen = cli
        .listen
        .as_deref()
        .unwrap_or_else(|| config.listen_addr())
        .to_owned();
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(
        addr = %listen,
        routes = state.routes.routes().len(),
        "gateway listening"
    );

    let app = server::router(state)
        .into_make_service_with_connect_info::<std::net::SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
