use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use domo_bus::{DeviceBus, MemoryDeviceBus, MqttConfig, MqttDeviceBus};
use domo_engine::api::{self, AppState};
use domo_engine::collab::{HttpEmailSender, HttpEntityRegistry, HttpUserDirectory};
use domo_engine::config::EngineConfig;
use domo_engine::error::EngineError;
use domo_engine::executor::{Executor, ExecutorConfig};
use domo_engine::hub::EventHub;
use domo_engine::metrics::EngineMetrics;
use domo_engine::store::WorkflowStore;
use domo_engine::store::postgres::PgWorkflowStore;
use domo_engine::telemetry;
use domo_engine::trigger::TriggerManager;

/// domo automation engine.
#[derive(Parser, Debug)]
#[command(name = "domo-engine", about = "Workflow automation engine for the domo platform")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "engine.yaml")]
    config: PathBuf,

    /// Override the bind address.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = EngineConfig::load(&cli.config)?;
    telemetry::init(&config.log);

    let database_url = config
        .database_url
        .clone()
        .ok_or_else(|| EngineError::Config("database_url is required".into()))?;
    let store: Arc<dyn WorkflowStore> = Arc::new(PgWorkflowStore::connect(&database_url).await?);
    info!("workflow store ready");

    let bus: Arc<dyn DeviceBus> = if config.bus.backend == "memory" {
        info!("using in-process device bus");
        Arc::new(MemoryDeviceBus::new())
    } else {
        let mqtt = MqttDeviceBus::connect(&MqttConfig {
            host: config.bus.mqtt_host.clone(),
            port: config.bus.mqtt_port,
            client_id: config.bus.client_id.clone(),
        })
        .await?;
        info!(host = %config.bus.mqtt_host, port = config.bus.mqtt_port, "device bus connected");
        Arc::new(mqtt)
    };

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(30))
        .build()?;
    let registry = Arc::new(HttpEntityRegistry::new(
        http.clone(),
        config.upstream("registry")?,
    ));
    let directory = Arc::new(HttpUserDirectory::new(http.clone(), config.upstream("users")?));
    let email = Arc::new(HttpEmailSender::new(http, config.upstream("email")?));

    let metrics = Arc::new(EngineMetrics::default());
    let hub = Arc::new(EventHub::new(Arc::clone(&metrics)));

    let mut executor_config = ExecutorConfig::default();
    if let Some(secs) = config.run_timeout_sec {
        executor_config.run_timeout = Duration::from_secs(secs);
    }
    let executor = Executor::start(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&hub),
        registry.clone(),
        directory,
        email,
        Arc::clone(&metrics),
        executor_config,
    );

    let triggers = TriggerManager::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&executor),
        registry,
        Arc::clone(&metrics),
    );
    let trigger_reload = triggers.reload_handle();
    let shutdown = CancellationToken::new();
    let trigger_task = {
        let triggers = Arc::clone(&triggers);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { triggers.run(shutdown).await })
    };

    let state = AppState {
        store,
        executor: Arc::clone(&executor),
        hub,
        trigger_reload,
        metrics,
    };

    let listen = cli
        .listen
        .as_deref()
        .unwrap_or_else(|| config.listen_addr())
        .to_owned();
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(addr = %listen, "engine listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("draining runs before exit");
    shutdown.cancel();
    executor.shutdown().await;
    let _ = trigger_task.await;
    info!("engine stopped");
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
