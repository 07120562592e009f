use clap::Parser;
use dotenvy::dotenv;
use modelgen_relay::config::{ServerConfig, StorageConfig};
use modelgen_relay::infrastructure::storage;
use modelgen_relay::services::upload_service::UploadService;
use modelgen_relay::{AppState, create_app};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port for the upload receiver (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: std::net::IpAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "modelgen_relay=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting upload receiver...");

    let mut server_config = ServerConfig::from_env();
    if let Some(port) = args.port {
        server_config.port = port;
    }
    info!(
        "⚙️  Config: Max Size={}MB, Folder={}",
        server_config.max_file_size / 1024 / 1024,
        server_config.upload_folder
    );

    let storage_service = storage::setup_storage(StorageConfig::from_env()).await;
    let upload_service = Arc::new(UploadService::new(
        storage_service,
        server_config.upload_folder.clone(),
    ));

    let state = AppState {
        upload_service,
        config: server_config.clone(),
    };

    let app = create_app(state);

    let addr = SocketAddr::new(args.host, server_config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("✅ Upload receiver listening on: http://{}", addr);
    info!("📖 Swagger UI documentation: http://{}/swagger-ui", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("👋 Upload receiver exited cleanly.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, initiating graceful shutdown...");
        },
    }
}
