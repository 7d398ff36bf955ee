use order_analytics::api::create_router;
use order_analytics::config::ServiceConfig;
use order_analytics::ingestion::KafkaSource;
use order_analytics::service::AnalyticsService;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = order_analytics::SERVICE_VERSION,
        "Starting order analytics service"
    );

    let config = ServiceConfig::load()?;

    let store = AnalyticsService::connect_store(&config).await;
    let service = AnalyticsService::init(config.clone(), store);

    let source = KafkaSource::connect(&config.kafka)?;
    service.start(source)?;

    let app = create_router(service.app_state());
    let listener = TcpListener::bind(&config.http.bind).await?;

    tracing::info!("Listening on {}", config.http.bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
