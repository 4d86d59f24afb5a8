use clap::Parser as _;
use infer_router::{
    AppState, build_metrics_layer_and_handle, build_metrics_router, build_router,
    config::Config, controller::Controller,
};
use tokio::net::TcpListener;
use tracing::{error, info, instrument};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
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
    info!("Shutting down server...");
}

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    let config = Config::parse().validate()?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_filter())),
        )
        .init();

    info!("Starting inference router with config: {:?}", config);

    let controller = Controller::new(config.controller_config()?, config.pool_config())?;
    let app_state = AppState::new(controller).with_log_requests(config.log_requests);
    let mut router = build_router(app_state);

    if config.metrics {
        let (prometheus_layer, handle) =
            build_metrics_layer_and_handle(config.metrics_prefix.clone());
        router = router.layer(prometheus_layer);

        let metrics_addr = format!("{}:{}", config.host, config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr).await?;
        info!("Metrics endpoint listening on {}", metrics_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, build_metrics_router(handle)).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let bind_addr = config.bind_addr();
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Inference router listening on {}", bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server exiting");
    Ok(())
}
