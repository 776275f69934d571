use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wsbroker::{
    auth::jwt::JwtAccessTokenService,
    broker::{Broker, CloseReason},
    config::{LogFormat, ServerConfig},
    metrics::{self, BrokerMetrics},
    routes::{build_router, AppState},
    ConnectionInfo,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    init_tracing(&config)?;
    metrics::set_global_metrics(Arc::new(BrokerMetrics::default()));

    if config.is_dev_jwt_secret() {
        warn!("using development JWT secret; set WSBROKER_JWT_SECRET in production");
    }
    let jwt_service = Arc::new(
        JwtAccessTokenService::new(&config.jwt_secret).context("invalid WSBROKER_JWT_SECRET")?,
    );

    let broker = Broker::builder()
        .options(config.broker.clone())
        .disconnect_hook(|connection: ConnectionInfo, reason: CloseReason| async move {
            info!(
                user_id = connection.user_id,
                connection_id = %connection.connection_id,
                reason = reason.as_str(),
                "client disconnected"
            );
        })
        .start();

    let app = build_router(AppState::new(broker, Arc::clone(&jwt_service), config.subprotocols.clone()));
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind broker listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, subprotocols = ?config.subprotocols, "starting websocket broker");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("broker server exited unexpectedly")
}

fn init_tracing(config: &ServerConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&config.log_filter)
        .with_context(|| format!("invalid WSBROKER_LOG_FILTER '{}'", config.log_filter))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match config.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    result.map_err(|error| anyhow::anyhow!("failed to install tracing subscriber: {error}"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
