use anyhow::Context;
use tokio_util::sync::CancellationToken;

use relaybox_api::app::{build_app, Runtime};
use relaybox_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relaybox_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    tracing::info!(?config, "configuration loaded");

    let shutdown = CancellationToken::new();
    let runtime = Runtime::start(&config, shutdown.clone()).await?;
    let app = build_app(runtime.services());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind 0.0.0.0:{}", config.port))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal(&signal).await;
            signal.cancel();
        })
        .await
        .context("http server failed")?;

    tracing::info!("shutting down");
    runtime.shutdown(config.shutdown_grace).await;
    Ok(())
}

async fn shutdown_signal(cancel: &CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = cancel.cancelled() => {},
    }
}
