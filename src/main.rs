use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use reference_image_proxy::{
    Config, GenerateService,
    generation,
    quota::QuotaTracker,
    reference_image::ReferenceImageLoader,
    server,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    let bind_address = config.bind_address();

    let reference_image = if config.cache_reference_image {
        ReferenceImageLoader::cached(&config.reference_image_path)
    } else {
        ReferenceImageLoader::new(&config.reference_image_path)
    };
    if !reference_image.exists().await {
        tracing::warn!(
            path = %reference_image.path().display(),
            "reference image is missing; generation requests will fail until it is provided"
        );
    }

    let shutdown = CancellationToken::new();
    let quota = QuotaTracker::in_memory(config.daily_limit);
    let eviction = quota.spawn_eviction(config.quota_retention_days, shutdown.clone());
    let generator = generation::build_client(&config.replicate)
        .context("failed to build generation client")?;
    let service = Arc::new(GenerateService::new(
        quota,
        reference_image,
        generator,
        shutdown.clone(),
    ));

    let router = server::router(service);
    let tcp_listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;

    tracing::info!(
        address = %bind_address,
        daily_limit = config.daily_limit,
        model = %config.replicate.model,
        strategy = ?config.replicate.strategy,
        "image proxy listening"
    );

    let signal = shutdown.clone();
    axum::serve(
        tcp_listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        signal.cancel();
    })
    .await
    .context("server error")?;

    shutdown.cancel();
    let _ = eviction.await;
    tracing::info!("image proxy stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
