//! HTTP server bootstrap: plain TCP or TLS (rustls), with graceful shutdown.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;

use eventmill_infra::config::TlsSettings;

/// Time in-flight requests get once shutdown begins (TLS listener).
const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },

    #[error("load certificate: {0}")]
    Tls(std::io::Error),

    #[error("serve: {0}")]
    Serve(std::io::Error),
}

/// Serve `app` on `address` until `shutdown` is cancelled.
pub async fn serve(
    app: Router,
    address: SocketAddr,
    tls: Option<&TlsSettings>,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    match tls {
        Some(tls) => serve_tls(app, address, tls, shutdown).await,
        None => serve_plain(app, address, shutdown).await,
    }
}

async fn serve_plain(
    app: Router,
    address: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .map_err(|source| ServerError::Bind { address, source })?;

    info!(address = %address, tls = false, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(ServerError::Serve)
}

async fn serve_tls(
    app: Router,
    address: SocketAddr,
    tls: &TlsSettings,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    // Both ring (via reqwest) and aws-lc-rs end up linked; pick one explicitly.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = RustlsConfig::from_pem_file(&tls.cert, &tls.key)
        .await
        .map_err(ServerError::Tls)?;

    let handle = axum_server::Handle::new();
    let on_shutdown = handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        on_shutdown.graceful_shutdown(Some(GRACEFUL_SHUTDOWN));
    });

    info!(address = %address, tls = true, cert = %tls.cert.display(), "listening");

    axum_server::bind_rustls(address, config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(ServerError::Serve)
}
