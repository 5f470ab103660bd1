//! axo-flow server binary.
//!
//! Serves the `/upload` endpoint used by flow.js style chunking clients:
//! GET probes whether a chunk is already stored, POST delivers a chunk and
//! triggers assembly once all chunks are present. A background task sweeps
//! sessions that have gone idle.

mod atomic;
mod config;
mod coordinator;
mod error;
mod flow;
mod http;
mod locking;
mod logging;
mod output;
mod store;
mod sweeper;
mod upload;

use axum::extract::Extension;
use axum::http::Request;
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span, warn};

use crate::config::{ASSEMBLY_LOCK_WAIT_SECS, Args, SHUTDOWN_GRACE_SECS, check_disjoint_roots};
use crate::coordinator::UploadCoordinator;
use crate::http::{build_cors_layer, client_ip};
use crate::output::OutputDir;
use crate::store::FsPartStore;
use crate::sweeper::spawn_sweeper;
use crate::upload::{UploadConfig, upload_routes};

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let invalid_input =
        |msg: String| std::io::Error::new(std::io::ErrorKind::InvalidInput, msg);

    let store = Arc::new(FsPartStore::new(args.parts_dir()));
    let output = OutputDir::new(args.output_dir());
    store.ensure_root().await?;
    output.ensure_root().await?;
    check_disjoint_roots(store.root_path(), output.root_path()).map_err(invalid_input)?;
    let stale_temps = output.remove_stale_temp_files().await?;
    if stale_temps > 0 {
        info!(count = stale_temps, "removed leftover assembly temp files");
    }
    info!(
        parts_dir = ?store.root_path(),
        output_dir = ?output.root_path(),
        "storage ready"
    );

    let coordinator = Arc::new(UploadCoordinator::new(
        store.clone(),
        output,
        Duration::from_secs(ASSEMBLY_LOCK_WAIT_SECS),
    ));
    let upload_config = Arc::new(UploadConfig {
        max_chunk_size: args.max_chunk_size,
        absent_status: args.absent_status().map_err(invalid_input)?,
    });

    let mut app: Router = upload_routes(&upload_config)
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip = client_ip(request),
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(coordinator))
        .layer(Extension(upload_config));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .bind
        .parse::<IpAddr>()
        .map_err(|err| invalid_input(err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();
    let cancel = CancellationToken::new();

    let sweeper = spawn_sweeper(
        store,
        args.sweep_policy(),
        Duration::from_secs(args.cleanup_interval_secs),
        cancel.clone(),
    );

    info!("🚀 Listening at {}", addr);
    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::spawn(shutdown_signal(handle, cancel.clone()));
    server.await?;

    cancel.cancel();
    if let Some(sweeper) = sweeper
        && let Err(err) = sweeper.await
    {
        warn!(error = %err, "upload sweeper panicked");
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle, cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
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

    info!("Received termination signal shutting down");
    cancel.cancel();
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}
