use std::{future::IntoFuture, net::SocketAddr, sync::Arc, time::Duration};

use axum::{middleware, routing::get, Router};
use tokio::sync::Notify;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{health::health, ratelimit, state::AppState, users};

pub fn build_app(state: AppState) -> Router {
    let mut protected = users::handlers::protected_routes();
    if let Some(limiter) = state.limiter.clone() {
        protected = protected.route_layer(middleware::from_fn_with_state(
            limiter,
            ratelimit::rate_limit,
        ));
    }

    Router::new()
        .route("/health", get(health))
        .nest(
            "/api/v1",
            Router::new()
                .merge(users::handlers::public_routes())
                .merge(protected),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let method = req.method().clone();
                    let uri = req.uri().clone();
                    tracing::info_span!("http_request", %method, uri = %uri, status = tracing::field::Empty)
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        let status = res.status();
                        span.record("status", tracing::field::display(status));
                        let latency_ms = latency.as_millis() as u64;
                        if status.is_server_error() {
                            tracing::error!(%status, latency_ms, "response");
                        } else {
                            tracing::info!(%status, latency_ms, "response");
                        }
                    },
                ),
        )
}

/// Serves until SIGINT/SIGTERM, then gives in-flight requests `grace` to
/// finish before the server task is aborted.
pub async fn serve(app: Router, addr: SocketAddr, grace: Duration) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);

    let stop = Arc::new(Notify::new());
    let stop_rx = stop.clone();
    let mut server = tokio::spawn(
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { stop_rx.notified().await })
        .into_future(),
    );

    tokio::select! {
        res = &mut server => {
            // server ended on its own; surface why
            res??;
            return Ok(());
        }
        _ = shutdown_signal() => {}
    }

    tracing::info!(grace_secs = grace.as_secs(), "shutting down server");
    stop.notify_one();

    match tokio::time::timeout(grace, &mut server).await {
        Ok(res) => res??,
        Err(_) => {
            tracing::warn!("grace period elapsed; forcing remaining connections closed");
            server.abort();
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install ctrl-c handler");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
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
}
