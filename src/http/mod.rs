//! HTTP control surface.
//!
//! Axum server carrying the auth endpoints, command execution, health, and
//! session admin. Middleware outer to inner: correlation-id + request log,
//! CORS, request timeout, body size limit, then (on protected routes)
//! Bearer-JWT auth with the per-session rate limiter.

pub mod middleware;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::AppContext;

/// Request body cap.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    let protected = Router::new()
        .route("/execute", post(routes::execute::execute))
        .route("/cancel", post(routes::execute::cancel))
        .route("/status", get(routes::execute::status))
        .route(
            "/auth/sessions/{id}",
            get(routes::auth::get_session).delete(routes::auth::delete_session),
        )
        .route("/auth/sessions/{id}/refresh", post(routes::auth::refresh))
        .layer(axum_middleware::from_fn_with_state(
            ctx.clone(),
            middleware::require_auth,
        ));

    let public = Router::new()
        .route("/health", get(routes::health::health))
        .route("/auth/sessions", post(routes::auth::create_session))
        .route("/auth/sessions/{id}/verify", post(routes::auth::verify))
        .route("/auth/setup", get(routes::auth::setup))
        .route("/auth/renew-host-id", post(routes::auth::renew_host_id));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(
            ctx.config.http_timeout_secs,
        )))
        .layer(middleware::cors_layer(&ctx.config.cors_origins))
        .layer(axum_middleware::from_fn(middleware::correlation))
        .with_state(ctx)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    ctx: Arc<AppContext>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let bind = format!("{}:{}", ctx.config.host, ctx.config.port);
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address {bind}"))?;

    let router = build_router(ctx);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "http control surface listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("http server error")
}
