//! Middleware stack: correlation-id injection and request logging, CORS,
//! Bearer-JWT authentication with the per-session rate limiter, and the
//! loopback guard for admin endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::debug;

use crate::auth;
use crate::error::AgentError;
use crate::ratelimit::Decision;
use crate::AppContext;

/// Correlation id attached to every request and response.
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

/// The session a protected request was authenticated for.
#[derive(Debug, Clone)]
pub struct AuthedSession {
    pub session_id: String,
}

/// Outermost layer: mint a correlation id, log the request, stamp the
/// response header.
pub async fn correlation(mut req: Request, next: Next) -> Response {
    let correlation_id = uuid::Uuid::new_v4().to_string();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    req.extensions_mut()
        .insert(CorrelationId(correlation_id.clone()));

    let started = std::time::Instant::now();
    let mut response = next.run(req).await;

    // Server errors leave the process with a generic body only; no stack
    // traces, no internal paths. Details were already logged at the source.
    if response.status().is_server_error() {
        let status = response.status();
        response = (
            status,
            axum::Json(serde_json::json!({
                "error": "internal error",
                "correlationId": correlation_id,
            })),
        )
            .into_response();
    }

    response.headers_mut().insert(
        "x-correlation-id",
        HeaderValue::from_str(&correlation_id)
            .unwrap_or_else(|_| HeaderValue::from_static("invalid")),
    );
    debug!(
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        correlation = %correlation_id,
        "request"
    );
    response
}

/// Bearer-JWT authentication plus the per-session rate limiter.
///
/// Ordering matters: the credential is checked first, then the limiter is
/// charged against the verified session, then activity is touched (a side
/// effect of successful verification).
pub async fn require_auth(
    State(ctx): State<Arc<AppContext>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AgentError> {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = auth::bearer_token(header).ok_or(AgentError::Unauthorized)?;
    let claims =
        auth::verify(&ctx.config.jwt_secret, token).ok_or(AgentError::Unauthorized)?;

    let session = ctx
        .sessions
        .get(&claims.session_id)
        .await
        .ok_or(AgentError::Unauthorized)?;
    if session.is_expired(Utc::now()) {
        return Err(AgentError::Gone("session expired".to_string()));
    }
    if !session.authenticated {
        return Err(AgentError::Unauthorized);
    }

    if let Decision::Limited { retry_after_secs } = ctx.limiter.check(&claims.session_id).await {
        return Err(AgentError::RateLimited { retry_after_secs });
    }

    ctx.sessions.touch(&claims.session_id).await;
    req.extensions_mut().insert(AuthedSession {
        session_id: claims.session_id,
    });
    Ok(next.run(req).await)
}

/// Admin endpoints answer only to loopback sources.
pub fn require_loopback(addr: &SocketAddr) -> Result<(), AgentError> {
    if addr.ip().is_loopback() {
        Ok(())
    } else {
        Err(AgentError::Forbidden(
            "this endpoint is only available from localhost".to_string(),
        ))
    }
}

/// CORS layer from the configured origin list (`*` or comma-separated).
pub fn cors_layer(origins: &str) -> CorsLayer {
    if origins.trim() == "*" {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let list: Vec<HeaderValue> = origins
        .split(',')
        .filter_map(|o| o.trim().parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(list))
        .allow_methods(Any)
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_guard() {
        let local: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let local_v6: SocketAddr = "[::1]:9999".parse().unwrap();
        let remote: SocketAddr = "203.0.113.5:9999".parse().unwrap();
        assert!(require_loopback(&local).is_ok());
        assert!(require_loopback(&local_v6).is_ok());
        assert!(require_loopback(&remote).is_err());
    }
}
