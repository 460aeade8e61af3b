//! Auth endpoints: session creation, TOTP verification, refresh, teardown,
//! and the loopback-only enrolment and Host-ID rotation surfaces.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::auth as jwt;
use crate::error::AgentError;
use crate::http::middleware::{require_loopback, AuthedSession};
use crate::ratelimit::Decision;
use crate::session::{totp, SessionPublic, VerifyResult};
use crate::AppContext;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub host_id: String,
}

/// `POST /auth/sessions`: create a pending session for a correct Host ID.
/// A wrong Host ID gets a generic 404 so the identifier cannot be probed.
pub async fn create_session(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Value>), AgentError> {
    if !ctx.identity.matches(&body.host_id).await {
        return Err(AgentError::NotFound("not found".to_string()));
    }

    let (session_id, totp_secret) = ctx.sessions.create(&body.host_id).await;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "sessionId": session_id,
            "totpSecret": totp_secret,
            "message": "session created; verify with a one-time code to authenticate",
        })),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub totp_code: String,
}

/// `POST /auth/sessions/{id}/verify`: verify TOTP, mint the JWT.
/// Session validation runs first: 404 unknown, 410 expired. The limiter is
/// charged per session id before the code is checked, which bounds
/// brute-force attempts.
pub async fn verify(
    State(ctx): State<Arc<AppContext>>,
    Path(session_id): Path<String>,
    Json(body): Json<VerifyRequest>,
) -> Result<Json<Value>, AgentError> {
    // Session validation first: 404 unknown, 410 expired.
    let session = ctx
        .sessions
        .get(&session_id)
        .await
        .ok_or_else(|| AgentError::NotFound("session not found".to_string()))?;
    if session.is_expired(chrono::Utc::now()) {
        return Err(AgentError::Gone("session expired".to_string()));
    }

    if let Decision::Limited { retry_after_secs } = ctx.limiter.check(&session_id).await {
        return Err(AgentError::RateLimited { retry_after_secs });
    }

    match ctx.sessions.verify(&session_id, &body.totp_code).await {
        VerifyResult::Unknown => Err(AgentError::NotFound("session not found".to_string())),
        VerifyResult::Expired => Err(AgentError::Gone("session expired".to_string())),
        VerifyResult::BadCode => Err(AgentError::Unauthorized),
        VerifyResult::Verified => {
            let session = ctx
                .sessions
                .get(&session_id)
                .await
                .ok_or(AgentError::Unauthorized)?;
            let token = jwt::mint(
                &ctx.config.jwt_secret,
                &session.id,
                &session.host_id,
                session.expires_at,
            )?;
            Ok(Json(json!({
                "token": token,
                "expiresAt": session.expires_at,
                "message": "authenticated",
            })))
        }
    }
}

/// `GET /auth/sessions/{id}`: session status (authenticated callers only).
pub async fn get_session(
    State(ctx): State<Arc<AppContext>>,
    Extension(authed): Extension<AuthedSession>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, AgentError> {
    require_same_session(&authed, &session_id)?;
    let session = ctx
        .sessions
        .get(&session_id)
        .await
        .ok_or_else(|| AgentError::NotFound("session not found".to_string()))?;
    let peer = ctx.peers.get(&session_id).await;
    Ok(Json(json!({
        "session": SessionPublic::from(&session),
        "peer": peer,
    })))
}

/// `POST /auth/sessions/{id}/refresh`: extend expiry 24 h, mint a new JWT.
pub async fn refresh(
    State(ctx): State<Arc<AppContext>>,
    Extension(authed): Extension<AuthedSession>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, AgentError> {
    require_same_session(&authed, &session_id)?;
    let expires_at = ctx
        .sessions
        .refresh(&session_id)
        .await
        .ok_or_else(|| AgentError::NotFound("session not found".to_string()))?;
    let session = ctx
        .sessions
        .get(&session_id)
        .await
        .ok_or_else(|| AgentError::NotFound("session not found".to_string()))?;
    let token = jwt::mint(
        &ctx.config.jwt_secret,
        &session.id,
        &session.host_id,
        expires_at,
    )?;
    Ok(Json(json!({ "token": token, "expiresAt": expires_at })))
}

/// `DELETE /auth/sessions/{id}`: tear the session down, cascading to its
/// execution and peer.
pub async fn delete_session(
    State(ctx): State<Arc<AppContext>>,
    Extension(authed): Extension<AuthedSession>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, AgentError> {
    require_same_session(&authed, &session_id)?;
    ctx.destroy_session(&session_id).await;
    Ok(Json(json!({ "deleted": true })))
}

/// `GET /auth/setup`: loopback-only enrolment data for physical-access
/// provisioning: a fresh pending session plus the otpauth URL.
pub async fn setup(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<Value>, AgentError> {
    require_loopback(&addr)?;

    let host_id = ctx.identity.current().await;
    let (session_id, totp_secret) = ctx.sessions.create(&host_id).await;
    let otpauth_url = totp::otpauth_url(&totp_secret, &host_id, &session_id);
    Ok(Json(json!({
        "hostId": host_id,
        "sessionId": session_id,
        "totpSecret": totp_secret,
        "otpauthUrl": otpauth_url,
        "iceServers": ctx.config.ice_servers,
    })))
}

/// `POST /auth/renew-host-id`: loopback-only. Rotates the Host ID and
/// invalidates every session atomically.
pub async fn renew_host_id(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<Value>, AgentError> {
    require_loopback(&addr)?;
    let new_id = ctx.rotate_host_id().await?;
    info!("host id renewed via admin surface");
    Ok(Json(json!({
        "hostId": new_id,
        "message": "host id rotated; all sessions invalidated",
    })))
}

/// A bearer token only operates on its own session.
fn require_same_session(authed: &AuthedSession, path_id: &str) -> Result<(), AgentError> {
    if authed.session_id == path_id {
        Ok(())
    } else {
        Err(AgentError::Forbidden(
            "token does not match session".to_string(),
        ))
    }
}
