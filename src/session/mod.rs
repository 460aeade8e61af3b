//! In-memory session registry.
//!
//! Sessions are created when a client presents the correct Host ID,
//! authenticated by TOTP, and evicted on expiry, inactivity, explicit
//! logout, or Host-ID rotation. Nothing is persisted across restarts.

pub mod totp;

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::util;

/// Absolute lifetime granted at creation and on each refresh.
const SESSION_TTL_HOURS: i64 = 24;
/// Sessions idle longer than this are swept regardless of expiry.
const IDLE_TIMEOUT_MINS: i64 = 60;
const SESSION_ID_LEN: usize = 8;

// ─── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub host_id: String,
    /// Base32 TOTP secret. Only ever sent to the client in the create
    /// response; every other view must go through [`SessionPublic`].
    #[serde(skip_serializing)]
    pub totp_secret: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub authenticated: bool,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    fn is_idle(&self, now: DateTime<Utc>) -> bool {
        now - self.last_activity > Duration::minutes(IDLE_TIMEOUT_MINS)
    }
}

/// Client-safe view; everything except the secret.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPublic {
    pub session_id: String,
    pub authenticated: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&Session> for SessionPublic {
    fn from(s: &Session) -> Self {
        Self {
            session_id: s.id.clone(),
            authenticated: s.authenticated,
            created_at: s.created_at,
            last_activity: s.last_activity,
            expires_at: s.expires_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyResult {
    Verified,
    BadCode,
    Unknown,
    Expired,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub total: usize,
    pub authenticated: usize,
}

// ─── Store ───────────────────────────────────────────────────────────────────

pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create a pending session bound to `host_id`.
    /// Returns `(session_id, totp_secret)`.
    pub async fn create(&self, host_id: &str) -> (String, String) {
        let now = Utc::now();
        let secret = totp::generate_secret();
        let mut map = self.sessions.write().await;

        // Rejection-sample the ID against the live set. With 36^8 values a
        // retry is effectively never taken, but uniqueness is an invariant,
        // not a probability.
        let id = loop {
            let candidate = util::base36_id(SESSION_ID_LEN);
            if !map.contains_key(&candidate) {
                break candidate;
            }
        };

        map.insert(
            id.clone(),
            Session {
                id: id.clone(),
                host_id: host_id.to_string(),
                totp_secret: secret.clone(),
                created_at: now,
                last_activity: now,
                expires_at: now + Duration::hours(SESSION_TTL_HOURS),
                authenticated: false,
            },
        );
        info!(session = %id, "session created");
        (id, secret)
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Verify a TOTP code. A successful verification marks the session
    /// authenticated and counts as activity.
    pub async fn verify(&self, id: &str, code: &str) -> VerifyResult {
        let now = Utc::now();
        let mut map = self.sessions.write().await;
        let Some(session) = map.get_mut(id) else {
            return VerifyResult::Unknown;
        };
        if session.is_expired(now) {
            return VerifyResult::Expired;
        }
        if totp::verify(&session.totp_secret, code) {
            session.authenticated = true;
            session.last_activity = now;
            info!(session = %id, "session authenticated");
            VerifyResult::Verified
        } else {
            debug!(session = %id, "totp verification failed");
            VerifyResult::BadCode
        }
    }

    pub async fn is_authenticated(&self, id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|s| s.authenticated && !s.is_expired(Utc::now()))
            .unwrap_or(false)
    }

    /// Record activity. Returns `false` for unknown sessions.
    pub async fn touch(&self, id: &str) -> bool {
        let mut map = self.sessions.write().await;
        match map.get_mut(id) {
            Some(s) => {
                s.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Extend the session by 24 h from now. Requires prior authentication.
    /// Returns the new expiry.
    pub async fn refresh(&self, id: &str) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        let mut map = self.sessions.write().await;
        let session = map.get_mut(id)?;
        if !session.authenticated {
            return None;
        }
        session.expires_at = now + Duration::hours(SESSION_TTL_HOURS);
        session.last_activity = now;
        Some(session.expires_at)
    }

    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            info!(session = %id, "session removed");
        }
        removed
    }

    /// Drop every session (Host-ID rotation). Returns the removed ids so the
    /// caller can cascade-cancel executions and peers.
    pub async fn remove_all(&self) -> Vec<String> {
        let mut map = self.sessions.write().await;
        let ids: Vec<String> = map.keys().cloned().collect();
        map.clear();
        if !ids.is_empty() {
            info!(count = ids.len(), "all sessions removed");
        }
        ids
    }

    /// Evict expired and idle sessions. Returns the removed ids.
    pub async fn sweep(&self) -> Vec<String> {
        let now = Utc::now();
        let mut map = self.sessions.write().await;
        let doomed: Vec<String> = map
            .values()
            .filter(|s| s.is_expired(now) || s.is_idle(now))
            .map(|s| s.id.clone())
            .collect();
        for id in &doomed {
            map.remove(id);
            debug!(session = %id, "session swept");
        }
        doomed
    }

    pub async fn stats(&self) -> SessionStats {
        let map = self.sessions.read().await;
        SessionStats {
            total: map.len(),
            authenticated: map.values().filter(|s| s.authenticated).count(),
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_yields_well_formed_ids_and_secrets() {
        let store = SessionStore::new();
        let (id, secret) = store.create("27539093").await;
        assert_eq!(id.len(), 8);
        assert!(id
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        assert_eq!(secret.len(), 32);

        let session = store.get(&id).await.unwrap();
        assert!(!session.authenticated);
        assert!(session.expires_at > session.created_at);
    }

    #[tokio::test]
    async fn verify_with_valid_code_authenticates() {
        let store = SessionStore::new();
        let (id, secret) = store.create("27539093").await;

        let now = Utc::now().timestamp() as u64;
        let code = totp::code_at(&secret, now).unwrap();
        assert_eq!(store.verify(&id, &code).await, VerifyResult::Verified);
        assert!(store.is_authenticated(&id).await);
    }

    #[tokio::test]
    async fn verify_rejects_bad_code_and_unknown_session() {
        let store = SessionStore::new();
        let (id, _) = store.create("27539093").await;
        assert_eq!(store.verify(&id, "000000").await, VerifyResult::BadCode);
        assert!(!store.is_authenticated(&id).await);
        assert_eq!(
            store.verify("NOPE1234", "000000").await,
            VerifyResult::Unknown
        );
    }

    #[tokio::test]
    async fn refresh_requires_authentication_and_extends_expiry() {
        let store = SessionStore::new();
        let (id, secret) = store.create("27539093").await;
        assert!(store.refresh(&id).await.is_none());

        let now = Utc::now().timestamp() as u64;
        let code = totp::code_at(&secret, now).unwrap();
        store.verify(&id, &code).await;

        let before = store.get(&id).await.unwrap().expires_at;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let after = store.refresh(&id).await.unwrap();
        assert!(after > before, "refresh must strictly extend expiry");
    }

    #[tokio::test]
    async fn remove_and_remove_all() {
        let store = SessionStore::new();
        let (a, _) = store.create("27539093").await;
        let (b, _) = store.create("27539093").await;
        assert!(store.remove(&a).await);
        assert!(!store.remove(&a).await);
        let rest = store.remove_all().await;
        assert_eq!(rest, vec![b.clone()]);
        assert!(store.get(&b).await.is_none());
    }

    #[tokio::test]
    async fn sweep_evicts_expired_and_idle() {
        let store = SessionStore::new();
        let (fresh, _) = store.create("27539093").await;
        let (expired, _) = store.create("27539093").await;
        let (idle, _) = store.create("27539093").await;

        {
            let mut map = store.sessions.write().await;
            map.get_mut(&expired).unwrap().expires_at = Utc::now() - Duration::minutes(1);
            map.get_mut(&idle).unwrap().last_activity = Utc::now() - Duration::minutes(61);
        }

        let mut removed = store.sweep().await;
        removed.sort();
        let mut expect = vec![expired, idle];
        expect.sort();
        assert_eq!(removed, expect);
        assert!(store.get(&fresh).await.is_some());
    }

    #[tokio::test]
    async fn invariant_expiry_after_creation() {
        let store = SessionStore::new();
        for _ in 0..10 {
            let (id, _) = store.create("27539093").await;
            let s = store.get(&id).await.unwrap();
            assert!(s.expires_at >= s.created_at);
            assert!(s.last_activity <= Utc::now());
        }
    }
}
