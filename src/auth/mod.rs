//! JWT credentials.
//!
//! Minted after a successful TOTP verification, verified by the auth
//! middleware on every protected request. Symmetric HS256 with the
//! configured `JWT_SECRET`.

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub session_id: String,
    pub host_id: String,
    /// Unix seconds.
    pub exp: u64,
}

/// Mint a token for an authenticated session. The token expires with the
/// session.
pub fn mint(
    secret: &str,
    session_id: &str,
    host_id: &str,
    expires_at: DateTime<Utc>,
) -> anyhow::Result<String> {
    let claims = Claims {
        session_id: session_id.to_string(),
        host_id: host_id.to_string(),
        exp: expires_at.timestamp().max(0) as u64,
    };
    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

/// Verify a token. `None` means the credential is missing its signature,
/// malformed, or expired; the caller maps that to 401.
pub fn verify(secret: &str, token: &str) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()
    .map(|data| data.claims)
}

/// Extract the token from a `Bearer <token>` authorization header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    header_value.strip_prefix("Bearer ").map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn mint_and_verify_round_trip() {
        let exp = Utc::now() + Duration::hours(1);
        let token = mint(SECRET, "AB12CD34", "27539093", exp).unwrap();
        let claims = verify(SECRET, &token).expect("token must verify");
        assert_eq!(claims.session_id, "AB12CD34");
        assert_eq!(claims.host_id, "27539093");
        assert_eq!(claims.exp, exp.timestamp() as u64);
    }

    #[test]
    fn wrong_secret_fails() {
        let exp = Utc::now() + Duration::hours(1);
        let token = mint(SECRET, "AB12CD34", "27539093", exp).unwrap();
        assert!(verify("another-secret-another-secret-xx", &token).is_none());
    }

    #[test]
    fn expired_token_fails() {
        let exp = Utc::now() - Duration::hours(1);
        let token = mint(SECRET, "AB12CD34", "27539093", exp).unwrap();
        assert!(verify(SECRET, &token).is_none());
    }

    #[test]
    fn garbage_token_fails() {
        assert!(verify(SECRET, "not.a.jwt").is_none());
        assert!(verify(SECRET, "").is_none());
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(bearer_token("Bearer abc.def.ghi"), Some("abc.def.ghi"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token(""), None);
    }
}
