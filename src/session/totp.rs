//! Time-based one-time passcodes per RFC 6238.
//!
//! HMAC-SHA1, 6 digits, 30 second step. Verification accepts a clock-skew
//! window of ±2 steps and compares codes in constant time.

use base32::Alphabet;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

pub const DIGITS: u32 = 6;
pub const STEP_SECS: u64 = 30;
/// Accepted clock skew, in steps, on either side of now.
pub const SKEW_STEPS: i64 = 2;
const SECRET_BYTES: usize = 20;

const B32: Alphabet = Alphabet::Rfc4648 { padding: false };

/// Fresh per-session secret, Base32-encoded (32 chars for 20 bytes).
pub fn generate_secret() -> String {
    use rand_core::{OsRng, RngCore};
    let mut raw = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut raw);
    base32::encode(B32, &raw)
}

/// `otpauth://` provisioning URL for authenticator apps.
pub fn otpauth_url(secret_b32: &str, host_id: &str, session_id: &str) -> String {
    format!(
        "otpauth://totp/Tether%20Host:{host_id}-{session_id}?secret={secret_b32}&issuer=Tether%20Host&algorithm=SHA1&digits={DIGITS}&period={STEP_SECS}"
    )
}

/// HOTP value for one counter step (RFC 4226 dynamic truncation).
fn hotp(secret: &[u8], counter: u64) -> u32 {
    // HMAC-SHA1 accepts keys of any length.
    let mut mac = HmacSha1::new_from_slice(secret).expect("hmac key");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let bin = ((u32::from(digest[offset]) & 0x7f) << 24)
        | (u32::from(digest[offset + 1]) << 16)
        | (u32::from(digest[offset + 2]) << 8)
        | u32::from(digest[offset + 3]);
    bin % 10u32.pow(DIGITS)
}

/// The code for `unix_secs` exactly (no skew window). Exposed so tests and
/// the enrolment flow can mint a currently-valid code.
pub fn code_at(secret_b32: &str, unix_secs: u64) -> Option<String> {
    let secret = base32::decode(B32, secret_b32)?;
    Some(format!(
        "{:06}",
        hotp(&secret, unix_secs / STEP_SECS)
    ))
}

/// Verify `code` against the secret at `unix_secs`, accepting ±2 steps.
///
/// Every candidate step is compared in constant time; the loop never exits
/// early on a match so total work does not depend on the input.
pub fn verify_at(secret_b32: &str, code: &str, unix_secs: u64) -> bool {
    let Some(secret) = base32::decode(B32, secret_b32) else {
        return false;
    };
    if code.len() != DIGITS as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }

    let step = (unix_secs / STEP_SECS) as i64;
    let mut matched = 0u8;
    for skew in -SKEW_STEPS..=SKEW_STEPS {
        let counter = step + skew;
        if counter < 0 {
            continue;
        }
        let expected = format!("{:06}", hotp(&secret, counter as u64));
        matched |= u8::from(constant_time_eq(expected.as_bytes(), code.as_bytes()));
    }
    matched == 1
}

/// Verify against the current clock.
pub fn verify(secret_b32: &str, code: &str) -> bool {
    verify_at(secret_b32, code, chrono::Utc::now().timestamp().max(0) as u64)
}

/// Byte comparison without short-circuiting on mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    /// RFC 6238 appendix B secret: ASCII "12345678901234567890".
    fn rfc_secret() -> String {
        base32::encode(B32, b"12345678901234567890")
    }

    #[test]
    fn rfc6238_sha1_test_vectors() {
        // Appendix B values, truncated from 8 to 6 digits.
        let secret = rfc_secret();
        assert_eq!(code_at(&secret, 59).unwrap(), "287082");
        assert_eq!(code_at(&secret, 1_111_111_109).unwrap(), "081804");
        assert_eq!(code_at(&secret, 1_234_567_890).unwrap(), "005924");
        assert_eq!(code_at(&secret, 20_000_000_000).unwrap(), "353130");
    }

    #[test]
    fn secret_is_32_base32_chars() {
        let s = generate_secret();
        assert_eq!(s.len(), 32);
        assert!(base32::decode(B32, &s).is_some());
    }

    #[test]
    fn accepts_codes_within_two_steps() {
        let secret = rfc_secret();
        let now = 1_234_567_890u64;
        for skew_steps in [-2i64, -1, 0, 1, 2] {
            let t = (now as i64 + skew_steps * STEP_SECS as i64) as u64;
            let code = code_at(&secret, t).unwrap();
            assert!(
                verify_at(&secret, &code, now),
                "code at skew {skew_steps} must verify"
            );
        }
    }

    #[test]
    fn rejects_codes_three_steps_out() {
        let secret = rfc_secret();
        let now = 1_234_567_890u64;
        for skew_steps in [-3i64, 3] {
            let t = (now as i64 + skew_steps * STEP_SECS as i64) as u64;
            let code = code_at(&secret, t).unwrap();
            assert!(
                !verify_at(&secret, &code, now),
                "code at skew {skew_steps} must not verify"
            );
        }
    }

    #[test]
    fn rejects_malformed_codes() {
        let secret = rfc_secret();
        assert!(!verify_at(&secret, "28708", 59));
        assert!(!verify_at(&secret, "2870822", 59));
        assert!(!verify_at(&secret, "28708a", 59));
        assert!(!verify_at(&secret, "", 59));
    }

    #[test]
    fn rejects_wrong_secret() {
        let code = code_at(&rfc_secret(), 59).unwrap();
        let other = generate_secret();
        assert!(!verify_at(&other, &code, 59));
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"123456", b"123456"));
        assert!(!constant_time_eq(b"123456", b"123457"));
        assert!(!constant_time_eq(b"12345", b"123456"));
    }
}
