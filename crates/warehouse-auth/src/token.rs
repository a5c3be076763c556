//! Bearer credential inspection
//!
//! Reads the claims embedded in a JWT-shaped credential (`header.payload.sig`)
//! without verifying the signature. The results are advisory: they drive
//! refresh scheduling and local expiry checks, while the backend remains the
//! only authority on whether a credential is valid.

use std::time::Duration;

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde::Deserialize;

/// base64url that accepts payloads with or without `=` padding.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Claims read from a credential payload. Times are epoch seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub subject: String,
    pub issued_at: Option<u64>,
    pub expires_at: u64,
}

impl Claims {
    pub fn expires_at_ms(&self) -> u64 {
        self.expires_at.saturating_mul(1000)
    }
}

#[derive(Deserialize)]
struct RawClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    iat: Option<u64>,
    exp: u64,
}

/// Decode the claims of `credential`, or `None` if it is not well-formed.
pub fn claims(credential: &str) -> Option<Claims> {
    let mut segments = credential.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() || payload.is_empty() {
        return None;
    }
    let bytes = PAYLOAD_ENGINE.decode(payload).ok()?;
    let raw: RawClaims = serde_json::from_slice(&bytes).ok()?;
    Some(Claims {
        subject: raw.sub.unwrap_or_default(),
        issued_at: raw.iat,
        expires_at: raw.exp,
    })
}

/// Expiry in epoch milliseconds, `None` if the credential is malformed.
pub fn expires_at_ms(credential: &str) -> Option<u64> {
    claims(credential).map(|c| c.expires_at_ms())
}

/// Malformed credentials count as expired.
pub fn is_expired(credential: &str, now_ms: u64) -> bool {
    match expires_at_ms(credential) {
        Some(expires) => expires <= now_ms,
        None => true,
    }
}

/// Malformed credentials count as expiring.
pub fn is_expiring_soon(credential: &str, now_ms: u64, threshold: Duration) -> bool {
    match expires_at_ms(credential) {
        Some(expires) => expires <= now_ms.saturating_add(threshold.as_millis() as u64),
        None => true,
    }
}

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
