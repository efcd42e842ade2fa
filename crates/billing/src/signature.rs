//! Webhook signature verification
//!
//! Deliveries carry an HMAC-SHA256 signature header of the form
//! `t=<unix_seconds>,v1=<hex_digest>` where the digest covers
//! `"{timestamp}.{raw_body}"`. Verification fails closed: a missing,
//! malformed, stale, or mismatched signature rejects the delivery before
//! anything is persisted.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed timestamp, in seconds. Bounds replay of a
/// captured delivery.
const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// Verifies provider signatures on raw webhook bodies.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Check `signature_header` against `payload`. Ok(()) means the body
    /// is authentic and fresh.
    pub fn verify(&self, payload: &str, signature_header: &str) -> BillingResult<()> {
        let (timestamp, provided) = parse_signature_header(signature_header)?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > TIMESTAMP_TOLERANCE_SECS {
            tracing::warn!(
                age_secs = now - timestamp,
                "Webhook signature timestamp outside tolerance"
            );
            return Err(BillingError::SignatureInvalid);
        }

        let expected = self.compute(timestamp, payload)?;
        if constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
            Ok(())
        } else {
            Err(BillingError::SignatureInvalid)
        }
    }

    /// Produce a valid header for `payload` at `timestamp`. Used by tests
    /// and the local delivery simulator.
    pub fn sign(&self, payload: &str, timestamp: i64) -> BillingResult<String> {
        let digest = self.compute(timestamp, payload)?;
        Ok(format!("t={},v1={}", timestamp, digest))
    }

    fn compute(&self, timestamp: i64, payload: &str) -> BillingResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| BillingError::SignatureInvalid)?;
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

fn parse_signature_header(header: &str) -> BillingResult<(i64, String)> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signature = Some(value.to_string()),
            _ => {}
        }
    }

    match (timestamp, signature) {
        (Some(t), Some(s)) => Ok((t, s)),
        _ => Err(BillingError::SignatureInvalid),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
