//! Signed-request plumbing shared by the venue adapters.
//!
//! Retrying is policy here, not per-call code: every REST operation builds
//! its (freshly timestamped and signed) request through a closure and
//! [`send_with_retry`] retries transport failures up to [`RETRY_COUNT`]
//! attempts. Non-2xx responses are never retried; the caller decides what
//! a venue rejection means.

use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::blocking;
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Transport-error retry budget per REST call.
pub const RETRY_COUNT: usize = 3;

/// HMAC-SHA256 over `payload`, hex encoded — the digest format both venue
/// dialects use.
pub fn sign_payload(secret: &str, payload: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow!("hmac key error: {e}"))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Query-string encoding of the parameter list, in insertion order. The
/// encoded string doubles as the signature payload, so it must match the
/// bytes that go on the wire exactly. Values are venue symbols, decimals,
/// uuids and flags; none need percent escaping.
pub fn urlencode(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Send a request, retrying transport errors. `build` is invoked per
/// attempt so timestamps and signatures are fresh on every try.
pub fn send_with_retry<F>(venue: &str, build: F) -> Result<blocking::Response>
where
    F: Fn() -> Result<blocking::RequestBuilder>,
{
    let mut last_err = None;
    for attempt in 0..RETRY_COUNT {
        match build()?.send() {
            Ok(response) => return Ok(response),
            Err(e) => {
                warn!(venue, attempt, error = %e, "rest_transport_retry");
                last_err = Some(e);
            }
        }
    }
    match last_err {
        Some(e) => Err(e).with_context(|| format!("connection error to {venue}")),
        None => Err(anyhow!("connection error to {venue}")),
    }
}

/// Turn a non-2xx response into an error carrying the full body.
pub fn response_error(venue: &str, response: blocking::Response) -> anyhow::Error {
    let status = response.status();
    let body = response.text().unwrap_or_default();
    anyhow!("{venue} request failed with {status}: {body}")
}

/// Parse a venue-reported decimal string.
pub fn parse_decimal(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw.trim()).with_context(|| format!("bad decimal {raw:?}"))
}

/// Render a decimal for a request parameter without a trailing zero tail.
pub fn decimal_param(value: Decimal) -> String {
    value.normalize().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn signature_is_stable_hex() {
        // HMAC-SHA256("key", "message"), a fixed vector.
        let sig = sign_payload("key", "message").unwrap();
        assert_eq!(
            sig,
            "6e9ef29b75fffc5b7abae527d58fdadb2fe42e7219011976917343065f58ed4a"
        );
    }

    #[test]
    fn urlencode_preserves_order() {
        let qs = urlencode(&[
            ("symbol", "BTCUSDT".to_string()),
            ("side", "BUY".to_string()),
        ]);
        assert_eq!(qs, "symbol=BTCUSDT&side=BUY");
    }

    #[test]
    fn decimal_param_strips_zero_tail() {
        assert_eq!(decimal_param(dec!(0.0500)), "0.05");
        assert_eq!(decimal_param(dec!(20000)), "20000");
        assert_eq!(parse_decimal(" 1.25 ").unwrap(), dec!(1.25));
    }
}
