//! HMAC-SHA256 signing for private (user-data) stream logins.
//!
//! Public market-data paths never touch this module. Each venue signs a
//! different canonical string; the helpers here cover the three
//! encodings in use across the supported venues:
//!
//! - hex digest                       (binance, bybit, mexc, coinex, gateio)
//! - base64 digest                    (okx, kucoin, bitget, bingx)
//! - signed "GET/path" style payloads (okx family)
//!
//! Signature rejection halts the user-data stream only; public
//! subscriptions on the same venue keep running.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(secret: &str, payload: &str) -> Vec<u8> {
    // HMAC accepts keys of any length; new_from_slice cannot fail.
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Signature as lowercase hex.
pub fn sign_hex(secret: &str, payload: &str) -> String {
    hex::encode(hmac_sha256(secret, payload))
}

/// Signature as standard base64.
pub fn sign_base64(secret: &str, payload: &str) -> String {
    BASE64.encode(hmac_sha256(secret, payload))
}

/// Canonical string of the okx/kucoin/bitget login family:
/// `{timestamp}{method}{path}` signed and base64-encoded.
pub fn sign_timestamp_method_path(
    secret: &str,
    timestamp: &str,
    method: &str,
    path: &str,
) -> String {
    sign_base64(secret, &format!("{timestamp}{method}{path}"))
}
