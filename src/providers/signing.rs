//! Canonical parameter signing shared by the provider adapters.
//!
//! Every supported provider signs the same way at the core: sort parameters
//! by key, join non-empty pairs as `key=value&...` (signature fields
//! excluded), then apply the channel's digest over that canonical string
//! plus the shared secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

/// Keys never included in a canonical string.
pub const SIGNATURE_KEYS: [&str; 2] = ["sign", "sign_type"];

/// Sorted `key=value&...` over non-empty params, signature fields skipped.
pub fn canonical_query(params: &BTreeMap<String, String>) -> String {
    let mut parts = Vec::with_capacity(params.len());
    for (key, value) in params {
        if SIGNATURE_KEYS.contains(&key.as_str()) || value.is_empty() {
            continue;
        }
        parts.push(format!("{}={}", key, value));
    }
    parts.join("&")
}

/// Lowercase MD5 hex of `canonical ∥ secret` (legacy alipay style).
pub fn md5_sign(canonical: &str, secret: &str) -> String {
    let digest = md5::compute(format!("{}{}", canonical, secret));
    format!("{:x}", digest)
}

/// Uppercase MD5 hex of `canonical&key=secret` (wechat v2 MD5 style).
pub fn md5_key_sign(canonical: &str, secret: &str) -> String {
    let digest = md5::compute(format!("{}&key={}", canonical, secret));
    format!("{:x}", digest).to_uppercase()
}

/// Lowercase HMAC-SHA256 hex over the message with the shared secret.
pub fn hmac_sha256_sign(message: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time-ish signature comparison; case-insensitive because
/// providers disagree on hex casing.
pub fn signature_matches(expected: &str, provided: &str) -> bool {
    if expected.len() != provided.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in expected
        .bytes()
        .map(|b| b.to_ascii_lowercase())
        .zip(provided.bytes().map(|b| b.to_ascii_lowercase()))
    {
        diff |= a ^ b;
    }
    diff == 0
}
