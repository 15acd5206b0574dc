//! Callback signature primitives.
//!
//! Workers sign every callback with HMAC-SHA-256 over the raw request body
//! concatenated with the timestamp header, keyed by their shared credential.
//! The digest travels hex-encoded in the `X-Signature` header.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn mac_for(credential: &str, body: &[u8], timestamp: &str) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(credential.as_bytes())
        .expect("HMAC-SHA-256 accepts keys of any size");
    mac.update(body);
    mac.update(timestamp.as_bytes());
    mac
}

/// Compute the hex signature a worker is expected to send.
pub fn compute_signature(
    credential: &str,
    body: &[u8],
    timestamp: &str,
) -> String {
    let digest = mac_for(credential, body, timestamp).finalize().into_bytes();
    hex::encode(digest)
}

/// Verify a hex signature in constant time.
pub fn verify_signature(
    credential: &str,
    body: &[u8],
    timestamp: &str,
    signature: &str,
) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    mac_for(credential, body, timestamp)
        .verify_slice(&expected)
        .is_ok()
}
