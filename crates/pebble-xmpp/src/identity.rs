//! Stream ids and bound identifiers.
//!
//! Both are drawn from the operating system RNG. There is no fallback: if the
//! RNG fails, uniqueness of identifiers can no longer be guaranteed, so the
//! process aborts.

use jid::FullJid;
use rand::rngs::OsRng;
use rand::TryRngCore;
use tracing::error;

use crate::XmppError;

/// Eight random bytes, hex-encoded (16 lowercase hex digits).
pub fn random_hex() -> String {
    let mut bytes = [0u8; 8];
    if let Err(e) = OsRng.try_fill_bytes(&mut bytes) {
        error!(error = %e, "Failed to read random bytes");
        std::process::abort();
    }
    hex::encode(bytes)
}

/// A fresh stream id for a `<stream:stream>` header.
pub fn stream_id() -> String {
    random_hex()
}

/// Synthesize a bound identifier: `<hex>@<domain>/<hex>`.
///
/// Local part and resource come from independent draws.
pub fn generate_jid(domain: &str) -> Result<FullJid, XmppError> {
    let raw = format!("{}@{}/{}", random_hex(), domain, random_hex());
    raw.parse::<FullJid>()
        .map_err(|e| XmppError::config(format!("Cannot build identifier for domain {}: {}", domain, e)))
}
