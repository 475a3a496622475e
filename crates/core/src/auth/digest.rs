//! HTTP Digest computation (RFC 2617 §3.2.2, MD5 with `qop`).
//!
//! ```text
//! HA1      = MD5(username:realm:password)
//! HA2      = MD5(method:uri)
//! response = MD5(HA1:nonce:nc:cnonce:qop:HA2)
//! ```
//!
//! Everything here is pure; the per-camera request counter lives in
//! [`AuthSession`](super::AuthSession).

use md5::{Digest, Md5};

use crate::scan::extract_between;

/// Highest nonce-count value before the counter wraps back to 1.
pub const MAX_NONCE_COUNT: u8 = 125;

/// Lowercase 32-character hex MD5 of `input`.
pub fn md5_hex(input: &[u8]) -> String {
    hex::encode(Md5::digest(input))
}

/// Advances the nonce count: 1, 2, ... 126, then back to 1. Never 0.
///
/// Called exactly once per digest attempt.
pub fn next_counter(prev: u8) -> u8 {
    if prev > MAX_NONCE_COUNT { 1 } else { prev + 1 }
}

/// Computes the Digest `response=` value.
#[allow(clippy::too_many_arguments)]
pub fn build_digest_response(
    user: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    qop: &str,
    cnonce: &str,
    nc: &str,
    method: &str,
    uri: &str,
) -> String {
    let ha1 = md5_hex(format!("{user}:{realm}:{password}").as_bytes());
    let ha2 = md5_hex(format!("{method}:{uri}").as_bytes());
    md5_hex(format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}").as_bytes())
}

/// Attributes of one `WWW-Authenticate: Digest ...` challenge.
///
/// Parsed leniently with [`extract_between`]; absent attributes are empty.
/// Recomputed on every 401, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: String,
    pub qop: String,
    /// `stale="true"`: the nonce expired, the credentials themselves were fine.
    pub stale: bool,
}

impl DigestChallenge {
    pub fn parse(header: &str) -> Self {
        DigestChallenge {
            realm: extract_between(header, "realm=\"").to_string(),
            nonce: extract_between(header, "nonce=\"").to_string(),
            opaque: extract_between(header, "opaque=\"").to_string(),
            qop: extract_between(header, "qop=\"").to_string(),
            stale: extract_between(header, "stale=\"").eq_ignore_ascii_case("true"),
        }
    }
}
