//! HMAC signature verification for push notifications

use std::fmt;
use std::str::FromStr;

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use tracing::{debug, warn};

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha1=<hex>`.
pub const SIGNATURE_HEADER: &str = "x-hub-signature";
/// Header carrying `sha256=<hex>`; preferred when present.
pub const SIGNATURE_256_HEADER: &str = "x-hub-signature-256";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Sha1,
    Sha256,
}

impl SignatureAlgorithm {
    pub fn prefix(&self) -> &'static str {
        match self {
            SignatureAlgorithm::Sha1 => "sha1",
            SignatureAlgorithm::Sha256 => "sha256",
        }
    }

    fn digest_len(&self) -> usize {
        match self {
            SignatureAlgorithm::Sha1 => 20,
            SignatureAlgorithm::Sha256 => 32,
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha1" => Ok(SignatureAlgorithm::Sha1),
            "sha256" => Ok(SignatureAlgorithm::Sha256),
            _ => Err(()),
        }
    }
}

/// Keyed MAC over `payload`, or None if the key is rejected.
fn keyed_mac<M: Mac + KeyInit>(secret: &str, payload: &[u8]) -> Option<M> {
    match <M as KeyInit>::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(payload);
            Some(mac)
        }
        Err(_) => None,
    }
}

/// Produces the `<algo>=<hexdigest>` header value for `payload`.
pub fn sign_payload(
    algorithm: SignatureAlgorithm,
    payload: &[u8],
    secret: &str,
) -> Option<String> {
    let digest = match algorithm {
        SignatureAlgorithm::Sha1 => keyed_mac::<HmacSha1>(secret, payload)?
            .finalize()
            .into_bytes()
            .to_vec(),
        SignatureAlgorithm::Sha256 => keyed_mac::<HmacSha256>(secret, payload)?
            .finalize()
            .into_bytes()
            .to_vec(),
    };
    Some(format!("{}={}", algorithm, hex::encode(digest)))
}

/// Verifies a `<algo>=<hexdigest>` signature header against the raw payload.
///
/// Returns false for an empty header, payload or secret, for an unsupported
/// algorithm, and for anything but a lowercase hex digest of the right length.
/// The digest comparison is constant-time.
pub fn verify_signature(signature_header: &str, payload: &[u8], secret: &str) -> bool {
    if signature_header.is_empty() || payload.is_empty() {
        debug!("Missing signature header or empty payload");
        return false;
    }
    if secret.is_empty() {
        warn!("No signing secret available, rejecting signature");
        return false;
    }

    let Some((prefix, hex_digest)) = signature_header.split_once('=') else {
        return false;
    };
    let Ok(algorithm) = prefix.parse::<SignatureAlgorithm>() else {
        warn!("Unsupported signature algorithm '{}'", prefix);
        return false;
    };

    let well_formed = hex_digest.len() == algorithm.digest_len() * 2
        && hex_digest
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    if !well_formed {
        return false;
    }
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    // verify_slice compares in constant time
    match algorithm {
        SignatureAlgorithm::Sha1 => keyed_mac::<HmacSha1>(secret, payload)
            .is_some_and(|mac| mac.verify_slice(&expected).is_ok()),
        SignatureAlgorithm::Sha256 => keyed_mac::<HmacSha256>(secret, payload)
            .is_some_and(|mac| mac.verify_slice(&expected).is_ok()),
    }
}
