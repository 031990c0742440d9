//! Shared-secret tokens for the worker control channel.
//!
//! Every connection's first frame must carry a token matching the worker's
//! configured secret; nothing else is accepted until it does.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Environment variable both the worker and the client read the token from.
pub const AUTH_TOKEN_ENV: &str = "WMUX_AUTH_TOKEN";

/// Check a presented token against the configured secret.
///
/// Both sides are hashed first, so the comparison never short-circuits on
/// the raw secret bytes.
pub fn verify_token(presented: &str, expected: &str) -> bool {
    Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}

/// Generate a random 32-byte token, hex-encoded.
pub fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

/// Short digest of a token, safe to put in logs.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..4])
}
