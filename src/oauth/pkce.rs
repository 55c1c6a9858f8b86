//! PKCE (RFC 7636) verifiers and S256 challenges, plus OAuth state tokens.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// 32 random bytes, base64url without padding (43 characters).
fn random_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Unguessable, URL-safe OAuth `state` value.
pub fn generate_state() -> String {
    random_token()
}

/// Code verifier: 43 characters from the unreserved URL alphabet.
pub fn generate_code_verifier() -> String {
    random_token()
}

/// `BASE64URL(SHA256(verifier))`
pub fn code_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}
