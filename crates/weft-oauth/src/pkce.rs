//! Proof Key for Code Exchange: verifier/challenge pairs binding an
//! authorization request to the eventual token exchange.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::{CryptoRng, RngCore, rngs::ThreadRng};
use sha2::{Digest, Sha256};
use smol_str::SmolStr;

/// Generate a code verifier: 32 bytes of CSPRNG entropy, base64url encoded
/// to 43 unreserved characters.
/// https://datatracker.ietf.org/doc/html/rfc7636#section-4.1
pub fn generate_verifier() -> SmolStr {
    URL_SAFE_NO_PAD
        .encode(get_random_values::<_, 32>(&mut ThreadRng::default()))
        .into()
}

/// S256 transform of a verifier: SHA-256 then unpadded base64url. Pure, so
/// the authorization server can recompute it at exchange time.
/// https://datatracker.ietf.org/doc/html/rfc7636#section-4.2
pub fn generate_challenge(verifier: &str) -> SmolStr {
    URL_SAFE_NO_PAD
        .encode(Sha256::digest(verifier.as_bytes()))
        .into()
}

/// Returns `(code_challenge, code_verifier)`.
pub fn generate_pkce() -> (SmolStr, SmolStr) {
    let verifier = generate_verifier();
    (generate_challenge(&verifier), verifier)
}

/// 16 random bytes, base64url. Used for single-use identifiers.
pub fn generate_nonce() -> SmolStr {
    URL_SAFE_NO_PAD
        .encode(get_random_values::<_, 16>(&mut ThreadRng::default()))
        .into()
}

pub fn get_random_values<R, const LEN: usize>(rng: &mut R) -> [u8; LEN]
where
    R: RngCore + CryptoRng,
{
    let mut bytes = [0u8; LEN];
    rng.fill_bytes(&mut bytes);
    bytes
}
