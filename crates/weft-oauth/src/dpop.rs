//! DPoP proof construction and the nonce-aware request wrapper.
//!
//! Every outbound call that needs proof of possession gets a freshly signed
//! proof binding the HTTP method and target URL to the session key. Server
//! issued nonces (RFC 9449 section 8) are tracked per peer and a request
//! answered with `use_dpop_nonce` is re-signed and retried once.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use elliptic_curve::SecretKey;
use http::{Request, Response, Uri, header::InvalidHeaderValue};
use jose_jwa::{Algorithm, Signing};
use jose_jwk::{Jwk, Key, crypto};
use p256::ecdsa::SigningKey;
use rand::{RngCore, SeedableRng, rngs::ThreadRng};
use sha2::Digest;
use smol_str::SmolStr;

use crate::http_client::HttpClient;
use crate::jose::{
    create_signed_jwt,
    jws::RegisteredHeader,
    jwt::{Claims, PublicClaims, RegisteredClaims},
};

pub const JWT_HEADER_TYP_DPOP: &str = "dpop+jwt";

#[derive(serde::Deserialize)]
struct ErrorResponse {
    error: String,
}

#[derive(thiserror::Error, Debug, miette::Diagnostic)]
pub enum Error {
    #[error(transparent)]
    InvalidHeaderValue(#[from] InvalidHeaderValue),
    #[error("crypto error: {0:?}")]
    JwkCrypto(crypto::Error),
    #[error("key is not an ES256 secret key")]
    UnsupportedKey,
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error("transport: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

type Result<T> = core::result::Result<T, Error>;

/// Generate a fresh EC P-256 key for DPoP signing.
pub fn generate_key() -> Key {
    Key::from(&crypto::Key::from(SecretKey::<p256::NistP256>::random(
        &mut ThreadRng::default(),
    )))
}

/// Per-session proof state: the signing key and the latest nonce issued by
/// each peer. The authorization server and the resource host hand out
/// nonces independently, so they are tracked separately.
#[derive(Clone, Debug)]
pub struct DpopState {
    pub key: Key,
    pub authserver_nonce: Option<SmolStr>,
    pub host_nonce: Option<SmolStr>,
}

impl DpopState {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            authserver_nonce: None,
            host_nonce: None,
        }
    }

    fn nonce(&self, to_auth_server: bool) -> Option<SmolStr> {
        if to_auth_server {
            self.authserver_nonce.clone()
        } else {
            self.host_nonce.clone()
        }
    }

    fn set_nonce(&mut self, to_auth_server: bool, nonce: SmolStr) {
        if to_auth_server {
            self.authserver_nonce = Some(nonce);
        } else {
            self.host_nonce = Some(nonce);
        }
    }
}

/// Attach a fresh proof to `request`, send it, and handle the nonce dance:
/// a `DPoP-Nonce` response header is stored for future proofs, and a
/// `use_dpop_nonce` rejection is retried once with a re-signed proof.
pub async fn send_with_proof<T>(
    client: &T,
    state: &mut DpopState,
    to_auth_server: bool,
    mut request: Request<Vec<u8>>,
) -> Result<Response<Vec<u8>>>
where
    T: HttpClient,
{
    let method = SmolStr::from(request.method().as_str());
    let htu = htu_of(request.uri());
    // https://datatracker.ietf.org/doc/html/rfc9449#section-4.2
    let ath: Option<SmolStr> = request
        .headers()
        .get("Authorization")
        .filter(|v| v.to_str().is_ok_and(|s| s.starts_with("DPoP ")))
        .map(|auth| {
            URL_SAFE_NO_PAD
                .encode(sha2::Sha256::digest(&auth.as_bytes()[5..]))
                .into()
        });

    let init_nonce = state.nonce(to_auth_server);
    let init_proof = build_dpop_proof(
        &state.key,
        method.clone(),
        htu.clone(),
        init_nonce.clone(),
        ath.clone(),
    )?;
    request.headers_mut().insert("DPoP", init_proof.parse()?);
    let response = client
        .send_http(request.clone())
        .await
        .map_err(|e| Error::Transport(e.into()))?;

    let next_nonce: Option<SmolStr> = response
        .headers()
        .get("DPoP-Nonce")
        .and_then(|v| v.to_str().ok())
        .map(SmolStr::from);
    match &next_nonce {
        Some(nonce) if next_nonce != init_nonce => {
            state.set_nonce(to_auth_server, nonce.clone());
        }
        _ => {
            // No nonce was returned or it matches the one we sent; nothing
            // to store and no reason to retry.
            return Ok(response);
        }
    }

    if !is_use_dpop_nonce_error(to_auth_server, &response) {
        return Ok(response);
    }
    let next_proof = build_dpop_proof(&state.key, method, htu, next_nonce, ath)?;
    request.headers_mut().insert("DPoP", next_proof.parse()?);
    let response = client
        .send_http(request)
        .await
        .map_err(|e| Error::Transport(e.into()))?;
    Ok(response)
}

#[inline]
fn is_use_dpop_nonce_error(to_auth_server: bool, response: &Response<Vec<u8>>) -> bool {
    // https://datatracker.ietf.org/doc/html/rfc9449#name-authorization-server-provid
    if to_auth_server {
        if response.status() == 400 {
            if let Ok(res) = serde_json::from_slice::<ErrorResponse>(response.body()) {
                return res.error == "use_dpop_nonce";
            };
        }
    }
    // https://datatracker.ietf.org/doc/html/rfc9449#name-resource-server-provided-no
    else if response.status() == 401 {
        if let Some(www_auth) = response
            .headers()
            .get("WWW-Authenticate")
            .and_then(|v| v.to_str().ok())
        {
            return www_auth.starts_with("DPoP") && www_auth.contains(r#"error="use_dpop_nonce""#);
        }
    }
    false
}

#[inline]
pub(crate) fn generate_jti() -> SmolStr {
    let mut rng = rand::rngs::SmallRng::from_entropy();
    let mut bytes = [0u8; 12];
    rng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes).into()
}

/// The `htu` claim carries scheme, authority, and path only; query and
/// fragment are stripped.
fn htu_of(uri: &Uri) -> SmolStr {
    match (uri.scheme_str(), uri.authority()) {
        (Some(scheme), Some(authority)) => {
            smol_str::format_smolstr!("{scheme}://{authority}{}", uri.path())
        }
        _ => uri.path().into(),
    }
}

/// Build a compact JWS (ES256) for DPoP with embedded public JWK.
#[inline]
pub fn build_dpop_proof(
    key: &Key,
    method: SmolStr,
    url: SmolStr,
    nonce: Option<SmolStr>,
    ath: Option<SmolStr>,
) -> Result<String> {
    let secret = match crypto::Key::try_from(key).map_err(Error::JwkCrypto)? {
        crypto::Key::P256(crypto::Kind::Secret(sk)) => sk,
        _ => return Err(Error::UnsupportedKey),
    };
    let mut header = RegisteredHeader::from(Algorithm::Signing(Signing::Es256));
    header.typ = Some(JWT_HEADER_TYP_DPOP.into());
    header.jwk = Some(Jwk {
        key: Key::from(&crypto::Key::from(secret.public_key())),
        prm: Default::default(),
    });

    let claims = Claims {
        registered: RegisteredClaims {
            jti: Some(generate_jti()),
            iat: Some(Utc::now().timestamp()),
            ..Default::default()
        },
        public: PublicClaims {
            htm: Some(method),
            htu: Some(url),
            ath,
            nonce,
        },
    };
    Ok(create_signed_jwt(
        SigningKey::from(secret.clone()),
        header.into(),
        claims,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::{VerifyingKey, signature::Verifier};

    fn decode_part(part: &str) -> serde_json::Value {
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(part).unwrap()).unwrap()
    }

    #[test]
    fn proof_header_and_claims_bind_the_request() {
        let key = generate_key();
        let proof = build_dpop_proof(
            &key,
            "POST".into(),
            "https://auth.example/token".into(),
            None,
            None,
        )
        .unwrap();
        let parts: Vec<&str> = proof.split('.').collect();
        assert_eq!(parts.len(), 3);

        let header = decode_part(parts[0]);
        assert_eq!(header["alg"], "ES256");
        assert_eq!(header["typ"], "dpop+jwt");
        assert_eq!(header["jwk"]["kty"], "EC");
        assert_eq!(header["jwk"]["crv"], "P-256");
        assert!(header["jwk"].get("d").is_none(), "private material leaked");

        let claims = decode_part(parts[1]);
        assert_eq!(claims["htm"], "POST");
        assert_eq!(claims["htu"], "https://auth.example/token");
        assert!(claims["jti"].is_string());
        assert!(claims["iat"].is_i64());
        assert!(claims.get("nonce").is_none());
    }

    #[test]
    fn proofs_are_never_replay_identical() {
        let key = generate_key();
        let a = build_dpop_proof(&key, "GET".into(), "https://h/r".into(), None, None).unwrap();
        let b = build_dpop_proof(&key, "GET".into(), "https://h/r".into(), None, None).unwrap();
        assert_ne!(a, b);
        let jti_a = decode_part(a.split('.').nth(1).unwrap())["jti"].clone();
        let jti_b = decode_part(b.split('.').nth(1).unwrap())["jti"].clone();
        assert_ne!(jti_a, jti_b);
    }

    #[test]
    fn proof_signature_verifies_under_the_session_key() {
        let key = generate_key();
        let secret = match crypto::Key::try_from(&key).unwrap() {
            crypto::Key::P256(crypto::Kind::Secret(sk)) => sk,
            _ => unreachable!(),
        };
        let verifying = VerifyingKey::from(&SigningKey::from(secret));

        let proof = build_dpop_proof(
            &key,
            "GET".into(),
            "https://host.example/data".into(),
            Some("n1".into()),
            None,
        )
        .unwrap();
        let (signed, sig) = proof.rsplit_once('.').unwrap();
        let sig = p256::ecdsa::Signature::from_slice(&URL_SAFE_NO_PAD.decode(sig).unwrap()).unwrap();
        verifying.verify(signed.as_bytes(), &sig).unwrap();

        let claims = decode_part(signed.split('.').nth(1).unwrap());
        assert_eq!(claims["nonce"], "n1");
    }

    #[test]
    fn htu_strips_query_and_fragment() {
        let uri: Uri = "https://host.example/path/to/thing?query=1".parse().unwrap();
        assert_eq!(htu_of(&uri), "https://host.example/path/to/thing");
    }

    #[test]
    fn non_p256_key_is_rejected() {
        let jwk = Jwk {
            key: Key::from(&crypto::Key::from(
                SecretKey::<p256::NistP256>::random(&mut ThreadRng::default()).public_key(),
            )),
            prm: Default::default(),
        };
        // A public key has no signing half.
        let err =
            build_dpop_proof(&jwk.key, "GET".into(), "https://h/".into(), None, None).unwrap_err();
        assert!(matches!(err, Error::UnsupportedKey));
    }
}
