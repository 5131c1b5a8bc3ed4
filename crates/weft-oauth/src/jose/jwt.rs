use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Claims {
    #[serde(flatten)]
    pub registered: RegisteredClaims,
    #[serde(flatten)]
    pub public: PublicClaims,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RegisteredClaims {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<RegisteredClaimsAud>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<SmolStr>,
}

/// DPoP binding claims (RFC 9449 section 4.2).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PublicClaims {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub htm: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub htu: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ath: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<SmolStr>,
}

impl From<RegisteredClaims> for Claims {
    fn from(registered: RegisteredClaims) -> Self {
        Self {
            registered,
            public: PublicClaims::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisteredClaimsAud {
    Single(SmolStr),
    Multiple(Vec<SmolStr>),
}
