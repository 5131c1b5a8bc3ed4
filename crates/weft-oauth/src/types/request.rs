use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use url::Url;

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationResponseType {
    Code,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub enum CodeChallengeMethod {
    S256,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum TokenGrantType {
    AuthorizationCode,
    RefreshToken,
}

/// Form body wrapper: `client_id` plus the operation's own parameters.
/// With `token_endpoint_auth_method: "none"` the bare id is the whole
/// client authentication.
#[derive(Debug, Serialize)]
pub struct RequestPayload<T>
where
    T: Serialize,
{
    pub client_id: Url,
    #[serde(flatten)]
    pub parameters: T,
}

// https://datatracker.ietf.org/doc/html/rfc9126#section-2
#[derive(Serialize, Debug)]
pub struct ParParameters {
    pub response_type: AuthorizationResponseType,
    pub redirect_uri: Url,
    pub scope: String,
    // https://datatracker.ietf.org/doc/html/rfc7636#section-4.3
    pub code_challenge: SmolStr,
    pub code_challenge_method: CodeChallengeMethod,
}

// https://datatracker.ietf.org/doc/html/rfc6749#section-4.1.3
#[derive(Serialize, Debug)]
pub struct TokenRequestParameters {
    pub grant_type: TokenGrantType,
    pub code: SmolStr,
    pub redirect_uri: Url,
    // https://datatracker.ietf.org/doc/html/rfc7636#section-4.5
    pub code_verifier: SmolStr,
}

// https://datatracker.ietf.org/doc/html/rfc6749#section-6
#[derive(Serialize, Debug)]
pub struct RefreshRequestParameters {
    pub grant_type: TokenGrantType,
    pub refresh_token: SmolStr,
}
