use http::StatusCode;
use miette::Diagnostic;
use smol_str::SmolStr;
use thiserror::Error;

use crate::config::ConfigError;
use crate::security::SecurityError;
use crate::store::TokenStoreError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Upstream failure detail attached to protocol-level errors so callers can
/// branch on the server's answer without string matching.
#[derive(Debug, Error, Diagnostic)]
pub enum UpstreamError {
    /// Non-2xx response with a JSON error body
    #[error("http status {status}, body: {body}")]
    #[diagnostic(
        code(weft_oauth::upstream::status_body),
        help("server returned error JSON; inspect fields like `error`, `error_description`")
    )]
    StatusWithBody {
        status: StatusCode,
        body: serde_json::Value,
    },

    /// Non-2xx response without a parseable body
    #[error("http status {0}")]
    #[diagnostic(code(weft_oauth::upstream::status))]
    Status(StatusCode),

    /// 2xx response whose body did not parse as the expected shape
    #[error("malformed response body: {0}")]
    #[diagnostic(code(weft_oauth::upstream::malformed_body))]
    MalformedBody(#[source] serde_json::Error),

    /// The request never produced a response
    #[error("transport error: {0}")]
    #[diagnostic(code(weft_oauth::upstream::transport))]
    Transport(#[source] BoxError),
}

impl UpstreamError {
    pub(crate) fn from_response(res: &http::Response<Vec<u8>>) -> Self {
        match serde_json::from_slice(res.body()) {
            Ok(body) => Self::StatusWithBody {
                status: res.status(),
                body,
            },
            Err(_) => Self::Status(res.status()),
        }
    }

    /// Status code of the upstream answer, if one arrived.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::StatusWithBody { status, .. } | Self::Status(status) => Some(*status),
            Self::MalformedBody(_) | Self::Transport(_) => None,
        }
    }
}

/// Errors emitted by the client core. Each variant is a structurally
/// distinct kind; callers branch on the variant, not the message.
#[derive(Debug, Error, Diagnostic)]
pub enum OAuthError {
    /// Missing or unusable constructor input. Fatal; no partial session
    /// is created.
    #[error("configuration error: {0}")]
    #[diagnostic(
        code(weft_oauth::config),
        help("client id, redirect uri, scopes, allow-list, and ES256 key material are required up front")
    )]
    Configuration(SmolStr),

    /// URL failed the SSRF gate or a caller exceeded the rate limit.
    /// Never retried automatically.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Security(#[from] SecurityError),

    /// DPoP proof construction failed. Deterministic for the given key
    /// material, so not retried.
    #[error("proof generation failed: {0}")]
    #[diagnostic(
        code(weft_oauth::proof),
        help("check that the session key is an EC P-256 secret key")
    )]
    Proof(#[source] crate::dpop::Error),

    /// The pushed authorization request was rejected.
    #[error("pushed authorization request failed: {0}")]
    #[diagnostic(code(weft_oauth::par))]
    Authorization(UpstreamError),

    /// The token endpoint rejected the code exchange. The authorization
    /// attempt itself must be redone.
    #[error("token exchange failed: {0}")]
    #[diagnostic(code(weft_oauth::token_exchange))]
    TokenExchange(UpstreamError),

    /// The token endpoint rejected the refresh. The prior token record is
    /// left untouched; callers may fall back to a full re-authorization.
    #[error("token refresh failed: {0}")]
    #[diagnostic(code(weft_oauth::token_refresh))]
    TokenRefresh(UpstreamError),

    /// A protected-resource call failed upstream. A 401 on a fresh token
    /// is surfaced here rather than retried.
    #[error("resource call failed: {0}")]
    #[diagnostic(code(weft_oauth::upstream))]
    Upstream(UpstreamError),

    /// No usable token where one was required. Recoverable only by
    /// re-authorization, never transient.
    #[error("no {0} token available")]
    #[diagnostic(
        code(weft_oauth::token_missing),
        help("restart the authorization flow")
    )]
    TokenMissing(&'static str),

    /// Propagated unchanged from the token store.
    #[error(transparent)]
    #[diagnostic(code(weft_oauth::storage))]
    Storage(#[from] TokenStoreError),

    #[error(transparent)]
    #[diagnostic(code(weft_oauth::http_build))]
    HttpBuild(#[from] http::Error),

    #[error(transparent)]
    #[diagnostic(code(weft_oauth::serde_json))]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(code(weft_oauth::serde_form))]
    UrlEncoding(#[from] serde_html_form::ser::Error),
}

impl From<ConfigError> for OAuthError {
    fn from(e: ConfigError) -> Self {
        OAuthError::Configuration(smol_str::format_smolstr!("{e}"))
    }
}

pub type Result<T> = core::result::Result<T, OAuthError>;
