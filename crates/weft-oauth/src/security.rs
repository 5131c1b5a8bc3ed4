//! Security gates consulted by the session before outbound work: SSRF-safe
//! URL admissibility, caller rate limiting, and output sanitization.

pub mod rate_limit;
pub mod sanitize;
pub mod ssrf;

use miette::Diagnostic;
use smol_str::SmolStr;
use thiserror::Error;

/// A gate said no. Neither variant is retried automatically.
#[derive(Debug, Error, Diagnostic)]
pub enum SecurityError {
    /// The URL failed the admissibility check. Deliberately carries no
    /// reason detail; the reason is logged at debug level instead.
    #[error("outbound url rejected: {0}")]
    #[diagnostic(
        code(weft_oauth::security::url),
        help("only https urls on allow-listed hosts resolving to public addresses are admissible")
    )]
    UrlRejected(SmolStr),

    /// The caller exceeded its request budget for the current window.
    #[error("rate limit exceeded for `{key}`, retry in {retry_after:?}")]
    #[diagnostic(
        code(weft_oauth::security::rate_limit),
        help("back off until the window resets")
    )]
    RateLimited {
        key: SmolStr,
        retry_after: std::time::Duration,
    },
}
