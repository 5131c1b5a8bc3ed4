mod request;
mod response;

pub use self::request::*;
pub use self::response::*;

use smol_str::SmolStr;

/// One authorization attempt, returned by `begin_authorization`. The
/// verifier must be held by the caller (e.g. in the user's session) until
/// the callback; this core never stores it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorizationAttempt {
    /// Browser redirect target carrying the encoded `request_uri` handle
    pub url: String,
    pub code_verifier: SmolStr,
    pub request_uri: SmolStr,
}
