//! Client identity and the fixed authorization-server endpoint set.

use smol_str::SmolStr;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("`client_id` must be an https url")]
    InvalidClientId,
    #[error("`scopes` must not be empty")]
    EmptyScopes,
    #[error("`allowed_hosts` must not be empty")]
    EmptyAllowList,
    #[error("endpoint host `{0}` is not in `allowed_hosts`")]
    EndpointNotAllowed(SmolStr),
}

/// The authorization server's endpoints, fixed by configuration rather
/// than discovered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthServerEndpoints {
    pub par_endpoint: Url,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
}

/// Immutable client identity, created once per session. The `client_id` is
/// the https URL of the client metadata document; this core treats it as an
/// opaque identifier and never fetches it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    pub client_id: Url,
    pub redirect_uri: Url,
    pub scopes: Vec<SmolStr>,
    pub endpoints: AuthServerEndpoints,
    /// Hosts the SSRF gate will admit for outbound calls.
    pub allowed_hosts: Vec<SmolStr>,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_id.scheme() != "https" {
            return Err(ConfigError::InvalidClientId);
        }
        if self.scopes.is_empty() {
            return Err(ConfigError::EmptyScopes);
        }
        if self.allowed_hosts.is_empty() {
            return Err(ConfigError::EmptyAllowList);
        }
        for endpoint in [
            &self.endpoints.par_endpoint,
            &self.endpoints.authorization_endpoint,
            &self.endpoints.token_endpoint,
        ] {
            let host = endpoint.host_str().unwrap_or_default();
            if !self.allowed_hosts.iter().any(|allowed| allowed == host) {
                return Err(ConfigError::EndpointNotAllowed(host.into()));
            }
        }
        Ok(())
    }

    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }
}
