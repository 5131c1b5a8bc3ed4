//! The authorization/token lifecycle engine: PAR issuance, code exchange,
//! transparent refresh, and DPoP-wrapped resource calls for one identity.
//!
//! A session is single-flight by construction: every state-mutating
//! operation takes `&mut self`, so exclusive ownership is the
//! serialization point. Share a session across logical flows only behind
//! an external mutex or actor.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use http::{Method, Request, Response, header::CONTENT_TYPE};
use jose_jwk::{Key, crypto};
use serde::Serialize;
use smol_str::SmolStr;
use tracing::warn;
use url::Url;

use crate::config::ClientConfig;
use crate::dpop::{self, DpopState};
use crate::error::{OAuthError, Result, UpstreamError};
use crate::http_client::HttpClient;
use crate::pkce::generate_pkce;
use crate::security::SecurityError;
use crate::security::rate_limit::{FixedWindowLimiter, RateLimiter};
use crate::security::ssrf::UrlGate;
use crate::store::{TokenRecord, TokenStore};
use crate::types::{
    AuthorizationAttempt, AuthorizationResponseType, CodeChallengeMethod, ParParameters,
    ParResponse, RefreshRequestParameters, RequestPayload, TokenGrantType,
    TokenRequestParameters, TokenResponse,
};

/// Lifecycle of one identity's session. `Pending` carries no persisted
/// state; an abandoned attempt leaves nothing to clean up here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Pending,
    Authenticated,
    Expired,
}

/// OAuth session for a single identity against one authorization server.
///
/// Owns the in-memory working copy of the token record and writes through
/// to the [`TokenStore`] on every mutation.
pub struct OAuthSession<T, S>
where
    T: HttpClient + Send + Sync,
    S: TokenStore,
{
    client: Arc<T>,
    store: S,
    config: ClientConfig,
    user_id: SmolStr,
    dpop: DpopState,
    tokens: Option<TokenRecord>,
    pending: bool,
    gate: UrlGate,
    limiter: Arc<dyn RateLimiter>,
}

impl<T, S> std::fmt::Debug for OAuthSession<T, S>
where
    T: HttpClient + Send + Sync,
    S: TokenStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthSession")
            .field("user_id", &self.user_id)
            .field("pending", &self.pending)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<T, S> OAuthSession<T, S>
where
    T: HttpClient + Send + Sync,
    S: TokenStore,
{
    /// Construct a session. Fails with a configuration error on unusable
    /// input; no partial session is created.
    pub fn new(
        config: ClientConfig,
        dpop_key: Key,
        user_id: impl Into<SmolStr>,
        store: S,
        client: Arc<T>,
    ) -> Result<Self> {
        config.validate()?;
        match crypto::Key::try_from(&dpop_key) {
            Ok(crypto::Key::P256(crypto::Kind::Secret(_))) => {}
            _ => {
                return Err(OAuthError::Configuration(
                    "dpop key must be an EC P-256 secret key".into(),
                ));
            }
        }
        let gate = UrlGate::new(config.allowed_hosts.clone());
        Ok(Self {
            client,
            store,
            user_id: user_id.into(),
            dpop: DpopState::new(dpop_key),
            tokens: None,
            pending: false,
            gate,
            limiter: Arc::new(FixedWindowLimiter::default()),
            config,
        })
    }

    /// Replace the URL gate, e.g. to inject a resolver.
    pub fn with_url_gate(mut self, gate: UrlGate) -> Self {
        self.gate = gate;
        self
    }

    /// Replace the rate limiter backing `begin_authorization`.
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn token_record(&self) -> Option<&TokenRecord> {
        self.tokens.as_ref()
    }

    pub fn state(&self) -> SessionState {
        match &self.tokens {
            Some(record) if record.is_expired(Utc::now()) => SessionState::Expired,
            Some(_) => SessionState::Authenticated,
            None if self.pending => SessionState::Pending,
            None => SessionState::Unauthenticated,
        }
    }

    /// Push the authorization request and build the URL the caller sends
    /// the user to. The returned verifier must be held by the caller until
    /// the callback; it is not stored here.
    ///
    /// PAR is not blind-retried: a rejected or timed-out push surfaces to
    /// the caller unchanged.
    #[tracing::instrument(level = "debug", skip_all, fields(caller = caller_key))]
    pub async fn begin_authorization(&mut self, caller_key: &str) -> Result<AuthorizationAttempt> {
        self.limiter.check(caller_key)?;

        let (code_challenge, code_verifier) = generate_pkce();

        let par_url = self.config.endpoints.par_endpoint.clone();
        if !self.gate.is_admissible(par_url.as_str()) {
            return Err(SecurityError::UrlRejected(par_url.as_str().into()).into());
        }

        let body = serde_html_form::to_string(RequestPayload {
            client_id: self.config.client_id.clone(),
            parameters: ParParameters {
                response_type: AuthorizationResponseType::Code,
                redirect_uri: self.config.redirect_uri.clone(),
                scope: self.config.scope_string(),
                code_challenge,
                code_challenge_method: CodeChallengeMethod::S256,
            },
        })?;
        let request = Request::builder()
            .uri(par_url.as_str())
            .method(Method::POST)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body.into_bytes())?;

        let response = dpop::send_with_proof(self.client.as_ref(), &mut self.dpop, true, request)
            .await
            .map_err(|e| dpop_failure(e, OAuthError::Authorization))?;
        if !response.status().is_success() {
            return Err(OAuthError::Authorization(UpstreamError::from_response(
                &response,
            )));
        }
        let par: ParResponse = serde_json::from_slice(response.body())
            .map_err(|e| OAuthError::Authorization(UpstreamError::MalformedBody(e)))?;

        #[derive(Serialize)]
        struct Parameters<'s> {
            client_id: &'s Url,
            request_uri: &'s str,
        }
        let url = self.config.endpoints.authorization_endpoint.to_string()
            + "?"
            + &serde_html_form::to_string(Parameters {
                client_id: &self.config.client_id,
                request_uri: &par.request_uri,
            })?;

        self.pending = true;
        Ok(AuthorizationAttempt {
            url,
            code_verifier,
            request_uri: par.request_uri,
        })
    }

    /// Exchange the authorization code for tokens. On success the record
    /// is written through to the store and the session becomes
    /// authenticated; on failure the session stays pending. Whether a
    /// failed code can be replayed is the server's call; single-use codes
    /// usually cannot.
    #[tracing::instrument(level = "debug", skip_all, fields(user = %self.user_id))]
    pub async fn complete_authorization(&mut self, code: &str, code_verifier: &str) -> Result<()> {
        let record = self
            .token_request(
                TokenRequestParameters {
                    grant_type: TokenGrantType::AuthorizationCode,
                    code: code.into(),
                    redirect_uri: self.config.redirect_uri.clone(),
                    code_verifier: code_verifier.into(),
                },
                OAuthError::TokenExchange,
            )
            .await?;

        self.store.save_tokens(&self.user_id, &record).await?;
        self.tokens = Some(record);
        self.pending = false;
        Ok(())
    }

    /// Refresh the token record. The old record survives any failure; on
    /// success it is overwritten wholesale, so a response without a new
    /// refresh token drops refresh capability, matching the upstream
    /// contract.
    #[tracing::instrument(level = "debug", skip_all, fields(user = %self.user_id))]
    pub(crate) async fn refresh(&mut self) -> Result<()> {
        let Some(current) = &self.tokens else {
            return Err(OAuthError::TokenMissing("access"));
        };
        let Some(refresh_token) = current.refresh_token.clone() else {
            return Err(OAuthError::TokenMissing("refresh"));
        };

        let record = self
            .token_request(
                RefreshRequestParameters {
                    grant_type: TokenGrantType::RefreshToken,
                    refresh_token,
                },
                OAuthError::TokenRefresh,
            )
            .await?;
        if record.refresh_token.is_none() {
            warn!(user = %self.user_id, "refresh response carried no refresh token; session loses refresh capability");
        }

        self.store.save_tokens(&self.user_id, &record).await?;
        self.tokens = Some(record);
        Ok(())
    }

    /// Call a protected resource with `Authorization: DPoP <token>` and a
    /// fresh proof. An expired session token triggers exactly one refresh
    /// first; a 401 on a fresh token is surfaced, not retried, since it
    /// can mean key mismatch or revocation.
    #[tracing::instrument(level = "debug", skip_all, fields(user = %self.user_id, %method))]
    pub async fn call_protected_resource(
        &mut self,
        method: Method,
        url: &str,
        access_token: Option<&str>,
    ) -> Result<Response<Vec<u8>>> {
        let token: SmolStr = match access_token {
            Some(token) => token.into(),
            None => {
                let expired = match &self.tokens {
                    Some(record) => record.is_expired(Utc::now()),
                    None => return Err(OAuthError::TokenMissing("access")),
                };
                if expired {
                    // Fails with TokenMissing("refresh") before any I/O
                    // when there is nothing to refresh with.
                    self.refresh().await?;
                }
                match &self.tokens {
                    Some(record) => record.access_token.clone(),
                    None => return Err(OAuthError::TokenMissing("access")),
                }
            }
        };

        if !self.gate.is_admissible(url) {
            return Err(SecurityError::UrlRejected(url.into()).into());
        }

        let request = Request::builder()
            .method(method)
            .uri(url)
            .header(http::header::AUTHORIZATION, format!("DPoP {token}"))
            .body(Vec::new())?;
        let response = dpop::send_with_proof(self.client.as_ref(), &mut self.dpop, false, request)
            .await
            .map_err(|e| dpop_failure(e, OAuthError::Upstream))?;
        if !response.status().is_success() {
            return Err(OAuthError::Upstream(UpstreamError::from_response(&response)));
        }
        Ok(response)
    }

    /// Delete the durable record and clear the in-memory copy. Idempotent;
    /// a logout with no active session is a no-op.
    #[tracing::instrument(level = "debug", skip_all, fields(user = %self.user_id))]
    pub async fn logout(&mut self) -> Result<()> {
        self.store.delete_tokens(&self.user_id).await?;
        self.tokens = None;
        self.pending = false;
        Ok(())
    }

    /// Rehydrate the in-memory record from the durable store. Returns
    /// whether a record was found.
    pub async fn restore(&mut self) -> Result<bool> {
        match self.store.load_tokens(&self.user_id).await? {
            Some(record) => {
                self.tokens = Some(record);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// DPoP-signed POST to the token endpoint, shared by code exchange and
    /// refresh. `wrap` picks the error kind the caller branches on.
    async fn token_request<P>(
        &mut self,
        parameters: P,
        wrap: fn(UpstreamError) -> OAuthError,
    ) -> Result<TokenRecord>
    where
        P: Serialize + Send,
    {
        let token_url = self.config.endpoints.token_endpoint.clone();
        if !self.gate.is_admissible(token_url.as_str()) {
            return Err(SecurityError::UrlRejected(token_url.as_str().into()).into());
        }

        let body = serde_html_form::to_string(RequestPayload {
            client_id: self.config.client_id.clone(),
            parameters,
        })?;
        let request = Request::builder()
            .uri(token_url.as_str())
            .method(Method::POST)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body.into_bytes())?;

        let response = dpop::send_with_proof(self.client.as_ref(), &mut self.dpop, true, request)
            .await
            .map_err(|e| dpop_failure(e, wrap))?;
        if !response.status().is_success() {
            return Err(wrap(UpstreamError::from_response(&response)));
        }
        let token_response: TokenResponse = serde_json::from_slice(response.body())
            .map_err(|e| wrap(UpstreamError::MalformedBody(e)))?;

        let expires_at = token_response
            .expires_in
            .and_then(|expires_in| Utc::now().checked_add_signed(TimeDelta::seconds(expires_in)));
        Ok(TokenRecord {
            access_token: token_response.access_token,
            refresh_token: token_response.refresh_token,
            expires_at,
        })
    }
}

fn dpop_failure(err: dpop::Error, wrap: fn(UpstreamError) -> OAuthError) -> OAuthError {
    match err {
        dpop::Error::Transport(inner) => wrap(UpstreamError::Transport(inner)),
        other => OAuthError::Proof(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthServerEndpoints;
    use crate::store::MemoryTokenStore;
    use std::convert::Infallible;

    #[derive(Clone, Default)]
    struct NeverClient;

    impl HttpClient for NeverClient {
        type Error = Infallible;
        fn send_http(
            &self,
            _request: http::Request<Vec<u8>>,
        ) -> impl core::future::Future<
            Output = core::result::Result<http::Response<Vec<u8>>, Self::Error>,
        > + Send {
            async move { panic!("no network expected") }
        }
    }

    fn config() -> ClientConfig {
        ClientConfig {
            client_id: Url::parse("https://app.example.com/client-metadata.json").unwrap(),
            redirect_uri: Url::parse("https://app.example.com/callback").unwrap(),
            scopes: vec!["openid".into()],
            endpoints: AuthServerEndpoints {
                par_endpoint: Url::parse("https://auth.example.com/par").unwrap(),
                authorization_endpoint: Url::parse("https://auth.example.com/authorize").unwrap(),
                token_endpoint: Url::parse("https://auth.example.com/token").unwrap(),
            },
            allowed_hosts: vec!["auth.example.com".into()],
        }
    }

    fn session() -> OAuthSession<NeverClient, MemoryTokenStore> {
        OAuthSession::new(
            config(),
            dpop::generate_key(),
            "user1",
            MemoryTokenStore::default(),
            Arc::new(NeverClient),
        )
        .unwrap()
    }

    #[test]
    fn new_session_is_unauthenticated() {
        assert_eq!(session().state(), SessionState::Unauthenticated);
    }

    #[test]
    fn construction_rejects_bad_config() {
        let mut cfg = config();
        cfg.scopes.clear();
        let err = OAuthSession::new(
            cfg,
            dpop::generate_key(),
            "user1",
            MemoryTokenStore::default(),
            Arc::new(NeverClient),
        )
        .unwrap_err();
        assert!(matches!(err, OAuthError::Configuration(_)));
    }

    #[test]
    fn state_tracks_token_expiry() {
        let mut session = session();
        session.tokens = Some(TokenRecord {
            access_token: "AT1".into(),
            refresh_token: None,
            expires_at: Some(Utc::now() + TimeDelta::seconds(60)),
        });
        assert_eq!(session.state(), SessionState::Authenticated);

        session.tokens.as_mut().unwrap().expires_at = Some(Utc::now() - TimeDelta::seconds(1));
        assert_eq!(session.state(), SessionState::Expired);
    }

    #[tokio::test]
    async fn expired_without_refresh_token_fails_before_any_io() {
        let mut session = session();
        session.tokens = Some(TokenRecord {
            access_token: "AT1".into(),
            refresh_token: None,
            expires_at: Some(Utc::now() - TimeDelta::seconds(1)),
        });
        // NeverClient panics on any send, so reaching the error proves no
        // network call was issued.
        let err = session
            .call_protected_resource(Method::GET, "https://auth.example.com/data", None)
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::TokenMissing("refresh")));
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let mut session = session();
        session.logout().await.unwrap();
        session.logout().await.unwrap();
        assert_eq!(session.state(), SessionState::Unauthenticated);
    }
}
